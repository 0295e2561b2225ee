use serde::{Deserialize, Serialize};

use crate::topics::{
    DEFAULT_MQTT_CLIENT_ID, FIELD_COOLING_ACTIVE, FIELD_CURRENT_TEMPERATURE, FIELD_TARGET_TEMP,
    TOPIC_SETPOINT, TOPIC_STATUS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolingConfig {
    pub default_setpoint_c: f32,
    /// Degrees above the setpoint required before the relay starts again.
    pub restart_offset_c: f32,
    pub max_run_ms: u64,
    pub min_rest_ms: u64,
}

impl Default for CoolingConfig {
    fn default() -> Self {
        Self {
            default_setpoint_c: 6.0,
            restart_offset_c: 1.0,
            max_run_ms: 900_000,
            min_rest_ms: 900_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub sample_interval_ms: u64,
    pub status_interval_ms: u64,
    pub cycle_interval_ms: u64,
    pub min_valid_temp_c: f32,
    pub max_valid_temp_c: f32,
    pub max_payload_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            status_interval_ms: 5_000,
            cycle_interval_ms: 100,
            min_valid_temp_c: -55.0,
            max_valid_temp_c: 125.0,
            max_payload_bytes: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub spacing_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            spacing_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

impl RetryConfig {
    fn sanitize(&mut self, fallback: RetryConfig) {
        if self.spacing_ms == 0 {
            self.spacing_ms = fallback.spacing_ms;
        }
        if self.timeout_ms < self.spacing_ms {
            self.timeout_ms = self.spacing_ms;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
    pub wifi_retry: RetryConfig,
    pub mqtt_retry: RetryConfig,
}

impl NetworkConfig {
    pub const DEFAULT_WIFI_RETRY: RetryConfig = RetryConfig {
        spacing_ms: 500,
        timeout_ms: 10_000,
    };
    pub const DEFAULT_MQTT_RETRY: RetryConfig = RetryConfig {
        spacing_ms: 1_000,
        timeout_ms: 10_000,
    };
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            wifi_retry: Self::DEFAULT_WIFI_RETRY,
            mqtt_retry: Self::DEFAULT_MQTT_RETRY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TopicConfig {
    pub setpoint_topic: String,
    pub status_topic: String,
    pub setpoint_field: String,
    pub temperature_field: String,
    pub cooling_field: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            setpoint_topic: TOPIC_SETPOINT.to_string(),
            status_topic: TOPIC_STATUS.to_string(),
            setpoint_field: FIELD_TARGET_TEMP.to_string(),
            temperature_field: FIELD_CURRENT_TEMPERATURE.to_string(),
            cooling_field: FIELD_COOLING_ACTIVE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub one_wire_pin: i32,
    pub relay_pin: i32,
    pub relay_active_high: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            one_wire_pin: 4,
            relay_pin: 5,
            relay_active_high: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cooling: CoolingConfig,
    pub control: ControlConfig,
    pub network: NetworkConfig,
    pub topics: TopicConfig,
    pub hardware: HardwareConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.cooling.sanitize();
        self.control.sanitize();
        self.network
            .wifi_retry
            .sanitize(NetworkConfig::DEFAULT_WIFI_RETRY);
        self.network
            .mqtt_retry
            .sanitize(NetworkConfig::DEFAULT_MQTT_RETRY);
        self.topics.sanitize();
    }
}

impl CoolingConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !self.default_setpoint_c.is_finite() {
            self.default_setpoint_c = defaults.default_setpoint_c;
        }
        if !self.restart_offset_c.is_finite() || self.restart_offset_c < 0.0 {
            self.restart_offset_c = defaults.restart_offset_c;
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.sample_interval_ms == 0 {
            self.sample_interval_ms = defaults.sample_interval_ms;
        }
        if self.status_interval_ms == 0 {
            self.status_interval_ms = defaults.status_interval_ms;
        }
        if !(self.min_valid_temp_c.is_finite()
            && self.max_valid_temp_c.is_finite()
            && self.min_valid_temp_c < self.max_valid_temp_c)
        {
            self.min_valid_temp_c = defaults.min_valid_temp_c;
            self.max_valid_temp_c = defaults.max_valid_temp_c;
        }
        if self.max_payload_bytes == 0 {
            self.max_payload_bytes = defaults.max_payload_bytes;
        }
    }

    pub fn is_valid_temperature(&self, celsius: f32) -> bool {
        celsius.is_finite() && (self.min_valid_temp_c..=self.max_valid_temp_c).contains(&celsius)
    }
}

impl TopicConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        let fields = [
            (&mut self.setpoint_topic, defaults.setpoint_topic),
            (&mut self.status_topic, defaults.status_topic),
            (&mut self.setpoint_field, defaults.setpoint_field),
            (&mut self.temperature_field, defaults.temperature_field),
            (&mut self.cooling_field, defaults.cooling_field),
        ];
        for (value, fallback) in fields {
            if value.trim().is_empty() {
                *value = fallback;
            }
        }
    }
}
