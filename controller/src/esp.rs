use core::convert::TryInto;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{self, esp},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire};

use fridge_common::{
    ControlLoop, InboundMessage, MessageBus, MonotonicClock, NetworkConfig, Publish, RelayOutput,
    RuntimeConfig, TemperatureSensor, Transport,
};

const NVS_NAMESPACE: &str = "fridge";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 60;
const MQTT_RX_STACK_BYTES: usize = 8 * 1024;

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, setpoint={:.1}C",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.cooling.default_setpoint_c,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;

    let relay = RelayPin::new(runtime.hardware.relay_pin, runtime.hardware.relay_active_high)?;
    let sensor = Ds18b20Probe::new(runtime.hardware.one_wire_pin)
        .context("failed to initialize DS18B20 probe")?;
    let wifi = StationLink::new(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    let mqtt = BrokerSession::new(&runtime);

    let watchdog = TaskWatchdog::arm(WATCHDOG_TIMEOUT_SEC)?;

    let mut control = ControlLoop::new(&runtime, MonotonicClock::new(), sensor, relay, wifi, mqtt);
    control.run_while(|| {
        watchdog.feed();
        true
    });

    Ok(())
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 4096];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

struct Ds18b20Probe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
    pin: i32,
}

impl Ds18b20Probe {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut one_wire_pin = unsafe { PinDriver::input_output_od(AnyIOPin::new(pin)) }?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
            pin,
        };
        probe.refresh_address();
        Ok(probe)
    }

    fn refresh_address(&mut self) {
        let mut first_ds18: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if first_ds18.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        first_ds18 = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = first_ds18;
        match self.address {
            Some(address) => info!(
                "DS18B20 ready on GPIO{} ({device_count} one-wire device(s), using {address:?})",
                self.pin
            ),
            None => warn!(
                "no DS18B20 found on GPIO{} ({device_count} one-wire device(s) detected)",
                self.pin
            ),
        }
    }
}

impl TemperatureSensor for Ds18b20Probe {
    fn read_celsius(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.refresh_address();
        }

        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => {
                debug!("[DS18B20] {:.2}C", data.temperature);
                Some(data.temperature)
            }
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}

struct RelayPin {
    driver: PinDriver<'static, AnyOutputPin, Output>,
    active_high: bool,
}

impl RelayPin {
    fn new(pin: i32, active_high: bool) -> anyhow::Result<Self> {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
            .with_context(|| format!("failed to claim relay GPIO{pin}"))?;
        info!("relay on GPIO{pin} (active {})", if active_high { "high" } else { "low" });
        Ok(Self {
            driver,
            active_high,
        })
    }
}

impl RelayOutput for RelayPin {
    fn set_output(&mut self, on: bool) {
        let result = if on == self.active_high {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay {}: {err:?}", if on { "on" } else { "off" });
        }
    }
}

/// WiFi station. Association runs in the background after `connect`, so an
/// attempt only requests it and reports whether the netif came up.
struct StationLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    ssid: String,
}

impl StationLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        disable_wifi_power_save();
        info!("wifi started for `{}`", network.wifi_ssid);

        Ok(Self {
            wifi,
            ssid: network.wifi_ssid.clone(),
        })
    }
}

impl Transport for StationLink {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn attempt(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }

        if !self.wifi.is_connected().unwrap_or(false) {
            if let Err(err) = self.wifi.wifi_mut().connect() {
                debug!("wifi connect request to `{}` failed: {err}", self.ssid);
            }
        }
        self.is_connected()
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }
}

/// State shared between a session and its receiver thread.
#[derive(Default)]
struct MqttLink {
    connected: AtomicBool,
    resubscribe: AtomicBool,
    closed: AtomicBool,
    inbox: Mutex<VecDeque<InboundMessage>>,
}

impl MqttLink {
    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.resubscribe.store(true, Ordering::Relaxed);
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// The receiver thread has exited; the client behind it is unusable.
    fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.closed.store(true, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn take_resubscribe(&self) -> bool {
        self.resubscribe.swap(false, Ordering::Relaxed)
    }

    fn push(&self, message: InboundMessage) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
    }

    fn drain(&self) -> Vec<InboundMessage> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// MQTT session on the ESP-IDF client. The client reconnects on its own once
/// started and every reconnect replays `subscriptions`. A client whose
/// receiver thread died is discarded and started again on the next attempt.
struct BrokerSession {
    url: String,
    client_id: String,
    user: String,
    pass: String,
    max_payload_bytes: usize,
    client: Option<EspMqttClient<'static>>,
    link: Arc<MqttLink>,
    subscriptions: Vec<String>,
}

impl BrokerSession {
    fn new(runtime: &RuntimeConfig) -> Self {
        let network = &runtime.network;
        Self {
            url: format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port),
            client_id: network.mqtt_client_id.clone(),
            user: network.mqtt_user.clone(),
            pass: network.mqtt_pass.clone(),
            max_payload_bytes: runtime.control.max_payload_bytes,
            client: None,
            link: Arc::new(MqttLink::default()),
            subscriptions: Vec::new(),
        }
    }

    fn start_client(&mut self) -> anyhow::Result<()> {
        let conf = MqttClientConfiguration {
            client_id: Some(self.client_id.as_str()),
            username: (!self.user.is_empty()).then_some(self.user.as_str()),
            password: (!self.pass.is_empty()).then_some(self.pass.as_str()),
            ..Default::default()
        };

        let link = Arc::new(MqttLink::default());
        let (client, conn) = EspMqttClient::new(self.url.as_str(), &conf)?;
        spawn_mqtt_receiver(conn, link.clone(), self.max_payload_bytes)?;
        info!("mqtt client started for {}", self.url);
        self.client = Some(client);
        self.link = link;
        Ok(())
    }

    fn send_subscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.subscribe(topic, QoS::AtMostOnce) {
            Ok(_) => true,
            Err(err) => {
                warn!("mqtt subscribe to {topic} failed: {err}");
                false
            }
        }
    }
}

impl Transport for BrokerSession {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn attempt(&mut self) -> bool {
        if self.client.is_some() && self.link.is_closed() {
            warn!("mqtt receiver stopped; restarting client");
            self.client = None;
        }
        if self.client.is_none() {
            if let Err(err) = self.start_client() {
                warn!("mqtt client start failed: {err:#}");
                return false;
            }
        }
        self.is_connected()
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

impl Publish for BrokerSession {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.publish(topic, QoS::AtMostOnce, false, payload) {
            Ok(_) => true,
            Err(err) => {
                debug!("mqtt publish to {topic} failed: {err}");
                false
            }
        }
    }
}

impl MessageBus for BrokerSession {
    fn subscribe(&mut self, topic: &str) -> bool {
        if !self.subscriptions.iter().any(|known| known == topic) {
            self.subscriptions.push(topic.to_string());
        }
        self.link.take_resubscribe();
        self.send_subscribe(topic)
    }

    fn receive(&mut self) -> Vec<InboundMessage> {
        if self.link.take_resubscribe() {
            for topic in self.subscriptions.clone() {
                if self.send_subscribe(&topic) {
                    info!("re-subscribed to {topic} after reconnect");
                }
            }
        }
        self.link.drain()
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    link: Arc<MqttLink>,
    max_payload_bytes: usize,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(MQTT_RX_STACK_BYTES)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        link.mark_connected();
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        link.mark_disconnected();
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if data.len() > max_payload_bytes {
                            warn!(
                                "dropping oversized MQTT payload on topic {topic} ({} bytes)",
                                data.len()
                            );
                        } else {
                            link.push(InboundMessage::new(topic, data.to_vec()));
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop ended: {err:?}");
                    link.close();
                    break;
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

/// Task watchdog subscription for the control task.
struct TaskWatchdog;

impl TaskWatchdog {
    fn arm(timeout_sec: u32) -> anyhow::Result<Self> {
        let config = sys::esp_task_wdt_config_t {
            timeout_ms: timeout_sec.saturating_mul(1000),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        tolerate_invalid_state("esp_task_wdt_init", unsafe {
            sys::esp_task_wdt_init(&config)
        })?;
        tolerate_invalid_state("esp_task_wdt_add", unsafe {
            sys::esp_task_wdt_add(core::ptr::null_mut())
        })?;
        info!("task watchdog armed ({timeout_sec} s)");
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { sys::esp_task_wdt_reset() };
    }
}

/// `ESP_ERR_INVALID_STATE` means the watchdog is already set up.
fn tolerate_invalid_state(call: &str, rc: sys::esp_err_t) -> anyhow::Result<()> {
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        Ok(())
    } else {
        Err(anyhow!("{call} failed with code {rc}"))
    }
}

fn disable_wifi_power_save() {
    match esp!(unsafe { sys::esp_wifi_set_ps(sys::wifi_ps_type_t_WIFI_PS_NONE) }) {
        Ok(()) => info!("wifi power save disabled"),
        Err(err) => warn!("failed to disable wifi power save: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_requests_one_resubscribe() {
        let link = MqttLink::default();

        link.mark_connected();
        link.mark_disconnected();
        link.mark_connected();

        assert!(link.is_connected());
        assert!(link.take_resubscribe());
        assert!(!link.take_resubscribe());
    }

    #[test]
    fn closed_link_reports_disconnected() {
        let link = MqttLink::default();
        link.mark_connected();

        link.close();

        assert!(link.is_closed());
        assert!(!link.is_connected());
    }

    #[test]
    fn inbox_drains_in_arrival_order() {
        let link = MqttLink::default();
        link.push(InboundMessage::new("a", b"1".to_vec()));
        link.push(InboundMessage::new("b", b"2".to_vec()));

        let topics: Vec<String> = link.drain().into_iter().map(|m| m.topic).collect();

        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
        assert!(link.drain().is_empty());
    }
}
