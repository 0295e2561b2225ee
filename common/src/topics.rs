pub const DEFAULT_MQTT_CLIENT_ID: &str = "fridgecontroller";

pub const TOPIC_SETPOINT: &str = "fridgecontroller/config";
pub const TOPIC_STATUS: &str = "fridgecontroller/status";

pub const FIELD_TARGET_TEMP: &str = "target_temp";
pub const FIELD_CURRENT_TEMPERATURE: &str = "current_temperature";
pub const FIELD_COOLING_ACTIVE: &str = "cooling_active";
