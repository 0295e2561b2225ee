use log::{debug, warn};
use serde_json::{Map, Value};

use crate::{config::TopicConfig, control::ControllerState, ports::Publish, timer::TimerGate};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusRecord {
    pub current_temperature: f32,
    pub cooling_active: bool,
}

impl StatusRecord {
    /// `None` until the first successful sensor poll.
    pub fn from_state(state: &ControllerState) -> Option<Self> {
        state.temperature.map(|reading| Self {
            current_temperature: reading.celsius,
            cooling_active: state.cooling.is_cooling(),
        })
    }

    /// JSON object keyed by the configured field names. The temperature is
    /// rounded to millidegrees so `f32` noise does not leak onto the wire.
    pub fn to_payload(&self, topics: &TopicConfig) -> Vec<u8> {
        let temperature = (f64::from(self.current_temperature) * 1_000.0).round() / 1_000.0;

        let mut object = Map::new();
        object.insert(topics.temperature_field.clone(), Value::from(temperature));
        object.insert(
            topics.cooling_field.clone(),
            Value::Bool(self.cooling_active),
        );
        Value::Object(object).to_string().into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    gate: TimerGate,
    topics: TopicConfig,
}

impl StatusReporter {
    pub fn new(interval_ms: u64, topics: TopicConfig) -> Self {
        Self {
            gate: TimerGate::new(interval_ms),
            topics,
        }
    }

    /// Publishes one status record when the cadence is due. Returns whether the
    /// publish was accepted, or `None` when nothing was sent this tick.
    pub fn tick<P: Publish + ?Sized>(
        &mut self,
        now_ms: u64,
        state: &ControllerState,
        publisher: &mut P,
    ) -> Option<bool> {
        if !self.gate.due(now_ms) {
            return None;
        }

        let Some(record) = StatusRecord::from_state(state) else {
            debug!("status skipped: no temperature reading yet");
            return None;
        };

        let payload = record.to_payload(&self.topics);
        let accepted = publisher.publish(&self.topics.status_topic, &payload);
        if !accepted {
            warn!("status publish to {} dropped", self.topics.status_topic);
        }
        Some(accepted)
    }
}
