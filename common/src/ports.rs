//! Collaborator boundaries between the control core and the device.
//!
//! Host builds plug in simulated or `rumqttc`-backed adapters, firmware builds
//! plug in ESP-IDF drivers; the core only ever sees these traits.

pub trait TemperatureSensor {
    /// `None` when the poll failed; the caller keeps its previous reading.
    fn read_celsius(&mut self) -> Option<f32>;
}

pub trait RelayOutput {
    fn set_output(&mut self, on: bool);
}

/// A connection that can be (re)established one attempt at a time.
pub trait Transport {
    fn name(&self) -> &'static str;

    /// One connection attempt. Success may be reported synchronously or only
    /// observed on a later attempt once the link comes up in the background.
    fn attempt(&mut self) -> bool;

    fn is_connected(&self) -> bool;
}

pub trait Publish {
    /// Best effort; `false` means the message was dropped.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

pub trait MessageBus: Transport + Publish {
    fn subscribe(&mut self, topic: &str) -> bool;

    /// Messages received since the last call, oldest first.
    fn receive(&mut self) -> Vec<InboundMessage>;
}
