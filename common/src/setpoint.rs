use serde_json::Value;
use thiserror::Error;

use crate::{config::TopicConfig, control::ControllerState};

#[derive(Debug, Error)]
pub enum SetpointError {
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload has no `{0}` field")]
    MissingField(String),
    #[error("field `{field}` is not a finite number: {value}")]
    NotANumber { field: String, value: String },
}

/// Applies pushed setpoint messages to the controller state.
#[derive(Debug, Clone)]
pub struct SetpointChannel {
    topic: String,
    field: String,
    max_payload_bytes: usize,
}

impl SetpointChannel {
    pub fn new(topic: impl Into<String>, field: impl Into<String>, max_payload_bytes: usize) -> Self {
        Self {
            topic: topic.into(),
            field: field.into(),
            max_payload_bytes,
        }
    }

    pub fn from_config(topics: &TopicConfig, max_payload_bytes: usize) -> Self {
        Self::new(
            topics.setpoint_topic.clone(),
            topics.setpoint_field.clone(),
            max_payload_bytes,
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Parses `payload` and overwrites the setpoint. On error the previous
    /// setpoint is left untouched.
    pub fn apply(&self, state: &mut ControllerState, payload: &[u8]) -> Result<f32, SetpointError> {
        let setpoint = self.parse(payload)?;
        state.setpoint = setpoint;
        Ok(setpoint)
    }

    fn parse(&self, payload: &[u8]) -> Result<f32, SetpointError> {
        if payload.len() > self.max_payload_bytes {
            return Err(SetpointError::Oversized {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        let document: Value = serde_json::from_slice(payload)?;
        let value = document
            .get(&self.field)
            .ok_or_else(|| SetpointError::MissingField(self.field.clone()))?;

        value
            .as_f64()
            .map(|number| number as f32)
            .filter(|number| number.is_finite())
            .ok_or_else(|| SetpointError::NotANumber {
                field: self.field.clone(),
                value: value.to_string(),
            })
    }
}
