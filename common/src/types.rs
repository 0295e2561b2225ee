use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    Off,
    On,
}

impl RelayState {
    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoolingPhase {
    Idle,
    Running,
    Resting,
}

impl CoolingPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Resting => "RESTING",
        }
    }

    /// Relay level the phase requires.
    pub fn relay_state(self) -> RelayState {
        match self {
            Self::Running => RelayState::On,
            Self::Idle | Self::Resting => RelayState::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    pub celsius: f32,
    pub sampled_at_ms: u64,
}
