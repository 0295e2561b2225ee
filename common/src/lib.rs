pub mod clock;
pub mod config;
pub mod control;
pub mod cooling;
pub mod ports;
pub mod retry;
pub mod setpoint;
pub mod status;
pub mod timer;
pub mod topics;
pub mod types;

pub use clock::{Clock, MonotonicClock};
pub use config::{
    ControlConfig, CoolingConfig, HardwareConfig, NetworkConfig, RetryConfig, RuntimeConfig,
    TopicConfig,
};
pub use control::{ControlLoop, ControllerState, CycleReport, LinkStatus};
pub use cooling::{CoolingController, Transition, TransitionReason};
pub use ports::{InboundMessage, MessageBus, Publish, RelayOutput, TemperatureSensor, Transport};
pub use retry::{ConnectOutcome, RetryBudget, RetryingConnector};
pub use setpoint::{SetpointChannel, SetpointError};
pub use status::{StatusRecord, StatusReporter};
pub use timer::TimerGate;
pub use topics::*;
pub use types::{CoolingPhase, RelayState, TemperatureReading};
