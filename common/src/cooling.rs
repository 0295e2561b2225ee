use log::info;

use crate::{
    config::CoolingConfig,
    ports::RelayOutput,
    types::{CoolingPhase, RelayState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunWindow {
    Never,
    Running { since_ms: u64 },
    Resting { since_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Demand,
    Satisfied,
    MaxRunExceeded,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Demand => "demand",
            Self::Satisfied => "setpoint reached",
            Self::MaxRunExceeded => "max run time exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CoolingPhase,
    pub to: CoolingPhase,
    pub reason: TransitionReason,
    pub at_ms: u64,
}

/// Hysteresis relay control with minimum rest and maximum run windows.
///
/// Demand starts at `setpoint + restart_offset_c` and is satisfied at or
/// below `setpoint`. A run ends when demand is satisfied or after
/// `max_run_ms`, whichever comes first. A rest lasts at least `min_rest_ms`,
/// even when demand returns immediately. The very first activation is never
/// throttled.
#[derive(Debug, Clone)]
pub struct CoolingController {
    config: CoolingConfig,
    window: RunWindow,
    relay: RelayState,
}

impl CoolingController {
    pub fn new(config: CoolingConfig) -> Self {
        Self {
            config,
            window: RunWindow::Never,
            relay: RelayState::Off,
        }
    }

    pub fn config(&self) -> &CoolingConfig {
        &self.config
    }

    pub fn phase(&self) -> CoolingPhase {
        match self.window {
            RunWindow::Never => CoolingPhase::Idle,
            RunWindow::Running { .. } => CoolingPhase::Running,
            RunWindow::Resting { .. } => CoolingPhase::Resting,
        }
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay
    }

    pub fn is_cooling(&self) -> bool {
        self.relay.is_on()
    }

    pub fn run_started_at(&self) -> Option<u64> {
        match self.window {
            RunWindow::Running { since_ms } => Some(since_ms),
            _ => None,
        }
    }

    pub fn rest_started_at(&self) -> Option<u64> {
        match self.window {
            RunWindow::Resting { since_ms } => Some(since_ms),
            _ => None,
        }
    }

    /// Writes the current relay state to the output regardless of what was
    /// last driven. Used once at startup to put the pin in a known state.
    pub fn sync_output<R: RelayOutput + ?Sized>(&self, relay: &mut R) {
        relay.set_output(self.relay.is_on());
    }

    pub fn evaluate<R: RelayOutput + ?Sized>(
        &mut self,
        temperature_c: f32,
        setpoint_c: f32,
        now_ms: u64,
        relay: &mut R,
    ) -> Option<Transition> {
        let demand = temperature_c >= setpoint_c + self.config.restart_offset_c;

        let (window, reason) = match self.window {
            RunWindow::Never if demand => (
                RunWindow::Running { since_ms: now_ms },
                TransitionReason::Demand,
            ),
            RunWindow::Never => return None,
            RunWindow::Running { since_ms } => {
                if now_ms.saturating_sub(since_ms) >= self.config.max_run_ms {
                    (
                        RunWindow::Resting { since_ms: now_ms },
                        TransitionReason::MaxRunExceeded,
                    )
                } else if temperature_c <= setpoint_c {
                    (
                        RunWindow::Resting { since_ms: now_ms },
                        TransitionReason::Satisfied,
                    )
                } else {
                    return None;
                }
            }
            RunWindow::Resting { since_ms } => {
                let rested = now_ms.saturating_sub(since_ms) >= self.config.min_rest_ms;
                if !(demand && rested) {
                    return None;
                }
                (
                    RunWindow::Running { since_ms: now_ms },
                    TransitionReason::Demand,
                )
            }
        };

        let from = self.phase();
        self.window = window;
        let to = self.phase();
        self.drive(relay, to.relay_state());

        info!(
            "cooling {} -> {} ({}) at {temperature_c:.2}C, setpoint {setpoint_c:.2}C",
            from.as_str(),
            to.as_str(),
            reason.as_str()
        );

        Some(Transition {
            from,
            to,
            reason,
            at_ms: now_ms,
        })
    }

    fn drive<R: RelayOutput + ?Sized>(&mut self, relay: &mut R, target: RelayState) {
        if self.relay == target {
            return;
        }
        relay.set_output(target.is_on());
        self.relay = target;
    }
}
