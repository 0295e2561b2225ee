use log::{debug, info, warn};

use crate::{clock::Clock, config::RetryConfig, ports::Transport};

/// Attempt accounting for one connection sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts: u32,
    max_attempts: u32,
}

impl RetryBudget {
    pub fn new(spacing_ms: u64, timeout_ms: u64) -> Self {
        let max_attempts = timeout_ms
            .checked_div(spacing_ms)
            .unwrap_or(1)
            .try_into()
            .unwrap_or(u32::MAX);
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Claims the next attempt, or returns `false` once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.attempts += 1;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl ConnectOutcome {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryingConnector {
    spacing_ms: u64,
    timeout_ms: u64,
}

impl RetryingConnector {
    pub fn new(spacing_ms: u64, timeout_ms: u64) -> Self {
        Self {
            spacing_ms,
            timeout_ms,
        }
    }

    pub fn from_config(config: RetryConfig) -> Self {
        Self::new(config.spacing_ms, config.timeout_ms)
    }

    /// Runs one bounded connection sequence. Sleeps `spacing_ms` between
    /// attempts only. Stops at the attempt cap or once `timeout_ms` has
    /// elapsed on `clock`, whichever comes first, so a slow `attempt` can
    /// overrun the timeout by at most its own duration.
    pub fn connect<T, C>(&self, transport: &mut T, clock: &C) -> ConnectOutcome
    where
        T: Transport + ?Sized,
        C: Clock + ?Sized,
    {
        let mut budget = RetryBudget::new(self.spacing_ms, self.timeout_ms);
        let started_ms = clock.now_ms();
        let name = transport.name();
        info!(
            "{name} connecting (up to {} attempts, {} ms apart)",
            budget.max_attempts(),
            self.spacing_ms
        );

        while budget.begin_attempt() {
            let attempt = budget.attempts();
            if transport.attempt() {
                info!("{name} connected on attempt {attempt}");
                return ConnectOutcome::Connected { attempts: attempt };
            }
            debug!(
                "{name} attempt {attempt}/{} failed",
                budget.max_attempts()
            );

            if budget.is_exhausted() {
                break;
            }
            let remaining_ms = self
                .timeout_ms
                .saturating_sub(clock.now_ms().saturating_sub(started_ms));
            if remaining_ms == 0 {
                break;
            }
            clock.sleep_ms(self.spacing_ms.min(remaining_ms));
            if clock.now_ms().saturating_sub(started_ms) >= self.timeout_ms {
                break;
            }
        }

        warn!(
            "{name} unreachable after {} attempts; retrying next cycle",
            budget.attempts()
        );
        ConnectOutcome::Exhausted {
            attempts: budget.attempts(),
        }
    }
}
