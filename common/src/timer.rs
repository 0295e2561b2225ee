#[derive(Debug, Clone, Copy)]
pub struct TimerGate {
    interval_ms: u64,
    last_fired_ms: Option<u64>,
}

impl TimerGate {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_fired_ms: None,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Fires on the first call and then once at least `interval_ms` has passed
    /// since the previous fire. Firing moves the baseline to `now_ms`.
    pub fn due(&mut self, now_ms: u64) -> bool {
        let fire = self
            .last_fired_ms
            .map(|last| now_ms.saturating_sub(last) >= self.interval_ms)
            .unwrap_or(true);
        if fire {
            self.last_fired_ms = Some(now_ms);
        }
        fire
    }
}
