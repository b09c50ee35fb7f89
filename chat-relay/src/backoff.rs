use std::time::Duration;

/// Exponential reconnect delay: doubles after every failed attempt up to
/// `max`, and drops back to `base` after a successful one.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay the next failure will wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait after a failure and doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = delay.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Renders a delay the way notices show it: whole seconds as `4s`,
/// anything finer in milliseconds.
pub fn format_delay(delay: Duration) -> String {
    if delay.subsec_nanos() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}
