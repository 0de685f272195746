use std::time::Duration;

/// Retry schedule for broker (re)connection.
///
/// `backoff_multiplier == 1` gives a fixed interval; larger values grow the
/// delay geometrically up to `max_delay_ms`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
    /// Spread each delay by up to ±10%.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1,
            jitter: false,
        }
    }

    pub fn unbounded(self) -> Self {
        Self {
            max_attempts: None,
            ..self
        }
    }

    pub fn with_backoff(mut self, multiplier: u64, max_delay_ms: u64) -> Self {
        self.backoff_multiplier = multiplier.max(1);
        self.max_delay_ms = max_delay_ms.max(self.initial_delay_ms);
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// True once `attempt` (1-based) is the last one allowed.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self
            .backoff_multiplier
            .max(1)
            .checked_pow(exponent)
            .and_then(|factor| self.initial_delay_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms.max(self.initial_delay_ms));

        if !self.jitter {
            return Duration::from_millis(base);
        }

        let jitter: f64 = rand::random_range(-0.1..=0.1);
        Duration::from_millis((base as f64 * (1.0 + jitter)) as u64)
    }
}
