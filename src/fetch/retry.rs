use rand::Rng;
use std::time::Duration;

/// Backoff schedule for retrying transient failures (provider rate limits,
/// timeouts, store transport errors).
///
/// Delays grow exponentially from `base_delay`, are capped at `max_delay`,
/// and get ±50% jitter so concurrent fetch tasks do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay to sleep before retry number `attempt` (1-based: the delay
    /// after the first failure is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exp));
        let capped = std::cmp::min(raw, self.max_delay);

        if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let factor = rng.random_range(0.5..1.5);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}
