use rand::Rng;
use std::time::Duration;

/// Retry/backoff policy owned by the worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total deliveries a job gets before it is dead-lettered.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Proportional jitter in [0, 1].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
}

impl RetryPolicy {
    /// Decide what happens to a job whose delivery number `attempt` (zero-based)
    /// just failed.
    pub fn decide(&self, attempt: u32, rng: &mut impl Rng) -> RetryDecision {
        let failures = attempt.saturating_add(1);
        if failures >= self.max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.backoff(failures, rng),
            }
        }
    }

    /// `base * 2^(failures - 1)`, capped, then jittered within the cap.
    pub fn backoff(&self, failures: u32, rng: &mut impl Rng) -> Duration {
        let exp = failures.max(1).saturating_sub(1);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;

        let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(pow2).min(max_ms);

        if self.jitter <= 0.0 || delay_ms == 0 {
            return Duration::from_millis(delay_ms);
        }

        let range = delay_ms as f64 * self.jitter;
        let jittered = delay_ms as f64 + rng.gen_range(-range..=range);
        Duration::from_millis(jittered.round().clamp(0.0, max_ms as f64) as u64)
    }
}
