use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff applied between failed attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt, in milliseconds.
    pub base_ms: u64,
    /// Multiplier applied per additional attempt.
    pub factor: f64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            factor: 2.0,
            max_ms: 300_000, // 5 minutes
        }
    }
}

impl BackoffPolicy {
    /// Delay before the job becomes claimable again after `attempts` claims.
    ///
    /// `min(base_ms * factor^(attempts-1), max_ms)`; zero attempts yield no delay.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let exp = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
        let scaled = (self.base_ms as f64) * self.factor.powi(exp);
        let capped = if scaled.is_finite() {
            scaled.min(self.max_ms as f64)
        } else {
            self.max_ms as f64
        };

        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Returns true once a job's claims have used up its attempt budget.
pub fn should_dead_letter(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

/// What to do with a job whose handler just failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FinalizeDecision {
    /// Re-queue after the given delay.
    Retry {
        /// Backoff before the job is claimable again.
        delay: Duration,
    },
    /// Mark failed and copy into the dead-letter store.
    DeadLetter,
}

/// Decide between retry and dead-letter for a failed attempt.
pub fn decide_after_failure(
    attempts: u32,
    max_attempts: u32,
    policy: &BackoffPolicy,
) -> FinalizeDecision {
    if should_dead_letter(attempts, max_attempts) {
        FinalizeDecision::DeadLetter
    } else {
        FinalizeDecision::Retry {
            delay: policy.delay_for(attempts),
        }
    }
}
