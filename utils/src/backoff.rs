//! Cooperative delay and bounded retry with exponential backoff.
//!
//! # Policy
//!
//! - Delay before retry `n` (0-based): `initial * 2^n`, capped at `max`
//! - Down-jitter: multiplied by a random factor in `[1 - jitter_factor, 1.0]`
//! - At most `max_attempts` attempts in total (including the first)

use std::future::Future;
use std::time::Duration;

/// Sleep without blocking the executor thread.
pub async fn delay(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// 0.25 = up to 25% shorter than the nominal delay.
    pub jitter_factor: f64,
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            jitter_factor: 0.25,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// A policy that tries once and never sleeps.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Nominal delay before retry number `step` (0 before the first retry).
    #[must_use]
    pub fn nominal_delay(&self, step: u32) -> Duration {
        let base = self.initial.as_secs_f64() * 2.0_f64.powi(step.min(30) as i32);
        Duration::from_secs_f64(base.min(self.max.as_secs_f64()))
    }

    /// Jittered delay before retry number `step`.
    #[must_use]
    pub fn delay_for(&self, step: u32) -> Duration {
        let jitter = 1.0 - rand::random::<f64>() * self.jitter_factor.clamp(0.0, 1.0);
        self.nominal_delay(step).mul_f64(jitter)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// `op` receives the 0-based attempt number. The last error is returned.
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts => {
                let wait = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    attempts,
                    wait_ms = wait.as_millis() as u64,
                    "{label} failed: {e}"
                );
                delay(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
