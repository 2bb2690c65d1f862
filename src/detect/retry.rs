use std::time::Duration;

use super::backend::DetectError;
use crate::config::VisionSettings;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff around a single detection call.
///
/// Only transient errors (`DetectError::is_transient`) are retried. The policy
/// knows nothing about what the call does.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn from_settings(settings: &VisionSettings) -> Self {
        Self::new(settings.max_retries, settings.retry_base)
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `op`, retrying transient failures. `on_retry` sees each failure that
    /// is about to be retried together with the delay that follows it.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, DetectError>,
        mut on_retry: impl FnMut(u32, &DetectError, Duration),
    ) -> Result<T, DetectError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    on_retry(attempt + 1, &err, delay);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&VisionSettings::default())
    }
}
