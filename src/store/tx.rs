//! Transaction-retry wrapper for the Store (§4.1).
//!
//! Re-runs a fallible operation on `StoreError::RetryableConflict` with
//! exponential backoff plus jitter, up to a bounded attempt count, honouring
//! an outer deadline: if the next delay would push past it, the wrapper
//! gives up without another attempt rather than overshoot.

use crate::error::StoreError;
use rand::Rng;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
        }
    }
}

/// Run `f` (a synchronous closure, expected to be called from within a
/// blocking task) until it succeeds, hits a non-retryable error, exhausts
/// `max_attempts`, or would overshoot `deadline`.
pub fn retry_on_conflict<T>(
    cfg: RetryConfig,
    deadline: Option<Instant>,
    mut f: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(StoreError::RetryableConflict(msg)) => {
                attempt += 1;
                if attempt >= cfg.max_attempts {
                    return Err(StoreError::Fatal(format!(
                        "exhausted {} retries: {msg}",
                        cfg.max_attempts
                    )));
                }
                let delay = next_delay(cfg, attempt);
                if let Some(deadline) = deadline {
                    if Instant::now() + delay > deadline {
                        return Err(StoreError::Fatal(format!(
                            "deadline exceeded after {attempt} retries: {msg}"
                        )));
                    }
                }
                std::thread::sleep(delay);
            }
            Err(other) => return Err(other),
        }
    }
}

fn next_delay(cfg: RetryConfig, attempt: u32) -> Duration {
    let base_ms = cfg.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
    let capped_ms = base_ms.min(cfg.max_delay.as_millis() as f64);
    let jitter = rand::thread_rng().gen_range(0.9..1.1);
    Duration::from_millis((capped_ms * jitter).max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(RetryConfig::default(), None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(StoreError::RetryableConflict("locked".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn non_retryable_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = retry_on_conflict(RetryConfig::default(), None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound)
        });
        assert!(matches!(result, Err(StoreError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhaustion_becomes_fatal() {
        let result: Result<(), StoreError> = retry_on_conflict(
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            None,
            || Err(StoreError::RetryableConflict("busy".into())),
        );
        assert!(matches!(result, Err(StoreError::Fatal(_))));
    }

    #[test]
    fn deadline_is_honoured() {
        let deadline = Instant::now() - Duration::from_secs(1);
        let result: Result<(), StoreError> = retry_on_conflict(
            RetryConfig::default(),
            Some(deadline),
            || Err(StoreError::RetryableConflict("busy".into())),
        );
        assert!(matches!(result, Err(StoreError::Fatal(_))));
    }
}
