//! Retry with exponential backoff.
//!
//! Used for rate-limited model calls and flaky CI API requests. Sleeping
//! goes through [`Sleeper`] so tests never wait on a real clock.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Retry policy: up to `max_retries` retries after the first attempt,
/// doubling the delay each time up to `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `operation` until it succeeds, returns a non-retryable error, or
    /// the retry budget is spent. The last error is returned on give-up.
    pub fn run<T, E, F, R>(
        &self,
        sleeper: &dyn Sleeper,
        mut operation: F,
        retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_retries && retryable(&err) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "transient error, retrying"
                    );
                    sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempts = attempt + 1, err = %err, "giving up");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: RefCell<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.borrow_mut().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(3))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(3));
        assert_eq!(p.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let sleeper = RecordingSleeper::default();
        let out: Result<u32, String> = policy().run(
            &sleeper,
            |attempt| {
                if attempt < 2 {
                    Err("429".to_string())
                } else {
                    Ok(attempt)
                }
            },
            |err| err == "429",
        );
        assert_eq!(out, Ok(2));
        assert_eq!(
            *sleeper.slept.borrow(),
            [Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn stops_on_permanent_error() {
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let out: Result<(), String> = policy().run(
            &sleeper,
            |_| {
                calls += 1;
                Err("401".to_string())
            },
            |err| err == "429",
        );
        assert_eq!(out, Err("401".to_string()));
        assert_eq!(calls, 1);
        assert!(sleeper.slept.borrow().is_empty());
    }

    #[test]
    fn gives_up_after_budget() {
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let out: Result<(), String> = policy().run(
            &sleeper,
            |_| {
                calls += 1;
                Err("429".to_string())
            },
            |_| true,
        );
        assert!(out.is_err());
        assert_eq!(calls, 4);
        assert_eq!(sleeper.slept.borrow().len(), 3);
    }
}
