//! Reconnect policy.
//!
//! After an unexpected close the client retries with a fixed delay. The
//! attempt counter starts at 1, goes up with every scheduled retry and only
//! resets after a fully authenticated connection. Once it passes the
//! configured maximum the client gives up for good.

use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::HubConfig;

/// What to do after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule attempt number `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Auto-reconnect is turned off
    Disabled,
    /// `attempts` retries were made without success
    Exhausted { attempts: u32 },
}

/// Attempt counter plus the single scheduled retry.
#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    max_retries: u32,
    delay: Duration,
    scheduled: Option<JoinHandle<()>>,
}

impl RetryState {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            attempt: 1,
            max_retries,
            delay,
            scheduled: None,
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.max_retries, config.reconnect_delay())
    }

    /// Decide the next step and advance the counter if a retry is due.
    pub fn next(&mut self) -> RetryDecision {
        if self.delay.is_zero() || self.max_retries == 0 {
            return RetryDecision::Disabled;
        }
        if self.attempt > self.max_retries {
            return RetryDecision::Exhausted {
                attempts: self.max_retries,
            };
        }
        let attempt = self.attempt;
        self.attempt += 1;
        RetryDecision::Retry {
            attempt,
            delay: self.delay,
        }
    }

    /// Back to the first attempt, after a successful authenticated connect.
    pub fn reset(&mut self) {
        self.attempt = 1;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a retry is scheduled or running.
    pub fn in_flight(&self) -> bool {
        self.scheduled.is_some()
    }

    pub fn set_scheduled(&mut self, task: JoinHandle<()>) {
        self.scheduled = Some(task);
    }

    /// Called by the retry task once its outcome is known.
    pub fn finish(&mut self) {
        self.scheduled = None;
    }

    /// Abort a scheduled retry.
    pub fn cancel(&mut self) {
        if let Some(task) = self.scheduled.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_max_retries() {
        let mut retry = RetryState::new(3, Duration::from_secs(5));

        for expected in 1..=3 {
            assert_eq!(
                retry.next(),
                RetryDecision::Retry {
                    attempt: expected,
                    delay: Duration::from_secs(5)
                }
            );
        }
        assert_eq!(retry.next(), RetryDecision::Exhausted { attempts: 3 });
        assert_eq!(retry.next(), RetryDecision::Exhausted { attempts: 3 });
    }

    #[test]
    fn test_reset_restarts_counting() {
        let mut retry = RetryState::new(2, Duration::from_secs(1));
        retry.next();
        retry.next();
        retry.reset();
        assert_eq!(retry.attempt(), 1);
        assert!(matches!(retry.next(), RetryDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn test_zero_delay_or_budget_disables() {
        assert_eq!(
            RetryState::new(5, Duration::ZERO).next(),
            RetryDecision::Disabled
        );
        assert_eq!(
            RetryState::new(0, Duration::from_secs(5)).next(),
            RetryDecision::Disabled
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_scheduled_retry() {
        let mut retry = RetryState::new(1, Duration::from_secs(1));
        retry.set_scheduled(tokio::spawn(std::future::pending::<()>()));
        assert!(retry.in_flight());

        retry.cancel();
        assert!(!retry.in_flight());
    }
}
