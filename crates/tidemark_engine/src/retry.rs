//! Retry scheduling and error classification.

use crate::config::RetryConfig;
use crate::error::ReplicationError;
use std::time::Duration;

/// What to do after an engine cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the given delay, then run the cycle again.
    Retry(Duration),
    /// Give up: the failure is fatal for this replication.
    Fatal,
}

/// Per-engine retry controller.
///
/// Wraps one engine's cycle loop: transient network errors retry with
/// capped exponential backoff and no attempt bound (live replication is
/// expected to outlast outages); protocol errors retry up to the
/// configured bound and then become fatal; storage and configuration
/// faults are fatal immediately. Any successful cycle resets the
/// backoff.
#[derive(Debug)]
pub struct RetryController {
    config: RetryConfig,
    attempt: u32,
}

impl RetryController {
    /// Creates a controller with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Classifies a failure and schedules the next attempt.
    pub fn decide(&mut self, error: &ReplicationError) -> RetryDecision {
        match error {
            ReplicationError::Network(_) => {
                self.attempt = self.attempt.saturating_add(1);
                RetryDecision::Retry(self.config.delay_for_attempt(self.attempt))
            }
            ReplicationError::Protocol(_) => {
                self.attempt = self.attempt.saturating_add(1);
                if self.attempt >= self.config.max_protocol_attempts {
                    RetryDecision::Fatal
                } else {
                    RetryDecision::Retry(self.config.delay_for_attempt(self.attempt))
                }
            }
            ReplicationError::Storage(_)
            | ReplicationError::Configuration(_)
            | ReplicationError::Cancelled => RetryDecision::Fatal,
        }
    }

    /// Resets the backoff after a successful cycle.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the number of consecutive failed attempts.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RetryController {
        RetryController::new(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .without_jitter(),
        )
    }

    #[test]
    fn network_errors_retry_unbounded() {
        let mut retry = controller();
        let err = ReplicationError::Network("offline".into());

        for _ in 0..100 {
            assert!(matches!(retry.decide(&err), RetryDecision::Retry(_)));
        }
        assert_eq!(retry.attempts(), 100);
    }

    #[test]
    fn protocol_errors_become_fatal_after_bound() {
        let mut retry = controller();
        let err = ReplicationError::Protocol("garbage response".into());

        assert!(matches!(retry.decide(&err), RetryDecision::Retry(_)));
        assert!(matches!(retry.decide(&err), RetryDecision::Retry(_)));
        assert_eq!(retry.decide(&err), RetryDecision::Fatal);
    }

    #[test]
    fn storage_errors_are_immediately_fatal() {
        let mut retry = controller();
        let err = ReplicationError::Storage("torn write".into());
        assert_eq!(retry.decide(&err), RetryDecision::Fatal);
    }

    #[test]
    fn success_resets_backoff() {
        let mut retry = controller();
        let err = ReplicationError::Network("offline".into());

        let RetryDecision::Retry(first) = retry.decide(&err) else {
            panic!("expected retry");
        };
        retry.decide(&err);
        let RetryDecision::Retry(third) = retry.decide(&err) else {
            panic!("expected retry");
        };
        assert!(third > first, "backoff must grow across attempts");

        retry.reset();
        assert_eq!(retry.attempts(), 0);
        assert_eq!(retry.decide(&err), RetryDecision::Retry(first));
    }
}
