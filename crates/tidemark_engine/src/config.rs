//! Configuration for replication states.

use crate::error::{ReplicationError, ReplicationResult};
use std::time::Duration;

/// Configuration for one replication state.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Stable identifier scoping checkpoints and active-replication
    /// bookkeeping. Must survive restarts unchanged to resume correctly.
    pub identifier: String,
    /// Live mode keeps replicating on notifications after the initial
    /// pass; one-shot mode stops once both directions are caught up.
    pub live: bool,
    /// Maximum documents requested per pull cycle.
    pub pull_batch_size: usize,
    /// Maximum write rows sent per push cycle.
    pub push_batch_size: usize,
    /// Pull re-poll interval in live mode when the backend offers no
    /// change subscription.
    pub poll_interval: Duration,
    /// Retry configuration shared by both engines.
    pub retry: RetryConfig,
}

impl ReplicationConfig {
    /// Creates a configuration with default batch sizes and retries.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            live: true,
            pull_batch_size: 100,
            push_batch_size: 100,
            poll_interval: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    /// Switches between live and one-shot mode.
    #[must_use]
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Sets the pull batch size.
    #[must_use]
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    #[must_use]
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the live-mode poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration before any I/O happens.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.identifier.is_empty() {
            return Err(ReplicationError::Configuration(
                "replication identifier must not be empty".into(),
            ));
        }
        if self.pull_batch_size == 0 || self.push_batch_size == 0 {
            return Err(ReplicationError::Configuration(
                "batch sizes must be greater than zero".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ReplicationError::Configuration(
                "poll interval must be greater than zero".into(),
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ReplicationError::Configuration(
                "retry backoff multiplier must be a finite value of at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempt bound for protocol errors before they become fatal.
    /// Transient network errors are never bounded.
    pub max_protocol_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given protocol-error bound.
    pub fn new(max_protocol_attempts: u32) -> Self {
        Self {
            max_protocol_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter, for deterministic tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the backoff delay for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        // Clamped to [0, max_delay]: a negative or non-finite multiplier
        // slipping past validation must not panic `Duration::from_secs_f64`.
        // `min`/`max` drop a NaN operand, so the result is always finite.
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * pseudo_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Simple deterministic "jitter" (no external RNG dependency).
fn pseudo_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ReplicationConfig::new("users-remote1")
            .with_live(false)
            .with_pull_batch_size(50)
            .with_push_batch_size(25)
            .with_poll_interval(Duration::from_secs(1));

        assert_eq!(config.identifier, "users-remote1");
        assert!(!config.live);
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.push_batch_size, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_identifier() {
        let config = ReplicationConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(ReplicationError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = ReplicationConfig::new("x").with_pull_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn rejects_bad_backoff_multiplier() {
        for multiplier in [0.5, 0.0, -2.0, f64::NAN, f64::INFINITY] {
            let config = ReplicationConfig::new("x")
                .with_retry(RetryConfig::new(3).with_backoff_multiplier(multiplier));
            assert!(
                matches!(config.validate(), Err(ReplicationError::Configuration(_))),
                "multiplier {multiplier} must be rejected"
            );
        }
    }

    #[test]
    fn bad_backoff_multiplier_never_panics_the_delay() {
        // An unvalidated config still yields a usable delay.
        let negative = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(-2.0)
            .without_jitter();
        assert_eq!(negative.delay_for_attempt(2), Duration::ZERO);

        let nan = RetryConfig::new(3).with_backoff_multiplier(f64::NAN);
        let delay = nan.delay_for_attempt(2);
        assert!(delay <= nan.max_delay + nan.max_delay / 4);
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        // Even with a high multiplier, must not exceed max plus jitter
        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250));
    }
}
