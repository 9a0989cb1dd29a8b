use std::time::Duration;

use crate::consumer::error::{ConsumerError, Result};
use crate::source::Credential;

/// Number of workers when none is configured
pub const DEFAULT_WORKER_COUNT: usize = 20;

/// Deliveries allowed before a message is dead-lettered
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Configuration for a consumer pool
///
/// Immutable once the pool has been started; workers share it read-only.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers, each with its own subscription
    pub worker_count: usize,

    /// Topic to consume from
    pub topic: String,

    /// Subscription on the topic
    pub subscription: String,

    /// Credential handed to the source on subscribe
    pub credential: Credential,

    /// Maximum number of times a message is handed to the handler
    ///
    /// The handler sees at most this many deliveries: a retry on the last one
    /// dead-letters the message with `MaxDeliveryExceeded`.
    pub max_delivery_count: u32,

    /// Pause after a transient source error before trying again
    pub retry_backoff: Duration,
}

impl PoolConfig {
    /// Create a new pool configuration
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use topic_consumers::consumer::PoolConfig;
    /// use topic_consumers::source::Credential;
    ///
    /// let config = PoolConfig::new("orders", "billing", Credential::new("secret"))
    ///     .with_worker_count(4)
    ///     .with_max_delivery_count(5)
    ///     .with_retry_backoff(Duration::from_millis(250));
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(
        topic: impl Into<String>,
        subscription: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            topic: topic.into(),
            subscription: subscription.into(),
            credential,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Set the worker count (builder pattern)
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the maximum delivery count (builder pattern)
    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    /// Set the transient error backoff (builder pattern)
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Check the configuration before any worker is spawned
    pub fn validate(&self) -> Result<()> {
        if self.worker_count < 1 {
            return Err(ConsumerError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(ConsumerError::Config("topic must not be empty".to_string()));
        }
        if self.subscription.trim().is_empty() {
            return Err(ConsumerError::Config(
                "subscription must not be empty".to_string(),
            ));
        }
        if self.max_delivery_count < 1 {
            return Err(ConsumerError::Config(
                "max_delivery_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig::new("orders", "billing", Credential::new("secret"))
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.max_delivery_count, DEFAULT_MAX_DELIVERY_COUNT);
        assert_eq!(config.retry_backoff, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = config()
            .with_worker_count(3)
            .with_max_delivery_count(2)
            .with_retry_backoff(Duration::from_millis(10));

        assert_eq!(config.worker_count, 3);
        assert_eq!(config.max_delivery_count, 2);
        assert_eq!(config.retry_backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let err = config().with_worker_count(0).validate().unwrap_err();
        assert!(matches!(err, ConsumerError::Config(_)));
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn test_validate_rejects_blank_names() {
        let blank_topic = PoolConfig::new("  ", "billing", Credential::default());
        assert!(blank_topic.validate().is_err());

        let blank_subscription = PoolConfig::new("orders", "", Credential::default());
        assert!(blank_subscription.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_max_delivery() {
        assert!(config().with_max_delivery_count(0).validate().is_err());
    }

    #[test]
    fn test_debug_does_not_leak_credential() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("secret"));
    }
}
