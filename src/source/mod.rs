//! Message sources
//!
//! A [`MessageSource`] is the broker side of the consumer group: every worker
//! calls [`MessageSource::subscribe`] once and receives its own
//! [`Subscription`], an independent receive stream over the same topic
//! subscription. The source owns delivered messages until the worker settles
//! them with `ack`, `abandon` or `dead_letter`.
//!
//! Two sources ship with the crate:
//!
//! - [`InMemoryBroker`]: topics and subscriptions held in process, with
//!   message locks, delivery counting and a dead-letter sub-queue
//! - [`MessageDbSource`]: Message DB categories, one consumer group member
//!   per worker

pub mod error;
pub mod memory;
pub mod message;
pub mod message_db;

pub use error::SourceError;
pub use memory::{DeadLetter, InMemoryBroker};
pub use message::Message;
pub use message_db::{MessageDbSource, MessageDbSourceOptions};

use async_trait::async_trait;

/// Opaque connection credential
///
/// Never printed: `Debug` is redacted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Raw secret, for sources that need to connect with it
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Everything a source needs to open one worker's subscription
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub topic: String,
    pub subscription: String,
    pub credential: Credential,

    /// 1-based index of the subscribing worker
    pub worker_index: usize,

    /// Number of workers in the pool
    pub worker_count: usize,
}

impl SubscribeRequest {
    /// Entity path used in error context: `{topic}/subscriptions/{subscription}`
    pub fn entity_path(&self) -> String {
        entity_path(&self.topic, &self.subscription)
    }
}

pub fn entity_path(topic: &str, subscription: &str) -> String {
    format!("{}/subscriptions/{}", topic, subscription)
}

/// Broker-side subscription factory
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Namespace reported alongside errors (host, broker name)
    fn namespace(&self) -> String;

    /// Open an independent receive stream for one worker
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<Box<dyn Subscription>, SourceError>;
}

/// One worker's receive stream
///
/// Owned exclusively by its worker, hence `&mut self` everywhere.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message
    ///
    /// Returns `Ok(None)` once the subscription has been closed by the source.
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a message.
    async fn receive(&mut self) -> Result<Option<Message>, SourceError>;

    /// Settle a message as processed
    async fn ack(&mut self, message_id: &str) -> Result<(), SourceError>;

    /// Release a message for redelivery
    async fn abandon(&mut self, message_id: &str) -> Result<(), SourceError>;

    /// Move a message to the dead-letter holding area
    async fn dead_letter(&mut self, message_id: &str, reason: &str) -> Result<(), SourceError>;

    /// Stop receiving; unsettled messages go back to the source
    async fn close(&mut self) -> Result<(), SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("Endpoint=sb://x;SharedAccessKey=abc");
        assert_eq!(format!("{:?}", credential), "Credential(<redacted>)");
        assert_eq!(credential.expose(), "Endpoint=sb://x;SharedAccessKey=abc");
        assert!(!credential.is_empty());
        assert!(Credential::default().is_empty());
    }

    #[test]
    fn test_entity_path() {
        let request = SubscribeRequest {
            topic: "orders".to_string(),
            subscription: "billing".to_string(),
            credential: Credential::default(),
            worker_index: 1,
            worker_count: 4,
        };
        assert_eq!(request.entity_path(), "orders/subscriptions/billing");
    }
}
