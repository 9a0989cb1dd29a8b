use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message received from a subscription
///
/// Immutable once delivered. The source keeps ownership of the underlying
/// broker message until the worker acknowledges or dead-letters it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-assigned message identifier
    pub id: String,

    /// Monotonic within one subscription, not across subscriptions
    pub sequence_number: i64,

    pub body: Bytes,

    /// Number of times this message has been handed out, 1 on first delivery
    pub delivery_count: u32,

    /// Optional label set by the publisher (message type for Message DB)
    pub subject: Option<String>,

    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, sequence_number: i64, body: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            sequence_number,
            body: body.into(),
            delivery_count: 1,
            subject: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Set the subject (builder pattern)
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the delivery count (builder pattern)
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Body as UTF-8 text, if it is valid UTF-8
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}
