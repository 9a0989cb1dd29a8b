use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message data for writing to Message DB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteMessage {
    /// Unique identifier for the message
    pub id: Uuid,

    /// Target stream name
    pub stream_name: String,

    /// Message type/class name (e.g., "Withdrawn", "DeadLettered")
    #[serde(rename = "type")]
    pub message_type: String,

    /// Business data payload
    #[serde(default)]
    pub data: Value,

    /// Infrastructural/mechanical data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// Expected current version for concurrency control
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
}

impl WriteMessage {
    /// Create a new WriteMessage
    ///
    /// # Example
    ///
    /// ```
    /// use topic_consumers::message_db::WriteMessage;
    /// use uuid::Uuid;
    /// use serde_json::json;
    ///
    /// let msg = WriteMessage::new(Uuid::new_v4(), "orders-123", "OrderPlaced")
    ///     .with_data(json!({ "amount": 50 }))
    ///     .with_metadata(json!({ "correlation_id": "xyz-789" }));
    /// ```
    pub fn new(id: Uuid, stream_name: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            id,
            stream_name: stream_name.into(),
            message_type: message_type.into(),
            data: Value::Object(serde_json::Map::new()),
            metadata: None,
            expected_version: None,
        }
    }

    /// Set the data payload (builder pattern)
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set the metadata (builder pattern)
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the expected version for optimistic concurrency control (builder pattern)
    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Message data read from Message DB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,

    pub stream_name: String,

    #[serde(rename = "type")]
    pub message_type: String,

    pub data: Value,

    pub metadata: Option<Value>,

    /// Ordinal position in the stream (0-based)
    pub position: i64,

    /// Ordinal position in entire message store
    pub global_position: i64,

    /// UTC timestamp when message was written
    pub time: DateTime<Utc>,
}

impl StoredMessage {
    /// Get the correlation ID from metadata if present
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("correlation_id"))
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_message_builder() {
        let id = Uuid::new_v4();
        let msg = WriteMessage::new(id, "orders-123", "OrderPlaced")
            .with_data(json!({ "amount": 50 }))
            .with_metadata(json!({ "correlation_id": "xyz" }))
            .with_expected_version(4);

        assert_eq!(msg.id, id);
        assert_eq!(msg.stream_name, "orders-123");
        assert_eq!(msg.message_type, "OrderPlaced");
        assert_eq!(msg.data["amount"], 50);
        assert_eq!(msg.metadata.as_ref().unwrap()["correlation_id"], "xyz");
        assert_eq!(msg.expected_version, Some(4));
    }

    #[test]
    fn test_write_message_serializes_type_field() {
        let msg = WriteMessage::new(Uuid::new_v4(), "orders-1", "OrderPlaced");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "OrderPlaced");
        assert!(json.get("metadata").is_none());
        assert!(json.get("expected_version").is_none());
    }

    #[test]
    fn test_correlation_id() {
        let mut msg = StoredMessage {
            id: Uuid::new_v4(),
            stream_name: "orders-123".to_string(),
            message_type: "OrderPlaced".to_string(),
            data: json!({}),
            metadata: Some(json!({ "correlation_id": "corr-123" })),
            position: 0,
            global_position: 1,
            time: Utc::now(),
        };
        assert_eq!(msg.correlation_id(), Some("corr-123"));

        msg.metadata = None;
        assert_eq!(msg.correlation_id(), None);
    }
}
