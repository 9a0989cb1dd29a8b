use serde_json::json;
use uuid::Uuid;

use crate::message_db::{error::Result, types::WriteMessage, MessageDbClient};

/// Category positions start at 1
pub const INITIAL_POSITION: i64 = 1;

/// Position tracking for one subscription member
///
/// The next global position to read is kept in memory and written to the
/// position stream `{category}:position-{consumer_id}` every
/// `update_interval` settled messages, and on demand.
pub struct PositionTracker {
    client: MessageDbClient,
    position_stream_name: String,
    update_interval: usize,
    messages_since_update: usize,
    current_position: i64,
}

impl PositionTracker {
    pub fn new(
        client: MessageDbClient,
        category: &str,
        consumer_id: &str,
        update_interval: usize,
    ) -> Self {
        Self {
            client,
            position_stream_name: position_stream_name(category, consumer_id),
            update_interval: update_interval.max(1),
            messages_since_update: 0,
            current_position: INITIAL_POSITION,
        }
    }

    pub fn position_stream_name(&self) -> &str {
        &self.position_stream_name
    }

    /// Read the last stored position, falling back to the start of the category
    pub async fn read_position(&mut self) -> Result<i64> {
        let stored = self
            .client
            .get_last_stream_message(&self.position_stream_name, None)
            .await?;

        self.current_position = stored
            .and_then(|msg| msg.data.get("position").and_then(|v| v.as_i64()))
            .unwrap_or(INITIAL_POSITION);

        Ok(self.current_position)
    }

    /// Record that everything before `next_position` is settled
    ///
    /// Positions never move backwards.
    pub async fn update_position(&mut self, next_position: i64) -> Result<()> {
        if next_position <= self.current_position {
            return Ok(());
        }

        self.current_position = next_position;
        self.messages_since_update += 1;

        if self.messages_since_update >= self.update_interval {
            self.write_position().await?;
        }

        Ok(())
    }

    /// Force write the current position to the position stream
    pub async fn write_position(&mut self) -> Result<()> {
        let msg = WriteMessage::new(Uuid::new_v4(), &self.position_stream_name, "PositionUpdated")
            .with_data(json!({ "position": self.current_position }));

        self.client.write_message(msg).await?;
        self.messages_since_update = 0;
        Ok(())
    }

    pub fn current_position(&self) -> i64 {
        self.current_position
    }

    pub fn messages_since_update(&self) -> usize {
        self.messages_since_update
    }
}

/// Name of the stream holding a consumer's position
pub fn position_stream_name(category: &str, consumer_id: &str) -> String {
    format!("{}:position-{}", category, consumer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_stream_name() {
        assert_eq!(
            position_stream_name("orders", "billing-1"),
            "orders:position-billing-1"
        );
    }

    #[test]
    fn test_position_stream_name_with_types() {
        assert_eq!(
            position_stream_name("orders:command", "billing-2"),
            "orders:command:position-billing-2"
        );
    }
}
