use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Message, MessageSource, SourceError, SubscribeRequest, Subscription};
use crate::message_db::{
    CategoryReadOptions, MessageDbClient, MessageDbConfig, PositionTracker, StoredMessage,
    WriteMessage,
};

/// Message type written to dead-letter streams
pub const DEAD_LETTER_MESSAGE_TYPE: &str = "DeadLettered";

/// Tuning for Message DB subscriptions
#[derive(Debug, Clone)]
pub struct MessageDbSourceOptions {
    /// Maximum messages to retrieve per read
    pub batch_size: i64,

    /// Wait time when no messages are available (milliseconds)
    pub polling_interval_ms: u64,

    /// Write position after this many settled messages
    pub position_update_interval: usize,

    /// Connections per worker
    pub max_pool_size: usize,

    /// Message DB schema
    pub schema_name: String,
}

impl Default for MessageDbSourceOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            polling_interval_ms: 100,
            position_update_interval: 100,
            max_pool_size: 2,
            schema_name: "message_store".to_string(),
        }
    }
}

impl MessageDbSourceOptions {
    /// Set the batch size (builder pattern)
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the polling interval in milliseconds (builder pattern)
    pub fn with_polling_interval_ms(mut self, interval_ms: u64) -> Self {
        self.polling_interval_ms = interval_ms;
        self
    }

    /// Set the position update interval (builder pattern)
    pub fn with_position_update_interval(mut self, interval: usize) -> Self {
        self.position_update_interval = interval;
        self
    }
}

/// Message DB backed message source
///
/// The topic is a Message DB category. Each worker builds its own client from
/// the connection-string credential and reads the category as member
/// `worker_index - 1` of a consumer group of `worker_count`, so workers see
/// disjoint streams and never the same message. Acknowledging advances the
/// worker's position stream `{category}:position-{subscription}-{index}`;
/// dead-lettering writes a `DeadLettered` message to
/// `{category}:deadletter-{subscription}` and then advances the position.
///
/// Delivery counts are kept in memory: a restarted worker starts counting
/// from 1 again.
pub struct MessageDbSource {
    options: MessageDbSourceOptions,
    namespace: String,
}

impl MessageDbSource {
    pub fn new(options: MessageDbSourceOptions) -> Self {
        Self {
            options,
            namespace: "message-db".to_string(),
        }
    }

    /// Set the namespace reported in error context (builder pattern)
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

#[async_trait]
impl MessageSource for MessageDbSource {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        let config = MessageDbConfig::from_connection_string(request.credential.expose())?
            .with_max_pool_size(self.options.max_pool_size)
            .with_schema_name(self.options.schema_name.clone());

        let client = MessageDbClient::new(config).await?;

        let consumer_id = format!("{}-{}", request.subscription, request.worker_index);
        let mut position_tracker = PositionTracker::new(
            client.clone(),
            &request.topic,
            &consumer_id,
            self.options.position_update_interval,
        );
        let position = position_tracker.read_position().await?;

        info!(
            worker = request.worker_index,
            category = %request.topic,
            position_stream = %position_tracker.position_stream_name(),
            position,
            "Message DB subscription opened"
        );

        Ok(Box::new(MessageDbSubscription {
            client,
            dead_letter_stream: dead_letter_stream_name(&request.topic, &request.subscription),
            category: request.topic,
            member: request.worker_index.saturating_sub(1) as i64,
            group_size: request.worker_count.max(1) as i64,
            batch_size: self.options.batch_size,
            polling_interval: Duration::from_millis(self.options.polling_interval_ms),
            next_read_position: position,
            position_tracker,
            buffer: VecDeque::new(),
            in_flight: BTreeMap::new(),
            delivery_counts: HashMap::new(),
            closed: false,
        }))
    }
}

/// Name of the stream receiving a subscription's dead letters
pub fn dead_letter_stream_name(category: &str, subscription: &str) -> String {
    format!("{}:deadletter-{}", category, subscription)
}

struct MessageDbSubscription {
    client: MessageDbClient,
    category: String,
    dead_letter_stream: String,
    member: i64,
    group_size: i64,
    batch_size: i64,
    polling_interval: Duration,
    /// Next global position to fetch
    next_read_position: i64,
    position_tracker: PositionTracker,
    /// Fetched, not yet delivered
    buffer: VecDeque<StoredMessage>,
    /// Delivered, not yet settled, keyed by global position
    in_flight: BTreeMap<i64, StoredMessage>,
    delivery_counts: HashMap<Uuid, u32>,
    closed: bool,
}

impl MessageDbSubscription {
    async fn fill_buffer(&mut self) -> Result<(), SourceError> {
        loop {
            let options = CategoryReadOptions::new(&self.category)
                .with_position(self.next_read_position)
                .with_batch_size(self.batch_size)
                .with_consumer_group(self.member, self.group_size);

            let messages = self.client.get_category_messages(options).await?;

            if let Some(last) = messages.last() {
                self.next_read_position = last.global_position + 1;
                self.buffer.extend(messages);
                return Ok(());
            }

            time::sleep(self.polling_interval).await;
        }
    }

    fn take_in_flight(&mut self, message_id: &str) -> Result<StoredMessage, SourceError> {
        let global_position = self
            .in_flight
            .iter()
            .find(|(_, msg)| msg.id.to_string() == message_id)
            .map(|(position, _)| *position)
            .ok_or_else(|| {
                SourceError::LockLost(format!("message '{}' is not in flight", message_id))
            })?;

        self.in_flight
            .remove(&global_position)
            .ok_or_else(|| SourceError::LockLost(format!("message '{}'", message_id)))
    }

    /// Everything before the oldest unsettled message is settled
    fn settled_position(&self) -> i64 {
        let oldest_in_flight = self.in_flight.keys().next().copied();
        let oldest_buffered = self.buffer.iter().map(|m| m.global_position).min();

        oldest_in_flight
            .into_iter()
            .chain(oldest_buffered)
            .min()
            .unwrap_or(self.next_read_position)
    }

    /// Record settled progress; the message itself is already settled
    async fn advance_position(&mut self) {
        let position = self.settled_position();
        // The tracker keeps the position and writes it on the next update or close
        if let Err(e) = self.position_tracker.update_position(position).await {
            warn!(
                category = %self.category,
                position,
                error = %e,
                "Failed to store position"
            );
        }
    }
}

fn to_message(stored: &StoredMessage, delivery_count: u32) -> Result<Message, SourceError> {
    let body = serde_json::to_vec(&stored.data).map_err(|e| {
        SourceError::Protocol(format!("message '{}' data is not serializable: {}", stored.id, e))
    })?;

    Ok(Message {
        id: stored.id.to_string(),
        sequence_number: stored.global_position,
        body: Bytes::from(body),
        delivery_count,
        subject: Some(stored.message_type.clone()),
        enqueued_at: stored.time,
    })
}

#[async_trait]
impl Subscription for MessageDbSubscription {
    async fn receive(&mut self) -> Result<Option<Message>, SourceError> {
        if self.closed {
            return Ok(None);
        }

        if self.buffer.is_empty() {
            self.fill_buffer().await?;
        }

        let Some(stored) = self.buffer.pop_front() else {
            return Ok(None);
        };

        let count = self.delivery_counts.entry(stored.id).or_insert(0);
        *count += 1;
        let message = match to_message(&stored, *count) {
            Ok(message) => message,
            Err(e) => {
                // Position must not move past a message nobody has seen
                self.buffer.push_front(stored);
                return Err(e);
            }
        };

        self.in_flight.insert(stored.global_position, stored);
        Ok(Some(message))
    }

    async fn ack(&mut self, message_id: &str) -> Result<(), SourceError> {
        let stored = self.take_in_flight(message_id)?;
        self.delivery_counts.remove(&stored.id);
        self.advance_position().await;
        Ok(())
    }

    async fn abandon(&mut self, message_id: &str) -> Result<(), SourceError> {
        let stored = self.take_in_flight(message_id)?;
        debug!(message_id, global_position = stored.global_position, "Message abandoned");
        self.buffer.push_front(stored);
        Ok(())
    }

    async fn dead_letter(&mut self, message_id: &str, reason: &str) -> Result<(), SourceError> {
        let stored = self.take_in_flight(message_id)?;
        let delivery_count = self.delivery_counts.get(&stored.id).copied().unwrap_or(0);

        let mut dead_letter =
            WriteMessage::new(Uuid::new_v4(), &self.dead_letter_stream, DEAD_LETTER_MESSAGE_TYPE)
                .with_data(json!({
                    "message_id": stored.id,
                    "stream_name": stored.stream_name,
                    "type": stored.message_type,
                    "global_position": stored.global_position,
                    "delivery_count": delivery_count,
                    "reason": reason,
                    "data": stored.data,
                }));
        if let Some(correlation_id) = stored.correlation_id() {
            dead_letter = dead_letter.with_metadata(json!({ "correlation_id": correlation_id }));
        }

        if let Err(e) = self.client.write_message(dead_letter).await {
            // Still in flight: the settlement can be retried or the message abandoned
            self.in_flight.insert(stored.global_position, stored);
            return Err(e.into());
        }

        self.delivery_counts.remove(&stored.id);
        self.advance_position().await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Unsettled messages are read again from the stored position
        self.in_flight.clear();
        self.buffer.clear();

        if self.position_tracker.messages_since_update() > 0 {
            self.position_tracker.write_position().await?;
        }
        Ok(())
    }
}
