use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{entity_path, Credential, Message, MessageSource, SourceError, SubscribeRequest, Subscription};

/// A message moved to a subscription's dead-letter sub-queue
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
}

/// In-process topic/subscription broker
///
/// Every subscription has its own copy of each published message. Receivers
/// attached to the same subscription compete for messages: a received message
/// is locked to the receiver that got it until that receiver settles it, and
/// is returned to the subscription if the receiver closes or is dropped first.
///
/// Cloning the broker yields another handle to the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    namespace: String,
    credential: Option<Credential>,
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
}

#[derive(Default)]
struct TopicState {
    next_sequence: i64,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Default)]
struct SubscriptionState {
    ready: VecDeque<Message>,
    locked: HashMap<String, Message>,
    acknowledged: Vec<Message>,
    dead_letters: Vec<DeadLetter>,
    injected_errors: VecDeque<SourceError>,
    injected_settle_errors: VecDeque<SourceError>,
    closed: bool,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // State stays consistent across a panicking holder: every mutation is a single step
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BrokerState {
    fn subscription_mut(
        &mut self,
        topic: &str,
        subscription: &str,
    ) -> Result<&mut SubscriptionState, SourceError> {
        self.topics
            .get_mut(topic)
            .ok_or_else(|| SourceError::NotFound(format!("topic '{}'", topic)))?
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| SourceError::NotFound(entity_path(topic, subscription)))
    }

    fn subscription(&self, topic: &str, subscription: &str) -> Option<&SubscriptionState> {
        self.topics.get(topic)?.subscriptions.get(subscription)
    }
}

impl InMemoryBroker {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                namespace: namespace.into(),
                credential: None,
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Require subscribers to present this credential
    pub fn with_credential(namespace: impl Into<String>, credential: Credential) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                namespace: namespace.into(),
                credential: Some(credential),
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a subscription, creating the topic if needed
    ///
    /// Only messages published after the subscription exists are delivered to it.
    pub fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut state = self.inner.state();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry(subscription.to_string())
            .or_default();
    }

    /// Publish one message to every subscription of a topic, returning its id
    pub fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<String, SourceError> {
        self.publish_with_subject(topic, None, body)
    }

    pub fn publish_with_subject(
        &self,
        topic: &str,
        subject: Option<&str>,
        body: impl Into<Bytes>,
    ) -> Result<String, SourceError> {
        let id = Uuid::new_v4().to_string();
        let body = body.into();

        {
            let mut state = self.inner.state();
            let topic_state = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| SourceError::NotFound(format!("topic '{}'", topic)))?;

            topic_state.next_sequence += 1;
            let message = Message {
                id: id.clone(),
                sequence_number: topic_state.next_sequence,
                body,
                delivery_count: 0,
                subject: subject.map(str::to_string),
                enqueued_at: Utc::now(),
            };

            for sub in topic_state.subscriptions.values_mut() {
                sub.ready.push_back(message.clone());
            }
        }

        self.inner.notify.notify_waiters();
        Ok(id)
    }

    pub fn publish_many<I, B>(&self, topic: &str, bodies: I) -> Result<Vec<String>, SourceError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        bodies
            .into_iter()
            .map(|body| self.publish(topic, body))
            .collect()
    }

    /// Messages acknowledged on a subscription, in settle order
    pub fn acknowledged(&self, topic: &str, subscription: &str) -> Vec<Message> {
        self.inner
            .state()
            .subscription(topic, subscription)
            .map(|s| s.acknowledged.clone())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<DeadLetter> {
        self.inner
            .state()
            .subscription(topic, subscription)
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Messages not yet settled: waiting plus locked
    pub fn pending_count(&self, topic: &str, subscription: &str) -> usize {
        self.inner
            .state()
            .subscription(topic, subscription)
            .map(|s| s.ready.len() + s.locked.len())
            .unwrap_or(0)
    }

    /// Messages currently locked by some receiver
    pub fn in_flight_count(&self, topic: &str, subscription: &str) -> usize {
        self.inner
            .state()
            .subscription(topic, subscription)
            .map(|s| s.locked.len())
            .unwrap_or(0)
    }

    /// Make the next `receive` on this subscription fail with `error`
    ///
    /// Whichever receiver asks first gets it.
    pub fn inject_receive_error(
        &self,
        topic: &str,
        subscription: &str,
        error: SourceError,
    ) -> Result<(), SourceError> {
        self.inner
            .state()
            .subscription_mut(topic, subscription)?
            .injected_errors
            .push_back(error);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Make the next `ack`, `abandon` or `dead_letter` on this subscription fail
    ///
    /// The message stays locked to its receiver, so the settlement can be
    /// tried again.
    pub fn inject_settle_error(
        &self,
        topic: &str,
        subscription: &str,
        error: SourceError,
    ) -> Result<(), SourceError> {
        self.inner
            .state()
            .subscription_mut(topic, subscription)?
            .injected_settle_errors
            .push_back(error);
        Ok(())
    }

    /// Close a subscription: pending and future receives return `None`
    pub fn close_subscription(&self, topic: &str, subscription: &str) -> Result<(), SourceError> {
        self.inner.state().subscription_mut(topic, subscription)?.closed = true;
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    fn namespace(&self) -> String {
        self.inner.namespace.clone()
    }

    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        if let Some(expected) = &self.inner.credential {
            if expected != &request.credential {
                return Err(SourceError::Unauthorized(format!(
                    "credential rejected for {}",
                    request.entity_path()
                )));
            }
        }

        // Unknown entities are rejected at attach time
        self.inner
            .state()
            .subscription_mut(&request.topic, &request.subscription)?;

        Ok(Box::new(MemorySubscription {
            broker: Arc::clone(&self.inner),
            topic: request.topic,
            subscription: request.subscription,
            held: HashSet::new(),
            closed: false,
        }))
    }
}

/// One receiver attached to an in-memory subscription
struct MemorySubscription {
    broker: Arc<BrokerInner>,
    topic: String,
    subscription: String,
    /// Ids locked by this receiver
    held: HashSet<String>,
    closed: bool,
}

impl MemorySubscription {
    fn try_receive(&mut self) -> Result<Option<Option<Message>>, SourceError> {
        if self.closed {
            return Ok(Some(None));
        }

        let mut state = self.broker.state();
        let sub = state.subscription_mut(&self.topic, &self.subscription)?;

        if let Some(error) = sub.injected_errors.pop_front() {
            return Err(error);
        }
        if sub.closed {
            return Ok(Some(None));
        }

        match sub.ready.pop_front() {
            Some(mut message) => {
                message.delivery_count += 1;
                sub.locked.insert(message.id.clone(), message.clone());
                self.held.insert(message.id.clone());
                Ok(Some(Some(message)))
            }
            None => Ok(None),
        }
    }

    /// Take a locked message out of the subscription if this receiver holds it
    fn settle(&mut self, message_id: &str) -> Result<(MutexGuard<'_, BrokerState>, Message), SourceError> {
        if !self.held.contains(message_id) {
            return Err(SourceError::LockLost(format!(
                "message '{}' is not locked by this receiver",
                message_id
            )));
        }

        let mut state = self.broker.state();
        let sub = state.subscription_mut(&self.topic, &self.subscription)?;
        if let Some(error) = sub.injected_settle_errors.pop_front() {
            return Err(error);
        }
        self.held.remove(message_id);

        let message = state
            .subscription_mut(&self.topic, &self.subscription)?
            .locked
            .remove(message_id)
            .ok_or_else(|| SourceError::LockLost(format!("message '{}'", message_id)))?;
        Ok((state, message))
    }

    fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }

        {
            let mut state = self.broker.state();
            if let Ok(sub) = state.subscription_mut(&self.topic, &self.subscription) {
                for id in self.held.drain() {
                    if let Some(message) = sub.locked.remove(&id) {
                        sub.ready.push_front(message);
                    }
                }
            }
        }
        self.held.clear();
        self.broker.notify.notify_waiters();
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&mut self) -> Result<Option<Message>, SourceError> {
        let broker = Arc::clone(&self.broker);
        loop {
            // Register interest before looking so a publish in between is not missed
            let notified = broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_receive()? {
                return Ok(result);
            }

            notified.await;
        }
    }

    async fn ack(&mut self, message_id: &str) -> Result<(), SourceError> {
        let topic = self.topic.clone();
        let subscription = self.subscription.clone();
        let (mut state, message) = self.settle(message_id)?;
        state
            .subscription_mut(&topic, &subscription)?
            .acknowledged
            .push(message);
        Ok(())
    }

    async fn abandon(&mut self, message_id: &str) -> Result<(), SourceError> {
        let topic = self.topic.clone();
        let subscription = self.subscription.clone();
        {
            let (mut state, message) = self.settle(message_id)?;
            state
                .subscription_mut(&topic, &subscription)?
                .ready
                .push_back(message);
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&mut self, message_id: &str, reason: &str) -> Result<(), SourceError> {
        let topic = self.topic.clone();
        let subscription = self.subscription.clone();
        let (mut state, message) = self.settle(message_id)?;
        state
            .subscription_mut(&topic, &subscription)?
            .dead_letters
            .push(DeadLetter {
                message,
                reason: reason.to_string(),
            });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.release_held();
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release_held();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TOPIC: &str = "orders";
    const SUB: &str = "billing";

    fn request(worker_index: usize) -> SubscribeRequest {
        SubscribeRequest {
            topic: TOPIC.to_string(),
            subscription: SUB.to_string(),
            credential: Credential::default(),
            worker_index,
            worker_count: 2,
        }
    }

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new("memory://test");
        broker.create_subscription(TOPIC, SUB);
        broker
    }

    #[tokio::test]
    async fn test_receive_and_ack() {
        let broker = broker();
        broker.publish(TOPIC, "one").unwrap();

        let mut sub = broker.subscribe(request(1)).await.unwrap();
        let msg = sub.receive().await.unwrap().unwrap();
        assert_eq!(msg.body_str(), Some("one"));
        assert_eq!(msg.delivery_count, 1);
        assert_eq!(msg.sequence_number, 1);
        assert_eq!(broker.in_flight_count(TOPIC, SUB), 1);

        sub.ack(&msg.id).await.unwrap();
        assert_eq!(broker.pending_count(TOPIC, SUB), 0);
        assert_eq!(broker.acknowledged(TOPIC, SUB).len(), 1);

        // Settling twice is a lost lock
        assert!(matches!(sub.ack(&msg.id).await, Err(SourceError::LockLost(_))));
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscription() {
        let broker = broker();
        broker.create_subscription(TOPIC, "audit");
        broker.publish_many(TOPIC, ["a", "b"]).unwrap();

        assert_eq!(broker.pending_count(TOPIC, SUB), 2);
        assert_eq!(broker.pending_count(TOPIC, "audit"), 2);
    }

    #[tokio::test]
    async fn test_competing_receivers_get_distinct_messages() {
        let broker = broker();
        broker.publish_many(TOPIC, ["a", "b"]).unwrap();

        let mut first = broker.subscribe(request(1)).await.unwrap();
        let mut second = broker.subscribe(request(2)).await.unwrap();

        let a = first.receive().await.unwrap().unwrap();
        let b = second.receive().await.unwrap().unwrap();
        assert_ne!(a.id, b.id);

        // A receiver cannot settle a message locked by another
        assert!(matches!(second.ack(&a.id).await, Err(SourceError::LockLost(_))));
    }

    #[tokio::test]
    async fn test_abandon_increments_delivery_count() {
        let broker = broker();
        broker.publish(TOPIC, "retry-me").unwrap();
        let mut sub = broker.subscribe(request(1)).await.unwrap();

        let first = sub.receive().await.unwrap().unwrap();
        sub.abandon(&first.id).await.unwrap();
        let second = sub.receive().await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_records_reason() {
        let broker = broker();
        broker.publish(TOPIC, "poison").unwrap();
        let mut sub = broker.subscribe(request(1)).await.unwrap();

        let msg = sub.receive().await.unwrap().unwrap();
        sub.dead_letter(&msg.id, "Unparseable").await.unwrap();

        let dead = broker.dead_letters(TOPIC, SUB);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "Unparseable");
        assert_eq!(broker.pending_count(TOPIC, SUB), 0);
    }

    #[tokio::test]
    async fn test_drop_returns_locked_messages() {
        let broker = broker();
        broker.publish(TOPIC, "held").unwrap();

        {
            let mut sub = broker.subscribe(request(1)).await.unwrap();
            sub.receive().await.unwrap().unwrap();
            assert_eq!(broker.in_flight_count(TOPIC, SUB), 1);
        }

        assert_eq!(broker.in_flight_count(TOPIC, SUB), 0);
        let mut other = broker.subscribe(request(2)).await.unwrap();
        let msg = other.receive().await.unwrap().unwrap();
        assert_eq!(msg.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let broker = broker();
        let mut sub = broker.subscribe(request(1)).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(TOPIC, "late").unwrap();
        });

        let msg = tokio::time::timeout(Duration::from_secs(2), sub.receive())
            .await
            .expect("receive should wake on publish")
            .unwrap()
            .unwrap();
        assert_eq!(msg.body_str(), Some("late"));
    }

    #[tokio::test]
    async fn test_close_subscription_ends_receive() {
        let broker = broker();
        let mut sub = broker.subscribe(request(1)).await.unwrap();
        broker.close_subscription(TOPIC, SUB).unwrap();

        assert_eq!(sub.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_error_is_delivered_once() {
        let broker = broker();
        broker
            .inject_receive_error(TOPIC, SUB, SourceError::Timeout("slow".to_string()))
            .unwrap();
        broker.publish(TOPIC, "after").unwrap();
        let mut sub = broker.subscribe(request(1)).await.unwrap();

        assert!(matches!(sub.receive().await, Err(SourceError::Timeout(_))));
        assert!(sub.receive().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_settle_error_keeps_message_locked() {
        let broker = broker();
        broker.publish(TOPIC, "sticky").unwrap();
        broker
            .inject_settle_error(TOPIC, SUB, SourceError::Timeout("slow".to_string()))
            .unwrap();
        let mut sub = broker.subscribe(request(1)).await.unwrap();

        let msg = sub.receive().await.unwrap().unwrap();
        assert!(matches!(sub.ack(&msg.id).await, Err(SourceError::Timeout(_))));
        assert_eq!(broker.in_flight_count(TOPIC, SUB), 1);

        sub.ack(&msg.id).await.unwrap();
        assert_eq!(broker.acknowledged(TOPIC, SUB).len(), 1);
        assert_eq!(broker.pending_count(TOPIC, SUB), 0);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_unknown_entities_and_bad_credentials() {
        let broker = InMemoryBroker::with_credential("memory://secure", Credential::new("right"));
        broker.create_subscription(TOPIC, SUB);

        let mut req = request(1);
        req.credential = Credential::new("wrong");
        assert!(matches!(
            broker.subscribe(req).await.err(),
            Some(SourceError::Unauthorized(_))
        ));

        let mut req = request(1);
        req.credential = Credential::new("right");
        req.subscription = "missing".to_string();
        assert!(matches!(
            broker.subscribe(req).await.err(),
            Some(SourceError::NotFound(_))
        ));
    }
}
