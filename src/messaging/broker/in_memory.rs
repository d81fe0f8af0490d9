use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    redelivery_delay, AckId, BrokerError, MessageId, MessageSink, MessageSource, ReceivedMessage,
    SubscriptionName, TopicName, TopologyAdmin, DEFAULT_REDELIVERY_BACKOFF,
};
use crate::messaging::envelope::Envelope;

// ============================================================================
// In-Memory Broker
// ============================================================================
//
// In-process stand-in for a pull-based broker, used by tests and by the demo
// when EVENTS_BROKER=memory. It keeps the semantics the consumers must cope
// with:
// - fan-out: every subscription on a topic gets its own copy
// - leasing: pulled messages are invisible until acked, nacked or expired
// - redelivery: an elapsed ack deadline puts the message back at once; a nack
//   hides it for a backoff that doubles per attempt, capped at the ack deadline
// - no retroactive delivery: a subscription only sees messages published
//   after it was created
//
// Fault injection (failing or stalled publishes) lets tests drive the error
// paths without a real cluster.
//
// ============================================================================

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<BrokerState>,
    delivered: Notify,
    redelivery_backoff: Duration,
}

#[derive(Default)]
struct BrokerState {
    topics: HashSet<TopicName>,
    subscriptions: HashMap<SubscriptionName, SubscriptionState>,
    next_message_id: u64,
    next_ack_id: u64,
    publish_fault: Option<PublishFault>,
}

#[derive(Clone)]
enum PublishFault {
    Fail(BrokerError),
    Stall,
}

struct SubscriptionState {
    topic: TopicName,
    ack_deadline: Duration,
    backlog: VecDeque<StoredMessage>,
    leased: HashMap<AckId, Lease>,
    delayed: Vec<Delayed>,
    acked: u64,
    nacked: u64,
    expired: u64,
}

#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    envelope: Envelope,
    delivery_attempt: u32,
}

struct Lease {
    message: StoredMessage,
    deadline: Instant,
}

/// A nacked message waiting out its redelivery backoff
struct Delayed {
    message: StoredMessage,
    ready_at: Instant,
}

/// Snapshot of one subscription, for assertions and diagnostics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionStats {
    pub backlog: usize,
    pub outstanding: usize,
    /// Nacked messages not yet due for redelivery
    pub delayed: usize,
    pub acked: u64,
    pub nacked: u64,
    pub expired: u64,
}

impl SubscriptionState {
    fn new(topic: TopicName, ack_deadline: Duration) -> Self {
        Self {
            topic,
            ack_deadline,
            backlog: VecDeque::new(),
            leased: HashMap::new(),
            delayed: Vec::new(),
            acked: 0,
            nacked: 0,
            expired: 0,
        }
    }

    /// Move elapsed leases and due nacks back to the backlog
    fn reclaim(&mut self, now: Instant) {
        let expired: Vec<AckId> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();

        for ack_id in expired {
            if let Some(lease) = self.leased.remove(&ack_id) {
                tracing::debug!(
                    message_id = %lease.message.message_id,
                    "Ack deadline elapsed, message returned to backlog"
                );
                self.expired += 1;
                self.backlog.push_back(lease.message);
            }
        }

        let (due, waiting): (Vec<Delayed>, Vec<Delayed>) =
            std::mem::take(&mut self.delayed).into_iter().partition(|d| d.ready_at <= now);
        self.delayed = waiting;
        self.backlog.extend(due.into_iter().map(|d| d.message));
    }

    /// Earliest instant at which reclaim would make something visible
    fn next_due(&self) -> Option<Instant> {
        let leases = self.leased.values().map(|lease| lease.deadline);
        let delayed = self.delayed.iter().map(|d| d.ready_at);
        leases.chain(delayed).min()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_redelivery_backoff(DEFAULT_REDELIVERY_BACKOFF)
    }

    /// Broker whose first redelivery after a nack waits `base`
    pub fn with_redelivery_backoff(base: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                delivered: Notify::new(),
                redelivery_backoff: base,
            }),
        }
    }

    /// Every following publish fails with `error`
    pub async fn fail_publishes(&self, error: BrokerError) {
        self.inner.state.lock().await.publish_fault = Some(PublishFault::Fail(error));
    }

    /// Every following publish never completes, as if the broker stopped acking
    pub async fn stall_publishes(&self) {
        self.inner.state.lock().await.publish_fault = Some(PublishFault::Stall);
    }

    pub async fn clear_publish_fault(&self) {
        self.inner.state.lock().await.publish_fault = None;
    }

    pub async fn topic_count(&self) -> usize {
        self.inner.state.lock().await.topics.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.state.lock().await.subscriptions.len()
    }

    pub async fn stats(&self, subscription: &SubscriptionName) -> Option<SubscriptionStats> {
        let state = self.inner.state.lock().await;
        state.subscriptions.get(subscription).map(|sub| SubscriptionStats {
            backlog: sub.backlog.len(),
            outstanding: sub.leased.len(),
            delayed: sub.delayed.len(),
            acked: sub.acked,
            nacked: sub.nacked,
            expired: sub.expired,
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopologyAdmin for InMemoryBroker {
    async fn create_topic(&self, topic: &TopicName) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        if !state.topics.insert(topic.clone()) {
            return Err(BrokerError::AlreadyExists(topic.to_string()));
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &SubscriptionName,
        topic: &TopicName,
        ack_deadline: Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;

        if !state.topics.contains(topic) {
            return Err(BrokerError::NotFound(topic.to_string()));
        }
        if state.subscriptions.contains_key(subscription) {
            return Err(BrokerError::AlreadyExists(subscription.to_string()));
        }

        state
            .subscriptions
            .insert(subscription.clone(), SubscriptionState::new(topic.clone(), ack_deadline));
        Ok(())
    }
}

#[async_trait]
impl MessageSink for InMemoryBroker {
    async fn send(&self, topic: &TopicName, envelope: Envelope) -> Result<MessageId, BrokerError> {
        let fault = self.inner.state.lock().await.publish_fault.clone();
        match fault {
            Some(PublishFault::Fail(error)) => return Err(error),
            Some(PublishFault::Stall) => std::future::pending::<()>().await,
            None => {}
        }

        let message_id = {
            let mut state = self.inner.state.lock().await;
            if !state.topics.contains(topic) {
                return Err(BrokerError::NotFound(topic.to_string()));
            }

            state.next_message_id += 1;
            let message_id = MessageId(state.next_message_id.to_string());

            for sub in state.subscriptions.values_mut().filter(|s| &s.topic == topic) {
                sub.backlog.push_back(StoredMessage {
                    message_id: message_id.clone(),
                    envelope: envelope.clone(),
                    delivery_attempt: 0,
                });
            }
            message_id
        };

        self.inner.delivered.notify_waiters();
        Ok(message_id)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn pull(
        &self,
        subscription: &SubscriptionName,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let give_up_at = Instant::now() + wait;

        loop {
            let notified = self.inner.delivered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut guard = self.inner.state.lock().await;
                let state = &mut *guard;
                let sub = state
                    .subscriptions
                    .get_mut(subscription)
                    .ok_or_else(|| BrokerError::NotFound(subscription.to_string()))?;

                let now = Instant::now();
                sub.reclaim(now);

                if !sub.backlog.is_empty() && max_messages > 0 {
                    let mut batch = Vec::new();
                    while batch.len() < max_messages {
                        let Some(mut message) = sub.backlog.pop_front() else {
                            break;
                        };
                        message.delivery_attempt += 1;
                        state.next_ack_id += 1;
                        let ack_id = AckId(format!("{}-{}", message.message_id, state.next_ack_id));

                        batch.push(ReceivedMessage {
                            ack_id: ack_id.clone(),
                            message_id: message.message_id.clone(),
                            envelope: message.envelope.clone(),
                            delivery_attempt: message.delivery_attempt,
                        });
                        sub.leased.insert(ack_id, Lease {
                            message,
                            deadline: now + sub.ack_deadline,
                        });
                    }
                    return Ok(batch);
                }
                sub.next_due()
            };

            if Instant::now() >= give_up_at {
                return Ok(Vec::new());
            }
            let wake_at = next_due.map_or(give_up_at, |due| due.min(give_up_at));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, subscription: &SubscriptionName, ack_id: &AckId) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::NotFound(subscription.to_string()))?;

        match sub.leased.remove(ack_id) {
            Some(_) => sub.acked += 1,
            None => {
                tracing::debug!(ack_id = %ack_id, "Ignoring ack for expired or unknown lease");
            }
        }
        Ok(())
    }

    async fn nack(&self, subscription: &SubscriptionName, ack_id: &AckId) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::NotFound(subscription.to_string()))?;

        let Some(lease) = sub.leased.remove(ack_id) else {
            tracing::debug!(ack_id = %ack_id, "Ignoring nack for expired or unknown lease");
            return Ok(());
        };

        let delay = redelivery_delay(
            self.inner.redelivery_backoff,
            lease.message.delivery_attempt,
            sub.ack_deadline,
        );
        tracing::debug!(
            message_id = %lease.message.message_id,
            attempt = lease.message.delivery_attempt,
            delay_ms = delay.as_millis() as u64,
            "Message nacked, redelivery delayed"
        );

        sub.nacked += 1;
        sub.delayed.push(Delayed {
            message: lease.message,
            ready_at: Instant::now() + delay,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::EVENT_TYPE_ATTRIBUTE;

    fn names() -> (TopicName, SubscriptionName) {
        (
            TopicName::new("test-project", "user-events"),
            SubscriptionName::new("test-project", "task-service"),
        )
    }

    fn envelope(body: &str) -> Envelope {
        Envelope::new(body.as_bytes().to_vec()).with_attribute(EVENT_TYPE_ATTRIBUTE, "user.deleted")
    }

    async fn broker_with_subscription(ack_deadline: Duration) -> InMemoryBroker {
        let (topic, subscription) = names();
        let broker = InMemoryBroker::new();
        broker.create_topic(&topic).await.unwrap();
        broker.create_subscription(&subscription, &topic, ack_deadline).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_duplicate_topology_reports_already_exists() {
        let (topic, subscription) = names();
        let broker = broker_with_subscription(Duration::from_secs(30)).await;

        assert!(matches!(broker.create_topic(&topic).await, Err(BrokerError::AlreadyExists(_))));
        assert!(matches!(
            broker.create_subscription(&subscription, &topic, Duration::from_secs(30)).await,
            Err(BrokerError::AlreadyExists(_))
        ));
        assert_eq!(broker.topic_count().await, 1);
        assert_eq!(broker.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_subscription_requires_topic() {
        let (topic, subscription) = names();
        let broker = InMemoryBroker::new();

        let result = broker.create_subscription(&subscription, &topic, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_to_missing_topic_fails() {
        let (topic, _) = names();
        let broker = InMemoryBroker::new();

        let result = broker.send(&topic, envelope("{}")).await;
        assert!(matches!(result, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_pull_leases_and_ack_removes() {
        let (topic, subscription) = names();
        let broker = broker_with_subscription(Duration::from_secs(30)).await;

        let id = broker.send(&topic, envelope(r#"{"userId":1}"#)).await.unwrap();
        let pulled = broker.pull(&subscription, 10, Duration::from_millis(10)).await.unwrap();

        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].message_id, id);
        assert_eq!(pulled[0].delivery_attempt, 1);

        // Leased messages are invisible to other pullers
        let again = broker.pull(&subscription, 10, Duration::from_millis(10)).await.unwrap();
        assert!(again.is_empty());

        broker.ack(&subscription, &pulled[0].ack_id).await.unwrap();
        let stats = broker.stats(&subscription).await.unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.backlog, 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_next_attempt_after_backoff() {
        let (topic, subscription) = names();
        let broker = InMemoryBroker::with_redelivery_backoff(Duration::from_millis(50));
        broker.create_topic(&topic).await.unwrap();
        broker.create_subscription(&subscription, &topic, Duration::from_secs(30)).await.unwrap();
        broker.send(&topic, envelope(r#"{"userId":1}"#)).await.unwrap();

        let first = broker.pull(&subscription, 1, Duration::from_millis(10)).await.unwrap();
        broker.nack(&subscription, &first[0].ack_id).await.unwrap();

        // Hidden while the backoff runs
        assert!(broker.pull(&subscription, 1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(broker.stats(&subscription).await.unwrap().delayed, 1);

        // A waiting pull wakes once the backoff elapses
        let second = broker.pull(&subscription, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_attempt, 2);
        assert_ne!(second[0].ack_id, first[0].ack_id);

        // A nacked ack id cannot ack the redelivery
        broker.ack(&subscription, &first[0].ack_id).await.unwrap();

        let stats = broker.stats(&subscription).await.unwrap();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.outstanding, 1);
    }

    #[tokio::test]
    async fn test_repeated_nacks_are_rate_limited() {
        let (topic, subscription) = names();
        let broker = InMemoryBroker::with_redelivery_backoff(Duration::from_millis(20));
        broker.create_topic(&topic).await.unwrap();
        broker.create_subscription(&subscription, &topic, Duration::from_secs(30)).await.unwrap();
        broker.send(&topic, envelope(r#"{"userId":1}"#)).await.unwrap();

        // Backoffs of 20, 40, 80, 160 ms: at most a handful of attempts in 300 ms
        let mut deliveries = 0;
        let until = Instant::now() + Duration::from_millis(300);
        while Instant::now() < until {
            let pulled = broker.pull(&subscription, 1, until.saturating_duration_since(Instant::now())).await.unwrap();
            for message in pulled {
                deliveries += 1;
                broker.nack(&subscription, &message.ack_id).await.unwrap();
            }
        }

        assert!((3..=5).contains(&deliveries), "delivered {} times", deliveries);
        assert_eq!(broker.stats(&subscription).await.unwrap().nacked, deliveries);
    }

    #[tokio::test]
    async fn test_nack_backoff_is_capped_by_ack_deadline() {
        let (topic, subscription) = names();
        let broker = InMemoryBroker::with_redelivery_backoff(Duration::from_secs(60));
        broker.create_topic(&topic).await.unwrap();
        broker.create_subscription(&subscription, &topic, Duration::from_millis(50)).await.unwrap();
        broker.send(&topic, envelope(r#"{"userId":1}"#)).await.unwrap();

        let first = broker.pull(&subscription, 1, Duration::ZERO).await.unwrap();
        broker.nack(&subscription, &first[0].ack_id).await.unwrap();

        let second = broker.pull(&subscription, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_attempt, 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered_and_stale_ack_ignored() {
        let (topic, subscription) = names();
        let broker = broker_with_subscription(Duration::from_millis(20)).await;
        broker.send(&topic, envelope(r#"{"userId":1}"#)).await.unwrap();

        let first = broker.pull(&subscription, 1, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = broker.pull(&subscription, 1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_attempt, 2);

        // The first lease is gone; acking it must not ack the redelivery
        broker.ack(&subscription, &first[0].ack_id).await.unwrap();
        let stats = broker.stats(&subscription).await.unwrap();
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test]
    async fn test_pull_wakes_on_publish() {
        let (topic, subscription) = names();
        let broker = broker_with_subscription(Duration::from_secs(30)).await;

        let puller = {
            let broker = broker.clone();
            let subscription = subscription.clone();
            tokio::spawn(async move { broker.pull(&subscription, 1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.send(&topic, envelope(r#"{"userId":9}"#)).await.unwrap();

        let pulled = tokio::time::timeout(Duration::from_secs(1), puller)
            .await
            .expect("pull should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(pulled.len(), 1);
    }

    #[tokio::test]
    async fn test_each_subscription_gets_its_own_copy() {
        let (topic, subscription) = names();
        let broker = broker_with_subscription(Duration::from_secs(30)).await;
        let audit = SubscriptionName::new("test-project", "audit");
        broker.create_subscription(&audit, &topic, Duration::from_secs(30)).await.unwrap();

        broker.send(&topic, envelope(r#"{"userId":1}"#)).await.unwrap();

        assert_eq!(broker.pull(&subscription, 10, Duration::ZERO).await.unwrap().len(), 1);
        assert_eq!(broker.pull(&audit, 10, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let (topic, _) = names();
        let broker = broker_with_subscription(Duration::from_secs(30)).await;

        broker.fail_publishes(BrokerError::Unavailable("injected".into())).await;
        assert!(matches!(
            broker.send(&topic, envelope("{}")).await,
            Err(BrokerError::Unavailable(_))
        ));

        broker.clear_publish_fault().await;
        assert!(broker.send(&topic, envelope("{}")).await.is_ok());
    }
}
