use async_trait::async_trait;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
    Offset, TopicPartitionList,
};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{
    redelivery_delay, AckId, BrokerError, MessageId, MessageSink, MessageSource, ReceivedMessage,
    SubscriptionName, TopicName, TopologyAdmin, DEFAULT_REDELIVERY_BACKOFF,
};
use crate::messaging::envelope::Envelope;

// ============================================================================
// Kafka / Redpanda Broker
// ============================================================================
//
// Maps the pull/ack model onto Kafka:
// - topic         -> Kafka topic named `{project}.{topic}`
// - subscription  -> consumer group named `{project}.{subscription}`
// - ack           -> offset commit, held back behind the lowest in-flight offset
// - nack          -> seek back to the message and pause its partition for the
//                    redelivery backoff, capped at the configured ack deadline
//
// Consumer groups need no creation, so create_subscription only records which
// topic the group reads. Kafka has no per-message ack deadline; a message stays
// leased until acked, nacked or the consumer leaves the group.
//
// Runtimes in one process that read the same subscription share one consumer.
// open() and close() count its users; the last close leaves the group.
//
// ============================================================================

const MESSAGE_ID_HEADER: &str = "messageId";
const NACK_SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub enum KafkaTransport {
    /// Local emulator (Redpanda dev container): no auth, no TLS
    Plaintext,
    /// Managed cluster
    SaslSsl { username: String, password: String },
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub transport: KafkaTransport,
    pub client_id: String,
    pub partitions: i32,
    pub replication: i32,
    pub message_timeout: Duration,
    /// First pause after a nack; doubles per attempt
    pub redelivery_backoff: Duration,
    /// Upper bound on the nack pause
    pub ack_deadline: Duration,
}

impl KafkaSettings {
    pub fn new(brokers: impl Into<String>, transport: KafkaTransport) -> Self {
        Self {
            brokers: brokers.into(),
            transport,
            client_id: "user-event-relay".to_string(),
            partitions: 3,
            replication: 1,
            message_timeout: Duration::from_secs(10),
            redelivery_backoff: DEFAULT_REDELIVERY_BACKOFF,
            ack_deadline: Duration::from_secs(30),
        }
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id);

        match &self.transport {
            KafkaTransport::Plaintext => {
                config.set("security.protocol", "plaintext");
            }
            KafkaTransport::SaslSsl { username, password } => {
                config
                    .set("security.protocol", "SASL_SSL")
                    .set("sasl.mechanisms", "PLAIN")
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            }
        }
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("message.timeout.ms", self.message_timeout.as_millis().to_string())
            .set("enable.idempotence", "true");
        config
    }

    fn consumer_config(&self, subscription: &SubscriptionName) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("group.id", subscription.to_string())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");
        config
    }
}

pub struct KafkaBroker {
    settings: KafkaSettings,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    bindings: Mutex<HashMap<SubscriptionName, TopicName>>,
    consumers: SharedRegistry<SubscriptionName, SubscriptionConsumer>,
}

struct SubscriptionConsumer {
    consumer: StreamConsumer,
    trackers: Mutex<HashMap<(String, i32), OffsetTracker>>,
}

impl KafkaBroker {
    pub fn new(settings: KafkaSettings) -> Result<Self, BrokerError> {
        let producer: FutureProducer = settings
            .producer_config()
            .create()
            .map_err(|e| map_kafka_error("create producer", &e))?;

        let admin: AdminClient<DefaultClientContext> = settings
            .base_config()
            .create()
            .map_err(|e| map_kafka_error("create admin client", &e))?;

        tracing::info!(
            brokers = %settings.brokers,
            plaintext = settings.transport == KafkaTransport::Plaintext,
            "Kafka broker client created"
        );

        Ok(Self {
            settings,
            producer,
            admin,
            bindings: Mutex::new(HashMap::new()),
            consumers: SharedRegistry::new(),
        })
    }

    /// Record which topic a subscription reads, for clusters whose topology is
    /// managed outside this process.
    pub fn bind_subscription(&self, subscription: &SubscriptionName, topic: &TopicName) {
        if let Ok(mut bindings) = self.bindings.lock() {
            bindings.insert(subscription.clone(), topic.clone());
        }
    }

    fn join_group(&self, subscription: &SubscriptionName) -> Result<SubscriptionConsumer, BrokerError> {
        let topic = self
            .bindings
            .lock()
            .ok()
            .and_then(|b| b.get(subscription).cloned())
            .ok_or_else(|| BrokerError::NotFound(subscription.to_string()))?;

        let consumer: StreamConsumer = self
            .settings
            .consumer_config(subscription)
            .create()
            .map_err(|e| map_kafka_error("create consumer", &e))?;

        let topic_name = topic.to_string();
        consumer
            .subscribe(&[topic_name.as_str()])
            .map_err(|e| map_kafka_error("subscribe", &e))?;

        tracing::info!(subscription = %subscription, topic = %topic, "Kafka consumer joined group");

        Ok(SubscriptionConsumer {
            consumer,
            trackers: Mutex::new(HashMap::new()),
        })
    }

    fn existing_consumer(&self, subscription: &SubscriptionName) -> Result<Arc<SubscriptionConsumer>, BrokerError> {
        self.consumers
            .get(subscription)
            .ok_or_else(|| BrokerError::NotFound(format!("{} is not open", subscription)))
    }

    /// Keep a nacked partition paused until its latest hold expires
    fn schedule_resume(entry: Arc<SubscriptionConsumer>, key: (String, i32), delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let due = entry
                .trackers
                .lock()
                .map(|mut trackers| {
                    trackers
                        .get_mut(&key)
                        .map_or(true, |tracker| tracker.release_hold(Instant::now()))
                })
                .unwrap_or(true);
            if !due {
                return;
            }

            let mut partitions = TopicPartitionList::new();
            partitions.add_partition(&key.0, key.1);
            if let Err(e) = entry.consumer.resume(&partitions) {
                tracing::debug!(topic = %key.0, partition = key.1, error = %e, "Resume after nack failed");
            }
        });
    }
}

// ============================================================================
// Shared Registry
// ============================================================================

/// Reference-counted map: the first acquire creates the value, the last
/// release hands it back for teardown.
struct SharedRegistry<K, V> {
    slots: Mutex<HashMap<K, (Arc<V>, usize)>>,
}

impl<K: Eq + Hash + Clone, V> SharedRegistry<K, V> {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn acquire(&self, key: &K, create: impl FnOnce() -> Result<V, BrokerError>) -> Result<Arc<V>, BrokerError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| BrokerError::Unavailable("consumer registry poisoned".into()))?;

        if let Some((value, users)) = slots.get_mut(key) {
            *users += 1;
            return Ok(value.clone());
        }

        let value = Arc::new(create()?);
        slots.insert(key.clone(), (value.clone(), 1));
        Ok(value)
    }

    fn get(&self, key: &K) -> Option<Arc<V>> {
        self.slots.lock().ok()?.get(key).map(|(value, _)| value.clone())
    }

    /// Returns the value once its last user is gone
    fn release(&self, key: &K) -> Option<Arc<V>> {
        let mut slots = self.slots.lock().ok()?;
        let (_, users) = slots.get_mut(key)?;
        *users -= 1;
        if *users > 0 {
            return None;
        }
        slots.remove(key).map(|(value, _)| value)
    }
}

#[async_trait]
impl TopologyAdmin for KafkaBroker {
    async fn create_topic(&self, topic: &TopicName) -> Result<(), BrokerError> {
        let name = topic.to_string();
        let new_topic = NewTopic::new(
            &name,
            self.settings.partitions,
            TopicReplication::Fixed(self.settings.replication),
        );

        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .map_err(|e| map_kafka_error("create topic", &e))?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(BrokerError::AlreadyExists(name));
                }
                Err((_, code)) => return Err(map_error_code(&name, code)),
            }
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &SubscriptionName,
        topic: &TopicName,
        _ack_deadline: Duration,
    ) -> Result<(), BrokerError> {
        let already_bound = self
            .bindings
            .lock()
            .map(|b| b.get(subscription) == Some(topic))
            .unwrap_or(false);

        self.bind_subscription(subscription, topic);

        if already_bound {
            return Err(BrokerError::AlreadyExists(subscription.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSink for KafkaBroker {
    async fn send(&self, topic: &TopicName, envelope: Envelope) -> Result<MessageId, BrokerError> {
        let topic_name = topic.to_string();
        let message_id = MessageId(uuid::Uuid::now_v7().to_string());

        let mut headers = OwnedHeaders::new().insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message_id.0.as_str()),
        });
        for (key, value) in &envelope.attributes {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::<str, [u8]>::to(&topic_name)
            .payload(envelope.payload.as_slice())
            .headers(headers);
        if let Some(key) = &envelope.ordering_key {
            record = record.key(key.as_str());
        }

        self.producer
            .send(record, Timeout::After(self.settings.message_timeout))
            .await
            .map_err(|(e, _)| map_kafka_error("send", &e))?;

        Ok(message_id)
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Unavailable(format!("flush task failed: {}", e)))?
            .map_err(|e| map_kafka_error("flush", &e))
    }
}

#[async_trait]
impl MessageSource for KafkaBroker {
    async fn pull(
        &self,
        subscription: &SubscriptionName,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let entry = self.existing_consumer(subscription)?;
        let mut batch = Vec::new();
        let mut window = wait;

        while batch.len() < max_messages {
            let message = match tokio::time::timeout(window, entry.consumer.recv()).await {
                Ok(Ok(message)) => message,
                Ok(Err(e)) if batch.is_empty() => return Err(map_kafka_error("receive", &e)),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Receive failed mid-batch, returning partial batch");
                    break;
                }
                Err(_) => break,
            };

            let attempt = entry
                .trackers
                .lock()
                .map_err(|_| BrokerError::Unavailable("offset tracker poisoned".into()))?
                .entry((message.topic().to_string(), message.partition()))
                .or_default()
                .delivered(message.offset());

            batch.push(to_received(&message, attempt));
            window = DRAIN_POLL;
        }

        Ok(batch)
    }

    async fn ack(&self, subscription: &SubscriptionName, ack_id: &AckId) -> Result<(), BrokerError> {
        let entry = self.existing_consumer(subscription)?;
        let (topic, partition, offset) = parse_ack_id(ack_id)?;

        let commit_at = entry
            .trackers
            .lock()
            .map_err(|_| BrokerError::Unavailable("offset tracker poisoned".into()))?
            .get_mut(&(topic.clone(), partition))
            .and_then(|tracker| tracker.acked(offset));

        let Some(commit_at) = commit_at else {
            tracing::debug!(ack_id = %ack_id, "Ack did not advance the committed offset");
            return Ok(());
        };

        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(&topic, partition, Offset::Offset(commit_at))
            .map_err(|e| map_kafka_error("build commit", &e))?;
        entry
            .consumer
            .commit(&positions, CommitMode::Async)
            .map_err(|e| map_kafka_error("commit", &e))
    }

    async fn nack(&self, subscription: &SubscriptionName, ack_id: &AckId) -> Result<(), BrokerError> {
        let entry = self.existing_consumer(subscription)?;
        let (topic, partition, offset) = parse_ack_id(ack_id)?;

        let key = (topic.clone(), partition);
        let delay = {
            let mut trackers = entry
                .trackers
                .lock()
                .map_err(|_| BrokerError::Unavailable("offset tracker poisoned".into()))?;
            let Some(tracker) = trackers.get_mut(&key) else {
                tracing::debug!(ack_id = %ack_id, "Ignoring nack for unknown partition");
                return Ok(());
            };
            let Some(attempt) = tracker.rewind(offset) else {
                tracing::debug!(ack_id = %ack_id, "Ignoring nack for stale offset");
                return Ok(());
            };
            let delay = redelivery_delay(self.settings.redelivery_backoff, attempt, self.settings.ack_deadline);
            tracker.hold_until(Instant::now() + delay);
            delay
        };

        let mut partitions = TopicPartitionList::new();
        partitions.add_partition(&topic, partition);
        entry
            .consumer
            .pause(&partitions)
            .map_err(|e| map_kafka_error("pause", &e))?;

        // seek waits on the broker; keep it off the runtime threads
        let seeker = entry.clone();
        tokio::task::spawn_blocking(move || {
            seeker
                .consumer
                .seek(&topic, partition, Offset::Offset(offset), Timeout::After(NACK_SEEK_TIMEOUT))
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("seek task failed: {}", e)))?
        .map_err(|e| map_kafka_error("seek", &e))?;

        tracing::debug!(ack_id = %ack_id, delay_ms = delay.as_millis() as u64, "Partition paused for redelivery");
        Self::schedule_resume(entry, key, delay);
        Ok(())
    }

    async fn open(&self, subscription: &SubscriptionName) -> Result<(), BrokerError> {
        self.consumers
            .acquire(subscription, || self.join_group(subscription))
            .map(|_| ())
    }

    async fn close(&self, subscription: &SubscriptionName) {
        if let Some(entry) = self.consumers.release(subscription) {
            entry.consumer.unsubscribe();
            tracing::info!(subscription = %subscription, "Kafka consumer left group");
        }
    }
}

fn to_received(message: &BorrowedMessage<'_>, delivery_attempt: u32) -> ReceivedMessage {
    let mut attributes = HashMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                attributes.insert(header.key.to_string(), String::from_utf8_lossy(value).into_owned());
            }
        }
    }

    let ack_id = format_ack_id(message.topic(), message.partition(), message.offset());
    let message_id = attributes
        .remove(MESSAGE_ID_HEADER)
        .map(MessageId)
        .unwrap_or_else(|| MessageId(ack_id.0.clone()));

    ReceivedMessage {
        ack_id,
        message_id,
        envelope: Envelope {
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            attributes,
            ordering_key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        },
        delivery_attempt,
    }
}

fn format_ack_id(topic: &str, partition: i32, offset: i64) -> AckId {
    AckId(format!("{}:{}:{}", topic, partition, offset))
}

fn parse_ack_id(ack_id: &AckId) -> Result<(String, i32, i64), BrokerError> {
    let invalid = || BrokerError::Rejected(format!("malformed ack id: {}", ack_id));

    let mut parts = ack_id.0.rsplitn(3, ':');
    let offset = parts.next().and_then(|o| o.parse().ok()).ok_or_else(invalid)?;
    let partition = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
    let topic = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;

    Ok((topic.to_string(), partition, offset))
}

fn map_kafka_error(operation: &str, error: &KafkaError) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(code) => map_error_code(operation, code),
        None => BrokerError::Unavailable(format!("{}: {}", operation, error)),
    }
}

fn map_error_code(context: &str, code: RDKafkaErrorCode) -> BrokerError {
    let detail = format!("{}: {}", context, code);
    match code {
        RDKafkaErrorCode::TopicAlreadyExists => BrokerError::AlreadyExists(detail),
        RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic => {
            BrokerError::NotFound(detail)
        }
        RDKafkaErrorCode::MessageTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::OperationTimedOut => BrokerError::Timeout(detail),
        RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::BrokerNotAvailable
        | RDKafkaErrorCode::NetworkException
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::NotLeaderForPartition
        | RDKafkaErrorCode::QueueFull => BrokerError::Unavailable(detail),
        _ => BrokerError::Rejected(detail),
    }
}

// ============================================================================
// Offset Tracker
// ============================================================================

/// Per-partition bookkeeping that turns out-of-order acks into a safe commit
/// position: the committed offset never passes a message still in flight.
#[derive(Debug, Default)]
struct OffsetTracker {
    in_flight: BTreeSet<i64>,
    attempts: HashMap<i64, u32>,
    highest_delivered: Option<i64>,
    committed: Option<i64>,
    /// Partition stays paused until this instant after a nack
    held_until: Option<Instant>,
}

impl OffsetTracker {
    /// Returns the delivery attempt number for this offset
    fn delivered(&mut self, offset: i64) -> u32 {
        self.in_flight.insert(offset);
        self.highest_delivered = Some(self.highest_delivered.map_or(offset, |h| h.max(offset)));
        let attempt = self.attempts.entry(offset).or_insert(0);
        *attempt += 1;
        *attempt
    }

    /// Returns the new commit position if this ack advanced it
    fn acked(&mut self, offset: i64) -> Option<i64> {
        if !self.in_flight.remove(&offset) {
            return None;
        }
        self.attempts.remove(&offset);

        let position = match self.in_flight.iter().next() {
            Some(lowest) => *lowest,
            None => self.highest_delivered? + 1,
        };

        if self.committed.is_some_and(|c| c >= position) {
            return None;
        }
        self.committed = Some(position);
        Some(position)
    }

    /// Forget `offset` and everything after it; they will be fetched again.
    /// Returns the attempt that was nacked, or None when it was not in flight.
    fn rewind(&mut self, offset: i64) -> Option<u32> {
        if !self.in_flight.contains(&offset) {
            return None;
        }
        self.in_flight.retain(|o| *o < offset);
        self.highest_delivered = Some(offset - 1);
        Some(self.attempts.get(&offset).copied().unwrap_or(1))
    }

    fn hold_until(&mut self, at: Instant) {
        self.held_until = Some(self.held_until.map_or(at, |held| held.max(at)));
    }

    /// True when no later hold is pending and the partition may resume
    fn release_hold(&mut self, now: Instant) -> bool {
        match self.held_until {
            Some(at) if at > now => false,
            _ => {
                self.held_until = None;
                true
            }
        }
    }
}
