// ============================================================================
// Broker Seams
// ============================================================================
//
// The subsystem talks to a broker through three narrow capabilities:
// - TopologyAdmin  - create topics and subscriptions
// - MessageSink    - hand an envelope to a topic and get a message id back
// - MessageSource  - pull leased messages from a subscription, ack or nack them
//
// Two adapters implement all three:
// - InMemoryBroker - in-process, pull/lease/redeliver semantics, fault injection
// - KafkaBroker    - Kafka/Redpanda via rdkafka (emulator or managed cluster)
//
// ============================================================================

mod in_memory;
mod kafka;

pub use in_memory::InMemoryBroker;
pub use kafka::{KafkaBroker, KafkaSettings, KafkaTransport};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::messaging::envelope::Envelope;
use crate::utils::IsTransient;

/// Topic scoped to a project, rendered as `{project}.{topic}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    project: String,
    topic: String,
}

impl TopicName {
    pub fn new(project: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            topic: topic.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.topic)
    }
}

/// Subscription scoped to a project, rendered as `{project}.{subscription}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionName {
    project: String,
    subscription: String,
}

impl SubscriptionName {
    pub fn new(project: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            subscription: subscription.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

impl fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.subscription)
    }
}

/// Broker-assigned identifier returned once a publish is acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for one delivery attempt; only valid until acked, nacked or expired
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckId(pub String);

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub ack_id: AckId,
    pub message_id: MessageId,
    pub envelope: Envelope,
    /// 1 on first delivery
    pub delivery_attempt: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker operation timed out: {0}")]
    Timeout(String),

    #[error("broker rejected request: {0}")]
    Rejected(String),
}

impl IsTransient for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout(_))
    }
}

/// First redelivery delay after a nack
pub const DEFAULT_REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);

/// How long a nacked message stays hidden before it is offered again.
/// `base` doubles with every attempt already made and never exceeds `cap`.
pub fn redelivery_delay(base: Duration, delivery_attempt: u32, cap: Duration) -> Duration {
    let doublings = delivery_attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << doublings).min(cap)
}

// ============================================================================
// Capabilities
// ============================================================================

#[async_trait]
pub trait TopologyAdmin: Send + Sync {
    /// Fails with `AlreadyExists` when the topic is present
    async fn create_topic(&self, topic: &TopicName) -> Result<(), BrokerError>;

    /// Fails with `AlreadyExists` when the subscription is present
    async fn create_subscription(
        &self,
        subscription: &SubscriptionName,
        topic: &TopicName,
        ack_deadline: Duration,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Resolves once the broker has durably accepted the message
    async fn send(&self, topic: &TopicName, envelope: Envelope) -> Result<MessageId, BrokerError>;

    /// Wait for buffered sends to be delivered
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Lease up to `max_messages`, waiting at most `wait` when none are available
    async fn pull(
        &self,
        subscription: &SubscriptionName,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    async fn ack(&self, subscription: &SubscriptionName, ack_id: &AckId) -> Result<(), BrokerError>;

    /// Make the message available for redelivery
    async fn nack(&self, subscription: &SubscriptionName, ack_id: &AckId) -> Result<(), BrokerError>;

    /// Claim per-subscription resources; every successful open is paired with one close
    async fn open(&self, _subscription: &SubscriptionName) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Release per-subscription resources held by the source
    async fn close(&self, _subscription: &SubscriptionName) {}
}
