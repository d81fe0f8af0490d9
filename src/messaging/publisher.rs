use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::broker::{BrokerError, MessageId, MessageSink, TopicName};
use super::envelope::encode;
use super::errors::{PublishFailure, PublishFailureReason};
use crate::domain::user::{DomainEvent, EventKind, UserDeleted, UserId, UserRegistered};
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

// ============================================================================
// Event Publisher
// ============================================================================
//
// One long-lived instance per process, shared by every request context.
// A publish returns only once the broker has acknowledged the message or the
// ack timeout has passed; a timeout is a failure, never a guessed success.
//
// The caller has already committed its local change when it publishes. A
// failure here leaves the other services stale until something re-publishes;
// there is no outbox.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub ack_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Broker confirmation of one published event
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAck {
    pub message_id: MessageId,
    pub kind: EventKind,
    pub topic: TopicName,
}

pub struct EventPublisher {
    sink: Arc<dyn MessageSink>,
    topic: TopicName,
    settings: PublisherSettings,
    breaker: CircuitBreaker,
    metrics: Option<Arc<Metrics>>,
    closed: AtomicBool,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn MessageSink>, topic: TopicName, settings: PublisherSettings) -> Self {
        let breaker = CircuitBreaker::new("event_publisher", settings.circuit_breaker.clone());
        Self {
            sink,
            topic,
            settings,
            breaker,
            metrics: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        let gauge = metrics.clone();
        self.breaker = CircuitBreaker::new("event_publisher", self.settings.circuit_breaker.clone())
            .with_observer(Arc::new(move |_from: CircuitState, to: CircuitState| {
                gauge.update_circuit_state(to.gauge_value());
            }));
        self.metrics = Some(metrics);
        self
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.get_state().await
    }

    pub async fn publish_user_registered(
        &self,
        user_id: UserId,
        name: impl Into<String>,
    ) -> Result<DeliveryAck, PublishFailure> {
        self.publish(&DomainEvent::UserRegistered(UserRegistered {
            user_id,
            name: name.into(),
        }))
        .await
    }

    pub async fn publish_user_deleted(
        &self,
        user_id: UserId,
        email: Option<String>,
    ) -> Result<DeliveryAck, PublishFailure> {
        self.publish(&DomainEvent::UserDeleted(UserDeleted { user_id, email })).await
    }

    pub async fn publish(&self, event: &DomainEvent) -> Result<DeliveryAck, PublishFailure> {
        let kind = event.kind();
        let started = Instant::now();

        match self.submit(event).await {
            Ok(message_id) => {
                tracing::info!(
                    event_type = %kind,
                    user_id = %event.user_id(),
                    message_id = %message_id,
                    topic = %self.topic,
                    "Published user event"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_published(kind.tag(), started.elapsed().as_secs_f64());
                }
                Ok(DeliveryAck {
                    message_id,
                    kind,
                    topic: self.topic.clone(),
                })
            }
            Err(reason) => {
                tracing::error!(
                    event_type = %kind,
                    user_id = %event.user_id(),
                    topic = %self.topic,
                    error = %reason,
                    "Failed to publish user event"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure(kind.tag(), reason.label());
                }
                Err(PublishFailure {
                    kind,
                    topic: self.topic.clone(),
                    reason,
                })
            }
        }
    }

    async fn submit(&self, event: &DomainEvent) -> Result<MessageId, PublishFailureReason> {
        if self.is_closed() {
            return Err(PublishFailureReason::Closed);
        }

        let envelope = encode(event).map_err(PublishFailureReason::Encode)?;
        let ack_timeout = self.settings.ack_timeout;

        let result = self
            .breaker
            .call(async {
                match tokio::time::timeout(ack_timeout, self.sink.send(&self.topic, envelope)).await {
                    Ok(Ok(message_id)) => Ok(message_id),
                    Ok(Err(e)) => Err(PublishFailureReason::Broker(e)),
                    Err(_) => Err(PublishFailureReason::Timeout(ack_timeout)),
                }
            })
            .await;

        match result {
            Ok(message_id) => Ok(message_id),
            Err(CircuitBreakerError::CircuitOpen) => Err(PublishFailureReason::CircuitOpen),
            Err(CircuitBreakerError::OperationFailed(reason)) => Err(reason),
        }
    }

    /// Reject further publishes and wait for buffered sends to drain.
    /// Calling it again is a no-op.
    pub async fn close(&self, timeout: Duration) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(topic = %self.topic, "Closing event publisher");
        self.sink.flush(timeout).await
    }
}
