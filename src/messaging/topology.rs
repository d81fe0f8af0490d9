use std::time::Duration;

use super::broker::{BrokerError, SubscriptionName, TopicName, TopologyAdmin};
use super::errors::MessagingError;
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// Topology Bootstrap
// ============================================================================
//
// Creates the topic (and, for consumers, the subscription) when running
// against a local broker. Managed environments own their topology, so the
// Skip policy never touches the broker.
//
// Every replica runs this on every start. "Already exists" is the common case
// and counts as success; racing replicas both succeed.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPolicy {
    /// Topology is provisioned externally
    Skip,
    Bootstrap,
}

#[derive(Debug, Clone)]
pub struct TopologySpec {
    pub topic: TopicName,
    pub subscription: Option<SubscriptionName>,
    pub ack_deadline: Duration,
}

impl TopologySpec {
    /// Topic only, for processes that publish
    pub fn publisher(topic: TopicName) -> Self {
        Self {
            topic,
            subscription: None,
            ack_deadline: Duration::from_secs(30),
        }
    }

    pub fn subscriber(topic: TopicName, subscription: SubscriptionName) -> Self {
        Self {
            subscription: Some(subscription),
            ..Self::publisher(topic)
        }
    }

    pub fn with_ack_deadline(mut self, ack_deadline: Duration) -> Self {
        self.ack_deadline = ack_deadline;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Created,
    AlreadyExists,
}

impl ResourceStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Created => "created",
            ResourceStatus::AlreadyExists => "already_exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyReport {
    Skipped,
    Ensured {
        topic: ResourceStatus,
        subscription: Option<ResourceStatus>,
    },
}

fn classify(result: Result<(), BrokerError>) -> Result<ResourceStatus, BrokerError> {
    match result {
        Ok(()) => Ok(ResourceStatus::Created),
        Err(BrokerError::AlreadyExists(_)) => Ok(ResourceStatus::AlreadyExists),
        Err(e) => Err(e),
    }
}

pub async fn ensure_topology(
    admin: &dyn TopologyAdmin,
    policy: BootstrapPolicy,
    spec: &TopologySpec,
    retry: RetryConfig,
    metrics: Option<&Metrics>,
) -> Result<TopologyReport, MessagingError> {
    if policy == BootstrapPolicy::Skip {
        tracing::info!(topic = %spec.topic, "Topology managed externally, skipping bootstrap");
        return Ok(TopologyReport::Skipped);
    }

    let topic = &spec.topic;
    let topic_status = retry_on_transient("create_topic", retry.clone(), |_attempt| async move {
        classify(admin.create_topic(topic).await)
    })
    .await
    .into_result();
    let topic_status = record("topic", topic.to_string(), topic_status, metrics)?;

    let subscription_status = match &spec.subscription {
        Some(subscription) => {
            let ack_deadline = spec.ack_deadline;
            let status = retry_on_transient("create_subscription", retry, |_attempt| async move {
                classify(admin.create_subscription(subscription, topic, ack_deadline).await)
            })
            .await
            .into_result();
            Some(record("subscription", subscription.to_string(), status, metrics)?)
        }
        None => None,
    };

    Ok(TopologyReport::Ensured {
        topic: topic_status,
        subscription: subscription_status,
    })
}

fn record(
    kind: &str,
    name: String,
    result: Result<ResourceStatus, BrokerError>,
    metrics: Option<&Metrics>,
) -> Result<ResourceStatus, MessagingError> {
    match result {
        Ok(status) => {
            tracing::info!(resource = kind, name = %name, status = status.as_str(), "Topology resource ensured");
            if let Some(metrics) = metrics {
                metrics.record_bootstrap(kind, status.as_str());
            }
            Ok(status)
        }
        Err(source) => {
            tracing::error!(resource = kind, name = %name, error = %source, "Topology bootstrap failed");
            if let Some(metrics) = metrics {
                metrics.record_bootstrap(kind, "failed");
            }
            Err(MessagingError::Topology {
                resource: format!("{} {}", kind, name),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::broker::InMemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn spec() -> TopologySpec {
        TopologySpec::subscriber(
            TopicName::new("local-project", "user-events"),
            SubscriptionName::new("local-project", "task-service.user-events"),
        )
    }

    /// Admin that fails a fixed number of times, then delegates
    struct FlakyAdmin {
        inner: InMemoryBroker,
        failures_left: AtomicU32,
        error: BrokerError,
        calls: AtomicU32,
    }

    impl FlakyAdmin {
        fn new(failures: u32, error: BrokerError) -> Self {
            Self {
                inner: InMemoryBroker::new(),
                failures_left: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn fail(&self) -> Option<BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Some(self.error.clone())
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl TopologyAdmin for FlakyAdmin {
        async fn create_topic(&self, topic: &TopicName) -> Result<(), BrokerError> {
            match self.fail() {
                Some(e) => Err(e),
                None => self.inner.create_topic(topic).await,
            }
        }

        async fn create_subscription(
            &self,
            subscription: &SubscriptionName,
            topic: &TopicName,
            ack_deadline: Duration,
        ) -> Result<(), BrokerError> {
            self.inner.create_subscription(subscription, topic, ack_deadline).await
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_skip_never_touches_broker() {
        let admin = FlakyAdmin::new(0, BrokerError::Rejected("unused".into()));

        let report = ensure_topology(&admin, BootstrapPolicy::Skip, &spec(), fast_retry(), None)
            .await
            .unwrap();

        assert_eq!(report, TopologyReport::Skipped);
        assert_eq!(admin.calls.load(Ordering::SeqCst), 0);
        assert_eq!(admin.inner.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let broker = InMemoryBroker::new();
        let metrics = Metrics::new().unwrap();

        let first = ensure_topology(&broker, BootstrapPolicy::Bootstrap, &spec(), fast_retry(), Some(&metrics))
            .await
            .unwrap();
        let second = ensure_topology(&broker, BootstrapPolicy::Bootstrap, &spec(), fast_retry(), Some(&metrics))
            .await
            .unwrap();

        assert_eq!(
            first,
            TopologyReport::Ensured {
                topic: ResourceStatus::Created,
                subscription: Some(ResourceStatus::Created),
            }
        );
        assert_eq!(
            second,
            TopologyReport::Ensured {
                topic: ResourceStatus::AlreadyExists,
                subscription: Some(ResourceStatus::AlreadyExists),
            }
        );
        assert_eq!(broker.topic_count().await, 1);
        assert_eq!(broker.subscription_count().await, 1);
        assert_eq!(
            metrics.topology_bootstrap.with_label_values(&["topic", "already_exists"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_racing_replicas_both_succeed() {
        let broker = Arc::new(InMemoryBroker::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    ensure_topology(broker.as_ref(), BootstrapPolicy::Bootstrap, &spec(), fast_retry(), None).await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(broker.topic_count().await, 1);
        assert_eq!(broker.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_publisher_spec_creates_topic_only() {
        let broker = InMemoryBroker::new();
        let spec = TopologySpec::publisher(TopicName::new("local-project", "user-events"));

        let report = ensure_topology(&broker, BootstrapPolicy::Bootstrap, &spec, fast_retry(), None)
            .await
            .unwrap();

        assert_eq!(
            report,
            TopologyReport::Ensured {
                topic: ResourceStatus::Created,
                subscription: None,
            }
        );
        assert_eq!(broker.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let admin = FlakyAdmin::new(2, BrokerError::Unavailable("emulator booting".into()));

        let report = ensure_topology(&admin, BootstrapPolicy::Bootstrap, &spec(), fast_retry(), None)
            .await
            .unwrap();

        assert!(matches!(report, TopologyReport::Ensured { topic: ResourceStatus::Created, .. }));
        assert_eq!(admin.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_fatal() {
        let admin = FlakyAdmin::new(1, BrokerError::Rejected("permission denied".into()));

        let result = ensure_topology(&admin, BootstrapPolicy::Bootstrap, &spec(), fast_retry(), None).await;

        match result {
            Err(MessagingError::Topology { resource, source }) => {
                assert!(resource.starts_with("topic"));
                assert!(matches!(source, BrokerError::Rejected(_)));
            }
            other => panic!("expected topology error, got {:?}", other),
        }
        assert_eq!(admin.calls.load(Ordering::SeqCst), 1);
    }
}
