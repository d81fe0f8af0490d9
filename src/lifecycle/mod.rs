use kameo::actor::ActorRef;
use std::sync::Arc;
use std::time::Duration;

use crate::actors::{HealthCheckable, HealthMonitorActor, UpdateHealth};
use crate::config::MessagingConfig;
use crate::messaging::broker::{SubscriptionName, TopicName};
use crate::messaging::{EventPublisher, MessagingError, SubscriberRuntime};

// ============================================================================
// Lifecycle Manager - explicit start/stop of messaging components
// ============================================================================
//
// start_all: runtimes in registration order; the first failure stops the
//            ones already running and is returned.
// stop_all:  runtimes in reverse order, each bounded by its own shutdown
//            timeout, then every publisher is closed.
//
// ============================================================================

pub struct LifecycleManager {
    topic: TopicName,
    subscription: SubscriptionName,
    publisher_close_timeout: Duration,
    runtimes: Vec<Arc<SubscriberRuntime>>,
    publishers: Vec<Arc<EventPublisher>>,
    health: Option<ActorRef<HealthMonitorActor>>,
}

impl LifecycleManager {
    /// Fails when the project, topic or subscription id is missing
    pub fn new(config: &MessagingConfig) -> Result<Self, MessagingError> {
        Ok(Self {
            topic: config.topic()?,
            subscription: config.subscription()?,
            publisher_close_timeout: config.publish_timeout,
            runtimes: Vec::new(),
            publishers: Vec::new(),
            health: None,
        })
    }

    pub fn with_health(mut self, health: ActorRef<HealthMonitorActor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn subscription(&self) -> &SubscriptionName {
        &self.subscription
    }

    pub fn register(&mut self, runtime: Arc<SubscriberRuntime>) {
        self.runtimes.push(runtime);
    }

    pub fn add_publisher(&mut self, publisher: Arc<EventPublisher>) {
        self.publishers.push(publisher);
    }

    pub fn runtimes(&self) -> &[Arc<SubscriberRuntime>] {
        &self.runtimes
    }

    pub async fn start_all(&self) -> Result<(), MessagingError> {
        tracing::info!(runtimes = self.runtimes.len(), subscription = %self.subscription, "Starting subscriber runtimes");

        for (index, runtime) in self.runtimes.iter().enumerate() {
            if let Err(e) = runtime.start().await {
                tracing::error!(runtime = runtime.name(), error = %e, "Runtime failed to start, rolling back");
                self.report(runtime).await;

                for started in self.runtimes[..index].iter().rev() {
                    started.stop().await;
                    self.report(started).await;
                }
                return Err(e);
            }
            self.report(runtime).await;
        }

        Ok(())
    }

    pub async fn stop_all(&self) {
        tracing::info!(runtimes = self.runtimes.len(), "Stopping subscriber runtimes");

        for runtime in self.runtimes.iter().rev() {
            runtime.stop().await;
            self.report(runtime).await;
        }

        for publisher in &self.publishers {
            if let Err(e) = publisher.close(self.publisher_close_timeout).await {
                tracing::warn!(topic = %publisher.topic(), error = %e, "Publisher did not flush cleanly");
            }
        }

        tracing::info!("Messaging components stopped");
    }

    async fn report(&self, runtime: &SubscriberRuntime) {
        let Some(health) = &self.health else {
            return;
        };

        if let Err(e) = health.tell(UpdateHealth::from(runtime.check_health())).await {
            tracing::warn!(runtime = runtime.name(), error = ?e, "Failed to report runtime health");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::GetSystemHealth;
    use crate::config::BrokerMode;
    use crate::domain::task::InMemoryTaskStore;
    use crate::messaging::broker::{InMemoryBroker, TopologyAdmin};
    use crate::messaging::{PublishFailureReason, PublisherSettings, RuntimeState};
    use crate::projection::task_service_registry;
    use kameo::Actor;

    fn config() -> MessagingConfig {
        MessagingConfig {
            project_id: Some("test-project".into()),
            topic_id: Some("user-events".into()),
            subscription_id: Some("task-service".into()),
            mode: BrokerMode::InMemory,
            publish_timeout: Duration::from_secs(1),
            ack_deadline: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(1),
            max_concurrent_handlers: 2,
            subscriber_replicas: 2,
            metrics_port: 9090,
        }
    }

    async fn manager_with_runtimes(count: usize) -> (Arc<InMemoryBroker>, LifecycleManager) {
        let config = config();
        let mut manager = LifecycleManager::new(&config).unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic(manager.topic()).await.unwrap();
        broker
            .create_subscription(manager.subscription(), manager.topic(), config.ack_deadline)
            .await
            .unwrap();

        let registry = Arc::new(task_service_registry(Arc::new(InMemoryTaskStore::new())));
        for i in 0..count {
            manager.register(Arc::new(SubscriberRuntime::new(
                format!("runtime-{}", i),
                manager.subscription().clone(),
                broker.clone(),
                registry.clone(),
                config.runtime_settings(),
            )));
        }
        (broker, manager)
    }

    #[test]
    fn test_missing_ids_are_rejected() {
        let mut missing_topic = config();
        missing_topic.topic_id = None;
        assert!(matches!(
            LifecycleManager::new(&missing_topic),
            Err(MessagingError::Configuration(_))
        ));

        let mut missing_project = config();
        missing_project.project_id = None;
        assert!(matches!(
            LifecycleManager::new(&missing_project),
            Err(MessagingError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let (broker, mut manager) = manager_with_runtimes(2).await;
        let publisher = Arc::new(EventPublisher::new(
            broker.clone(),
            manager.topic().clone(),
            PublisherSettings::default(),
        ));
        manager.add_publisher(publisher.clone());

        manager.start_all().await.unwrap();
        assert!(manager.runtimes().iter().all(|r| r.state() == RuntimeState::Running));

        manager.stop_all().await;
        assert!(manager.runtimes().iter().all(|r| r.state() == RuntimeState::Stopped));

        let failure = publisher.publish_user_deleted(crate::domain::user::UserId(1), None).await.unwrap_err();
        assert!(matches!(failure.reason, PublishFailureReason::Closed));
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let (_, manager) = manager_with_runtimes(3).await;
        // A runtime that already ran cannot be started again
        manager.runtimes()[2].stop().await;

        let result = manager.start_all().await;

        assert!(matches!(result, Err(MessagingError::InvalidState { .. })));
        assert_eq!(manager.runtimes()[0].state(), RuntimeState::Stopped);
        assert_eq!(manager.runtimes()[1].state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn test_reports_runtime_health() {
        let monitor = HealthMonitorActor::spawn(HealthMonitorActor::new(None));
        let (_, manager) = manager_with_runtimes(1).await;
        let manager = manager.with_health(monitor.clone());

        manager.start_all().await.unwrap();
        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert!(health.components["runtime-0"].status.is_healthy());

        manager.stop_all().await;
        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert!(!health.components["runtime-0"].status.is_healthy());
    }
}
