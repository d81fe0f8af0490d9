use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::task::{StoreError, TaskStore};
use crate::domain::user::{DomainEvent, EventKind, UserDeleted, UserRegistered};
use crate::messaging::{EventHandler, HandlerOutcome, HandlerRegistry, NackReason};

// ============================================================================
// Task Projections - keep the task store in step with user lifecycle events
// ============================================================================
//
// - UserDeleted    -> cascade delete of the user's tasks
// - UserRegistered -> seed the default task set
//
// Both are safe to repeat; the store makes the second application a no-op.
// Store failures become nacks so the broker retries later.
//
// ============================================================================

/// Handlers the task service subscribes with
pub fn task_service_registry(store: Arc<dyn TaskStore>) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(Arc::new(UserDeletedProjection::new(store.clone())))
        .register(Arc::new(UserRegisteredProjection::new(store)))
}

fn wrong_kind(event: &DomainEvent) -> HandlerOutcome {
    HandlerOutcome::Nack(NackReason::Unroutable {
        event_type: Some(event.kind().tag().to_string()),
    })
}

pub struct UserDeletedProjection {
    store: Arc<dyn TaskStore>,
}

impl UserDeletedProjection {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Returns the number of tasks removed
    pub async fn apply(&self, event: &UserDeleted) -> Result<u64, StoreError> {
        self.store.delete_all_tasks_for_user(event.user_id).await
    }
}

#[async_trait]
impl EventHandler for UserDeletedProjection {
    fn name(&self) -> &str {
        "user_deleted_projection"
    }

    fn kind(&self) -> EventKind {
        EventKind::UserDeleted
    }

    async fn handle(&self, event: &DomainEvent) -> HandlerOutcome {
        let DomainEvent::UserDeleted(deleted) = event else {
            return wrong_kind(event);
        };

        match self.apply(deleted).await {
            Ok(count) => {
                tracing::info!(user_id = %deleted.user_id, deleted = count, "Cascaded user deletion to tasks");
                HandlerOutcome::Ack
            }
            Err(e) => {
                tracing::error!(user_id = %deleted.user_id, error = %e, "Failed to delete tasks for user");
                HandlerOutcome::failed(e)
            }
        }
    }
}

pub struct UserRegisteredProjection {
    store: Arc<dyn TaskStore>,
}

impl UserRegisteredProjection {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Returns the number of tasks created (0 on a repeat delivery)
    pub async fn apply(&self, event: &UserRegistered) -> Result<usize, StoreError> {
        self.store.create_default_tasks(event.user_id, &event.name).await
    }
}

#[async_trait]
impl EventHandler for UserRegisteredProjection {
    fn name(&self) -> &str {
        "user_registered_projection"
    }

    fn kind(&self) -> EventKind {
        EventKind::UserRegistered
    }

    async fn handle(&self, event: &DomainEvent) -> HandlerOutcome {
        let DomainEvent::UserRegistered(registered) = event else {
            return wrong_kind(event);
        };

        match self.apply(registered).await {
            Ok(0) => {
                tracing::debug!(user_id = %registered.user_id, "Default tasks already handled");
                HandlerOutcome::Ack
            }
            Ok(created) => {
                tracing::info!(user_id = %registered.user_id, created, "Created default tasks");
                HandlerOutcome::Ack
            }
            Err(e) => {
                tracing::error!(user_id = %registered.user_id, error = %e, "Failed to create default tasks");
                HandlerOutcome::failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{InMemoryTaskStore, Priority, Task};
    use crate::domain::user::UserId;
    use crate::messaging::broker::{InMemoryBroker, SubscriptionName, TopicName, TopologyAdmin};
    use crate::messaging::{encode, EventPublisher, PublisherSettings, RuntimeSettings, SubscriberRuntime};
    use std::time::{Duration, Instant};

    async fn store_with(tasks: &[(i64, usize)]) -> Arc<InMemoryTaskStore> {
        let store = Arc::new(InMemoryTaskStore::new());
        for (user, count) in tasks {
            for i in 0..*count {
                store
                    .insert(Task::new(UserId(*user), format!("task {}", i), Priority::Medium))
                    .await
                    .unwrap();
            }
        }
        store
    }

    fn deleted(user: i64) -> DomainEvent {
        DomainEvent::UserDeleted(UserDeleted { user_id: UserId(user), email: None })
    }

    fn registered(user: i64, name: &str) -> DomainEvent {
        DomainEvent::UserRegistered(UserRegistered {
            user_id: UserId(user),
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_delete_removes_only_that_users_tasks() {
        let store = store_with(&[(42, 3), (7, 1)]).await;
        let projection = UserDeletedProjection::new(store.clone());

        let count = projection
            .apply(&UserDeleted { user_id: UserId(42), email: None })
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert!(store.tasks_for_user(UserId(42)).await.unwrap().is_empty());
        assert_eq!(store.tasks_for_user(UserId(7)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_user_without_tasks_acks() {
        let store = store_with(&[]).await;
        let projection = UserDeletedProjection::new(store.clone());

        let count = projection
            .apply(&UserDeleted { user_id: UserId(999), email: None })
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(projection.handle(&deleted(999)).await, HandlerOutcome::Ack);
    }

    #[tokio::test]
    async fn test_repeated_delete_is_harmless() {
        let store = store_with(&[(5, 2)]).await;
        let projection = UserDeletedProjection::new(store.clone());

        assert_eq!(projection.handle(&deleted(5)).await, HandlerOutcome::Ack);
        assert_eq!(projection.handle(&deleted(5)).await, HandlerOutcome::Ack);
        assert_eq!(store.total_tasks().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_registration_seeds_once() {
        let store = store_with(&[]).await;
        let projection = UserRegisteredProjection::new(store.clone());

        assert_eq!(projection.handle(&registered(8, "Ivy")).await, HandlerOutcome::Ack);
        assert_eq!(projection.handle(&registered(8, "Ivy")).await, HandlerOutcome::Ack);

        let tasks = store.tasks_for_user(UserId(8)).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].title, "Welcome, Ivy!");
    }

    #[tokio::test]
    async fn test_store_failure_nacks() {
        let store = store_with(&[(1, 1)]).await;
        store.fail_writes(StoreError::Unavailable("connection refused".into()));

        let outcome = UserDeletedProjection::new(store.clone()).handle(&deleted(1)).await;
        assert!(matches!(outcome, HandlerOutcome::Nack(NackReason::HandlerFailed(_))));

        let outcome = UserRegisteredProjection::new(store.clone()).handle(&registered(2, "Jo")).await;
        assert!(matches!(outcome, HandlerOutcome::Nack(NackReason::HandlerFailed(_))));

        assert_eq!(store.tasks_for_user(UserId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_registry_routes_both_kinds() {
        let store = store_with(&[]).await;
        let registry = task_service_registry(store.clone());

        let outcome = registry.dispatch(&encode(&registered(3, "Kim")).unwrap()).await;
        assert_eq!(outcome, HandlerOutcome::Ack);
        assert_eq!(store.tasks_for_user(UserId(3)).await.unwrap().len(), 3);

        let outcome = registry.dispatch(&encode(&deleted(3)).unwrap()).await;
        assert_eq!(outcome, HandlerOutcome::Ack);
        assert!(store.tasks_for_user(UserId(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_runtimes_share_one_subscription() {
        let broker = Arc::new(InMemoryBroker::new());
        let topic = TopicName::new("local-project", "user-events");
        let subscription = SubscriptionName::new("local-project", "task-service.user-events");
        broker.create_topic(&topic).await.unwrap();
        broker
            .create_subscription(&subscription, &topic, Duration::from_secs(30))
            .await
            .unwrap();

        let store = Arc::new(InMemoryTaskStore::new());
        let registry = Arc::new(task_service_registry(store.clone()));
        let settings = RuntimeSettings {
            pull_wait: Duration::from_millis(20),
            ..RuntimeSettings::default()
        };
        let runtimes: Vec<_> = (0..2)
            .map(|i| {
                SubscriberRuntime::new(
                    format!("task-service-{}", i),
                    subscription.clone(),
                    broker.clone(),
                    registry.clone(),
                    settings.clone(),
                )
            })
            .collect();
        for runtime in &runtimes {
            runtime.start().await.unwrap();
        }

        let publisher = EventPublisher::new(broker.clone(), topic, PublisherSettings::default());
        for user in 1..=10 {
            publisher.publish_user_registered(UserId(user), format!("user{}", user)).await.unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.total_tasks().await < 30 {
            assert!(Instant::now() < deadline, "projection did not catch up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for runtime in &runtimes {
            runtime.stop().await;
        }
        for user in 1..=10 {
            assert_eq!(store.tasks_for_user(UserId(user)).await.unwrap().len(), 3);
        }
        assert_eq!(broker.stats(&subscription).await.unwrap().acked, 10);
    }

    #[tokio::test]
    async fn test_store_outage_keeps_event_until_store_recovers() {
        let broker = Arc::new(InMemoryBroker::with_redelivery_backoff(Duration::from_millis(20)));
        let topic = TopicName::new("local-project", "user-events");
        let subscription = SubscriptionName::new("local-project", "task-service.user-events");
        broker.create_topic(&topic).await.unwrap();
        broker
            .create_subscription(&subscription, &topic, Duration::from_secs(30))
            .await
            .unwrap();

        let store = store_with(&[(4, 2)]).await;
        store.fail_writes(StoreError::Unavailable("connection refused".into()));
        let runtime = SubscriberRuntime::new(
            "task-service-0",
            subscription.clone(),
            broker.clone(),
            Arc::new(task_service_registry(store.clone())),
            RuntimeSettings {
                pull_wait: Duration::from_millis(20),
                ..RuntimeSettings::default()
            },
        );
        runtime.start().await.unwrap();

        let publisher = EventPublisher::new(broker.clone(), topic, PublisherSettings::default());
        publisher.publish_user_deleted(UserId(4), None).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.stats(&subscription).await.unwrap().nacked == 0 {
            assert!(Instant::now() < deadline, "failed write was not nacked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.stats(&subscription).await.unwrap().acked, 0);
        assert_eq!(store.tasks_for_user(UserId(4)).await.unwrap().len(), 2);

        store.clear_fault();
        while broker.stats(&subscription).await.unwrap().acked == 0 {
            assert!(Instant::now() < deadline, "redelivery did not reach the recovered store");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runtime.stop().await;

        assert!(store.tasks_for_user(UserId(4)).await.unwrap().is_empty());
    }
}
