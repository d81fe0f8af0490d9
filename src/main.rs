use kameo::Actor;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod actors;
mod config;
mod domain;
mod lifecycle;
mod messaging;
mod metrics;
mod projection;
mod utils;

use actors::HealthMonitorActor;
use crate::config::{BrokerMode, MessagingConfig};
use domain::task::{InMemoryTaskStore, TaskStore};
use domain::user::{IdentityError, IdentityService, InMemoryUserDirectory, NewUser};
use lifecycle::LifecycleManager;
use messaging::broker::{InMemoryBroker, KafkaBroker, MessageSink, MessageSource, TopologyAdmin};
use messaging::{ensure_topology, EventPublisher, SubscriberRuntime, TopologySpec};
use utils::RetryConfig;

/// One broker connection seen through each role it plays
struct BrokerHandles {
    admin: Arc<dyn TopologyAdmin>,
    sink: Arc<dyn MessageSink>,
    source: Arc<dyn MessageSource>,
}

fn connect_broker(config: &MessagingConfig, lifecycle: &LifecycleManager) -> anyhow::Result<BrokerHandles> {
    match config.kafka_settings() {
        None => {
            let broker = Arc::new(InMemoryBroker::new());
            Ok(BrokerHandles {
                admin: broker.clone(),
                sink: broker.clone(),
                source: broker,
            })
        }
        Some(settings) => {
            tracing::info!(brokers = %settings.brokers, "Connecting to Kafka");
            let broker = Arc::new(KafkaBroker::new(settings)?);
            // Managed topology is provisioned out of band; the binding still has to be known
            broker.bind_subscription(lifecycle.subscription(), lifecycle.topic());
            Ok(BrokerHandles {
                admin: broker.clone(),
                sink: broker.clone(),
                source: broker,
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,user_event_relay=debug"))
        )
        .init();

    tracing::info!("🚀 Starting user event relay");

    // === 1. Resolve configuration ===
    let config = MessagingConfig::from_env()?;
    tracing::info!(mode = config.mode.label(), replicas = config.subscriber_replicas, "Messaging configuration loaded");
    if let BrokerMode::Emulator { host } = &config.mode {
        tracing::info!(host = %host, "Using local broker emulator");
    }
    let mut lifecycle = LifecycleManager::new(&config)?;

    // === 2. Initialize Prometheus metrics ===
    let metrics = Arc::new(metrics::Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 3. Connect broker and ensure topology ===
    let broker = connect_broker(&config, &lifecycle)?;
    let spec = TopologySpec::subscriber(lifecycle.topic().clone(), lifecycle.subscription().clone())
        .with_ack_deadline(config.ack_deadline);
    let report = ensure_topology(
        broker.admin.as_ref(),
        config.bootstrap_policy(),
        &spec,
        RetryConfig::conservative(),
        Some(metrics.as_ref()),
    )
    .await?;
    tracing::info!(?report, "Topology ready");

    // === 4. Publisher (one per process) ===
    let publisher = Arc::new(
        EventPublisher::new(broker.sink.clone(), lifecycle.topic().clone(), config.publisher_settings())
            .with_metrics(metrics.clone()),
    );
    lifecycle.add_publisher(publisher.clone());

    // === 5. Health monitor and metrics endpoint ===
    let health = HealthMonitorActor::spawn(HealthMonitorActor::new(Some(publisher.clone())));
    let _metrics_server = metrics::spawn_metrics_server(
        Arc::new(metrics.registry().clone()),
        Some(health.clone()),
        config.metrics_port,
    );
    let mut lifecycle = lifecycle.with_health(health);

    // === 6. Task service subscriber runtimes ===
    let store = Arc::new(InMemoryTaskStore::new());
    let registry = Arc::new(projection::task_service_registry(store.clone()));
    for replica in 0..config.subscriber_replicas {
        let runtime = SubscriberRuntime::new(
            format!("task-service-{}", replica),
            lifecycle.subscription().clone(),
            broker.source.clone(),
            registry.clone(),
            config.runtime_settings(),
        )
        .with_metrics(metrics.clone());
        lifecycle.register(Arc::new(runtime));
    }
    lifecycle.start_all().await?;

    // === 7. Demonstrate the user lifecycle flow ===
    let identity = IdentityService::new(Arc::new(InMemoryUserDirectory::new()), publisher.clone());

    match identity.register_user(NewUser::new("demo", "demo@example.com")).await {
        Ok(user) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let tasks = store.tasks_for_user(user.id).await?;
            tracing::info!(user_id = %user.id, tasks = tasks.len(), "✅ Default tasks seeded");

            match identity.delete_user(user.id).await {
                Ok(_) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let tasks = store.tasks_for_user(user.id).await?;
                    tracing::info!(user_id = %user.id, tasks = tasks.len(), "✅ Tasks removed after user deletion");
                }
                Err(IdentityError::EventNotPublished { user, source }) => {
                    tracing::warn!(user_id = %user.id, error = %source, "User deleted but task service was not notified");
                }
                Err(e) => tracing::error!(error = %e, "Demo deletion failed"),
            }
        }
        Err(IdentityError::EventNotPublished { user, source }) => {
            tracing::warn!(user_id = %user.id, error = %source, "User registered but task service was not notified");
        }
        Err(e) => tracing::error!(error = %e, "Demo registration failed"),
    }

    // === 8. Run until interrupted ===
    tracing::info!("⏳ Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    lifecycle.stop_all().await;
    tracing::info!("👋 Shutdown complete");

    Ok(())
}
