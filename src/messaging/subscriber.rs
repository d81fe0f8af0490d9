use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use super::broker::{MessageSource, ReceivedMessage, SubscriptionName};
use super::errors::MessagingError;
use super::handler::{HandlerOutcome, HandlerRegistry, NackReason};
use crate::actors::{ComponentHealth, HealthCheckable, HealthStatus};
use crate::metrics::Metrics;

// ============================================================================
// Subscriber Runtime
// ============================================================================
//
// One pull loop per (subscription, registry) pair, running on its own task.
//
//   pull ──► route by eventType ──► handler task ──oneshot──► ack / nack
//
// - At most `max_concurrent_handlers` messages are leased and in flight.
// - Every handler runs in its own task; one that dies without reporting is
//   treated as a nack.
// - stop() lets in-flight handlers finish within `shutdown_timeout`, then
//   aborts the rest. Their leases expire and the broker redelivers them.
//
// State: Created ──start──► Running ──stop──► Stopping ──► Stopped
//        Created ──stop──► Stopped
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Created => "created",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub max_concurrent_handlers: usize,
    /// Upper bound on messages leased by one pull
    pub max_batch: usize,
    /// How long one pull waits for messages
    pub pull_wait: Duration,
    pub shutdown_timeout: Duration,
    /// Pause after a failed pull
    pub error_backoff: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 4,
            max_batch: 10,
            pull_wait: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Everything the pull loop and its message tasks share
struct LoopContext {
    name: String,
    subscription: SubscriptionName,
    source: Arc<dyn MessageSource>,
    registry: Arc<HandlerRegistry>,
    settings: RuntimeSettings,
    metrics: Option<Arc<Metrics>>,
}

pub struct SubscriberRuntime {
    ctx: Arc<LoopContext>,
    state: watch::Sender<RuntimeState>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriberRuntime {
    pub fn new(
        name: impl Into<String>,
        subscription: SubscriptionName,
        source: Arc<dyn MessageSource>,
        registry: Arc<HandlerRegistry>,
        settings: RuntimeSettings,
    ) -> Self {
        let (state, _) = watch::channel(RuntimeState::Created);
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(LoopContext {
                name: name.into(),
                subscription,
                source,
                registry,
                settings,
                metrics: None,
            }),
            state,
            shutdown,
            worker: Mutex::new(None),
        }
    }

    /// Only effective before start
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.metrics = Some(metrics);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn subscription(&self) -> &SubscriptionName {
        &self.ctx.subscription
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Spawn the pull loop and return once it is running
    pub async fn start(&self) -> Result<(), MessagingError> {
        // Held until the handle is stored, so a concurrent stop() always joins the loop
        let mut worker = self.worker.lock().await;

        let mut previous = RuntimeState::Created;
        let claimed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == RuntimeState::Created {
                *state = RuntimeState::Running;
                true
            } else {
                false
            }
        });

        if !claimed {
            return Err(MessagingError::InvalidState {
                name: self.ctx.name.clone(),
                action: "start",
                state: previous,
            });
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(pull_loop(self.ctx.clone(), ready_tx, shutdown)));
        if let Some(metrics) = &self.ctx.metrics {
            metrics.runtimes_running.inc();
        }
        drop(worker);

        if ready_rx.await.is_err() {
            // A stop() that got in first owns the cleanup
            let failed = self.state.send_if_modified(|state| {
                if *state == RuntimeState::Running {
                    *state = RuntimeState::Stopped;
                    true
                } else {
                    false
                }
            });
            if failed {
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.runtimes_running.dec();
                }
            }
            return Err(MessagingError::Startup {
                name: self.ctx.name.clone(),
                reason: "pull loop exited before signalling readiness".to_string(),
            });
        }

        tracing::info!(
            runtime = %self.ctx.name,
            subscription = %self.ctx.subscription,
            max_concurrent_handlers = self.ctx.settings.max_concurrent_handlers,
            "Subscriber runtime started"
        );
        Ok(())
    }

    /// Stop pulling and drain. Safe to call in any state, any number of times.
    pub async fn stop(&self) {
        let mut previous = RuntimeState::Stopped;
        self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                RuntimeState::Created => {
                    *state = RuntimeState::Stopped;
                    true
                }
                RuntimeState::Running => {
                    *state = RuntimeState::Stopping;
                    true
                }
                RuntimeState::Stopping | RuntimeState::Stopped => false,
            }
        });

        match previous {
            RuntimeState::Created => {
                tracing::debug!(runtime = %self.ctx.name, "Runtime stopped before it was started");
                return;
            }
            RuntimeState::Stopping | RuntimeState::Stopped => {
                // Another caller is (or was) stopping it
                let mut state = self.state.subscribe();
                let _ = state.wait_for(|s| *s == RuntimeState::Stopped).await;
                return;
            }
            RuntimeState::Running => {}
        }

        tracing::info!(runtime = %self.ctx.name, "Stopping subscriber runtime");
        self.shutdown.send_replace(true);

        let worker = self.worker.lock().await.take();
        if let Some(mut handle) = worker {
            // The loop bounds its own drain; the margin covers releasing the source
            let limit = self.ctx.settings.shutdown_timeout + Duration::from_secs(1);
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(runtime = %self.ctx.name, error = %e, "Pull loop ended abnormally")
                }
                Err(_) => {
                    tracing::warn!(runtime = %self.ctx.name, "Pull loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(metrics) = &self.ctx.metrics {
            metrics.runtimes_running.dec();
        }
        self.state.send_replace(RuntimeState::Stopped);
        tracing::info!(runtime = %self.ctx.name, "Subscriber runtime stopped");
    }
}

impl HealthCheckable for SubscriberRuntime {
    fn check_health(&self) -> ComponentHealth {
        let status = match self.state() {
            RuntimeState::Running => HealthStatus::Healthy,
            RuntimeState::Created => HealthStatus::Degraded("not started".to_string()),
            RuntimeState::Stopping => HealthStatus::Degraded("draining".to_string()),
            RuntimeState::Stopped => HealthStatus::Unhealthy("stopped".to_string()),
        };
        ComponentHealth::new(self.component_name(), status)
            .with_details(format!("subscription {}", self.ctx.subscription))
    }

    fn component_name(&self) -> &str {
        &self.ctx.name
    }
}

// ============================================================================
// Pull Loop
// ============================================================================

async fn pull_loop(
    ctx: Arc<LoopContext>,
    ready: oneshot::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(ctx.settings.max_concurrent_handlers.max(1)));
    let mut in_flight: JoinSet<()> = JoinSet::new();

    if let Err(e) = ctx.source.open(&ctx.subscription).await {
        tracing::error!(runtime = %ctx.name, subscription = %ctx.subscription, error = %e, "Failed to open subscription");
        return;
    }
    if ready.send(()).is_err() {
        ctx.source.close(&ctx.subscription).await;
        return;
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(&ctx, joined);
                continue;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // One permit is held; lease as many more messages as there are free slots
        let max_messages = (1 + permits.available_permits()).min(ctx.settings.max_batch.max(1));

        let pulled = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            pulled = ctx.source.pull(&ctx.subscription, max_messages, ctx.settings.pull_wait) => pulled,
        };

        let messages = match pulled {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(
                    runtime = %ctx.name,
                    subscription = %ctx.subscription,
                    error = %e,
                    "Pull failed, backing off"
                );
                drop(permit);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(ctx.settings.error_backoff) => {}
                }
                continue;
            }
        };

        let mut first = Some(permit);
        for message in messages {
            let permit = match first.take() {
                Some(permit) => permit,
                None => match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            in_flight.spawn(process_message(ctx.clone(), message, permit));
        }
    }

    drain(&ctx, &mut in_flight).await;
    ctx.source.close(&ctx.subscription).await;
}

async fn drain(ctx: &LoopContext, in_flight: &mut JoinSet<()>) {
    if !in_flight.is_empty() {
        tracing::info!(runtime = %ctx.name, in_flight = in_flight.len(), "Draining in-flight messages");
    }

    let drained = tokio::time::timeout(ctx.settings.shutdown_timeout, async {
        while let Some(joined) = in_flight.join_next().await {
            log_join(ctx, joined);
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            runtime = %ctx.name,
            remaining = in_flight.len(),
            "Shutdown timeout reached, aborting unfinished handlers"
        );
        in_flight.shutdown().await;
    }
}

fn log_join(ctx: &LoopContext, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            tracing::error!(runtime = %ctx.name, error = %e, "Message task failed");
        }
    }
}

/// Aborts the handler task if the message task itself is aborted
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn process_message(ctx: Arc<LoopContext>, message: ReceivedMessage, _permit: OwnedSemaphorePermit) {
    let subscription = ctx.subscription.to_string();
    if let Some(metrics) = &ctx.metrics {
        metrics.record_received(&subscription);
    }

    let (event_type, outcome) = match ctx.registry.route(&message.envelope) {
        Err(reason) => {
            tracing::warn!(
                runtime = %ctx.name,
                message_id = %message.message_id,
                event_type = message.envelope.event_type().unwrap_or("<none>"),
                reason = %reason,
                "Message cannot be routed"
            );
            (None, HandlerOutcome::Nack(reason))
        }
        Ok((event, handler)) => {
            let kind = event.kind();
            let started = Instant::now();

            let (result_tx, result_rx) = oneshot::channel();
            let mut task = AbortOnDrop(tokio::spawn(async move {
                let outcome = handler.handle(&event).await;
                let _ = result_tx.send(outcome);
            }));

            // A dropped sender means the handler panicked
            let outcome = result_rx
                .await
                .unwrap_or(HandlerOutcome::Nack(NackReason::HandlerPanicked));
            if let Err(e) = (&mut task.0).await {
                if e.is_panic() {
                    tracing::error!(
                        runtime = %ctx.name,
                        message_id = %message.message_id,
                        event_type = %kind,
                        "Handler panicked"
                    );
                }
            }

            if let Some(metrics) = &ctx.metrics {
                metrics.record_handler_duration(kind.tag(), started.elapsed().as_secs_f64());
            }
            (Some(kind), outcome)
        }
    };

    match outcome {
        HandlerOutcome::Ack => {
            if let Err(e) = ctx.source.ack(&ctx.subscription, &message.ack_id).await {
                tracing::error!(message_id = %message.message_id, error = %e, "Ack failed");
                return;
            }
            tracing::debug!(
                runtime = %ctx.name,
                message_id = %message.message_id,
                attempt = message.delivery_attempt,
                "Message acked"
            );
            if let (Some(metrics), Some(kind)) = (&ctx.metrics, event_type) {
                metrics.record_acked(&subscription, kind.tag());
            }
        }
        HandlerOutcome::Nack(reason) => {
            if let Err(e) = ctx.source.nack(&ctx.subscription, &message.ack_id).await {
                tracing::error!(message_id = %message.message_id, error = %e, "Nack failed");
                return;
            }
            tracing::warn!(
                runtime = %ctx.name,
                message_id = %message.message_id,
                attempt = message.delivery_attempt,
                reason = %reason,
                "Message nacked"
            );
            if let Some(metrics) = &ctx.metrics {
                metrics.record_nacked(&subscription, reason.label());
            }
        }
    }
}
