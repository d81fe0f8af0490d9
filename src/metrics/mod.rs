mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

pub use server::spawn_metrics_server;

// ============================================================================
// Metrics - Prometheus instrumentation for the event flow
// ============================================================================
//
// Covers both sides of the flow:
// - publishing (throughput, failures by reason, ack latency)
// - consumption (received, acked, nacked by reason, handler latency)
// - topology bootstrap outcomes
// - publisher circuit breaker state and running subscriber runtimes
//
// Everything is registered on one Registry scraped via /metrics.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Publishing
    pub events_published: IntCounterVec,
    pub publish_failures: IntCounterVec,
    pub publish_duration: HistogramVec,

    // Consumption
    pub messages_received: IntCounterVec,
    pub messages_acked: IntCounterVec,
    pub messages_nacked: IntCounterVec,
    pub handler_duration: HistogramVec,

    // Topology
    pub topology_bootstrap: IntCounterVec,

    // Component state
    pub publisher_circuit_state: IntGauge,
    pub runtimes_running: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_published = IntCounterVec::new(
            Opts::new("user_events_published_total", "User events acknowledged by the broker"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let publish_failures = IntCounterVec::new(
            Opts::new("user_event_publish_failures_total", "User events the broker did not acknowledge"),
            &["event_type", "reason"],
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        let publish_duration = HistogramVec::new(
            HistogramOpts::new("user_event_publish_duration_seconds", "Time from submit to broker ack")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["event_type"],
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        let messages_received = IntCounterVec::new(
            Opts::new("user_event_messages_received_total", "Messages pulled from a subscription"),
            &["subscription"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_acked = IntCounterVec::new(
            Opts::new("user_event_messages_acked_total", "Messages acknowledged after handling"),
            &["subscription", "event_type"],
        )?;
        registry.register(Box::new(messages_acked.clone()))?;

        let messages_nacked = IntCounterVec::new(
            Opts::new("user_event_messages_nacked_total", "Messages returned for redelivery"),
            &["subscription", "reason"],
        )?;
        registry.register(Box::new(messages_nacked.clone()))?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new("user_event_handler_duration_seconds", "Projection handler run time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["event_type"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        let topology_bootstrap = IntCounterVec::new(
            Opts::new("user_event_topology_bootstrap_total", "Topology bootstrap outcomes per resource"),
            &["resource", "outcome"],
        )?;
        registry.register(Box::new(topology_bootstrap.clone()))?;

        let publisher_circuit_state = IntGauge::new(
            "user_event_publisher_circuit_state",
            "Publisher circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(publisher_circuit_state.clone()))?;

        let runtimes_running = IntGauge::new(
            "user_event_subscriber_runtimes_running",
            "Subscriber runtimes currently pulling",
        )?;
        registry.register(Box::new(runtimes_running.clone()))?;

        Ok(Self {
            registry,
            events_published,
            publish_failures,
            publish_duration,
            messages_received,
            messages_acked,
            messages_nacked,
            handler_duration,
            topology_bootstrap,
            publisher_circuit_state,
            runtimes_running,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_published(&self, event_type: &str, duration_secs: f64) {
        self.events_published.with_label_values(&[event_type]).inc();
        self.publish_duration.with_label_values(&[event_type]).observe(duration_secs);
    }

    pub fn record_publish_failure(&self, event_type: &str, reason: &str) {
        self.publish_failures.with_label_values(&[event_type, reason]).inc();
    }

    pub fn record_received(&self, subscription: &str) {
        self.messages_received.with_label_values(&[subscription]).inc();
    }

    pub fn record_acked(&self, subscription: &str, event_type: &str) {
        self.messages_acked.with_label_values(&[subscription, event_type]).inc();
    }

    pub fn record_nacked(&self, subscription: &str, reason: &str) {
        self.messages_nacked.with_label_values(&[subscription, reason]).inc();
    }

    pub fn record_handler_duration(&self, event_type: &str, duration_secs: f64) {
        self.handler_duration.with_label_values(&[event_type]).observe(duration_secs);
    }

    pub fn record_bootstrap(&self, resource: &str, outcome: &str) {
        self.topology_bootstrap.with_label_values(&[resource, outcome]).inc();
    }

    pub fn update_circuit_state(&self, value: i64) {
        self.publisher_circuit_state.set(value);
    }
}
