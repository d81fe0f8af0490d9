// ============================================================================
// Messaging - user event propagation between services
// ============================================================================
//
// - broker/     - broker capabilities and adapters (in-memory, Kafka)
// - envelope    - DomainEvent <-> wire envelope
// - topology    - idempotent topic/subscription bootstrap
// - publisher   - identity side: publish and wait for the broker ack
// - handler     - per-kind handlers and routing
// - subscriber  - task side: pull loop, dispatch, ack/nack
//
// ============================================================================

pub mod broker;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod publisher;
pub mod subscriber;
pub mod topology;

pub use envelope::{decode, encode};
pub use errors::{MessagingError, PublishFailure, PublishFailureReason};
pub use handler::{EventHandler, HandlerOutcome, HandlerRegistry, NackReason};
pub use publisher::{EventPublisher, PublisherSettings};
pub use subscriber::{RuntimeSettings, RuntimeState, SubscriberRuntime};
pub use topology::{ensure_topology, BootstrapPolicy, TopologySpec};
