use std::time::Duration;

use super::broker::{BrokerError, TopicName};
use super::envelope::CodecError;
use super::subscriber::RuntimeState;
use crate::domain::user::EventKind;

// ============================================================================
// Messaging Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PublishFailureReason {
    #[error("no broker acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("broker error: {0}")]
    Broker(BrokerError),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("encoding failed: {0}")]
    Encode(CodecError),

    #[error("publisher closed")]
    Closed,
}

impl PublishFailureReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            PublishFailureReason::Timeout(_) => "timeout",
            PublishFailureReason::Broker(_) => "broker",
            PublishFailureReason::CircuitOpen => "circuit_open",
            PublishFailureReason::Encode(_) => "encode",
            PublishFailureReason::Closed => "closed",
        }
    }
}

/// The broker did not confirm the event; no message id exists for it
#[derive(Debug, thiserror::Error)]
#[error("failed to publish {kind} to {topic}: {reason}")]
pub struct PublishFailure {
    pub kind: EventKind,
    pub topic: TopicName,
    pub reason: PublishFailureReason,
}

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to ensure {resource}: {source}")]
    Topology {
        resource: String,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Publish(#[from] PublishFailure),

    #[error("Cannot {action} runtime {name} while {state}")]
    InvalidState {
        name: String,
        action: &'static str,
        state: RuntimeState,
    },

    #[error("Runtime {name} failed to start: {reason}")]
    Startup { name: String, reason: String },
}
