use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::envelope::{decode, CodecError, Envelope};
use crate::domain::user::{DomainEvent, EventKind};

// ============================================================================
// Event Handlers
// ============================================================================
//
// A handler owns one event kind and reports an outcome instead of an error:
// the subscriber only needs to know whether to ack or nack. Handlers must be
// idempotent; the broker delivers at least once.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum NackReason {
    /// No decoder or no handler for the tag
    Unroutable { event_type: Option<String> },
    /// Tag known, body or version unusable
    Malformed(String),
    HandlerFailed(String),
    /// The handler task died without reporting
    HandlerPanicked,
}

impl NackReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            NackReason::Unroutable { .. } => "unroutable",
            NackReason::Malformed(_) => "malformed",
            NackReason::HandlerFailed(_) => "handler_failed",
            NackReason::HandlerPanicked => "handler_panicked",
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::Unroutable { event_type: Some(tag) } => write!(f, "no handler for event type {}", tag),
            NackReason::Unroutable { event_type: None } => write!(f, "message has no event type"),
            NackReason::Malformed(detail) => write!(f, "malformed message: {}", detail),
            NackReason::HandlerFailed(detail) => write!(f, "handler failed: {}", detail),
            NackReason::HandlerPanicked => write!(f, "handler panicked"),
        }
    }
}

impl From<CodecError> for NackReason {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::MissingEventType => NackReason::Unroutable { event_type: None },
            CodecError::UnknownEventType(tag) => NackReason::Unroutable { event_type: Some(tag) },
            other => NackReason::Malformed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Ack,
    Nack(NackReason),
}

impl HandlerOutcome {
    pub fn failed(detail: impl fmt::Display) -> Self {
        HandlerOutcome::Nack(NackReason::HandlerFailed(detail.to_string()))
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> EventKind;

    /// Must tolerate being called again with the same event
    async fn handle(&self, event: &DomainEvent) -> HandlerOutcome;
}

// ============================================================================
// Registry
// ============================================================================

/// Routes decoded events to the handler registered for their kind
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered for the same kind
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let kind = handler.kind();
        if let Some(previous) = self.handlers.insert(kind, handler) {
            tracing::warn!(event_type = %kind, replaced = previous.name(), "Handler replaced");
        }
        self
    }

    pub fn handler_for(&self, kind: EventKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Decode and pick the handler, or say why the message cannot be handled
    pub fn route(&self, envelope: &Envelope) -> Result<(DomainEvent, Arc<dyn EventHandler>), NackReason> {
        let event = decode(envelope)?;
        let kind = event.kind();
        let handler = self.handler_for(kind).ok_or_else(|| NackReason::Unroutable {
            event_type: Some(kind.tag().to_string()),
        })?;
        Ok((event, handler))
    }

    /// Route and run the handler inline
    pub async fn dispatch(&self, envelope: &Envelope) -> HandlerOutcome {
        match self.route(envelope) {
            Ok((event, handler)) => handler.handle(&event).await,
            Err(reason) => HandlerOutcome::Nack(reason),
        }
    }
}
