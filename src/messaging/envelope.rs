use std::collections::HashMap;

use crate::domain::user::{DomainEvent, EventKind, UserDeleted, UserRegistered};

// ============================================================================
// Envelope Codec
// ============================================================================
//
// Wire format shared by every producer and consumer of user events:
// - payload    UTF-8 JSON of the event body (camelCase fields)
// - eventType  required attribute, selects the decoder
// - eventVersion optional attribute, absent means version 1
//
// ============================================================================

pub const EVENT_TYPE_ATTRIBUTE: &str = "eventType";
pub const EVENT_VERSION_ATTRIBUTE: &str = "eventVersion";
pub const CURRENT_EVENT_VERSION: &str = "1";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Kafka record key; the in-memory broker ignores it
    pub ordering_key: Option<String>,
}

impl Envelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn event_type(&self) -> Option<&str> {
        self.attributes.get(EVENT_TYPE_ATTRIBUTE).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope has no eventType attribute")]
    MissingEventType,

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unsupported version {version} for {kind}")]
    UnsupportedVersion { kind: EventKind, version: String },

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {kind}: {source}")]
    Serialize {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode(event: &DomainEvent) -> Result<Envelope, CodecError> {
    let kind = event.kind();
    let payload = match event {
        DomainEvent::UserRegistered(e) => serde_json::to_vec(e),
        DomainEvent::UserDeleted(e) => serde_json::to_vec(e),
    }
    .map_err(|source| CodecError::Serialize { kind, source })?;

    Ok(Envelope::new(payload)
        .with_attribute(EVENT_TYPE_ATTRIBUTE, kind.tag())
        .with_attribute(EVENT_VERSION_ATTRIBUTE, CURRENT_EVENT_VERSION)
        .with_ordering_key(event.user_id().to_string()))
}

pub fn decode(envelope: &Envelope) -> Result<DomainEvent, CodecError> {
    let tag = envelope.event_type().ok_or(CodecError::MissingEventType)?;
    let kind = EventKind::from_tag(tag)
        .ok_or_else(|| CodecError::UnknownEventType(tag.to_string()))?;

    if EventKind::is_legacy_tag(tag) {
        tracing::debug!(event_type = %tag, canonical = %kind.tag(), "Accepted legacy event tag");
    }

    if let Some(version) = envelope.attributes.get(EVENT_VERSION_ATTRIBUTE) {
        if version != CURRENT_EVENT_VERSION {
            return Err(CodecError::UnsupportedVersion {
                kind,
                version: version.clone(),
            });
        }
    }

    let malformed = |source: serde_json::Error| CodecError::MalformedPayload { kind, source };

    let event = match kind {
        EventKind::UserRegistered => DomainEvent::UserRegistered(
            serde_json::from_slice::<UserRegistered>(&envelope.payload).map_err(malformed)?,
        ),
        EventKind::UserDeleted => DomainEvent::UserDeleted(
            serde_json::from_slice::<UserDeleted>(&envelope.payload).map_err(malformed)?,
        ),
    };

    Ok(event)
}
