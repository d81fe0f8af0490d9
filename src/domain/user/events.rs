use serde::{Deserialize, Serialize};
use std::fmt;
use super::value_objects::UserId;

// ============================================================================
// User Lifecycle Events
// ============================================================================
//
// Produced by the identity service after a user change has been committed,
// consumed by every service that projects user state (the task service).
//
// The wire tag of each kind is fixed. Older producers used hyphenated tags;
// those are still accepted on the way in and never emitted.
//
// ============================================================================

/// Union type for all user lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    UserRegistered(UserRegistered),
    UserDeleted(UserDeleted),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    pub user_id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeleted {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::UserRegistered(_) => EventKind::UserRegistered,
            DomainEvent::UserDeleted(_) => EventKind::UserDeleted,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            DomainEvent::UserRegistered(e) => e.user_id,
            DomainEvent::UserDeleted(e) => e.user_id,
        }
    }
}

impl From<UserRegistered> for DomainEvent {
    fn from(event: UserRegistered) -> Self {
        DomainEvent::UserRegistered(event)
    }
}

impl From<UserDeleted> for DomainEvent {
    fn from(event: UserDeleted) -> Self {
        DomainEvent::UserDeleted(event)
    }
}

// ============================================================================
// Event Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserRegistered,
    UserDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::UserRegistered, EventKind::UserDeleted];

    /// Canonical `eventType` attribute value
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::UserRegistered => "user.registered",
            EventKind::UserDeleted => "user.deleted",
        }
    }

    fn legacy_tag(&self) -> &'static str {
        match self {
            EventKind::UserRegistered => "user-registered",
            EventKind::UserDeleted => "user-deleted",
        }
    }

    /// Resolve a wire tag, accepting the legacy hyphenated spelling
    pub fn from_tag(tag: &str) -> Option<EventKind> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag || kind.legacy_tag() == tag)
    }

    pub fn is_legacy_tag(tag: &str) -> bool {
        Self::ALL.iter().any(|kind| kind.legacy_tag() == tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_tags_resolve() {
        assert_eq!(EventKind::from_tag("user.registered"), Some(EventKind::UserRegistered));
        assert_eq!(EventKind::from_tag("user.deleted"), Some(EventKind::UserDeleted));
    }

    #[test]
    fn test_legacy_tags_resolve_to_same_kind() {
        assert_eq!(EventKind::from_tag("user-registered"), Some(EventKind::UserRegistered));
        assert_eq!(EventKind::from_tag("user-deleted"), Some(EventKind::UserDeleted));
        assert!(EventKind::is_legacy_tag("user-deleted"));
        assert!(!EventKind::is_legacy_tag("user.deleted"));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert_eq!(EventKind::from_tag("user.updated"), None);
        assert_eq!(EventKind::from_tag("USER.DELETED"), None);
        assert_eq!(EventKind::from_tag(""), None);
    }

    #[test]
    fn test_user_deleted_without_email_omits_field() {
        let event = UserDeleted { user_id: UserId(42), email: None };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"userId":42}"#);

        let parsed: UserDeleted = serde_json::from_str(r#"{"userId":42}"#).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_user_registered_uses_camel_case() {
        let event = UserRegistered { user_id: UserId(3), name: "alice".to_string() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["userId"], 3);
        assert_eq!(json["name"], "alice");
    }
}
