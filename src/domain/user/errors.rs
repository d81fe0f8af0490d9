use super::value_objects::User;
use crate::messaging::PublishFailure;

// ============================================================================
// Identity Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Email already registered: {0}")]
    EmailTaken(String),

    #[error("User directory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The local change is committed; only the notification is missing.
    #[error("User {} changed but event was not published: {source}", .user.id)]
    EventNotPublished {
        user: User,
        #[source]
        source: PublishFailure,
    },
}
