use std::sync::Arc;

use super::directory::UserDirectory;
use super::errors::IdentityError;
use super::value_objects::{NewUser, User, UserId};
use crate::messaging::EventPublisher;

// ============================================================================
// Identity Service - user lifecycle operations
// ============================================================================
//
// Every operation commits to the directory first and publishes second. The
// publish is awaited, so the caller learns whether the other services will
// hear about the change. A failed publish never rolls the commit back.
//
// ============================================================================

pub struct IdentityService {
    directory: Arc<dyn UserDirectory>,
    publisher: Arc<EventPublisher>,
}

impl IdentityService {
    pub fn new(directory: Arc<dyn UserDirectory>, publisher: Arc<EventPublisher>) -> Self {
        Self { directory, publisher }
    }

    pub async fn register_user(&self, new_user: NewUser) -> Result<User, IdentityError> {
        let user = self.directory.create_user(new_user).await?;
        tracing::info!(user_id = %user.id, "User registered");

        match self.publisher.publish_user_registered(user.id, user.name.clone()).await {
            Ok(_) => Ok(user),
            Err(source) => Err(IdentityError::EventNotPublished { user, source }),
        }
    }

    /// Returns `Ok(false)` when the user does not exist; nothing is published then.
    pub async fn delete_user(&self, user_id: UserId) -> Result<bool, IdentityError> {
        let Some(user) = self.directory.find_user(user_id).await? else {
            tracing::debug!(user_id = %user_id, "Delete requested for unknown user");
            return Ok(false);
        };

        if !self.directory.delete_user(user_id).await? {
            return Ok(false);
        }
        tracing::info!(user_id = %user_id, "User deleted");

        match self.publisher.publish_user_deleted(user_id, Some(user.email.clone())).await {
            Ok(_) => Ok(true),
            Err(source) => Err(IdentityError::EventNotPublished { user, source }),
        }
    }
}
