use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::errors::DirectoryError;
use super::value_objects::{NewUser, User, UserId};

// ============================================================================
// User Directory - identity service persistence seam
// ============================================================================
//
// The real directory (password hashing, ORM persistence) lives outside this
// crate. Every call here returns only after the change is durable.
//
// ============================================================================

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn create_user(&self, new_user: NewUser) -> Result<User, DirectoryError>;

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, DirectoryError>;

    /// Returns `false` when there was nothing to delete
    async fn delete_user(&self, user_id: UserId) -> Result<bool, DirectoryError>;
}

/// Directory used by the demo binary and tests
pub struct InMemoryUserDirectory {
    state: Mutex<DirectoryState>,
}

struct DirectoryState {
    next_id: i64,
    users: HashMap<UserId, User>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                next_id: 1,
                users: HashMap::new(),
            }),
        }
    }
}

impl Default for InMemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn create_user(&self, new_user: NewUser) -> Result<User, DirectoryError> {
        let mut state = self.state.lock().await;

        if state.users.values().any(|u| u.email == new_user.email) {
            return Err(DirectoryError::EmailTaken(new_user.email));
        }

        let id = UserId(state.next_id);
        state.next_id += 1;

        let user = User {
            id,
            name: new_user.name,
            email: new_user.email,
        };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, DirectoryError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn delete_user(&self, user_id: UserId) -> Result<bool, DirectoryError> {
        Ok(self.state.lock().await.users.remove(&user_id).is_some())
    }
}
