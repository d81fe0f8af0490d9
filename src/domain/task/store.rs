use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::errors::StoreError;
use super::model::{default_tasks, Task};
use crate::domain::user::UserId;

// ============================================================================
// Task Store - task service persistence seam
// ============================================================================
//
// Both projection operations are idempotent at this seam:
// - deleting a user's tasks twice deletes nothing the second time
// - seeding the default set twice seeds nothing the second time
//
// Writes for one user are serialised; writes for different users never
// contend.
//
// ============================================================================

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Returns how many tasks were removed (0 is not an error)
    async fn delete_all_tasks_for_user(&self, user_id: UserId) -> Result<u64, StoreError>;

    /// Returns how many tasks were created; 0 when the default set already
    /// exists or the user has been deleted
    async fn create_default_tasks(&self, user_id: UserId, name: &str) -> Result<usize, StoreError>;

    async fn tasks_for_user(&self, user_id: UserId) -> Result<Vec<Task>, StoreError>;
}

#[derive(Default)]
struct UserTasks {
    tasks: Vec<Task>,
    /// Tombstone: a UserDeleted was applied for this user
    deleted: bool,
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    users: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<UserTasks>>>>,
    write_fault: Mutex<Option<StoreError>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task directly, as the CRUD side of the task service would
    pub async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let slot = self.slot(task.user_id)?;
        slot.lock().await.tasks.push(task);
        Ok(())
    }

    /// Every following write fails with `error`
    pub fn fail_writes(&self, error: StoreError) {
        if let Ok(mut fault) = self.write_fault.lock() {
            *fault = Some(error);
        }
    }

    pub fn clear_fault(&self) {
        if let Ok(mut fault) = self.write_fault.lock() {
            *fault = None;
        }
    }

    pub async fn total_tasks(&self) -> usize {
        let slots: Vec<_> = match self.users.lock() {
            Ok(users) => users.values().cloned().collect(),
            Err(_) => return 0,
        };

        let mut total = 0;
        for slot in slots {
            total += slot.lock().await.tasks.len();
        }
        total
    }

    fn slot(&self, user_id: UserId) -> Result<Arc<tokio::sync::Mutex<UserTasks>>, StoreError> {
        let mut users = self
            .users
            .lock()
            .map_err(|_| StoreError::Unavailable("user slot map poisoned".into()))?;
        Ok(users.entry(user_id).or_default().clone())
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let fault = self
            .write_fault
            .lock()
            .map_err(|_| StoreError::Unavailable("fault flag poisoned".into()))?;
        match fault.as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn delete_all_tasks_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        self.check_fault()?;

        let slot = self.slot(user_id)?;
        let mut user_tasks = slot.lock().await;

        let removed = user_tasks.tasks.len() as u64;
        user_tasks.tasks.clear();
        user_tasks.deleted = true;

        tracing::debug!(user_id = %user_id, removed, "Deleted tasks for user");
        Ok(removed)
    }

    async fn create_default_tasks(&self, user_id: UserId, name: &str) -> Result<usize, StoreError> {
        self.check_fault()?;

        let slot = self.slot(user_id)?;
        let mut user_tasks = slot.lock().await;

        if user_tasks.deleted {
            tracing::debug!(user_id = %user_id, "User already deleted, not seeding default tasks");
            return Ok(0);
        }
        if user_tasks.tasks.iter().any(|t| t.seeded) {
            tracing::debug!(user_id = %user_id, "Default tasks already present");
            return Ok(0);
        }

        let defaults = default_tasks(user_id, name);
        let created = defaults.len();
        user_tasks.tasks.extend(defaults);
        Ok(created)
    }

    async fn tasks_for_user(&self, user_id: UserId) -> Result<Vec<Task>, StoreError> {
        let slot = self.slot(user_id)?;
        let tasks = slot.lock().await.tasks.clone();
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::Priority;

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryTaskStore::new();
        for i in 0..3 {
            store.insert(Task::new(UserId(1), format!("t{}", i), Priority::Low)).await.unwrap();
        }

        assert_eq!(store.delete_all_tasks_for_user(UserId(1)).await.unwrap(), 3);
        assert_eq!(store.delete_all_tasks_for_user(UserId(1)).await.unwrap(), 0);
        assert!(store.tasks_for_user(UserId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seeding_twice_keeps_one_set() {
        let store = InMemoryTaskStore::new();

        assert_eq!(store.create_default_tasks(UserId(2), "Eve").await.unwrap(), 3);
        assert_eq!(store.create_default_tasks(UserId(2), "Eve").await.unwrap(), 0);
        assert_eq!(store.tasks_for_user(UserId(2)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_seeding_for_one_user() {
        let store = Arc::new(InMemoryTaskStore::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create_default_tasks(UserId(3), "Finn").await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            created += handle.await.unwrap().unwrap();
        }

        assert_eq!(created, 3);
        assert_eq!(store.tasks_for_user(UserId(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_late_registration_does_not_resurrect() {
        let store = InMemoryTaskStore::new();

        store.delete_all_tasks_for_user(UserId(4)).await.unwrap();
        assert_eq!(store.create_default_tasks(UserId(4), "Gus").await.unwrap(), 0);
        assert!(store.tasks_for_user(UserId(4)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryTaskStore::new();
        store.fail_writes(StoreError::Unavailable("db down".into()));

        assert!(store.delete_all_tasks_for_user(UserId(5)).await.is_err());
        assert!(store.create_default_tasks(UserId(5), "Hal").await.is_err());

        store.clear_fault();
        assert_eq!(store.create_default_tasks(UserId(5), "Hal").await.unwrap(), 3);
    }
}
