use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::user::UserId;

// ============================================================================
// Task Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Part of the default set created on registration
    pub seeded: bool,
}

impl Task {
    pub fn new(user_id: UserId, title: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            description: None,
            priority,
            status: TaskStatus::Pending,
            seeded: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The starter tasks every newly registered user receives
pub fn default_tasks(user_id: UserId, name: &str) -> Vec<Task> {
    let seeded = |task: Task| Task { seeded: true, ..task };

    vec![
        seeded(
            Task::new(user_id, format!("Welcome, {}!", name), Priority::High)
                .with_description("Take a look around and get familiar with your task list."),
        ),
        seeded(
            Task::new(user_id, "Create your first task", Priority::Medium)
                .with_description("Add something you need to get done."),
        ),
        seeded(
            Task::new(user_id, "Explore task priorities", Priority::Low)
                .with_description("Use LOW, MEDIUM and HIGH to decide what comes first."),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_is_seeded_and_pending() {
        let tasks = default_tasks(UserId(5), "Dana");

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].title, "Welcome, Dana!");
        assert!(tasks.iter().all(|t| t.seeded && t.user_id == UserId(5)));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn test_enums_use_upper_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"HIGH\"");
        assert_eq!(serde_json::to_string(&TaskStatus::InProgress).unwrap(), "\"IN_PROGRESS\"");
    }
}
