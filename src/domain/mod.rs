// ============================================================================
// Domain Layer
// ============================================================================
//
// - user: identity-owned users and the lifecycle events they produce
// - task: the task service's store that user events are projected onto
//
// ============================================================================

pub mod user;
pub mod task;
