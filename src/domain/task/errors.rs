// ============================================================================
// Task Store Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Task store unavailable: {0}")]
    Unavailable(String),
}
