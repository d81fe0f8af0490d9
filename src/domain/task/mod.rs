// ============================================================================
// Task Domain - the task service's local projection of users
// ============================================================================

pub mod model;
pub mod errors;
pub mod store;

pub use model::*;
pub use errors::*;
pub use store::*;
