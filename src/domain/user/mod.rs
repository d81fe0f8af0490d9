// ============================================================================
// User Domain - identity side of the event flow
// ============================================================================
//
// - Value objects (UserId, User, NewUser)
// - Events (UserRegistered, UserDeleted, EventKind)
// - Directory (persistence collaborator)
// - Service (commit, then publish)
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod errors;
pub mod directory;
pub mod service;

pub use value_objects::*;
pub use events::*;
pub use errors::*;
pub use directory::*;
pub use service::*;
