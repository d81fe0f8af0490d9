// ============================================================================
// Actors Module
// ============================================================================
//
// Actor-based infrastructure for cross-cutting concerns.
//
// Structure:
// - core/           - Health vocabulary (HealthStatus, ComponentHealth, HealthCheckable)
// - infrastructure/ - Concrete infrastructure actors (HealthMonitorActor)
//
// Note: The event flow itself (publisher, subscriber runtimes, handlers) runs
//       on plain tokio tasks. Actors are reserved for infrastructure concerns.
//
// ============================================================================

mod core;
mod infrastructure;

pub use self::core::{ComponentHealth, HealthCheckable, HealthStatus};
pub use infrastructure::{GetSystemHealth, HealthMonitorActor, UpdateHealth};
