// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// - Health monitoring: aggregates publisher and subscriber runtime health
//
// ============================================================================

mod health_monitor;

pub use health_monitor::{GetSystemHealth, HealthMonitorActor, UpdateHealth};
