// # Worker Lifecycle
//
// Per-worker supervision: pool initialization, heartbeat/auto-scale/GC
// tickers on a monotonic clock, the health table, and the readiness gate.

pub mod health;
pub mod supervisor;

pub use health::{HealthTable, WorkerHealthRow};
pub use supervisor::WorkerSupervisor;

use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(5);
pub const GC_INTERVAL: Duration = Duration::from_secs(30);
