//! Autoscaling: telemetry sampling, overload aggregation, worker pool
//!
//! The `Snapshotter` collects per-resource readings, `SystemStatus`
//! reduces them to overload verdicts, and `AutoscaledPool` sizes its
//! worker count from those verdicts while gating task starts through an
//! optional per-minute rate limiter.

pub mod pool;
pub mod rate_limiter;
pub mod snapshotter;
pub mod system_status;

pub use pool::{AutoscaledPool, AutoscaledPoolOptions, PoolPredicateFn, PoolTaskFn};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use snapshotter::{
    ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, Snapshotter,
    SnapshotterOptions,
};
pub use system_status::{LoadVerdict, StatusReport, SystemStatus, SystemStatusOptions};
