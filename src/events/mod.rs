//! Process-wide event system
//!
//! Typed events (`PersistState`, `SystemInfo`, `Migrating`, `Aborting`,
//! `Exit`, `SessionRetired`) with per-kind listener registration, an
//! emission-tracking bus, and an `EventManager` that owns the periodic
//! tickers and shutdown draining.

pub mod bus;
pub mod errors;
pub mod manager;
pub mod metrics;
pub mod types;

pub use bus::{EventBus, Listener, ListenerId};
pub use errors::EventBusError;
pub use manager::EventManager;
pub use metrics::{EventBusMetrics, MetricsSnapshot};
pub use types::{Event, EventKind, SystemInfoData};
