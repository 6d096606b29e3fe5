//! Event type definitions for the crawler event system

use serde::{Deserialize, Serialize};

/// Discriminant used for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Periodic tick asking stateful components to persist themselves
    PersistState,
    /// Periodic CPU/memory reading
    SystemInfo,
    /// The process is being migrated elsewhere; drain gracefully
    Migrating,
    /// The crawl is being aborted; drain gracefully
    Aborting,
    /// Final event before the event manager closes
    Exit,
    /// A session was retired by the session pool
    SessionRetired,
}

/// Events emitted on the process-wide bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Emitted every `persist_state_interval_millis`, and immediately when
    /// `Migrating` or `Aborting` fire
    PersistState { is_migrating: bool },
    /// Emitted every `system_info_interval_millis` with fresh readings
    SystemInfo(SystemInfoData),
    Migrating,
    Aborting,
    Exit,
    SessionRetired { session_id: String },
}

impl Event {
    /// The registration discriminant for this event
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PersistState { .. } => EventKind::PersistState,
            Self::SystemInfo(_) => EventKind::SystemInfo,
            Self::Migrating => EventKind::Migrating,
            Self::Aborting => EventKind::Aborting,
            Self::Exit => EventKind::Exit,
            Self::SessionRetired { .. } => EventKind::SessionRetired,
        }
    }
}

/// One CPU/memory reading, produced by the event manager's sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfoData {
    /// Current CPU usage as a 0.0–1.0 ratio
    pub cpu_current_usage: f64,
    /// Whether CPU usage exceeds the configured `max_used_cpu_ratio`
    pub is_cpu_overloaded: bool,
    /// Bytes of memory currently used by this process
    pub mem_current_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
