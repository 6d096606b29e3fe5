//! Aggregated overload verdicts over snapshot history
//!
//! Reduces the snapshotter's per-resource histories into boolean
//! overload verdicts for a "current" (short) and "historical" (full
//! retention) window. A resource counts as overloaded when the ratio of
//! overloaded samples in the window exceeds `max_overloaded_ratio`.

use std::sync::Arc;
use std::time::Duration;

use super::snapshotter::Snapshotter;

/// Windows and thresholds for status aggregation.
#[derive(Debug, Clone)]
pub struct SystemStatusOptions {
    /// Window for `current_status`
    pub current_history_secs: u64,
    /// Fraction of overloaded samples at which a resource is reported
    /// overloaded
    pub max_overloaded_ratio: f64,
}

impl Default for SystemStatusOptions {
    fn default() -> Self {
        Self {
            current_history_secs: 5,
            max_overloaded_ratio: 0.4,
        }
    }
}

/// Verdict for one resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadVerdict {
    pub is_overloaded: bool,
    /// Overloaded sample count over total sample count
    pub overloaded_ratio: f64,
    pub sample_count: usize,
}

impl LoadVerdict {
    fn from_flags(flags: impl Iterator<Item = bool>, max_ratio: f64) -> Self {
        let mut overloaded = 0usize;
        let mut total = 0usize;
        for flag in flags {
            total += 1;
            if flag {
                overloaded += 1;
            }
        }
        let ratio = if total == 0 {
            0.0
        } else {
            overloaded as f64 / total as f64
        };
        Self {
            is_overloaded: ratio > max_ratio,
            overloaded_ratio: ratio,
            sample_count: total,
        }
    }
}

/// Combined verdict across all resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub is_system_idle: bool,
    pub memory: LoadVerdict,
    pub cpu: LoadVerdict,
    pub event_loop: LoadVerdict,
    pub client: LoadVerdict,
}

/// Read-side companion to the `Snapshotter`.
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    options: SystemStatusOptions,
}

impl SystemStatus {
    #[must_use]
    pub fn new(snapshotter: Arc<Snapshotter>, options: SystemStatusOptions) -> Self {
        Self { snapshotter, options }
    }

    fn report(&self, window: Option<Duration>) -> StatusReport {
        let max_ratio = self.options.max_overloaded_ratio;
        let memory = LoadVerdict::from_flags(
            self.snapshotter
                .memory_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            max_ratio,
        );
        let cpu = LoadVerdict::from_flags(
            self.snapshotter
                .cpu_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            max_ratio,
        );
        let event_loop = LoadVerdict::from_flags(
            self.snapshotter
                .event_loop_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            max_ratio,
        );
        let client = LoadVerdict::from_flags(
            self.snapshotter
                .client_sample(window)
                .iter()
                .map(|s| s.is_overloaded),
            max_ratio,
        );

        StatusReport {
            is_system_idle: !(memory.is_overloaded
                || cpu.is_overloaded
                || event_loop.is_overloaded
                || client.is_overloaded),
            memory,
            cpu,
            event_loop,
            client,
        }
    }

    /// Verdict over the short "current" window
    #[must_use]
    pub fn current_status(&self) -> StatusReport {
        self.report(Some(Duration::from_secs(self.options.current_history_secs)))
    }

    /// Verdict over the full retained history
    #[must_use]
    pub fn historical_status(&self) -> StatusReport {
        self.report(None)
    }

    /// True when any resource was overloaded over the retained history;
    /// drives the autoscaler's scale-down decision
    #[must_use]
    pub fn has_been_overloaded_recently(&self) -> bool {
        !self.historical_status().is_system_idle
    }
}
