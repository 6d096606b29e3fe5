//! Resource snapshotting
//!
//! Samples memory, CPU, event-loop lag and storage-client rate limiting
//! at fixed cadences, keeping a bounded history per resource. CPU and
//! memory readings arrive via `SystemInfo` events; event-loop and client
//! samplers run on their own tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::events::{Event, EventBus, EventKind, ListenerId};
use crate::storage::StorageClient;

/// One memory reading.
#[derive(Debug, Clone, Copy)]
pub struct MemorySnapshot {
    pub created_at: DateTime<Utc>,
    pub used_bytes: u64,
    pub is_overloaded: bool,
}

/// One CPU reading.
#[derive(Debug, Clone, Copy)]
pub struct CpuSnapshot {
    pub created_at: DateTime<Utc>,
    pub used_ratio: f64,
    pub is_overloaded: bool,
}

/// One event-loop lag reading.
#[derive(Debug, Clone, Copy)]
pub struct EventLoopSnapshot {
    pub created_at: DateTime<Utc>,
    /// How far past the intended interval the timer fired
    pub exceeded_millis: u64,
    pub is_overloaded: bool,
}

/// One storage-client reading.
#[derive(Debug, Clone, Copy)]
pub struct ClientSnapshot {
    pub created_at: DateTime<Utc>,
    pub rate_limit_error_count: u64,
    pub is_overloaded: bool,
}

/// Snapshotter cadences and thresholds.
#[derive(Debug, Clone)]
pub struct SnapshotterOptions {
    pub event_loop_snapshot_interval_millis: u64,
    pub client_snapshot_interval_millis: u64,
    /// Timer drift above this many milliseconds marks the event loop
    /// overloaded
    pub max_blocked_millis: u64,
    /// New client rate-limit errors per interval above this mark the
    /// client overloaded
    pub max_client_errors: u64,
    /// History retention per resource
    pub snapshot_history_secs: u64,
}

impl Default for SnapshotterOptions {
    fn default() -> Self {
        Self {
            event_loop_snapshot_interval_millis: 500,
            client_snapshot_interval_millis: 1000,
            max_blocked_millis: 50,
            max_client_errors: 3,
            snapshot_history_secs: 30,
        }
    }
}

/// Collects bounded per-resource sample histories.
pub struct Snapshotter {
    options: SnapshotterOptions,
    config: Arc<Configuration>,
    storage: Option<Arc<dyn StorageClient>>,
    bus: Arc<EventBus>,
    memory: Arc<RwLock<Vec<MemorySnapshot>>>,
    cpu: Arc<RwLock<Vec<CpuSnapshot>>>,
    event_loop: Arc<RwLock<Vec<EventLoopSnapshot>>>,
    client: Arc<RwLock<Vec<ClientSnapshot>>>,
    /// Memory ceiling in bytes, fixed at construction
    max_memory_bytes: u64,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    listener: parking_lot::Mutex<Option<ListenerId>>,
}

fn prune<T>(history: &mut Vec<T>, created_at: impl Fn(&T) -> DateTime<Utc>, max_age: Duration) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(30));
    history.retain(|snapshot| created_at(snapshot) >= cutoff);
}

impl Snapshotter {
    #[must_use]
    pub fn new(
        options: SnapshotterOptions,
        config: Arc<Configuration>,
        bus: Arc<EventBus>,
        storage: Option<Arc<dyn StorageClient>>,
    ) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let max_memory_bytes = config.max_memory_bytes(sys.total_memory());

        Self {
            options,
            config,
            storage,
            bus,
            memory: Arc::new(RwLock::new(Vec::new())),
            cpu: Arc::new(RwLock::new(Vec::new())),
            event_loop: Arc::new(RwLock::new(Vec::new())),
            client: Arc::new(RwLock::new(Vec::new())),
            max_memory_bytes,
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            listener: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribe to `SystemInfo` and start the sampler tasks.
    pub fn start(&self) {
        let history_age = Duration::from_secs(self.options.snapshot_history_secs);

        // CPU and memory arrive through SystemInfo events
        let memory = Arc::clone(&self.memory);
        let cpu = Arc::clone(&self.cpu);
        let max_memory_bytes = self.max_memory_bytes;
        let max_used_memory_ratio = self.config.max_used_memory_ratio();
        let listener_id = self.bus.on(
            EventKind::SystemInfo,
            Arc::new(move |event| {
                let memory = Arc::clone(&memory);
                let cpu = Arc::clone(&cpu);
                Box::pin(async move {
                    let Event::SystemInfo(info) = event else {
                        return;
                    };
                    {
                        let mut history = memory.write();
                        let used_ratio = info.mem_current_bytes as f64 / max_memory_bytes as f64;
                        history.push(MemorySnapshot {
                            created_at: info.created_at,
                            used_bytes: info.mem_current_bytes,
                            is_overloaded: used_ratio > max_used_memory_ratio,
                        });
                        prune(&mut history, |s| s.created_at, history_age);
                    }
                    {
                        let mut history = cpu.write();
                        history.push(CpuSnapshot {
                            created_at: info.created_at,
                            used_ratio: info.cpu_current_usage,
                            is_overloaded: info.is_cpu_overloaded,
                        });
                        prune(&mut history, |s| s.created_at, history_age);
                    }
                })
            }),
        );
        *self.listener.lock() = Some(listener_id);

        // event-loop lag sampler
        let event_loop = Arc::clone(&self.event_loop);
        let interval = Duration::from_millis(self.options.event_loop_snapshot_interval_millis);
        let max_blocked_millis = self.options.max_blocked_millis;
        let cancel = self.cancel.child_token();
        let lag_task = tokio::spawn(async move {
            loop {
                let before = Instant::now();
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
                let exceeded = before.elapsed().saturating_sub(interval);
                let exceeded_millis = exceeded.as_millis() as u64;
                let mut history = event_loop.write();
                history.push(EventLoopSnapshot {
                    created_at: Utc::now(),
                    exceeded_millis,
                    is_overloaded: exceeded_millis > max_blocked_millis,
                });
                prune(&mut history, |s| s.created_at, history_age);
            }
        });

        let mut tasks = vec![lag_task];

        // storage-client rate-limit sampler
        if let Some(storage) = self.storage.clone() {
            let client = Arc::clone(&self.client);
            let interval = Duration::from_millis(self.options.client_snapshot_interval_millis);
            let max_client_errors = self.options.max_client_errors;
            let cancel = self.cancel.child_token();
            let client_task = tokio::spawn(async move {
                let mut previous = storage.rate_limit_error_count();
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        () = cancel.cancelled() => break,
                    }
                    let current = storage.rate_limit_error_count();
                    let delta = current.saturating_sub(previous);
                    previous = current;
                    let mut history = client.write();
                    history.push(ClientSnapshot {
                        created_at: Utc::now(),
                        rate_limit_error_count: current,
                        is_overloaded: delta > max_client_errors,
                    });
                    prune(&mut history, |s| s.created_at, history_age);
                }
            });
            tasks.push(client_task);
        }

        self.tasks.lock().extend(tasks);
        log::debug!("Snapshotter started (memory ceiling {} MB)", self.max_memory_bytes / (1024 * 1024));
    }

    /// Stop samplers and detach from the bus.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(id) = self.listener.lock().take() {
            self.bus.off(id);
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    /// Histories are pruned on write, so a reader could otherwise see
    /// stale entries when sampling stops; the retention cutoff is
    /// therefore applied on read as well.
    fn sample<T: Copy>(
        history: &RwLock<Vec<T>>,
        created_at: impl Fn(&T) -> DateTime<Utc>,
        window: Duration,
    ) -> Vec<T> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(30));
        history
            .read()
            .iter()
            .filter(|snapshot| created_at(snapshot) >= cutoff)
            .copied()
            .collect()
    }

    fn effective_window(&self, window: Option<Duration>) -> Duration {
        window
            .unwrap_or_else(|| Duration::from_secs(self.options.snapshot_history_secs))
            .min(Duration::from_secs(self.options.snapshot_history_secs))
    }

    /// Memory snapshots within `window` (full retention when `None`)
    #[must_use]
    pub fn memory_sample(&self, window: Option<Duration>) -> Vec<MemorySnapshot> {
        Self::sample(&self.memory, |s| s.created_at, self.effective_window(window))
    }

    #[must_use]
    pub fn cpu_sample(&self, window: Option<Duration>) -> Vec<CpuSnapshot> {
        Self::sample(&self.cpu, |s| s.created_at, self.effective_window(window))
    }

    #[must_use]
    pub fn event_loop_sample(&self, window: Option<Duration>) -> Vec<EventLoopSnapshot> {
        Self::sample(&self.event_loop, |s| s.created_at, self.effective_window(window))
    }

    #[must_use]
    pub fn client_sample(&self, window: Option<Duration>) -> Vec<ClientSnapshot> {
        Self::sample(&self.client, |s| s.created_at, self.effective_window(window))
    }
}
