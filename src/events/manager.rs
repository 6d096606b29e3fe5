//! Event manager: interval emission and graceful shutdown
//!
//! Owns the periodic tickers that drive `PersistState` and `SystemInfo`
//! emissions, and the shutdown sequence that drains listeners before the
//! process exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;

use super::bus::EventBus;
use super::types::{Event, SystemInfoData};

/// Drives periodic event emission and owns the bus lifecycle.
pub struct EventManager {
    bus: Arc<EventBus>,
    config: Arc<Configuration>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl EventManager {
    #[must_use]
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
            config,
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Start the `PersistState` and `SystemInfo` tickers. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let persist_interval = Duration::from_millis(self.config.persist_state_interval_millis());
        let bus = Arc::clone(&self.bus);
        let cancel = self.cancel.child_token();
        let persist_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(persist_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if bus.emit(Event::PersistState { is_migrating: false }).is_err() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });

        let info_interval = Duration::from_millis(self.config.system_info_interval_millis());
        let max_cpu_ratio = self.config.max_used_cpu_ratio();
        let bus = Arc::clone(&self.bus);
        let cancel = self.cancel.child_token();
        let info_task = tokio::spawn(async move {
            let mut sys = System::new();
            let pid = sysinfo::get_current_pid().ok();
            let mut ticker = tokio::time::interval(info_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let data = sample_system(&mut sys, pid, max_cpu_ratio);
                        if bus.emit(Event::SystemInfo(data)).is_err() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });

        self.tasks.lock().extend([persist_task, info_task]);
        log::debug!(
            "Event manager started (persist every {persist_interval:?}, system info every {info_interval:?})"
        );
    }

    /// Emit `Migrating` plus an immediate migration-flavored `PersistState`
    pub fn emit_migrating(&self) {
        let _ = self.bus.emit(Event::Migrating);
        let _ = self.bus.emit(Event::PersistState { is_migrating: true });
    }

    /// Emit `Aborting` plus an immediate `PersistState`
    pub fn emit_aborting(&self) {
        let _ = self.bus.emit(Event::Aborting);
        let _ = self.bus.emit(Event::PersistState { is_migrating: false });
    }

    /// Stop the tickers, emit `Exit`, and drain all listener tasks.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                log::warn!("Event manager ticker failed during shutdown: {e}");
            }
        }

        let _ = self.bus.emit(Event::Exit);
        if let Err(e) = self
            .bus
            .wait_for_all_listeners_with_timeout(Duration::from_secs(10))
            .await
        {
            log::warn!("Event listener drain incomplete at shutdown: {e}");
        }
        self.bus.shutdown();
        log::debug!("Event manager closed");
    }
}

/// Take one CPU/memory reading.
///
/// CPU usage comes from the global counters; memory is the resident size
/// of this process, falling back to system-wide used memory when the
/// process entry is unavailable.
fn sample_system(sys: &mut System, pid: Option<sysinfo::Pid>, max_cpu_ratio: f64) -> SystemInfoData {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_ratio = f64::from(sys.global_cpu_usage()) / 100.0;
    let mem_current_bytes = match pid {
        Some(pid) => {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid)
                .map_or_else(|| sys.used_memory(), sysinfo::Process::memory)
        }
        None => sys.used_memory(),
    };

    SystemInfoData {
        cpu_current_usage: cpu_ratio,
        is_cpu_overloaded: cpu_ratio > max_cpu_ratio,
        mem_current_bytes,
        created_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventKind;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_persist_state_ticks() {
        let config = Arc::new(
            Configuration::default()
                .with_persist_state_interval_millis(20)
                .with_system_info_interval_millis(60_000),
        );
        let manager = EventManager::new(config);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            manager.bus().on(
                EventKind::PersistState,
                Arc::new(move |_| {
                    let counter = Arc::clone(&counter);
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            );
        }

        manager.start();
        tokio::time::sleep(Duration::from_millis(90)).await;
        manager.close().await;

        assert!(
            counter.load(Ordering::SeqCst) >= 2,
            "expected at least two persist ticks"
        );
    }

    #[tokio::test]
    async fn test_migrating_triggers_immediate_persist() {
        let config = Arc::new(Configuration::default());
        let manager = EventManager::new(config);
        let migrating_persists = Arc::new(AtomicUsize::new(0));
        {
            let migrating_persists = Arc::clone(&migrating_persists);
            manager.bus().on(
                EventKind::PersistState,
                Arc::new(move |event| {
                    let migrating_persists = Arc::clone(&migrating_persists);
                    Box::pin(async move {
                        if matches!(event, Event::PersistState { is_migrating: true }) {
                            migrating_persists.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                }),
            );
        }

        manager.emit_migrating();
        manager.bus().wait_for_all_listeners().await;
        assert_eq!(migrating_persists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_emits_exit_and_is_terminal() {
        let config = Arc::new(Configuration::default());
        let manager = EventManager::new(config);
        let saw_exit = Arc::new(AtomicBool::new(false));
        {
            let saw_exit = Arc::clone(&saw_exit);
            manager.bus().on(
                EventKind::Exit,
                Arc::new(move |_| {
                    let saw_exit = Arc::clone(&saw_exit);
                    Box::pin(async move {
                        saw_exit.store(true, Ordering::SeqCst);
                    })
                }),
            );
        }

        manager.start();
        manager.close().await;
        assert!(saw_exit.load(Ordering::SeqCst));
        assert!(manager.bus().emit(Event::Migrating).is_err());
    }
}
