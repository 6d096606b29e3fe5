//! Per-request timing and retry accounting
//!
//! Tracks durations, success/failure counts and a retry histogram for
//! one crawler run. State is logged periodically, persisted to the
//! key-value store on `PersistState` ticks, and restored on startup so
//! resumed crawls keep accumulating.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, EventKind, ListenerId};
use crate::storage::{KeyValueRecord, KeyValueStoreClient, StorageError};

/// Key-value store key the statistics state lives under
pub const STATISTICS_STATE_KEY: &str = "STATISTICS_STATE";

/// Cadence of the periodic statistics log line
const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Persisted part of the statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsState {
    pub requests_finished: u64,
    pub requests_failed: u64,
    /// Extra handler invocations beyond the first attempt
    pub request_retries: u64,
    pub request_total_duration_millis: u64,
    pub request_min_duration_millis: Option<u64>,
    pub request_max_duration_millis: u64,
    /// Index = retry count at which the request reached a terminal state
    pub retry_histogram: Vec<u64>,
    pub crawler_started_at: Option<DateTime<Utc>>,
    pub crawler_finished_at: Option<DateTime<Utc>>,
}

/// Computed summary returned to the caller after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStatistics {
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub request_retries: u64,
    pub retry_histogram: Vec<u64>,
    pub request_avg_duration_millis: u64,
    pub request_min_duration_millis: u64,
    pub request_max_duration_millis: u64,
    pub requests_per_minute: f64,
    pub crawler_runtime_millis: u64,
}

struct Inner {
    state: StatisticsState,
    in_progress: HashMap<String, Instant>,
    run_started: Option<Instant>,
}

/// Run statistics with periodic logging and persistence.
pub struct Statistics {
    inner: parking_lot::Mutex<Inner>,
    kvs: Option<Arc<dyn KeyValueStoreClient>>,
    bus: Option<Arc<EventBus>>,
    persist_listener: parking_lot::Mutex<Option<ListenerId>>,
    log_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Statistics {
    #[must_use]
    pub fn new(kvs: Option<Arc<dyn KeyValueStoreClient>>, bus: Option<Arc<EventBus>>) -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(Inner {
                state: StatisticsState::default(),
                in_progress: HashMap::new(),
                run_started: None,
            }),
            kvs,
            bus,
            persist_listener: parking_lot::Mutex::new(None),
            log_task: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Restore persisted counters, hook persistence, start the log ticker.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), StorageError> {
        self.restore().await?;

        {
            let mut inner = self.inner.lock();
            inner.run_started = Some(Instant::now());
            if inner.state.crawler_started_at.is_none() {
                inner.state.crawler_started_at = Some(Utc::now());
            }
        }

        if let Some(bus) = &self.bus {
            let weak: Weak<Statistics> = Arc::downgrade(self);
            let id = bus.on(
                EventKind::PersistState,
                Arc::new(move |_event| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(stats) = weak.upgrade()
                            && let Err(e) = stats.persist_state().await
                        {
                            log::warn!("Statistics persistence failed: {e}");
                        }
                    })
                }),
            );
            *self.persist_listener.lock() = Some(id);
        }

        let weak: Weak<Statistics> = Arc::downgrade(self);
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_LOG_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(stats) = weak.upgrade() else { break };
                        log::info!("{}", stats.render_log_line());
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });
        *self.log_task.lock() = Some(task);
        Ok(())
    }

    /// Stop the ticker, detach from the bus, persist one final time.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.log_task.lock().take() {
            task.abort();
        }
        if let (Some(bus), Some(id)) = (&self.bus, self.persist_listener.lock().take()) {
            bus.off(id);
        }
        self.inner.lock().state.crawler_finished_at = Some(Utc::now());
        if let Err(e) = self.persist_state().await {
            log::warn!("Final statistics persistence failed: {e}");
        }
    }

    /// Record the start of one handler attempt.
    pub fn start_job(&self, request_id: &str) {
        self.inner
            .lock()
            .in_progress
            .insert(request_id.to_string(), Instant::now());
    }

    /// Record a successful terminal outcome.
    pub fn finish_job(&self, request_id: &str, retry_count: u32) {
        let mut inner = self.inner.lock();
        let duration = inner
            .in_progress
            .remove(request_id)
            .map_or(0, |started| started.elapsed().as_millis() as u64);

        inner.state.requests_finished += 1;
        inner.state.request_total_duration_millis += duration;
        inner.state.request_max_duration_millis =
            inner.state.request_max_duration_millis.max(duration);
        let min = inner
            .state
            .request_min_duration_millis
            .map_or(duration, |current| current.min(duration));
        inner.state.request_min_duration_millis = Some(min);
        Self::bump_histogram(&mut inner.state.retry_histogram, retry_count);
    }

    /// Record a failed terminal outcome.
    pub fn fail_job(&self, request_id: &str, retry_count: u32) {
        let mut inner = self.inner.lock();
        inner.in_progress.remove(request_id);
        inner.state.requests_failed += 1;
        Self::bump_histogram(&mut inner.state.retry_histogram, retry_count);
    }

    /// Record one retry (a handler attempt beyond the first).
    pub fn record_retry(&self) {
        self.inner.lock().state.request_retries += 1;
    }

    /// Drop an in-progress attempt without a terminal outcome (crawl
    /// shutdown returned the request to the queue).
    pub fn abandon_job(&self, request_id: &str) {
        self.inner.lock().in_progress.remove(request_id);
    }

    fn bump_histogram(histogram: &mut Vec<u64>, retry_count: u32) {
        let index = retry_count as usize;
        if histogram.len() <= index {
            histogram.resize(index + 1, 0);
        }
        histogram[index] += 1;
    }

    /// Compute the summary for the current counters.
    #[must_use]
    pub fn calculate(&self) -> FinalStatistics {
        let inner = self.inner.lock();
        let state = &inner.state;
        let runtime_millis = inner
            .run_started
            .map_or(0, |started| started.elapsed().as_millis() as u64);
        let avg = if state.requests_finished == 0 {
            0
        } else {
            state.request_total_duration_millis / state.requests_finished
        };
        let per_minute = if runtime_millis == 0 {
            0.0
        } else {
            (state.requests_finished + state.requests_failed) as f64
                / (runtime_millis as f64 / 60_000.0)
        };

        FinalStatistics {
            requests_finished: state.requests_finished,
            requests_failed: state.requests_failed,
            request_retries: state.request_retries,
            retry_histogram: state.retry_histogram.clone(),
            request_avg_duration_millis: avg,
            request_min_duration_millis: state.request_min_duration_millis.unwrap_or(0),
            request_max_duration_millis: state.request_max_duration_millis,
            requests_per_minute: per_minute,
            crawler_runtime_millis: runtime_millis,
        }
    }

    fn render_log_line(&self) -> String {
        let stats = self.calculate();
        format!(
            "Statistics: finished {} / failed {} / retries {} / avg duration {} ms / {:.1} req/min",
            stats.requests_finished,
            stats.requests_failed,
            stats.request_retries,
            stats.request_avg_duration_millis,
            stats.requests_per_minute
        )
    }

    /// Serialize current counters to the key-value store.
    pub async fn persist_state(&self) -> Result<(), StorageError> {
        let Some(kvs) = &self.kvs else {
            return Ok(());
        };
        let state = self.inner.lock().state.clone();
        kvs.set_record(KeyValueRecord {
            key: STATISTICS_STATE_KEY.to_string(),
            value: serde_json::to_value(state)?,
            content_type: Some("application/json".to_string()),
        })
        .await
    }

    async fn restore(&self) -> Result<(), StorageError> {
        let Some(kvs) = &self.kvs else {
            return Ok(());
        };
        let Some(record) = kvs.get_record(STATISTICS_STATE_KEY).await? else {
            return Ok(());
        };
        match serde_json::from_value::<StatisticsState>(record.value) {
            Ok(state) => {
                log::debug!(
                    "Restored statistics ({} finished, {} failed)",
                    state.requests_finished,
                    state.requests_failed
                );
                self.inner.lock().state = state;
            }
            Err(e) => log::warn!("Discarding unreadable statistics state: {e}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageClient;
    use crate::storage::memory::MemoryStorage;

    #[tokio::test]
    async fn test_finish_and_fail_accounting() {
        let stats = Statistics::new(None, None);
        stats.start_job("a");
        tokio::time::sleep(Duration::from_millis(5)).await;
        stats.finish_job("a", 0);

        stats.start_job("b");
        stats.fail_job("b", 2);
        stats.record_retry();
        stats.record_retry();

        let summary = stats.calculate();
        assert_eq!(summary.requests_finished, 1);
        assert_eq!(summary.requests_failed, 1);
        assert_eq!(summary.request_retries, 2);
        assert!(summary.request_avg_duration_millis >= 5);
        // one success with zero retries, one failure at retry index 2
        assert_eq!(summary.retry_histogram, vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn test_persist_and_restore_round_trip() {
        let storage = MemoryStorage::new();
        let kvs = storage.open_key_value_store(None).await.expect("kvs opens");

        let stats = Statistics::new(Some(Arc::clone(&kvs)), None);
        stats.start_job("a");
        stats.finish_job("a", 1);
        stats.persist_state().await.expect("persist succeeds");

        let resumed = Statistics::new(Some(kvs), None);
        resumed.initialize().await.expect("initialize succeeds");
        let summary = resumed.calculate();
        assert_eq!(summary.requests_finished, 1);
        assert_eq!(summary.retry_histogram, vec![0, 1]);
        resumed.teardown().await;
    }

    #[tokio::test]
    async fn test_log_line_renders() {
        let stats = Statistics::new(None, None);
        stats.start_job("a");
        stats.finish_job("a", 0);
        let line = stats.render_log_line();
        assert!(line.starts_with("Statistics: finished 1"));
    }
}
