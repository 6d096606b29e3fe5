//! Autoscaled worker pool
//!
//! Runs a caller-supplied task function on up to `current_concurrency`
//! concurrent workers, resizing that limit periodically from system
//! telemetry. A task slot is admitted only while `is_task_ready` holds;
//! the pool finishes when `is_finished` reports true with nothing in
//! flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;

use super::rate_limiter::{RateLimitDecision, RateLimiter};
use super::system_status::SystemStatus;

/// Produces one unit of work per invocation.
pub type PoolTaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Async predicate consulted by the pool loop.
pub type PoolPredicateFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Poll cadence while the pool has nothing to run
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Pool sizing and pacing knobs.
#[derive(Debug, Clone)]
pub struct AutoscaledPoolOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Upper target for scale-up; defaults to `max_concurrency`
    pub desired_concurrency: Option<usize>,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Cadence of resize decisions
    pub autoscale_interval: Duration,
    /// Absolute cap on task starts per minute
    pub max_tasks_per_minute: Option<u64>,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: None,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            autoscale_interval: Duration::from_secs(10),
            max_tasks_per_minute: None,
        }
    }
}

/// Concurrency-managed task runner.
pub struct AutoscaledPool {
    options: AutoscaledPoolOptions,
    run_task: PoolTaskFn,
    is_task_ready: PoolPredicateFn,
    is_finished: PoolPredicateFn,
    system_status: Arc<SystemStatus>,
    rate_limiter: Option<RateLimiter>,
    /// Admission limit for concurrent workers
    current_concurrency: AtomicUsize,
    /// Workers currently running
    in_flight: AtomicUsize,
    paused: AtomicBool,
    cancel: CancellationToken,
}

impl AutoscaledPool {
    #[must_use]
    pub fn new(
        options: AutoscaledPoolOptions,
        system_status: Arc<SystemStatus>,
        run_task: PoolTaskFn,
        is_task_ready: PoolPredicateFn,
        is_finished: PoolPredicateFn,
    ) -> Self {
        let rate_limiter = options.max_tasks_per_minute.map(RateLimiter::per_minute);
        let initial = options.min_concurrency.max(1);
        Self {
            options,
            run_task,
            is_task_ready,
            is_finished,
            system_status,
            rate_limiter,
            current_concurrency: AtomicUsize::new(initial),
            in_flight: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Current admission limit
    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::SeqCst)
    }

    /// Workers currently running
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Token observed by workers for cooperative cancellation
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop admitting new tasks; in-flight workers finish normally
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        log::debug!("Pool paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        log::debug!("Pool resumed");
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cancel in-flight work cooperatively; `run` returns once workers
    /// settle
    pub fn abort(&self) {
        log::info!("Pool abort requested");
        self.cancel.cancel();
    }

    fn may_admit(&self, active: usize) -> bool {
        !self.cancel.is_cancelled()
            && !self.is_paused()
            && active < self.current_concurrency()
    }

    /// Run the worker loop to completion.
    ///
    /// Returns when the queue is finished with nothing in flight, or
    /// after `abort()` once workers drain. Task errors are logged, not
    /// propagated; predicate errors terminate the loop.
    pub async fn run(&self) -> Result<()> {
        let mut active: FuturesUnordered<tokio::task::JoinHandle<Result<()>>> =
            FuturesUnordered::new();
        let mut ticker = tokio::time::interval(self.options.autoscale_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate tick

        log::debug!(
            "Pool started (min {}, max {}, initial {})",
            self.options.min_concurrency,
            self.options.max_concurrency,
            self.current_concurrency()
        );

        loop {
            // admission phase
            while self.may_admit(active.len()) {
                if !(self.is_task_ready)().await? {
                    break;
                }
                if let Some(limiter) = &self.rate_limiter
                    && limiter.check() != RateLimitDecision::Allow
                {
                    break;
                }

                let task = (self.run_task)();
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                active.push(tokio::spawn(task));
            }

            if active.is_empty() {
                if self.cancel.is_cancelled() {
                    break;
                }
                if (self.is_finished)().await? {
                    break;
                }
            }

            tokio::select! {
                joined = active.next(), if !active.is_empty() => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    match joined {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(e))) => log::warn!("Worker task failed: {e:#}"),
                        Some(Err(e)) => log::error!("Worker task panicked: {e}"),
                        None => {}
                    }
                }
                _ = ticker.tick() => {
                    self.autoscale();
                }
                () = tokio::time::sleep(IDLE_POLL), if active.is_empty() => {}
            }
        }

        log::debug!("Pool drained, exiting run loop");
        Ok(())
    }

    /// One resize decision from current telemetry.
    fn autoscale(&self) {
        let idle = !self.system_status.has_been_overloaded_recently();
        let current = self.current_concurrency();
        let desired = self
            .options
            .desired_concurrency
            .unwrap_or(self.options.max_concurrency)
            .min(self.options.max_concurrency);

        if idle {
            if current < desired {
                let step = ((current as f64 * self.options.scale_up_step_ratio).floor() as usize).max(1);
                let next = (current + step).min(desired);
                self.current_concurrency.store(next, Ordering::SeqCst);
                log::debug!("Scaled up concurrency {current} -> {next}");
            }
        } else {
            let step =
                ((current as f64 * self.options.scale_down_step_ratio).floor() as usize).max(1);
            let next = current.saturating_sub(step).max(self.options.min_concurrency);
            if next != current {
                self.current_concurrency.store(next, Ordering::SeqCst);
                log::debug!("Scaled down concurrency {current} -> {next}");
            }
        }
    }
}
