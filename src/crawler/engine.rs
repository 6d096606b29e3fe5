//! Request lifecycle engine
//!
//! Binds the queue, session pool, context pipeline, statistics and the
//! autoscaled pool into one run loop. Each worker task pulls the next
//! request, builds a context, drives it through the pipeline into the
//! user handler, and disposes of the outcome: mark handled, retry,
//! rotate session, or fail terminally.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::autoscaling::{
    AutoscaledPool, AutoscaledPoolOptions, PoolPredicateFn, PoolTaskFn, Snapshotter, SystemStatus,
};
use crate::config::Configuration;
use crate::context::{ContextPipeline, CrawlingContext};
use crate::errors::{CrawlError, ErrorDisposition};
use crate::events::{EventKind, EventManager};
use crate::request::{Request, RequestState};
use crate::request_queue::RequestQueue;
use crate::session::{Session, SessionPool};
use crate::statistics::{FinalStatistics, Statistics};
use crate::storage::{DatasetClient, KeyValueStoreClient, StorageClient};

use super::options::CrawlerOptions;

/// Slack added on top of handler + navigation timeouts for the
/// per-request deadline
const TIMEOUT_BUFFER: Duration = Duration::from_secs(5);

/// Extra time the hard watchdog allows for cleanups after the deadline
const CLEANUP_GRACE: Duration = Duration::from_secs(10);

/// Handler invoked with the final error once a request is given up on.
pub type FailedRequestHandlerFn =
    Arc<dyn Fn(Arc<CrawlingContext>, Arc<CrawlError>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler invoked before each retry; may mutate the request or toggle
/// forefront via the context.
pub type ErrorHandlerFn =
    Arc<dyn Fn(Arc<CrawlingContext>, Arc<CrawlError>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler for one request (see `Router::into_handler` for routing).
pub type RequestHandlerFn =
    Arc<dyn Fn(Arc<CrawlingContext>) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;

pub(crate) struct EngineParts {
    pub options: CrawlerOptions,
    pub config: Arc<Configuration>,
    pub storage: Arc<dyn StorageClient>,
    pub request_queue: Arc<RequestQueue>,
    pub dataset: Arc<dyn DatasetClient>,
    pub key_value_store: Arc<dyn KeyValueStoreClient>,
    pub session_pool: Option<Arc<SessionPool>>,
    pub statistics: Arc<Statistics>,
    pub event_manager: Arc<EventManager>,
    pub snapshotter: Arc<Snapshotter>,
    pub system_status: Arc<SystemStatus>,
    pub pipeline: ContextPipeline,
    pub request_handler: RequestHandlerFn,
    pub failed_request_handler: Option<FailedRequestHandlerFn>,
    pub error_handler: Option<ErrorHandlerFn>,
    pub http_client: Option<reqwest::Client>,
}

pub(crate) struct CrawlerInner {
    options: CrawlerOptions,
    config: Arc<Configuration>,
    storage: Arc<dyn StorageClient>,
    request_queue: Arc<RequestQueue>,
    dataset: Arc<dyn DatasetClient>,
    key_value_store: Arc<dyn KeyValueStoreClient>,
    session_pool: Option<Arc<SessionPool>>,
    statistics: Arc<Statistics>,
    event_manager: Arc<EventManager>,
    snapshotter: Arc<Snapshotter>,
    system_status: Arc<SystemStatus>,
    pipeline: ContextPipeline,
    request_handler: RequestHandlerFn,
    failed_request_handler: Option<FailedRequestHandlerFn>,
    error_handler: Option<ErrorHandlerFn>,
    http_client: Option<reqwest::Client>,
    /// Requests that reached a terminal state this run
    processed_count: AtomicU64,
    /// Cancellation of the owning pool; set when `run` builds the pool
    pool_cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

/// The crawler: configured once, then `run` to completion.
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

impl Crawler {
    pub(crate) fn from_parts(parts: EngineParts) -> Self {
        Self {
            inner: Arc::new(CrawlerInner {
                options: parts.options,
                config: parts.config,
                storage: parts.storage,
                request_queue: parts.request_queue,
                dataset: parts.dataset,
                key_value_store: parts.key_value_store,
                session_pool: parts.session_pool,
                statistics: parts.statistics,
                event_manager: parts.event_manager,
                snapshotter: parts.snapshotter,
                system_status: parts.system_status,
                pipeline: parts.pipeline,
                request_handler: parts.request_handler,
                failed_request_handler: parts.failed_request_handler,
                error_handler: parts.error_handler,
                http_client: parts.http_client,
                processed_count: AtomicU64::new(0),
                pool_cancel: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// The queue this crawler consumes; usable to enqueue before `run`
    #[must_use]
    pub fn request_queue(&self) -> Arc<RequestQueue> {
        Arc::clone(&self.inner.request_queue)
    }

    /// The dataset handlers push results into
    #[must_use]
    pub fn dataset(&self) -> Arc<dyn DatasetClient> {
        Arc::clone(&self.inner.dataset)
    }

    /// The configuration this crawler was built with
    #[must_use]
    pub fn configuration(&self) -> Arc<Configuration> {
        Arc::clone(&self.inner.config)
    }

    /// Enqueue requests, then run the crawl to completion.
    pub async fn run(&self, initial_requests: Vec<Request>) -> Result<FinalStatistics> {
        let inner = &self.inner;

        if !initial_requests.is_empty() {
            inner
                .request_queue
                .batch_add_requests(initial_requests, false)
                .await?;
        }

        inner.event_manager.start();
        inner.snapshotter.start();
        inner.statistics.initialize().await?;
        if let Some(pool) = &inner.session_pool {
            pool.initialize().await?;
        }

        let pool = Arc::new(AutoscaledPool::new(
            AutoscaledPoolOptions {
                min_concurrency: inner.options.min_concurrency,
                max_concurrency: inner.options.max_concurrency,
                desired_concurrency: inner.options.desired_concurrency,
                autoscale_interval: inner.options.autoscale_interval,
                max_tasks_per_minute: inner.options.max_requests_per_minute,
                ..Default::default()
            },
            Arc::clone(&inner.system_status),
            self.make_run_task(),
            self.make_is_task_ready(),
            self.make_is_finished(),
        ));
        *inner.pool_cancel.lock() = Some(pool.cancellation_token());

        // migrating/aborting begin a graceful drain
        let bus = inner.event_manager.bus();
        let mut drain_listeners = Vec::new();
        for kind in [EventKind::Migrating, EventKind::Aborting] {
            let drain_pool = Arc::clone(&pool);
            drain_listeners.push(bus.on(
                kind,
                Arc::new(move |_event| {
                    let pool = Arc::clone(&drain_pool);
                    Box::pin(async move {
                        log::info!("Shutdown event received, draining the crawl");
                        pool.abort();
                    })
                }),
            ));
        }

        log::info!("Starting the crawl");
        let run_result = pool.run().await;

        for id in drain_listeners {
            bus.off(id);
        }

        inner.statistics.teardown().await;
        if let Some(session_pool) = &inner.session_pool {
            session_pool.teardown().await;
        }
        inner.snapshotter.stop().await;
        inner.event_manager.close().await;
        if let Err(e) = inner.storage.flush().await {
            log::warn!("Storage flush at shutdown failed: {e}");
        }

        run_result?;
        let stats = inner.statistics.calculate();
        log::info!(
            "Crawl finished: {} succeeded, {} failed",
            stats.requests_finished,
            stats.requests_failed
        );
        Ok(stats)
    }

    fn make_run_task(&self) -> PoolTaskFn {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.run_one().await })
        })
    }

    fn make_is_task_ready(&self) -> PoolPredicateFn {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                if inner.max_requests_reached() {
                    return Ok(false);
                }
                Ok(!inner.request_queue.is_empty().await?)
            })
        })
    }

    fn make_is_finished(&self) -> PoolPredicateFn {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                if inner.max_requests_reached() {
                    log::info!(
                        "Reached maximum of {} request(s) for this crawl",
                        inner.options.max_requests_per_crawl.unwrap_or_default()
                    );
                    return Ok(true);
                }
                Ok(inner.request_queue.is_finished().await?)
            })
        })
    }
}

impl CrawlerInner {
    fn max_requests_reached(&self) -> bool {
        match self.options.max_requests_per_crawl {
            Some(max) => self.processed_count.load(Ordering::SeqCst) >= max,
            None => false,
        }
    }

    fn crawl_cancelled(&self) -> bool {
        self.pool_cancel
            .lock()
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Process one request end to end.
    async fn run_one(self: &Arc<Self>) -> Result<()> {
        if self.max_requests_reached() {
            return Ok(());
        }
        let Some(request) = self.request_queue.fetch_next_request().await? else {
            return Ok(());
        };
        let request_id = request.id.clone();
        log::debug!("Processing {} (retry {})", request.url, request.retry_count);

        let session = match &self.session_pool {
            Some(pool) => Some(pool.get_session().await),
            None => None,
        };

        let pool_token = self
            .pool_cancel
            .lock()
            .clone()
            .unwrap_or_default();
        let cancellation = pool_token.child_token();
        let ctx = Arc::new(CrawlingContext::new(
            request,
            session.clone(),
            Some(Arc::clone(&self.dataset)),
            Some(Arc::clone(&self.key_value_store)),
            Some(Arc::clone(&self.request_queue)),
            cancellation.clone(),
        ));
        if let Some(client) = &self.http_client {
            ctx.set_http_client(client.clone());
        }

        self.statistics.start_job(&request_id);
        ctx.with_request(|r| r.state = RequestState::BeforeNav);

        // cooperative deadline: cancels the context, letting stages stop
        // between suspension points while cleanups still run
        let total_deadline =
            self.options.request_handler_timeout + self.options.navigation_timeout + TIMEOUT_BUFFER;
        let deadline_token = cancellation.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(total_deadline).await;
            deadline_token.cancel();
        });

        let handler = Arc::clone(&self.request_handler);
        let handler_timeout = self.options.request_handler_timeout;
        let lifecycle = self.pipeline.run_with(Arc::clone(&ctx), move |ctx| {
            Box::pin(async move {
                ctx.with_request(|r| r.state = RequestState::RequestHandler);
                match tokio::time::timeout(handler_timeout, handler(Arc::clone(&ctx))).await {
                    Ok(result) => result,
                    Err(_) => Err(CrawlError::Timeout {
                        operation: "request handler",
                        timeout: handler_timeout,
                    }),
                }
            })
        });

        // hard stop: only fires when a cleanup itself wedges
        let outcome = match tokio::time::timeout(total_deadline + CLEANUP_GRACE, lifecycle).await {
            Ok(result) => result,
            Err(_) => Err(CrawlError::Timeout {
                operation: "request lifecycle",
                timeout: total_deadline,
            }),
        };
        watchdog.abort();

        match outcome {
            Ok(()) => self.finalize_success(&ctx, session.as_deref()).await,
            Err(error) => self.handle_failure(&ctx, session.as_deref(), error).await,
        }
    }

    async fn finalize_success(
        &self,
        ctx: &Arc<CrawlingContext>,
        session: Option<&Session>,
    ) -> Result<()> {
        let request = ctx.with_request(|r| {
            r.state = RequestState::Done;
            r.handled_at = Some(chrono::Utc::now());
            r.clone()
        });
        self.request_queue.mark_request_handled(&request).await?;
        if let Some(session) = session {
            session.mark_good();
        }
        self.statistics.finish_job(&request.id, request.retry_count);
        self.processed_count.fetch_add(1, Ordering::SeqCst);
        log::debug!("Finished {}", request.url);
        Ok(())
    }

    async fn handle_failure(
        self: &Arc<Self>,
        ctx: &Arc<CrawlingContext>,
        session: Option<&Session>,
        error: CrawlError,
    ) -> Result<()> {
        let request_id = ctx.with_request(|r| r.id.clone());

        // a crawl-level shutdown is not a request failure: hand the
        // request back without burning a retry
        if self.crawl_cancelled() {
            let request = ctx.request();
            self.statistics.abandon_job(&request_id);
            self.request_queue.reclaim_request(&request, false).await?;
            return Ok(());
        }

        let error = Arc::new(error);
        let no_retry = ctx.with_request(|r| {
            r.push_error_message(format!("{error}"));
            r.state = RequestState::ErrorHandler;
            r.no_retry
        });

        if let Some(session) = session {
            if error.marks_session_bad() {
                // anti-bot signal: this identity is burned
                session.mark_bad();
                session.retire();
            } else if matches!(&*error, CrawlError::Timeout { operation, .. } if *operation == "navigation")
            {
                session.mark_bad();
            }
        }

        match error.disposition(no_retry) {
            ErrorDisposition::Retry => {
                let retry_count = ctx.with_request(|r| r.retry_count);
                if retry_count < self.options.max_request_retries {
                    self.retry_request(ctx, &error, true).await
                } else {
                    log::warn!(
                        "Request {} exhausted its {} retries",
                        ctx.url(),
                        self.options.max_request_retries
                    );
                    self.fail_request(ctx, &error).await
                }
            }
            ErrorDisposition::RetryWithNewSession => {
                let rotations = ctx.with_request(|r| r.session_rotation_count);
                if rotations < self.options.max_session_rotations {
                    ctx.with_request(|r| r.session_rotation_count += 1);
                    log::debug!(
                        "Rotating session for {} (rotation {})",
                        ctx.url(),
                        rotations + 1
                    );
                    self.retry_request(ctx, &error, false).await
                } else {
                    log::warn!(
                        "Request {} exhausted its {} session rotations",
                        ctx.url(),
                        self.options.max_session_rotations
                    );
                    self.fail_request(ctx, &error).await
                }
            }
            ErrorDisposition::RetryIgnoringCap => self.retry_request(ctx, &error, false).await,
            ErrorDisposition::Fail => self.fail_request(ctx, &error).await,
            ErrorDisposition::Abort => {
                self.fail_request(ctx, &error).await?;
                log::error!("Aborting the crawl: {error}");
                if let Some(token) = self.pool_cancel.lock().as_ref() {
                    token.cancel();
                }
                Ok(())
            }
        }
    }

    /// Put the request back into the queue for another attempt.
    ///
    /// `count_retry` distinguishes the regular retry path (which consumes
    /// `retry_count`) from session rotations and forced retries.
    async fn retry_request(
        &self,
        ctx: &Arc<CrawlingContext>,
        error: &Arc<CrawlError>,
        count_retry: bool,
    ) -> Result<()> {
        if let Some(handler) = &self.error_handler {
            handler(Arc::clone(ctx), Arc::clone(error)).await;
        }
        let request = ctx.with_request(|r| {
            if count_retry {
                r.retry_count += 1;
            }
            r.clone()
        });
        self.statistics.record_retry();
        log::debug!(
            "Reclaiming {} for retry ({} so far)",
            request.url,
            request.retry_count
        );
        self.request_queue
            .reclaim_request(&request, ctx.retry_forefront())
            .await?;
        Ok(())
    }

    /// Terminal failure: failed-request handler, then mark handled.
    async fn fail_request(
        &self,
        ctx: &Arc<CrawlingContext>,
        error: &Arc<CrawlError>,
    ) -> Result<()> {
        ctx.with_request(|r| r.state = RequestState::Error);

        match &self.failed_request_handler {
            Some(handler) => handler(Arc::clone(ctx), Arc::clone(error)).await,
            None => {
                let (url, messages) =
                    ctx.with_request(|r| (r.url.clone(), r.error_messages.len()));
                log::error!("Request {url} failed after {messages} error(s): {error}");
            }
        }

        let request = ctx.with_request(|r| {
            r.handled_at = Some(chrono::Utc::now());
            r.clone()
        });
        self.request_queue.mark_request_handled(&request).await?;
        self.statistics.fail_job(&request.id, request.retry_count);
        self.processed_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field(
                "processed",
                &self.inner.processed_count.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}
