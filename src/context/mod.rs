//! Per-request crawling context and the stage pipeline that builds it
//!
//! A `CrawlingContext` is created for one handler invocation and torn
//! down right after it. Pipeline stages extend the context (navigation
//! result, parsed body) in registration order; cleanups run in reverse
//! order during teardown, even when a later stage failed.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::errors::CrawlError;
use crate::proxy::ProxyInfo;
use crate::request::Request;
use crate::request_queue::RequestQueue;
use crate::session::Session;
use crate::storage::{AddRequestResult, DatasetClient, KeyValueStoreClient, StorageError};

/// Response captured by the HTTP pipeline stages.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// URL after redirects
    pub final_url: String,
}

impl HttpResponse {
    /// First header value with the given name, case-insensitive
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body decoded as UTF-8, lossily
    #[must_use]
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Deserialize the body as JSON
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

type DeferredCleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Everything a request handler can reach for one invocation.
///
/// The request itself lives behind a mutex so the handler and the engine
/// can both touch it (`user_data`, labels, retry bookkeeping) without the
/// context being mutably borrowed across await points.
pub struct CrawlingContext {
    request: parking_lot::Mutex<Request>,
    pub session: Option<Arc<Session>>,
    pub proxy_info: Option<ProxyInfo>,
    dataset: Option<Arc<dyn DatasetClient>>,
    key_value_store: Option<Arc<dyn KeyValueStoreClient>>,
    request_queue: Option<Arc<RequestQueue>>,
    response: parking_lot::Mutex<Option<Arc<HttpResponse>>>,
    deferred_cleanups: parking_lot::Mutex<Vec<DeferredCleanup>>,
    http_client: parking_lot::Mutex<Option<reqwest::Client>>,
    /// When set (typically by an error handler), the next retry of this
    /// request is reclaimed to the forefront of the queue
    retry_forefront: std::sync::atomic::AtomicBool,
    /// Per-request cancellation; observed between suspension points
    pub cancellation: CancellationToken,
}

impl CrawlingContext {
    #[must_use]
    pub fn new(
        request: Request,
        session: Option<Arc<Session>>,
        dataset: Option<Arc<dyn DatasetClient>>,
        key_value_store: Option<Arc<dyn KeyValueStoreClient>>,
        request_queue: Option<Arc<RequestQueue>>,
        cancellation: CancellationToken,
    ) -> Self {
        let proxy_info = session.as_ref().and_then(|s| s.proxy_info());
        Self {
            request: parking_lot::Mutex::new(request),
            session,
            proxy_info,
            dataset,
            key_value_store,
            request_queue,
            response: parking_lot::Mutex::new(None),
            deferred_cleanups: parking_lot::Mutex::new(Vec::new()),
            http_client: parking_lot::Mutex::new(None),
            retry_forefront: std::sync::atomic::AtomicBool::new(false),
            cancellation,
        }
    }

    /// Request that a retry of this request jumps the queue
    pub fn set_retry_forefront(&self, forefront: bool) {
        self.retry_forefront
            .store(forefront, std::sync::atomic::Ordering::SeqCst);
    }

    #[must_use]
    pub fn retry_forefront(&self) -> bool {
        self.retry_forefront
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Attach the HTTP client used by `send_request` and the HTTP stages
    pub fn set_http_client(&self, client: reqwest::Client) {
        *self.http_client.lock() = Some(client);
    }

    /// The attached HTTP client, when this is an HTTP-flavored crawl
    #[must_use]
    pub fn http_client(&self) -> Option<reqwest::Client> {
        self.http_client.lock().clone()
    }

    /// Run a closure over the live request
    pub fn with_request<R>(&self, f: impl FnOnce(&mut Request) -> R) -> R {
        f(&mut self.request.lock())
    }

    /// Owned copy of the current request state
    #[must_use]
    pub fn request(&self) -> Request {
        self.request.lock().clone()
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.request.lock().url.clone()
    }

    #[must_use]
    pub fn label(&self) -> Option<String> {
        self.request.lock().label().map(str::to_string)
    }

    /// Response stored by the navigation stage, if any
    #[must_use]
    pub fn response(&self) -> Option<Arc<HttpResponse>> {
        self.response.lock().clone()
    }

    pub fn set_response(&self, response: HttpResponse) {
        *self.response.lock() = Some(Arc::new(response));
    }

    /// Parse the response body as an HTML document.
    ///
    /// Parsing happens on demand; the returned document is not `Send`,
    /// so obtain it inside a synchronous block of the handler.
    pub fn parse_html(&self) -> Result<scraper::Html, CrawlError> {
        let response = self.response().ok_or_else(|| {
            CrawlError::non_retryable("no response available; navigation did not run")
        })?;
        Ok(scraper::Html::parse_document(&response.body_text()))
    }

    /// Append items to the crawl's dataset
    pub async fn push_data(&self, items: Vec<serde_json::Value>) -> Result<(), StorageError> {
        match &self.dataset {
            Some(dataset) => dataset.push_data(items).await,
            None => Err(StorageError::Other(anyhow::anyhow!(
                "no dataset attached to this crawl"
            ))),
        }
    }

    /// The crawl's key-value store, when attached
    #[must_use]
    pub fn key_value_store(&self) -> Option<Arc<dyn KeyValueStoreClient>> {
        self.key_value_store.clone()
    }

    /// Enqueue follow-up requests into the crawl's queue
    pub async fn add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError> {
        match &self.request_queue {
            Some(queue) => queue.batch_add_requests(requests, forefront).await,
            None => Err(StorageError::Other(anyhow::anyhow!(
                "no request queue attached to this crawl"
            ))),
        }
    }

    /// Register a cleanup to run at pipeline teardown.
    ///
    /// Deferred cleanups run after stage cleanups, in reverse order of
    /// registration.
    pub fn defer_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.deferred_cleanups.lock().push(Box::new(cleanup));
    }

    async fn run_deferred_cleanups(&self) {
        loop {
            let cleanup = self.deferred_cleanups.lock().pop();
            match cleanup {
                Some(cleanup) => cleanup().await,
                None => break,
            }
        }
    }
}

/// Async stage action: extends the context or fails the request.
pub type StageActionFn =
    Arc<dyn Fn(Arc<CrawlingContext>) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;

/// Async stage cleanup; must not fail.
pub type StageCleanupFn =
    Arc<dyn Fn(Arc<CrawlingContext>) -> BoxFuture<'static, ()> + Send + Sync>;

/// One pipeline element.
pub struct Stage {
    pub name: &'static str,
    action: StageActionFn,
    cleanup: Option<StageCleanupFn>,
}

impl Stage {
    #[must_use]
    pub fn new(name: &'static str, action: StageActionFn) -> Self {
        Self { name, action, cleanup: None }
    }

    #[must_use]
    pub fn with_cleanup(mut self, cleanup: StageCleanupFn) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

/// Ordered stage sequence with cleanup-safe execution.
#[derive(Default)]
pub struct ContextPipeline {
    stages: Vec<Stage>,
}

impl ContextPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    #[must_use]
    pub fn add_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run all stage actions in order, then all cleanups in reverse.
    pub async fn run(&self, ctx: Arc<CrawlingContext>) -> Result<(), CrawlError> {
        self.run_with(ctx, |_| Box::pin(async { Ok(()) })).await
    }

    /// Run stage actions in order, hand the extended context to
    /// `consumer`, then run all cleanups in reverse.
    ///
    /// Cleanups of every started stage run even when a later action, the
    /// consumer, or a mid-pipeline cancellation failed the request; the
    /// first error is returned after teardown completes.
    pub async fn run_with<F>(
        &self,
        ctx: Arc<CrawlingContext>,
        consumer: F,
    ) -> Result<(), CrawlError>
    where
        F: FnOnce(Arc<CrawlingContext>) -> BoxFuture<'static, Result<(), CrawlError>>,
    {
        let mut started: Vec<&Stage> = Vec::new();
        let mut result: Result<(), CrawlError> = Ok(());

        for stage in &self.stages {
            if ctx.cancellation.is_cancelled() {
                result = Err(CrawlError::Retryable(anyhow::anyhow!(
                    "request cancelled before stage {}",
                    stage.name
                )));
                break;
            }
            started.push(stage);
            if let Err(e) = (stage.action)(Arc::clone(&ctx)).await {
                log::debug!("Pipeline stage {} failed: {e}", stage.name);
                result = Err(e);
                break;
            }
        }

        if result.is_ok() {
            result = if ctx.cancellation.is_cancelled() {
                Err(CrawlError::Retryable(anyhow::anyhow!(
                    "request cancelled before the handler"
                )))
            } else {
                consumer(Arc::clone(&ctx)).await
            };
        }

        for stage in started.iter().rev() {
            if let Some(cleanup) = &stage.cleanup {
                cleanup(Arc::clone(&ctx)).await;
            }
        }
        ctx.run_deferred_cleanups().await;

        result
    }
}
