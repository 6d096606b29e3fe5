//! Fluent construction of a `Crawler`
//!
//! `build()` is async: it purges and opens the storage entities, wires
//! the event manager, snapshotter, statistics and session pool, and
//! assembles the context pipeline for the chosen flavor.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::autoscaling::{Snapshotter, SnapshotterOptions, SystemStatus, SystemStatusOptions};
use crate::config::Configuration;
use crate::context::{ContextPipeline, CrawlingContext};
use crate::errors::CrawlError;
use crate::events::EventManager;
use crate::request_queue::RequestQueue;
use crate::router::Router;
use crate::session::SessionPool;
use crate::statistics::Statistics;
use crate::storage::{MemoryStorage, StorageClient};

use super::engine::{
    Crawler, EngineParts, ErrorHandlerFn, FailedRequestHandlerFn, RequestHandlerFn,
};
use super::http::{HttpPipelineOptions, NavigationHookFn, build_http_pipeline};
use super::options::CrawlerOptions;

/// Builder for `Crawler`.
pub struct CrawlerBuilder {
    options: CrawlerOptions,
    config: Option<Arc<Configuration>>,
    storage: Option<Arc<dyn StorageClient>>,
    request_handler: Option<RequestHandlerFn>,
    failed_request_handler: Option<FailedRequestHandlerFn>,
    error_handler: Option<ErrorHandlerFn>,
    pre_navigation_hooks: Vec<NavigationHookFn>,
    post_navigation_hooks: Vec<NavigationHookFn>,
    http_pipeline: Option<HttpPipelineOptions>,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: CrawlerOptions::default(),
            config: None,
            storage: None,
            request_handler: None,
            failed_request_handler: None,
            error_handler: None,
            pre_navigation_hooks: Vec::new(),
            post_navigation_hooks: Vec::new(),
            http_pipeline: None,
        }
    }

    #[must_use]
    pub fn options(mut self, options: CrawlerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn configuration(mut self, config: Arc<Configuration>) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageClient>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// The user handler invoked for every successfully navigated request
    #[must_use]
    pub fn request_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<CrawlingContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.request_handler = Some(Arc::new(move |ctx| Box::pin(handler(ctx))));
        self
    }

    /// Use a label router as the request handler
    #[must_use]
    pub fn router(mut self, router: Router) -> Self {
        self.request_handler = Some(router.into_handler());
        self
    }

    /// Invoked once per request after retries are exhausted or a
    /// non-retryable error occurred; defaults to logging the error
    #[must_use]
    pub fn failed_request_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<CrawlingContext>, Arc<CrawlError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.failed_request_handler = Some(Arc::new(move |ctx, error| Box::pin(handler(ctx, error))));
        self
    }

    /// Invoked before each retry; may mutate the request or request a
    /// forefront retry via the context
    #[must_use]
    pub fn error_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<CrawlingContext>, Arc<CrawlError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.error_handler = Some(Arc::new(move |ctx, error| Box::pin(handler(ctx, error))));
        self
    }

    /// Hook run inside the navigation stage before the HTTP exchange
    #[must_use]
    pub fn pre_navigation_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<CrawlingContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.pre_navigation_hooks
            .push(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Hook run inside the navigation stage after the HTTP exchange
    #[must_use]
    pub fn post_navigation_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<CrawlingContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.post_navigation_hooks
            .push(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Attach the HTTP stage pipeline (raw-HTTP crawling flavor).
    ///
    /// Without this, the crawler runs handlers directly with no
    /// navigation, which suits pre-fetched or synthetic workloads.
    #[must_use]
    pub fn http_pipeline(mut self, options: HttpPipelineOptions) -> Self {
        self.http_pipeline = Some(options);
        self
    }

    /// Assemble the crawler.
    pub async fn build(self) -> Result<Crawler> {
        let request_handler = self
            .request_handler
            .context("a request handler (or router) is required")?;

        let config = self.config.unwrap_or_else(Configuration::global);
        let storage: Arc<dyn StorageClient> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::from_config(&config)),
        };

        if config.purge_on_start() {
            storage.purge().await.context("startup purge failed")?;
        }

        let request_queue = Arc::new(
            RequestQueue::open(storage.as_ref(), None, &config)
                .await
                .context("failed to open the request queue")?,
        );
        let dataset = storage
            .open_dataset(Some(config.default_dataset_id()))
            .await
            .context("failed to open the dataset")?;
        let key_value_store = storage
            .open_key_value_store(Some(config.default_key_value_store_id()))
            .await
            .context("failed to open the key-value store")?;

        let event_manager = Arc::new(EventManager::new(Arc::clone(&config)));
        let bus = Arc::clone(event_manager.bus());

        let snapshotter = Arc::new(Snapshotter::new(
            SnapshotterOptions::default(),
            Arc::clone(&config),
            Arc::clone(&bus),
            Some(Arc::clone(&storage)),
        ));
        let system_status = Arc::new(SystemStatus::new(
            Arc::clone(&snapshotter),
            SystemStatusOptions::default(),
        ));

        let statistics = Statistics::new(Some(Arc::clone(&key_value_store)), Some(Arc::clone(&bus)));

        let session_pool = if self.options.use_session_pool {
            Some(SessionPool::new(
                self.options.session_pool_options.clone(),
                Some(Arc::clone(&key_value_store)),
                Some(Arc::clone(&bus)),
            ))
        } else {
            None
        };

        let (pipeline, http_client) = match &self.http_pipeline {
            Some(http_options) => {
                let client = reqwest::Client::builder()
                    .user_agent(concat!("spinneret/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .context("failed to build the HTTP client")?;
                let pipeline = build_http_pipeline(
                    self.pre_navigation_hooks,
                    self.post_navigation_hooks,
                    http_options,
                    self.options.navigation_timeout,
                );
                (pipeline, Some(client))
            }
            None => (ContextPipeline::new(), None),
        };

        Ok(Crawler::from_parts(EngineParts {
            options: self.options,
            config,
            storage,
            request_queue,
            dataset,
            key_value_store,
            session_pool,
            statistics,
            event_manager,
            snapshotter,
            system_status,
            pipeline,
            request_handler,
            failed_request_handler: self.failed_request_handler,
            error_handler: self.error_handler,
            http_client,
        }))
    }
}

impl Crawler {
    /// Start building a crawler.
    #[must_use]
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
    }
}
