//! Spinneret: execution core for a general-purpose web crawler
//!
//! The crate wires five concerns into one engine: a request queue with
//! lease-based at-most-once delivery, a request lifecycle with retry and
//! session-rotation paths, a bounded pool of crawling identities, an
//! autoscaled worker pool driven by live resource telemetry, and a
//! per-request context pipeline with cleanup-safe stages.
//!
//! ```rust,no_run
//! use spinneret::{Crawler, Request};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let crawler = Crawler::builder()
//!     .request_handler(|ctx| async move {
//!         ctx.push_data(vec![serde_json::json!({ "url": ctx.url() })])
//!             .await?;
//!         Ok(())
//!     })
//!     .build()
//!     .await?;
//!
//! let stats = crawler
//!     .run(vec![Request::new("https://example.com/")?])
//!     .await?;
//! println!("crawled {} page(s)", stats.requests_finished);
//! # Ok(())
//! # }
//! ```

pub mod autoscaling;
pub mod config;
pub mod context;
pub mod crawler;
pub mod errors;
pub mod events;
pub mod proxy;
pub mod request;
pub mod request_queue;
pub mod router;
pub mod session;
pub mod statistics;
pub mod storage;

pub use autoscaling::{
    AutoscaledPool, AutoscaledPoolOptions, RateLimitDecision, RateLimiter, Snapshotter,
    SnapshotterOptions, SystemStatus, SystemStatusOptions,
};
pub use config::{Configuration, LogLevel};
pub use context::{ContextPipeline, CrawlingContext, HttpResponse, Stage};
pub use crawler::{
    Crawler, CrawlerBuilder, CrawlerOptions, HttpPipelineOptions, SendRequestOptions,
};
pub use errors::{CrawlError, ErrorDisposition};
pub use events::{Event, EventBus, EventKind, EventManager, SystemInfoData};
pub use proxy::ProxyInfo;
pub use request::{HttpMethod, Request, RequestBuilder, RequestError, RequestState};
pub use request_queue::RequestQueue;
pub use router::Router;
pub use session::{Session, SessionOptions, SessionPool, SessionPoolOptions};
pub use statistics::{FinalStatistics, Statistics};
pub use storage::{
    AddRequestResult, DatasetClient, KeyValueRecord, KeyValueStoreClient, ListKeysOptions,
    MemoryStorage, QueueStats, RequestQueueClient, StorageClient, StorageError,
};
