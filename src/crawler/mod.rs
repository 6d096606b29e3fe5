//! Crawler engine: lifecycle, retries, sessions, autoscaled workers
//!
//! `Crawler::builder()` assembles a crawler; `Crawler::run` drives the
//! queue to completion and returns the run's statistics.

pub mod builder;
pub mod engine;
pub mod http;
pub mod options;

pub use builder::CrawlerBuilder;
pub use engine::{Crawler, ErrorHandlerFn, FailedRequestHandlerFn, RequestHandlerFn};
pub use http::{HttpPipelineOptions, NavigationHookFn, SendRequestOptions};
pub use options::CrawlerOptions;
