//! Crawler tuning knobs

use std::time::Duration;

use crate::session::SessionPoolOptions;

/// Options governing retries, timeouts, concurrency and sessions.
#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    /// Handler retries per request beyond the first attempt
    pub max_request_retries: u32,
    /// Session rotations per request on anti-bot signals; these do not
    /// consume regular retries
    pub max_session_rotations: u32,
    /// Stop the crawl once this many requests reached a terminal state
    pub max_requests_per_crawl: Option<u64>,
    /// Absolute cap on handler starts per minute
    pub max_requests_per_minute: Option<u64>,
    /// Deadline for one user-handler invocation
    pub request_handler_timeout: Duration,
    /// Deadline for the navigation stage
    pub navigation_timeout: Duration,
    /// Rotate identities through a session pool
    pub use_session_pool: bool,
    pub session_pool_options: SessionPoolOptions,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Upper target for autoscaling; defaults to `max_concurrency`
    pub desired_concurrency: Option<usize>,
    /// Cadence of pool resize decisions
    pub autoscale_interval: Duration,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
            max_session_rotations: 10,
            max_requests_per_crawl: None,
            max_requests_per_minute: None,
            request_handler_timeout: Duration::from_secs(60),
            navigation_timeout: Duration::from_secs(30),
            use_session_pool: true,
            session_pool_options: SessionPoolOptions::default(),
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: None,
            autoscale_interval: Duration::from_secs(10),
        }
    }
}
