//! Storage backend abstraction
//!
//! The crawler core depends only on these traits. The bundled
//! `MemoryStorage` keeps everything in process and, when persistence is
//! enabled, mirrors each entity to a directory of JSON files through a
//! background writer (see `fs`).

pub mod fs;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::request::Request;

pub use memory::MemoryStorage;

/// Errors raised by storage clients.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("request {id} not found")]
    RequestNotFound { id: String },

    #[error("lock violation on request {id}: {reason}")]
    LockViolation { id: String, reason: String },

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of inserting one request into a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequestResult {
    pub request_id: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// Counters for one request queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_request_count: u64,
    pub handled_request_count: u64,
    pub total_request_count: u64,
}

/// One stored key-value record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValueRecord {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Options for key listing.
#[derive(Debug, Clone, Default)]
pub struct ListKeysOptions {
    pub limit: Option<usize>,
    pub exclusive_start_key: Option<String>,
    pub prefix: Option<String>,
}

/// Ordered set of pending requests with lease-based locking.
///
/// All mutations on one queue are serialized internally; callers may
/// invoke these methods concurrently.
#[async_trait]
pub trait RequestQueueClient: Send + Sync {
    /// Idempotent insert by unique key. With `forefront`, the request is
    /// prepended to the priority side of the queue.
    async fn add_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<AddRequestResult, StorageError>;

    /// `add_request` applied to each element, results in input order
    async fn batch_add_requests(
        &self,
        requests: &[Request],
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError>;

    async fn get_request(&self, id: &str) -> Result<Option<Request>, StorageError>;

    /// Replace the stored request body; counts and lock state unchanged
    async fn update_request(&self, request: &Request) -> Result<(), StorageError>;

    async fn delete_request(&self, id: &str) -> Result<(), StorageError>;

    /// Return up to `limit` unlocked pending requests, locking each for
    /// `lock_secs`. Forefront entries drain first (LIFO), then FIFO
    /// entries in insertion order. Atomic with respect to concurrent
    /// callers on the same queue.
    async fn list_and_lock_head(
        &self,
        limit: usize,
        lock_secs: u64,
    ) -> Result<Vec<Request>, StorageError>;

    /// Extend a held lease by `lock_secs`. Fails when the entry is
    /// terminal or not currently locked.
    async fn prolong_request_lock(
        &self,
        id: &str,
        lock_secs: u64,
        forefront: bool,
    ) -> Result<chrono::DateTime<chrono::Utc>, StorageError>;

    /// Release a held lease, returning the entry to the pending side.
    /// Fails when the entry is terminal or not currently locked.
    async fn delete_request_lock(&self, id: &str, forefront: bool) -> Result<(), StorageError>;

    /// Terminal transition: the entry stops being pending and is never
    /// returned again
    async fn mark_request_handled(&self, request: &Request) -> Result<(), StorageError>;

    /// Move a locked entry back to pending with a fresh position
    async fn reclaim_request(&self, request: &Request, forefront: bool)
    -> Result<(), StorageError>;

    async fn stats(&self) -> Result<QueueStats, StorageError>;
}

/// Append-only record store for crawl results.
#[async_trait]
pub trait DatasetClient: Send + Sync {
    async fn push_data(&self, items: Vec<serde_json::Value>) -> Result<(), StorageError>;

    async fn get_data(
        &self,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<serde_json::Value>, StorageError>;

    async fn item_count(&self) -> Result<usize, StorageError>;
}

/// Named JSON record store for component state.
#[async_trait]
pub trait KeyValueStoreClient: Send + Sync {
    async fn get_record(&self, key: &str) -> Result<Option<KeyValueRecord>, StorageError>;

    async fn set_record(&self, record: KeyValueRecord) -> Result<(), StorageError>;

    async fn delete_record(&self, key: &str) -> Result<(), StorageError>;

    async fn record_exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn list_keys(&self, options: ListKeysOptions) -> Result<Vec<String>, StorageError>;
}

/// Factory for storage entities, keyed by name (get-or-create).
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn open_request_queue(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn RequestQueueClient>, StorageError>;

    async fn open_key_value_store(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn KeyValueStoreClient>, StorageError>;

    async fn open_dataset(&self, name: Option<&str>)
    -> Result<Arc<dyn DatasetClient>, StorageError>;

    /// Clear the default storages (startup purge)
    async fn purge(&self) -> Result<(), StorageError>;

    /// Wait until all pending background writes have landed (graceful
    /// shutdown)
    async fn flush(&self) -> Result<(), StorageError>;

    /// Running count of rate-limit errors observed against the backend;
    /// consumed by the client snapshotter
    fn rate_limit_error_count(&self) -> u64;

    /// Report one rate-limit error (called by adapters on 429-style
    /// backend responses)
    fn record_rate_limit_error(&self);
}
