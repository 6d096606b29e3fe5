//! Engine-facing request queue
//!
//! Wraps a `RequestQueueClient` with a prefetched head cache and
//! in-progress tracking. All engine interaction with pending work goes
//! through this type: fetch-next, mark-handled, reclaim.
//!
//! Delivery contract: at most one in-process caller ever holds a given
//! request between `fetch_next_request` and the matching
//! `mark_request_handled` / `reclaim_request`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Configuration;
use crate::request::Request;
use crate::storage::{AddRequestResult, QueueStats, RequestQueueClient, StorageClient, StorageError};

/// How many requests one head fetch locks at a time
const HEAD_PREFETCH_LIMIT: usize = 25;

/// Lease duration for fetched requests
const REQUEST_LOCK_SECS: u64 = 180;

struct QueueState {
    /// Locked requests waiting to be handed to workers, head first
    head: VecDeque<Request>,
    /// Ids currently held by workers
    in_progress: HashSet<String>,
    /// Set when a forefront insert may have overtaken the cached head
    forefront_dirty: bool,
    /// Ids inserted with forefront since the last head refresh; these
    /// are spliced ahead of the cached head instead of behind it
    recent_forefront: HashSet<String>,
}

/// Ordered set of pending requests with at-most-once delivery.
pub struct RequestQueue {
    client: Arc<dyn RequestQueueClient>,
    state: Mutex<QueueState>,
}

impl RequestQueue {
    /// Open (get-or-create) a queue through the storage backend.
    pub async fn open(
        storage: &dyn StorageClient,
        name: Option<&str>,
        config: &Configuration,
    ) -> Result<Self, StorageError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => config.default_request_queue_id().to_string(),
        };
        let client = storage.open_request_queue(Some(&name)).await?;
        Ok(Self::from_client(client))
    }

    /// Wrap an already opened client.
    #[must_use]
    pub fn from_client(client: Arc<dyn RequestQueueClient>) -> Self {
        Self {
            client,
            state: Mutex::new(QueueState {
                head: VecDeque::new(),
                in_progress: HashSet::new(),
                forefront_dirty: false,
                recent_forefront: HashSet::new(),
            }),
        }
    }

    /// Insert one request. Idempotent by unique key.
    pub async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, StorageError> {
        let result = self.client.add_request(&request, forefront).await?;
        if forefront && !result.was_already_handled {
            let mut state = self.state.lock().await;
            state.forefront_dirty = true;
            state.recent_forefront.insert(result.request_id.clone());
        }
        Ok(result)
    }

    /// Insert a batch, preserving input order in the results.
    pub async fn batch_add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError> {
        let results = self.client.batch_add_requests(&requests, forefront).await?;
        if forefront {
            let mut state = self.state.lock().await;
            for result in results.iter().filter(|r| !r.was_already_handled) {
                state.forefront_dirty = true;
                state.recent_forefront.insert(result.request_id.clone());
            }
        }
        Ok(results)
    }

    /// Pop the next pending request, locking it for this process.
    ///
    /// Returns `None` when nothing is currently eligible (the queue may
    /// still hold locked or in-progress entries).
    pub async fn fetch_next_request(&self) -> Result<Option<Request>, StorageError> {
        let mut state = self.state.lock().await;

        if state.head.is_empty() || state.forefront_dirty {
            state.forefront_dirty = false;
            let locked = self
                .client
                .list_and_lock_head(HEAD_PREFETCH_LIMIT, REQUEST_LOCK_SECS)
                .await?;
            // Forefront arrivals are spliced ahead of the cached head;
            // everything else keeps FIFO order behind it.
            let mut front = Vec::new();
            for request in locked {
                let already_known = state.in_progress.contains(&request.id)
                    || state.head.iter().any(|cached| cached.id == request.id);
                if already_known {
                    continue;
                }
                if state.recent_forefront.remove(&request.id) {
                    front.push(request);
                } else {
                    state.head.push_back(request);
                }
            }
            for request in front.into_iter().rev() {
                state.head.push_front(request);
            }
            state.recent_forefront.clear();
        }

        match state.head.pop_front() {
            Some(request) => {
                state.in_progress.insert(request.id.clone());
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// Terminal success/failure transition for a fetched request.
    pub async fn mark_request_handled(&self, request: &Request) -> Result<(), StorageError> {
        self.client.mark_request_handled(request).await?;
        self.state.lock().await.in_progress.remove(&request.id);
        Ok(())
    }

    /// Return a fetched request to the pending side (retry path).
    pub async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<(), StorageError> {
        self.client.reclaim_request(request, forefront).await?;
        let mut state = self.state.lock().await;
        state.in_progress.remove(&request.id);
        if forefront {
            state.forefront_dirty = true;
            state.recent_forefront.insert(request.id.clone());
        }
        Ok(())
    }

    /// Extend the lease on an in-progress request.
    pub async fn prolong_request_lock(
        &self,
        id: &str,
        lock_secs: u64,
    ) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
        self.client.prolong_request_lock(id, lock_secs, false).await
    }

    /// True when nothing is currently eligible for fetching
    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        let state = self.state.lock().await;
        if !state.head.is_empty() {
            return Ok(false);
        }
        let stats = self.client.stats().await?;
        Ok(stats.pending_request_count as usize <= state.in_progress.len())
    }

    /// True when every request is handled and none is in flight
    pub async fn is_finished(&self) -> Result<bool, StorageError> {
        let state = self.state.lock().await;
        if !state.head.is_empty() || !state.in_progress.is_empty() {
            return Ok(false);
        }
        let stats = self.client.stats().await?;
        Ok(stats.pending_request_count == 0)
    }

    pub async fn stats(&self) -> Result<QueueStats, StorageError> {
        self.client.stats().await
    }

    /// Number of requests currently held by workers
    pub async fn in_progress_count(&self) -> usize {
        self.state.lock().await.in_progress.len()
    }
}
