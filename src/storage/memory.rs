//! In-memory storage backend with optional JSON-file mirroring
//!
//! The default backend for single-process crawls. Every entity lives in
//! memory; when built with persistence, each mutation is mirrored to
//! `<storage_dir>/<collection>/<name>/` through the background writer.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Configuration;
use crate::request::Request;

use super::fs::{BackgroundWriter, WriteJob};
use super::{
    AddRequestResult, DatasetClient, KeyValueRecord, KeyValueStoreClient, ListKeysOptions,
    QueueStats, RequestQueueClient, StorageClient, StorageError,
};

const DEFAULT_ENTITY_NAME: &str = "default";

#[derive(Clone)]
struct Persistence {
    writer: BackgroundWriter,
    root: PathBuf,
}

impl Persistence {
    fn entity_dir(&self, collection: &str, name: &str) -> PathBuf {
        self.root.join(collection).join(name)
    }
}

/// Replace filename-hostile characters in record keys
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Process-local storage backend.
///
/// Entity lookup is lock-free; each entity serializes its own mutations
/// internally.
pub struct MemoryStorage {
    queues: DashMap<String, Arc<MemoryRequestQueue>>,
    stores: DashMap<String, Arc<MemoryKeyValueStore>>,
    datasets: DashMap<String, Arc<MemoryDataset>>,
    rate_limit_errors: AtomicU64,
    persistence: Option<Persistence>,
}

impl MemoryStorage {
    /// Purely in-memory backend (tests, ephemeral crawls)
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            stores: DashMap::new(),
            datasets: DashMap::new(),
            rate_limit_errors: AtomicU64::new(0),
            persistence: None,
        }
    }

    /// Backend mirroring every entity under `root`
    #[must_use]
    pub fn with_persistence(root: PathBuf) -> Self {
        let mut storage = Self::new();
        storage.persistence = Some(Persistence { writer: BackgroundWriter::start(), root });
        storage
    }

    /// Backend configured per `persist_storage` / `storage_dir`
    #[must_use]
    pub fn from_config(config: &Configuration) -> Self {
        if config.persist_storage() {
            Self::with_persistence(config.storage_dir().clone())
        } else {
            Self::new()
        }
    }

    /// Wait for all queued disk writes to land
    pub async fn flush_writes(&self) {
        if let Some(p) = &self.persistence {
            p.writer.flush().await;
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn open_request_queue(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn RequestQueueClient>, StorageError> {
        let name = name.unwrap_or(DEFAULT_ENTITY_NAME).to_string();
        let queue = Arc::clone(
            self.queues
                .entry(name.clone())
                .or_insert_with(|| {
                    Arc::new(MemoryRequestQueue::new(name, self.persistence.clone()))
                })
                .value(),
        );
        Ok(queue)
    }

    async fn open_key_value_store(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn KeyValueStoreClient>, StorageError> {
        let name = name.unwrap_or(DEFAULT_ENTITY_NAME).to_string();
        let store = Arc::clone(
            self.stores
                .entry(name.clone())
                .or_insert_with(|| {
                    Arc::new(MemoryKeyValueStore::new(name, self.persistence.clone()))
                })
                .value(),
        );
        Ok(store)
    }

    async fn open_dataset(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn DatasetClient>, StorageError> {
        let name = name.unwrap_or(DEFAULT_ENTITY_NAME).to_string();
        let dataset = Arc::clone(
            self.datasets
                .entry(name.clone())
                .or_insert_with(|| Arc::new(MemoryDataset::new(name, self.persistence.clone())))
                .value(),
        );
        Ok(dataset)
    }

    async fn purge(&self) -> Result<(), StorageError> {
        self.queues.remove(DEFAULT_ENTITY_NAME);
        self.stores.remove(DEFAULT_ENTITY_NAME);
        self.datasets.remove(DEFAULT_ENTITY_NAME);

        if let Some(p) = &self.persistence {
            for collection in ["request_queues", "key_value_stores", "datasets"] {
                p.writer.submit(WriteJob::DeleteDir {
                    path: p.entity_dir(collection, DEFAULT_ENTITY_NAME),
                });
            }
        }
        log::debug!("Purged default storages");
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.flush_writes().await;
        Ok(())
    }

    fn rate_limit_error_count(&self) -> u64 {
        self.rate_limit_errors.load(Ordering::SeqCst)
    }

    fn record_rate_limit_error(&self) {
        self.rate_limit_errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// One queue entry as stored (and mirrored to disk).
///
/// `order_no` semantics: `None` = handled; positive = FIFO pending;
/// negative = forefront pending; `abs(order_no) > now` = leased until
/// that wall-clock millisecond.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    order_no: Option<i64>,
    request: Request,
}

impl QueueEntry {
    fn is_handled(&self) -> bool {
        self.order_no.is_none()
    }

    fn is_locked(&self, now: i64) -> bool {
        self.order_no.is_some_and(|n| n.abs() > now)
    }
}

#[derive(Debug, Serialize)]
struct QueueMetadata<'a> {
    name: &'a str,
    #[serde(flatten)]
    stats: QueueStats,
}

struct QueueInner {
    entries: HashMap<String, QueueEntry>,
    /// LIFO list of forefront ids, drained before any FIFO entry
    forefront_ids: VecDeque<String>,
    pending_count: u64,
    handled_count: u64,
    /// Monotonic order source; tracks wall clock but never repeats
    last_order_no: i64,
}

impl QueueInner {
    fn next_order_no(&mut self) -> i64 {
        let candidate = now_millis();
        self.last_order_no = candidate.max(self.last_order_no + 1);
        self.last_order_no
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            pending_request_count: self.pending_count,
            handled_request_count: self.handled_count,
            total_request_count: self.entries.len() as u64,
        }
    }

    fn remove_from_forefront(&mut self, id: &str) {
        self.forefront_ids.retain(|existing| existing != id);
    }

    fn promote_to_forefront(&mut self, id: &str) {
        if !self.forefront_ids.iter().any(|existing| existing == id) {
            self.forefront_ids.push_front(id.to_string());
        }
    }
}

/// In-memory request queue with lease locks and forefront insertion.
pub struct MemoryRequestQueue {
    name: String,
    inner: Mutex<QueueInner>,
    persistence: Option<Persistence>,
}

impl MemoryRequestQueue {
    fn new(name: String, persistence: Option<Persistence>) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner {
                entries: HashMap::new(),
                forefront_ids: VecDeque::new(),
                pending_count: 0,
                handled_count: 0,
                last_order_no: 0,
            }),
            persistence,
        }
    }

    fn persist_entry(&self, entry: &QueueEntry) {
        if let Some(p) = &self.persistence {
            let path = p
                .entity_dir("request_queues", &self.name)
                .join(format!("{}.json", entry.request.id));
            p.writer.submit_json(path, entry);
        }
    }

    fn persist_metadata(&self, inner: &QueueInner) {
        if let Some(p) = &self.persistence {
            let path = p
                .entity_dir("request_queues", &self.name)
                .join("__metadata__.json");
            p.writer.submit_json(path, &QueueMetadata { name: &self.name, stats: inner.stats() });
        }
    }

    fn persist_delete(&self, id: &str) {
        if let Some(p) = &self.persistence {
            p.writer.submit(WriteJob::Delete {
                path: p
                    .entity_dir("request_queues", &self.name)
                    .join(format!("{id}.json")),
            });
        }
    }
}

#[async_trait]
impl RequestQueueClient for MemoryRequestQueue {
    async fn add_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<AddRequestResult, StorageError> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.entries.get(&request.id) {
            return Ok(AddRequestResult {
                request_id: request.id.clone(),
                was_already_present: true,
                was_already_handled: existing.is_handled(),
            });
        }

        let order = inner.next_order_no();
        let order_no = if forefront { -order } else { order };
        if forefront {
            inner.promote_to_forefront(&request.id);
        }

        let entry = QueueEntry { order_no: Some(order_no), request: request.clone() };
        self.persist_entry(&entry);
        inner.entries.insert(request.id.clone(), entry);
        inner.pending_count += 1;
        self.persist_metadata(&inner);

        Ok(AddRequestResult {
            request_id: request.id.clone(),
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn batch_add_requests(
        &self,
        requests: &[Request],
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.add_request(request, forefront).await?);
        }
        Ok(results)
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(id).map(|entry| entry.request.clone()))
    }

    async fn update_request(&self, request: &Request) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(&request.id)
            .ok_or_else(|| StorageError::RequestNotFound { id: request.id.clone() })?;
        entry.request = request.clone();
        let entry = entry.clone();
        self.persist_entry(&entry);
        Ok(())
    }

    async fn delete_request(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.remove(id) {
            if entry.is_handled() {
                inner.handled_count = inner.handled_count.saturating_sub(1);
            } else {
                inner.pending_count = inner.pending_count.saturating_sub(1);
            }
            inner.remove_from_forefront(id);
            self.persist_delete(id);
            self.persist_metadata(&inner);
        }
        Ok(())
    }

    async fn list_and_lock_head(
        &self,
        limit: usize,
        lock_secs: u64,
    ) -> Result<Vec<Request>, StorageError> {
        let mut inner = self.inner.lock().await;
        let now = now_millis();
        let lock_until = now + (lock_secs as i64) * 1000;
        let mut head: Vec<Request> = Vec::new();

        // forefront first, most recent insertion first
        let forefront_snapshot: Vec<String> = inner.forefront_ids.iter().cloned().collect();
        for id in forefront_snapshot {
            if head.len() >= limit {
                break;
            }
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            let eligible = matches!(entry.order_no, Some(n) if n < 0 && n.abs() <= now);
            if eligible {
                entry.order_no = Some(-lock_until);
                head.push(entry.request.clone());
                let entry = entry.clone();
                self.persist_entry(&entry);
            }
        }

        // then FIFO in ascending insertion order
        if head.len() < limit {
            let mut eligible: Vec<(i64, String)> = inner
                .entries
                .iter()
                .filter_map(|(id, entry)| match entry.order_no {
                    Some(n) if n > 0 && n <= now => Some((n, id.clone())),
                    _ => None,
                })
                .collect();
            eligible.sort();

            for (_, id) in eligible {
                if head.len() >= limit {
                    break;
                }
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.order_no = Some(lock_until);
                    head.push(entry.request.clone());
                    let entry = entry.clone();
                    self.persist_entry(&entry);
                }
            }
        }

        Ok(head)
    }

    async fn prolong_request_lock(
        &self,
        id: &str,
        lock_secs: u64,
        forefront: bool,
    ) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
        let mut inner = self.inner.lock().await;
        let now = now_millis();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| StorageError::RequestNotFound { id: id.to_string() })?;

        let Some(order_no) = entry.order_no else {
            return Err(StorageError::LockViolation {
                id: id.to_string(),
                reason: "request is already handled".to_string(),
            });
        };
        if order_no.abs() <= now {
            return Err(StorageError::LockViolation {
                id: id.to_string(),
                reason: "request is not locked".to_string(),
            });
        }

        // leases only ever extend
        let new_abs = order_no.abs() + (lock_secs as i64) * 1000;
        let negative = forefront || order_no < 0;
        entry.order_no = Some(if negative { -new_abs } else { new_abs });
        let entry = entry.clone();
        self.persist_entry(&entry);
        if forefront {
            inner.promote_to_forefront(id);
        }

        Ok(chrono::DateTime::from_timestamp_millis(new_abs)
            .unwrap_or_else(chrono::Utc::now))
    }

    async fn delete_request_lock(&self, id: &str, forefront: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let now = now_millis();
        let Some(entry) = inner.entries.get(id) else {
            return Err(StorageError::RequestNotFound { id: id.to_string() });
        };
        let Some(order_no) = entry.order_no else {
            return Err(StorageError::LockViolation {
                id: id.to_string(),
                reason: "request is already handled".to_string(),
            });
        };
        if order_no.abs() <= now {
            return Err(StorageError::LockViolation {
                id: id.to_string(),
                reason: "request is not locked".to_string(),
            });
        }

        let fresh = inner.next_order_no();
        let entry = inner
            .entries
            .get_mut(id)
            .expect("entry presence checked above");
        entry.order_no = Some(if forefront { -fresh } else { fresh });
        let entry = entry.clone();
        self.persist_entry(&entry);
        if forefront {
            inner.promote_to_forefront(id);
        } else {
            inner.remove_from_forefront(id);
        }
        Ok(())
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(&request.id)
            .ok_or_else(|| StorageError::RequestNotFound { id: request.id.clone() })?;

        let was_pending = !entry.is_handled();
        entry.request = request.clone();
        entry.order_no = None;
        let entry = entry.clone();
        self.persist_entry(&entry);

        if was_pending {
            inner.pending_count = inner.pending_count.saturating_sub(1);
            inner.handled_count += 1;
        }
        inner.remove_from_forefront(&request.id);
        self.persist_metadata(&inner);
        Ok(())
    }

    async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(&request.id) {
            return Err(StorageError::RequestNotFound { id: request.id.clone() });
        }
        if inner
            .entries
            .get(&request.id)
            .is_some_and(QueueEntry::is_handled)
        {
            return Err(StorageError::LockViolation {
                id: request.id.clone(),
                reason: "cannot reclaim a handled request".to_string(),
            });
        }

        let fresh = inner.next_order_no();
        let entry = inner
            .entries
            .get_mut(&request.id)
            .expect("entry presence checked above");
        entry.request = request.clone();
        entry.order_no = Some(if forefront { -fresh } else { fresh });
        let entry = entry.clone();
        self.persist_entry(&entry);
        if forefront {
            inner.promote_to_forefront(&request.id);
        } else {
            inner.remove_from_forefront(&request.id);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.stats())
    }
}

/// In-memory key-value store.
pub struct MemoryKeyValueStore {
    name: String,
    records: Mutex<HashMap<String, KeyValueRecord>>,
    persistence: Option<Persistence>,
}

impl MemoryKeyValueStore {
    fn new(name: String, persistence: Option<Persistence>) -> Self {
        Self { name, records: Mutex::new(HashMap::new()), persistence }
    }

    fn record_path(&self, p: &Persistence, key: &str) -> PathBuf {
        p.entity_dir("key_value_stores", &self.name)
            .join(format!("{}.json", sanitize_key(key)))
    }
}

#[async_trait]
impl KeyValueStoreClient for MemoryKeyValueStore {
    async fn get_record(&self, key: &str) -> Result<Option<KeyValueRecord>, StorageError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set_record(&self, record: KeyValueRecord) -> Result<(), StorageError> {
        if let Some(p) = &self.persistence {
            p.writer.submit_json(self.record_path(p, &record.key), &record);
        }
        self.records.lock().await.insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<(), StorageError> {
        self.records.lock().await.remove(key);
        if let Some(p) = &self.persistence {
            p.writer.submit(WriteJob::Delete { path: self.record_path(p, key) });
        }
        Ok(())
    }

    async fn record_exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.records.lock().await.contains_key(key))
    }

    async fn list_keys(&self, options: ListKeysOptions) -> Result<Vec<String>, StorageError> {
        let records = self.records.lock().await;
        let mut keys: Vec<String> = records
            .keys()
            .filter(|key| {
                options
                    .prefix
                    .as_ref()
                    .is_none_or(|prefix| key.starts_with(prefix.as_str()))
            })
            .cloned()
            .collect();
        keys.sort();

        if let Some(start) = &options.exclusive_start_key {
            keys.retain(|key| key.as_str() > start.as_str());
        }
        if let Some(limit) = options.limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }
}

/// In-memory dataset.
pub struct MemoryDataset {
    name: String,
    items: Mutex<Vec<serde_json::Value>>,
    persistence: Option<Persistence>,
}

impl MemoryDataset {
    fn new(name: String, persistence: Option<Persistence>) -> Self {
        Self { name, items: Mutex::new(Vec::new()), persistence }
    }
}

#[async_trait]
impl DatasetClient for MemoryDataset {
    async fn push_data(&self, new_items: Vec<serde_json::Value>) -> Result<(), StorageError> {
        let mut items = self.items.lock().await;
        for item in new_items {
            if let Some(p) = &self.persistence {
                let path = p
                    .entity_dir("datasets", &self.name)
                    .join(format!("{:08}.json", items.len() + 1));
                p.writer.submit_json(path, &item);
            }
            items.push(item);
        }
        Ok(())
    }

    async fn get_data(
        &self,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<serde_json::Value>, StorageError> {
        let items = self.items.lock().await;
        let slice: Vec<serde_json::Value> = items
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(slice)
    }

    async fn item_count(&self) -> Result<usize, StorageError> {
        Ok(self.items.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_queue(storage: &MemoryStorage) -> Arc<dyn RequestQueueClient> {
        storage
            .open_request_queue(None)
            .await
            .expect("queue opens")
    }

    fn request(url: &str) -> Request {
        Request::new(url).expect("valid request")
    }

    #[tokio::test]
    async fn test_add_request_is_idempotent() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        let req = request("http://a/1");

        let first = queue.add_request(&req, false).await.expect("add succeeds");
        assert!(!first.was_already_present);

        let second = queue.add_request(&req, false).await.expect("add succeeds");
        assert!(second.was_already_present);
        assert!(!second.was_already_handled);

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.pending_request_count, 1);
        assert_eq!(stats.total_request_count, 1);
    }

    #[tokio::test]
    async fn test_fifo_order_and_locking() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        let first = request("http://a/1");
        let second = request("http://a/2");
        queue.add_request(&first, false).await.expect("add");
        queue.add_request(&second, false).await.expect("add");

        let head = queue.list_and_lock_head(10, 60).await.expect("lock head");
        assert_eq!(head.len(), 2);
        assert_eq!(head[0].url, "http://a/1");
        assert_eq!(head[1].url, "http://a/2");

        // everything is now locked; a second call returns nothing
        let empty = queue.list_and_lock_head(10, 60).await.expect("lock head");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_forefront_drains_before_fifo_in_lifo_order() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        queue.add_request(&request("http://a/fifo"), false).await.expect("add");
        queue.add_request(&request("http://a/front-1"), true).await.expect("add");
        queue.add_request(&request("http://a/front-2"), true).await.expect("add");

        let head = queue.list_and_lock_head(10, 60).await.expect("lock head");
        let urls: Vec<&str> = head.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["http://a/front-2", "http://a/front-1", "http://a/fifo"]);
    }

    #[tokio::test]
    async fn test_mark_handled_updates_counts() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        let req = request("http://a/1");
        queue.add_request(&req, false).await.expect("add");
        let locked = queue.list_and_lock_head(1, 60).await.expect("lock head");

        let mut handled = locked[0].clone();
        handled.handled_at = Some(chrono::Utc::now());
        queue.mark_request_handled(&handled).await.expect("mark handled");

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.pending_request_count, 0);
        assert_eq!(stats.handled_request_count, 1);
        assert_eq!(stats.total_request_count, 1);

        // adding again reports the handled state
        let result = queue.add_request(&req, false).await.expect("add");
        assert!(result.was_already_present);
        assert!(result.was_already_handled);
    }

    #[tokio::test]
    async fn test_prolong_extends_and_delete_lock_releases() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        let req = request("http://a/1");
        queue.add_request(&req, false).await.expect("add");
        queue.list_and_lock_head(1, 1).await.expect("lock head");

        let expiry = queue
            .prolong_request_lock(&req.id, 60, false)
            .await
            .expect("prolong succeeds");
        assert!(expiry > chrono::Utc::now() + chrono::Duration::seconds(50));

        queue
            .delete_request_lock(&req.id, false)
            .await
            .expect("release succeeds");

        // released entry is immediately eligible again
        let head = queue.list_and_lock_head(1, 60).await.expect("lock head");
        assert_eq!(head.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_operations_reject_unlocked_and_handled_entries() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        let req = request("http://a/1");
        queue.add_request(&req, false).await.expect("add");

        // not locked yet
        assert!(matches!(
            queue.prolong_request_lock(&req.id, 10, false).await,
            Err(StorageError::LockViolation { .. })
        ));
        assert!(matches!(
            queue.delete_request_lock(&req.id, false).await,
            Err(StorageError::LockViolation { .. })
        ));

        let locked = queue.list_and_lock_head(1, 60).await.expect("lock head");
        let mut handled = locked[0].clone();
        handled.handled_at = Some(chrono::Utc::now());
        queue.mark_request_handled(&handled).await.expect("mark handled");

        assert!(matches!(
            queue.prolong_request_lock(&req.id, 10, false).await,
            Err(StorageError::LockViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_reclaim_respects_forefront() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        let first = request("http://a/1");
        let second = request("http://a/2");
        queue.add_request(&first, false).await.expect("add");
        queue.add_request(&second, false).await.expect("add");

        let head = queue.list_and_lock_head(1, 60).await.expect("lock head");
        assert_eq!(head[0].url, "http://a/1");

        // reclaimed to the forefront, it must overtake http://a/2
        queue.reclaim_request(&head[0], true).await.expect("reclaim");
        let head = queue.list_and_lock_head(1, 60).await.expect("lock head");
        assert_eq!(head[0].url, "http://a/1");
    }

    #[tokio::test]
    async fn test_kvs_round_trip_and_listing() {
        let storage = MemoryStorage::new();
        let store = storage.open_key_value_store(None).await.expect("store opens");

        store
            .set_record(KeyValueRecord {
                key: "STATE_B".to_string(),
                value: serde_json::json!({"n": 2}),
                content_type: Some("application/json".to_string()),
            })
            .await
            .expect("set");
        store
            .set_record(KeyValueRecord {
                key: "STATE_A".to_string(),
                value: serde_json::json!({"n": 1}),
                content_type: None,
            })
            .await
            .expect("set");

        assert!(store.record_exists("STATE_A").await.expect("exists"));
        let record = store.get_record("STATE_B").await.expect("get").expect("present");
        assert_eq!(record.value["n"], 2);

        let keys = store
            .list_keys(ListKeysOptions { prefix: Some("STATE_".to_string()), ..Default::default() })
            .await
            .expect("list");
        assert_eq!(keys, vec!["STATE_A", "STATE_B"]);

        let after = store
            .list_keys(ListKeysOptions {
                exclusive_start_key: Some("STATE_A".to_string()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(after, vec!["STATE_B"]);

        store.delete_record("STATE_A").await.expect("delete");
        assert!(!store.record_exists("STATE_A").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_dataset_preserves_push_order() {
        let storage = MemoryStorage::new();
        let dataset = storage.open_dataset(None).await.expect("dataset opens");
        dataset
            .push_data(vec![serde_json::json!("a"), serde_json::json!("b")])
            .await
            .expect("push");
        dataset.push_data(vec![serde_json::json!("c")]).await.expect("push");

        assert_eq!(dataset.item_count().await.expect("count"), 3);
        let items = dataset.get_data(0, None).await.expect("get");
        assert_eq!(items, vec![
            serde_json::json!("a"),
            serde_json::json!("b"),
            serde_json::json!("c")
        ]);
    }

    #[tokio::test]
    async fn test_persistence_writes_entity_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = MemoryStorage::with_persistence(dir.path().to_path_buf());
        let queue = open_queue(&storage).await;
        let req = request("http://a/1");
        queue.add_request(&req, false).await.expect("add");
        storage.flush_writes().await;

        let entry_path = dir
            .path()
            .join("request_queues/default")
            .join(format!("{}.json", req.id));
        assert!(entry_path.exists(), "entry file should exist");
        assert!(
            dir.path()
                .join("request_queues/default/__metadata__.json")
                .exists(),
            "metadata sidecar should exist"
        );
    }

    #[tokio::test]
    async fn test_purge_clears_default_entities() {
        let storage = MemoryStorage::new();
        let queue = open_queue(&storage).await;
        queue.add_request(&request("http://a/1"), false).await.expect("add");
        storage.purge().await.expect("purge");

        let queue = open_queue(&storage).await;
        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.total_request_count, 0);
    }
}
