//! Bounded pool of crawling sessions
//!
//! Hands out sessions for requests, creating them lazily up to
//! `max_pool_size`, rotating uniformly at random among usable ones, and
//! dropping retired ones. Pool state is persisted to the key-value store
//! on every `PersistState` tick and restored on initialization.

use std::sync::{Arc, Weak};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::events::{EventBus, EventKind, ListenerId};
use crate::storage::{KeyValueRecord, KeyValueStoreClient, StorageError};

use super::{Session, SessionOptions, SessionState};

/// Key-value store key the pool state lives under
pub const SESSION_POOL_STATE_KEY: &str = "SESSION_POOL_STATE";

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct SessionPoolOptions {
    /// Ceiling on concurrently tracked sessions
    pub max_pool_size: usize,
    /// Options applied to newly created sessions
    pub session_options: SessionOptions,
    /// Key-value store key for persistence
    pub persist_state_key: String,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            session_options: SessionOptions::default(),
            persist_state_key: SESSION_POOL_STATE_KEY.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPoolState {
    sessions: Vec<SessionState>,
}

/// Bounded collection of `Session` identities.
pub struct SessionPool {
    options: SessionPoolOptions,
    sessions: Mutex<Vec<Arc<Session>>>,
    kvs: Option<Arc<dyn KeyValueStoreClient>>,
    bus: Option<Arc<EventBus>>,
    persist_listener: parking_lot::Mutex<Option<ListenerId>>,
}

impl SessionPool {
    #[must_use]
    pub fn new(
        options: SessionPoolOptions,
        kvs: Option<Arc<dyn KeyValueStoreClient>>,
        bus: Option<Arc<EventBus>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            sessions: Mutex::new(Vec::new()),
            kvs,
            bus,
            persist_listener: parking_lot::Mutex::new(None),
        })
    }

    /// Restore persisted sessions and hook persistence onto the event bus.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), StorageError> {
        self.restore().await?;

        if let Some(bus) = &self.bus {
            let weak: Weak<SessionPool> = Arc::downgrade(self);
            let id = bus.on(
                EventKind::PersistState,
                Arc::new(move |_event| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(pool) = weak.upgrade()
                            && let Err(e) = pool.persist_state().await
                        {
                            log::warn!("Session pool persistence failed: {e}");
                        }
                    })
                }),
            );
            *self.persist_listener.lock() = Some(id);
        }
        Ok(())
    }

    /// Detach from the event bus and persist one final time.
    pub async fn teardown(&self) {
        if let (Some(bus), Some(id)) = (&self.bus, self.persist_listener.lock().take()) {
            bus.off(id);
        }
        if let Err(e) = self.persist_state().await {
            log::warn!("Final session pool persistence failed: {e}");
        }
    }

    /// Get a session for the next request.
    ///
    /// Creates a new session while the pool is under capacity; otherwise
    /// picks uniformly at random among usable sessions. When nothing is
    /// usable at capacity, the oldest unusable entry is evicted to make
    /// room for a fresh one.
    pub async fn get_session(&self) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|session| !session.is_retired());

        let session = if sessions.len() < self.options.max_pool_size {
            let session = Arc::new(Session::new(&self.options.session_options, self.bus.clone()));
            log::debug!("Session pool created session {} ({} total)", session.id(), sessions.len() + 1);
            sessions.push(Arc::clone(&session));
            session
        } else {
            let usable: Vec<usize> = sessions
                .iter()
                .enumerate()
                .filter(|(_, session)| session.is_usable())
                .map(|(index, _)| index)
                .collect();

            if usable.is_empty() {
                // evict the oldest entry to make room
                let oldest = sessions
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, session)| session.created_at())
                    .map(|(index, _)| index);
                if let Some(index) = oldest {
                    let evicted = sessions.remove(index);
                    log::debug!("Session pool evicted exhausted session {}", evicted.id());
                }
                let session =
                    Arc::new(Session::new(&self.options.session_options, self.bus.clone()));
                sessions.push(Arc::clone(&session));
                session
            } else {
                let pick = usable[rand::rng().random_range(0..usable.len())];
                Arc::clone(&sessions[pick])
            }
        };

        session.increment_usage();
        session
    }

    /// Get a specific session when it is still usable, else a rotation.
    pub async fn get_session_by_id(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .find(|session| session.id() == id && session.is_usable())
            .cloned()
            .inspect(|session| session.increment_usage())
    }

    /// Serialize all non-retired sessions to the key-value store.
    pub async fn persist_state(&self) -> Result<(), StorageError> {
        let Some(kvs) = &self.kvs else {
            return Ok(());
        };
        let states: Vec<SessionState> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|session| !session.is_retired())
                .map(|session| session.state())
                .collect()
        };
        let count = states.len();
        kvs.set_record(KeyValueRecord {
            key: self.options.persist_state_key.clone(),
            value: serde_json::to_value(PersistedPoolState { sessions: states })?,
            content_type: Some("application/json".to_string()),
        })
        .await?;
        log::trace!("Persisted {count} session(s)");
        Ok(())
    }

    async fn restore(&self) -> Result<(), StorageError> {
        let Some(kvs) = &self.kvs else {
            return Ok(());
        };
        let Some(record) = kvs.get_record(&self.options.persist_state_key).await? else {
            return Ok(());
        };
        let state: PersistedPoolState = match serde_json::from_value(record.value) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Discarding unreadable session pool state: {e}");
                return Ok(());
            }
        };

        let now = chrono::Utc::now();
        let mut sessions = self.sessions.lock().await;
        let mut restored = 0usize;
        for session_state in state.sessions {
            if session_state.expires_at <= now {
                continue;
            }
            sessions.push(Arc::new(Session::from_state(session_state, self.bus.clone())));
            restored += 1;
            if sessions.len() >= self.options.max_pool_size {
                break;
            }
        }
        if restored > 0 {
            log::info!("Restored {restored} session(s) from previous run");
        }
        Ok(())
    }

    /// Sessions currently tracked (usable or not, excluding retired)
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.iter().filter(|s| !s.is_retired()).count()
    }

    /// Sessions currently usable
    pub async fn usable_session_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.iter().filter(|s| s.is_usable()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::StorageClient;

    fn pool_options(max: usize) -> SessionPoolOptions {
        SessionPoolOptions { max_pool_size: max, ..Default::default() }
    }

    #[tokio::test]
    async fn test_creates_lazily_up_to_capacity() {
        let pool = SessionPool::new(pool_options(3), None, None);
        let a = pool.get_session().await;
        let b = pool.get_session().await;
        let c = pool.get_session().await;
        assert_eq!(pool.session_count().await, 3);

        // distinct identities while under capacity
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());

        // at capacity, an existing session is reused
        let d = pool.get_session().await;
        assert_eq!(pool.session_count().await, 3);
        assert!([a.id(), b.id(), c.id()].contains(&d.id()));
    }

    #[tokio::test]
    async fn test_usage_counted_per_handout() {
        let pool = SessionPool::new(pool_options(1), None, None);
        let first = pool.get_session().await;
        assert_eq!(first.usage_count(), 1);
        let second = pool.get_session().await;
        assert_eq!(second.id(), first.id());
        assert_eq!(first.usage_count(), 2);
    }

    #[tokio::test]
    async fn test_retired_sessions_are_never_reoffered() {
        let pool = SessionPool::new(pool_options(2), None, None);
        let first = pool.get_session().await;
        first.retire();

        for _ in 0..10 {
            let session = pool.get_session().await;
            assert_ne!(session.id(), first.id());
        }
    }

    #[tokio::test]
    async fn test_eviction_when_everything_is_exhausted() {
        let options = SessionPoolOptions {
            max_pool_size: 1,
            session_options: SessionOptions { max_usage_count: 1, ..Default::default() },
            ..Default::default()
        };
        let pool = SessionPool::new(options, None, None);
        let first = pool.get_session().await;
        assert!(!first.is_usable());

        // pool is full of unusable sessions; a fresh one is created
        let second = pool.get_session().await;
        assert_ne!(second.id(), first.id());
        assert_eq!(pool.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_persist_and_restore_round_trip() {
        let storage = MemoryStorage::new();
        let kvs = storage.open_key_value_store(None).await.expect("kvs opens");

        let pool = SessionPool::new(pool_options(10), Some(Arc::clone(&kvs)), None);
        let session = pool.get_session().await;
        session.store_response_cookies("https://example.com/", &["sid=1".to_string()]);
        let session_id = session.id().to_string();
        pool.persist_state().await.expect("persist succeeds");

        let restored = SessionPool::new(pool_options(10), Some(kvs), None);
        restored.initialize().await.expect("initialize succeeds");
        assert_eq!(restored.session_count().await, 1);
        let back = restored
            .get_session_by_id(&session_id)
            .await
            .expect("restored session is usable");
        assert!(back.cookie_header_for("https://example.com/").is_some());
    }

    #[tokio::test]
    async fn test_retired_sessions_are_not_persisted() {
        let storage = MemoryStorage::new();
        let kvs = storage.open_key_value_store(None).await.expect("kvs opens");

        let pool = SessionPool::new(pool_options(10), Some(Arc::clone(&kvs)), None);
        let keep = pool.get_session().await;
        let drop = pool.get_session().await;
        drop.retire();
        pool.persist_state().await.expect("persist succeeds");

        let restored = SessionPool::new(pool_options(10), Some(kvs), None);
        restored.initialize().await.expect("initialize succeeds");
        assert_eq!(restored.session_count().await, 1);
        assert!(restored.get_session_by_id(keep.id()).await.is_some());
    }
}
