//! Anti-detection identities
//!
//! A `Session` bundles cookie state, usage accounting and an error score.
//! Sessions are handed out by the `SessionPool`; once a session crosses
//! any of its limits it is retired and never offered again.

pub mod cookies;
pub mod pool;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventBus};
use crate::proxy::ProxyInfo;

pub use cookies::{Cookie, CookieJar};
pub use pool::{SessionPool, SessionPoolOptions};

/// Amount `mark_good` subtracts from the error score
const ERROR_SCORE_DECREMENT: f64 = 0.5;

/// Tunables for newly created sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Uses before the session stops being offered
    pub max_usage_count: u32,
    /// Error score at which the session is retired
    pub max_error_score: f64,
    /// Lifetime from creation to expiry
    pub max_age_secs: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_usage_count: 50,
            max_error_score: 3.0,
            max_age_secs: 3000,
        }
    }
}

/// Serializable snapshot of a session, used by pool persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub cookie_jar: CookieJar,
    pub user_data: serde_json::Map<String, serde_json::Value>,
    pub usage_count: u32,
    pub max_usage_count: u32,
    pub error_score: f64,
    pub max_error_score: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub proxy_info: Option<ProxyInfo>,
}

struct SessionInner {
    cookie_jar: CookieJar,
    user_data: serde_json::Map<String, serde_json::Value>,
    usage_count: u32,
    error_score: f64,
    retired: bool,
    proxy_info: Option<ProxyInfo>,
}

/// One crawling identity.
///
/// All mutation goes through short `parking_lot` critical sections, so a
/// session can be shared between the pool and an in-flight request.
pub struct Session {
    id: String,
    max_usage_count: u32,
    max_error_score: f64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    inner: parking_lot::Mutex<SessionInner>,
    /// Bus for `SessionRetired` emissions; absent in detached tests
    bus: Option<Arc<EventBus>>,
}

fn random_session_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

impl Session {
    #[must_use]
    pub fn new(options: &SessionOptions, bus: Option<Arc<EventBus>>) -> Self {
        let created_at = Utc::now();
        Self {
            id: random_session_id(),
            max_usage_count: options.max_usage_count,
            max_error_score: options.max_error_score,
            created_at,
            expires_at: created_at + chrono::Duration::seconds(options.max_age_secs as i64),
            inner: parking_lot::Mutex::new(SessionInner {
                cookie_jar: CookieJar::new(),
                user_data: serde_json::Map::new(),
                usage_count: 0,
                error_score: 0.0,
                retired: false,
                proxy_info: None,
            }),
            bus,
        }
    }

    /// Rebuild a session from persisted state.
    #[must_use]
    pub fn from_state(state: SessionState, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            id: state.id,
            max_usage_count: state.max_usage_count,
            max_error_score: state.max_error_score,
            created_at: state.created_at,
            expires_at: state.expires_at,
            inner: parking_lot::Mutex::new(SessionInner {
                cookie_jar: state.cookie_jar,
                user_data: state.user_data,
                usage_count: state.usage_count,
                error_score: state.error_score,
                retired: false,
                proxy_info: state.proxy_info,
            }),
            bus,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn usage_count(&self) -> u32 {
        self.inner.lock().usage_count
    }

    #[must_use]
    pub fn error_score(&self) -> f64 {
        self.inner.lock().error_score
    }

    #[must_use]
    pub fn proxy_info(&self) -> Option<ProxyInfo> {
        self.inner.lock().proxy_info.clone()
    }

    pub fn set_proxy_info(&self, proxy_info: Option<ProxyInfo>) {
        self.inner.lock().proxy_info = proxy_info;
    }

    /// Usable = under the usage cap, under the error cap, unexpired, and
    /// not retired
    #[must_use]
    pub fn is_usable(&self) -> bool {
        let inner = self.inner.lock();
        !inner.retired
            && inner.usage_count < self.max_usage_count
            && inner.error_score < self.max_error_score
            && Utc::now() < self.expires_at
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }

    /// Record one handout to a request
    pub fn increment_usage(&self) {
        self.inner.lock().usage_count += 1;
    }

    /// Decay the error score after a successful request
    pub fn mark_good(&self) {
        let mut inner = self.inner.lock();
        inner.error_score = (inner.error_score - ERROR_SCORE_DECREMENT).max(0.0);
    }

    /// Record a failure; retires the session once the score reaches the
    /// cap
    pub fn mark_bad(&self) {
        let retire = {
            let mut inner = self.inner.lock();
            inner.error_score += 1.0;
            inner.error_score >= self.max_error_score && !inner.retired
        };
        if retire {
            self.retire();
        }
    }

    /// Permanently remove this session from rotation and announce it.
    pub fn retire(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.retired {
                return;
            }
            inner.retired = true;
        }
        log::debug!("Session {} retired", self.id);
        if let Some(bus) = &self.bus {
            let _ = bus.emit(Event::SessionRetired { session_id: self.id.clone() });
        }
    }

    /// Run a closure against the cookie jar
    pub fn with_cookies<R>(&self, f: impl FnOnce(&mut CookieJar) -> R) -> R {
        f(&mut self.inner.lock().cookie_jar)
    }

    /// Cookie header for a URL, if this session has matching cookies
    #[must_use]
    pub fn cookie_header_for(&self, url: &str) -> Option<String> {
        self.inner.lock().cookie_jar.header_for(url)
    }

    /// Absorb `Set-Cookie` headers observed on a response
    pub fn store_response_cookies(&self, url: &str, set_cookie_headers: &[String]) {
        self.inner
            .lock()
            .cookie_jar
            .store_from_response(url, set_cookie_headers);
    }

    /// Snapshot for persistence
    #[must_use]
    pub fn state(&self) -> SessionState {
        let inner = self.inner.lock();
        SessionState {
            id: self.id.clone(),
            cookie_jar: inner.cookie_jar.clone(),
            user_data: inner.user_data.clone(),
            usage_count: inner.usage_count,
            max_usage_count: self.max_usage_count,
            error_score: inner.error_score,
            max_error_score: self.max_error_score,
            created_at: self.created_at,
            expires_at: self.expires_at,
            proxy_info: inner.proxy_info.clone(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("usage_count", &inner.usage_count)
            .field("error_score", &inner.error_score)
            .field("retired", &inner.retired)
            .finish_non_exhaustive()
    }
}
