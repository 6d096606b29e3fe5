//! Request data model
//!
//! A `Request` is one unit of crawl work. It is created by the caller,
//! mutated only by the crawler engine (state, retry counters, error
//! messages, loaded URL), and discarded once terminal.

pub mod unique_key;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use unique_key::{compute_unique_key, normalize_url, unique_key_to_request_id};

/// HTTP verbs a request may carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle position of a request inside the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    #[default]
    Unprocessed,
    BeforeNav,
    AfterNav,
    RequestHandler,
    Done,
    ErrorHandler,
    Error,
}

/// Errors raised while constructing a request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid request URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("GET requests must not carry a payload (url: {url})")]
    PayloadOnGet { url: String },
}

/// A unit of crawl work.
///
/// `unique_key` is the canonical identity: two requests with equal keys
/// denote the same resource and at most one of them is ever delivered to
/// a handler. When not supplied it is derived from the method, the
/// normalized URL, and (for non-GET) a payload checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Stable id derived from `unique_key`
    pub id: String,
    pub url: String,
    pub unique_key: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque caller data carried through the whole lifecycle
    #[serde(default)]
    pub user_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
    /// Session rotations consumed by anti-bot retries; does not count
    /// against `retry_count`
    #[serde(default)]
    pub session_rotation_count: u32,
    #[serde(default)]
    pub error_messages: Vec<String>,
    /// Final URL after redirects, set on successful navigation
    #[serde(default)]
    pub loaded_url: Option<String>,
    #[serde(default)]
    pub state: RequestState,
    #[serde(default)]
    pub no_retry: bool,
    #[serde(default)]
    pub skip_navigation: bool,
    #[serde(default)]
    pub handled_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Request {
    /// Create a GET request for a URL with derived identity.
    pub fn new(url: impl Into<String>) -> Result<Self, RequestError> {
        RequestBuilder::new(url).build()
    }

    /// Start building a request with non-default options.
    pub fn builder(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(url)
    }

    /// The routing label, stored under `user_data["label"]`.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.user_data.get("label").and_then(|v| v.as_str())
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.user_data
            .insert("label".to_string(), serde_json::Value::String(label.into()));
    }

    /// Record a failure message, most recent last.
    pub fn push_error_message(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }

    /// Whether the request reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RequestState::Done | RequestState::Error)
    }
}

/// Builder for `Request` values.
///
/// Validation happens in `build()`: the URL must parse, and GET requests
/// must not carry a payload.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    url: String,
    method: HttpMethod,
    payload: Option<Vec<u8>>,
    headers: HashMap<String, String>,
    user_data: serde_json::Map<String, serde_json::Value>,
    unique_key: Option<String>,
    keep_url_fragment: bool,
    use_extended_unique_key: bool,
    no_retry: bool,
    skip_navigation: bool,
}

impl RequestBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            payload: None,
            headers: HashMap::new(),
            user_data: serde_json::Map::new(),
            unique_key: None,
            keep_url_fragment: false,
            use_extended_unique_key: false,
            no_retry: false,
            skip_navigation: false,
        }
    }

    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn user_data_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.user_data.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn label(self, label: impl Into<String>) -> Self {
        self.user_data_value("label", serde_json::Value::String(label.into()))
    }

    /// Override the derived unique key
    #[must_use]
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn keep_url_fragment(mut self, keep: bool) -> Self {
        self.keep_url_fragment = keep;
        self
    }

    #[must_use]
    pub fn use_extended_unique_key(mut self, extended: bool) -> Self {
        self.use_extended_unique_key = extended;
        self
    }

    #[must_use]
    pub fn no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    #[must_use]
    pub fn skip_navigation(mut self, skip: bool) -> Self {
        self.skip_navigation = skip;
        self
    }

    pub fn build(self) -> Result<Request, RequestError> {
        if self.method == HttpMethod::Get && self.payload.is_some() {
            return Err(RequestError::PayloadOnGet { url: self.url });
        }

        let unique_key = match self.unique_key {
            Some(key) if !key.is_empty() => key,
            _ => compute_unique_key(
                &self.url,
                self.method,
                self.payload.as_deref(),
                self.keep_url_fragment,
                self.use_extended_unique_key,
            )
            .map_err(|e| RequestError::InvalidUrl {
                url: self.url.clone(),
                reason: e.to_string(),
            })?,
        };

        Ok(Request {
            id: unique_key_to_request_id(&unique_key),
            url: self.url,
            unique_key,
            method: self.method,
            payload: self.payload,
            headers: self.headers,
            user_data: self.user_data,
            retry_count: 0,
            session_rotation_count: 0,
            error_messages: Vec::new(),
            loaded_url: None,
            state: RequestState::Unprocessed,
            no_retry: self.no_retry,
            skip_navigation: self.skip_navigation,
            handled_at: None,
        })
    }
}
