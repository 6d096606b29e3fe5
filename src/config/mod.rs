//! Process-wide crawler configuration
//!
//! `Configuration` is a plain value object. Subsystems accept it explicitly
//! (constructor injection); `Configuration::global()` exists as a convenience
//! fallback for entry points that do not thread one through.
//!
//! Precedence: values set in code are overridden by `SPINNERET_*` environment
//! variables read at construction time.

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Log verbosity recognized by `SPINNERET_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "OFF" => Some(Self::Off),
            "ERROR" => Some(Self::Error),
            "WARN" | "WARNING" => Some(Self::Warn),
            "INFO" => Some(Self::Info),
            "DEBUG" => Some(Self::Debug),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }

    /// Convert to the `log` crate's level filter
    #[must_use]
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Off => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Crawler process configuration.
///
/// Covers resource ceilings used by the autoscaling telemetry, persistence
/// cadence, and default storage entity ids.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Hard memory ceiling in megabytes. When unset, the ceiling is
    /// `available_memory_ratio` of total system RAM.
    pub(crate) memory_mbytes: Option<u64>,
    /// Fraction of total RAM claimed as the memory ceiling when
    /// `memory_mbytes` is unset
    pub(crate) available_memory_ratio: f64,
    /// CPU usage ratio above which a CPU snapshot reports overloaded
    pub(crate) max_used_cpu_ratio: f64,
    /// Memory usage ratio (of the ceiling) above which a memory snapshot
    /// reports overloaded
    pub(crate) max_used_memory_ratio: f64,
    /// Interval between `PersistState` events
    pub(crate) persist_state_interval_millis: u64,
    /// Interval between `SystemInfo` emissions
    pub(crate) system_info_interval_millis: u64,
    /// Clear the default storages at startup
    pub(crate) purge_on_start: bool,
    /// Mirror storage entities to disk
    pub(crate) persist_storage: bool,
    /// Directory the storage backend writes JSON entities under
    pub(crate) storage_dir: PathBuf,
    pub(crate) default_dataset_id: String,
    pub(crate) default_key_value_store_id: String,
    pub(crate) default_request_queue_id: String,
    pub(crate) log_level: LogLevel,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            memory_mbytes: None,
            available_memory_ratio: 0.25,
            max_used_cpu_ratio: 0.95,
            max_used_memory_ratio: 0.7,
            persist_state_interval_millis: 60_000,
            system_info_interval_millis: 60_000,
            purge_on_start: true,
            persist_storage: true,
            storage_dir: PathBuf::from("./storage"),
            default_dataset_id: "default".to_string(),
            default_key_value_store_id: "default".to_string(),
            default_request_queue_id: "default".to_string(),
            log_level: LogLevel::Info,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Configuration {
    /// Build a configuration from defaults plus `SPINNERET_*` environment
    /// overrides
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `SPINNERET_*` environment overrides on top of the current
    /// values.
    ///
    /// Unparseable values are ignored with a warning rather than failing
    /// process startup.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_var("SPINNERET_MEMORY_MBYTES") {
            match v.parse::<u64>() {
                Ok(mb) => self.memory_mbytes = Some(mb),
                Err(e) => log::warn!("Ignoring invalid SPINNERET_MEMORY_MBYTES={v}: {e}"),
            }
        }
        if let Some(v) = env_var("SPINNERET_AVAILABLE_MEMORY_RATIO") {
            match v.parse::<f64>() {
                Ok(r) if r > 0.0 && r <= 1.0 => self.available_memory_ratio = r,
                _ => log::warn!("Ignoring invalid SPINNERET_AVAILABLE_MEMORY_RATIO={v}"),
            }
        }
        if let Some(v) = env_var("SPINNERET_PERSIST_STATE_INTERVAL_MILLIS") {
            match v.parse::<u64>() {
                Ok(ms) => self.persist_state_interval_millis = ms,
                Err(e) => {
                    log::warn!("Ignoring invalid SPINNERET_PERSIST_STATE_INTERVAL_MILLIS={v}: {e}");
                }
            }
        }
        if let Some(v) = env_var("SPINNERET_PURGE_ON_START") {
            self.purge_on_start = parse_bool(&v).unwrap_or(self.purge_on_start);
        }
        if let Some(v) = env_var("SPINNERET_PERSIST_STORAGE") {
            self.persist_storage = parse_bool(&v).unwrap_or(self.persist_storage);
        }
        if let Some(v) = env_var("SPINNERET_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("SPINNERET_DEFAULT_DATASET_ID") {
            self.default_dataset_id = v;
        }
        if let Some(v) = env_var("SPINNERET_DEFAULT_KEY_VALUE_STORE_ID") {
            self.default_key_value_store_id = v;
        }
        if let Some(v) = env_var("SPINNERET_DEFAULT_REQUEST_QUEUE_ID") {
            self.default_request_queue_id = v;
        }
        if let Some(v) = env_var("SPINNERET_LOG_LEVEL") {
            match LogLevel::parse(&v) {
                Some(level) => self.log_level = level,
                None => log::warn!("Ignoring invalid SPINNERET_LOG_LEVEL={v}"),
            }
        }
        self
    }

    /// Process-wide default configuration (env overrides applied once at
    /// first access)
    pub fn global() -> Arc<Configuration> {
        static GLOBAL: Lazy<Arc<Configuration>> = Lazy::new(|| Arc::new(Configuration::from_env()));
        Arc::clone(&GLOBAL)
    }

    /// Memory ceiling in bytes used to compute memory overload.
    ///
    /// Uses the explicit `memory_mbytes` setting when present, otherwise
    /// `available_memory_ratio` of the given total system RAM.
    #[must_use]
    pub fn max_memory_bytes(&self, total_system_bytes: u64) -> u64 {
        match self.memory_mbytes {
            Some(mb) => mb * 1024 * 1024,
            None => (total_system_bytes as f64 * self.available_memory_ratio) as u64,
        }
    }

    #[must_use]
    pub fn memory_mbytes(&self) -> Option<u64> {
        self.memory_mbytes
    }

    #[must_use]
    pub fn available_memory_ratio(&self) -> f64 {
        self.available_memory_ratio
    }

    #[must_use]
    pub fn max_used_cpu_ratio(&self) -> f64 {
        self.max_used_cpu_ratio
    }

    #[must_use]
    pub fn max_used_memory_ratio(&self) -> f64 {
        self.max_used_memory_ratio
    }

    #[must_use]
    pub fn persist_state_interval_millis(&self) -> u64 {
        self.persist_state_interval_millis
    }

    #[must_use]
    pub fn system_info_interval_millis(&self) -> u64 {
        self.system_info_interval_millis
    }

    #[must_use]
    pub fn purge_on_start(&self) -> bool {
        self.purge_on_start
    }

    #[must_use]
    pub fn persist_storage(&self) -> bool {
        self.persist_storage
    }

    #[must_use]
    pub fn storage_dir(&self) -> &PathBuf {
        &self.storage_dir
    }

    #[must_use]
    pub fn default_dataset_id(&self) -> &str {
        &self.default_dataset_id
    }

    #[must_use]
    pub fn default_key_value_store_id(&self) -> &str {
        &self.default_key_value_store_id
    }

    #[must_use]
    pub fn default_request_queue_id(&self) -> &str {
        &self.default_request_queue_id
    }

    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    // Builder-style setters for constructor injection

    #[must_use]
    pub fn with_memory_mbytes(mut self, mbytes: u64) -> Self {
        self.memory_mbytes = Some(mbytes);
        self
    }

    #[must_use]
    pub fn with_available_memory_ratio(mut self, ratio: f64) -> Self {
        self.available_memory_ratio = ratio;
        self
    }

    #[must_use]
    pub fn with_max_used_cpu_ratio(mut self, ratio: f64) -> Self {
        self.max_used_cpu_ratio = ratio;
        self
    }

    #[must_use]
    pub fn with_max_used_memory_ratio(mut self, ratio: f64) -> Self {
        self.max_used_memory_ratio = ratio;
        self
    }

    #[must_use]
    pub fn with_persist_state_interval_millis(mut self, millis: u64) -> Self {
        self.persist_state_interval_millis = millis;
        self
    }

    #[must_use]
    pub fn with_system_info_interval_millis(mut self, millis: u64) -> Self {
        self.system_info_interval_millis = millis;
        self
    }

    #[must_use]
    pub fn with_purge_on_start(mut self, purge: bool) -> Self {
        self.purge_on_start = purge;
        self
    }

    #[must_use]
    pub fn with_persist_storage(mut self, persist: bool) -> Self {
        self.persist_storage = persist;
        self
    }

    #[must_use]
    pub fn with_storage_dir(mut self, dir: PathBuf) -> Self {
        self.storage_dir = dir;
        self
    }

    #[must_use]
    pub fn with_default_request_queue_id(mut self, id: impl Into<String>) -> Self {
        self.default_request_queue_id = id.into();
        self
    }

    #[must_use]
    pub fn with_default_dataset_id(mut self, id: impl Into<String>) -> Self {
        self.default_dataset_id = id.into();
        self
    }

    #[must_use]
    pub fn with_default_key_value_store_id(mut self, id: impl Into<String>) -> Self {
        self.default_key_value_store_id = id.into();
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
