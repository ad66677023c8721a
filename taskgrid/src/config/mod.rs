//! Dispatcher and processor configuration.
//!
//! Configuration is read once at startup from YAML or JSON (chosen by file
//! extension) and treated as immutable afterwards.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::observability::LogFormat;
use crate::processor::DispatcherEndpoint;

/// Bounds of the processor request loop interval, in seconds.
pub const REQUEST_INTERVAL_BOUNDS: (u64, u64, u64) = (3, 20, 3);
/// Bounds of the processor task loop interval, in seconds.
pub const TASK_INTERVAL_BOUNDS: (u64, u64, u64) = (3, 20, 5);
/// Bounds of the processor cleanup loop interval, in seconds.
pub const CLEANUP_INTERVAL_BOUNDS: (u64, u64, u64) = (10, 60, 30);

/// Clamps a configured interval into `[min, max]`; `None` gives `default`.
#[must_use]
pub fn clamp_secs(value: Option<u64>, min: u64, max: u64, default: u64) -> u64 {
    value.map_or(default, |v| v.clamp(min, max))
}

/// Process-wide storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// SQLite file with one blob table per area.
    Database {
        /// Database file.
        path: PathBuf,
    },
    /// SQLite in memory; data is lost on exit.
    #[default]
    InMemoryDatabase,
    /// Sharded directory tree.
    Filesystem {
        /// Root directory.
        root: PathBuf,
    },
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_session_ttl_secs() -> u64 {
    1800
}

fn default_stale_task_secs() -> u64 {
    3600
}

fn default_storage_timeout_secs() -> u64 {
    120
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// HTTP bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Inactivity after which a worker must identify again.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Storage backend.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upper bound on a single storage backend call.
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,
    /// Assignments older than this are reclaimed by [`crate::dispatcher::Dispatcher::reclaim_stale`].
    #[serde(default = "default_stale_task_secs")]
    pub stale_task_secs: u64,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            session_ttl_secs: default_session_ttl_secs(),
            storage: StorageConfig::default(),
            storage_timeout_secs: default_storage_timeout_secs(),
            stale_task_secs: default_stale_task_secs(),
            log_format: LogFormat::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl DispatcherConfig {
    /// Sets the storage backend.
    #[must_use]
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the bound on a single storage call.
    #[must_use]
    pub fn with_storage_timeout_secs(mut self, secs: u64) -> Self {
        self.storage_timeout_secs = secs;
        self
    }

    /// Sets the session TTL.
    #[must_use]
    pub fn with_session_ttl_secs(mut self, secs: u64) -> Self {
        self.session_ttl_secs = secs;
        self
    }

    /// Sets the stale-task threshold.
    #[must_use]
    pub fn with_stale_task_secs(mut self, secs: u64) -> Self {
        self.stale_task_secs = secs;
        self
    }

    /// Session TTL as a duration.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Storage call bound as a duration.
    #[must_use]
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    /// Stale-task threshold as a duration.
    #[must_use]
    pub fn stale_task_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_task_secs)
    }

    /// Loads and checks a dispatcher configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_file(path.as_ref())?;
        if config.session_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "session_ttl_secs".into(),
                reason: "must be positive".into(),
            });
        }
        if config.storage_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "storage_timeout_secs".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(config)
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Processor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessorConfig {
    /// Dispatchers in rotation order.
    #[serde(default)]
    pub endpoints: Vec<DispatcherEndpoint>,
    /// Tags advertised by this worker.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Request loop interval; clamped by [`REQUEST_INTERVAL_BOUNDS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_interval_secs: Option<u64>,
    /// Task loop interval; clamped by [`TASK_INTERVAL_BOUNDS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_interval_secs: Option<u64>,
    /// Cleanup loop interval; clamped by [`CLEANUP_INTERVAL_BOUNDS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_interval_secs: Option<u64>,
    /// Timeout of a single dispatcher request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProcessorConfig {
    /// Creates a configuration for the given endpoints.
    #[must_use]
    pub fn new(endpoints: Vec<DispatcherEndpoint>) -> Self {
        Self {
            endpoints,
            request_timeout_secs: default_request_timeout_secs(),
            ..Self::default()
        }
    }

    /// Adds a worker tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Sets the request loop interval.
    #[must_use]
    pub fn with_request_interval_secs(mut self, secs: u64) -> Self {
        self.request_interval_secs = Some(secs);
        self
    }

    /// Effective request loop interval.
    #[must_use]
    pub fn request_interval(&self) -> Duration {
        let (min, max, default) = REQUEST_INTERVAL_BOUNDS;
        Duration::from_secs(clamp_secs(self.request_interval_secs, min, max, default))
    }

    /// Effective task loop interval.
    #[must_use]
    pub fn task_interval(&self) -> Duration {
        let (min, max, default) = TASK_INTERVAL_BOUNDS;
        Duration::from_secs(clamp_secs(self.task_interval_secs, min, max, default))
    }

    /// Effective cleanup loop interval.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        let (min, max, default) = CLEANUP_INTERVAL_BOUNDS;
        Duration::from_secs(clamp_secs(self.cleanup_interval_secs, min, max, default))
    }

    /// Per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Checks that at least one endpoint is enabled and every schedule parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoints.iter().any(|e| e.enabled) {
            return Err(ConfigError::NoEndpoints);
        }
        for endpoint in &self.endpoints {
            endpoint.parsed_schedule()?;
        }
        Ok(())
    }

    /// Loads and validates a processor configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

/// Reads a YAML (`.yaml`, `.yml`) or JSON (`.json`) file.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    let parse_error = |reason: String| ConfigError::Parse {
        path: display.clone(),
        reason,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&text).map_err(|e| parse_error(e.to_string())),
        Some("json") => serde_json::from_str(&text).map_err(|e| parse_error(e.to_string())),
        other => Err(parse_error(format!(
            "unsupported extension {:?}, expected .yaml, .yml or .json",
            other.unwrap_or("")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_clamp_secs() {
        assert_eq!(clamp_secs(None, 3, 20, 5), 5);
        assert_eq!(clamp_secs(Some(1), 3, 20, 5), 3);
        assert_eq!(clamp_secs(Some(99), 3, 20, 5), 20);
        assert_eq!(clamp_secs(Some(7), 3, 20, 5), 7);
    }

    #[test]
    fn test_processor_intervals() {
        let config = ProcessorConfig::new(vec![DispatcherEndpoint::new("http://a")]).with_request_interval_secs(1);
        assert_eq!(config.request_interval(), Duration::from_secs(3));
        assert_eq!(config.task_interval(), Duration::from_secs(5));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_yaml_processor_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processor.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "endpoints:\n  - url: http://d1:8080\n    schedule: \"workingDay=0:00-23:59\"\n  - url: http://d2:8080\n    enabled: false\ntags: [gpu]\ntask_interval_secs: 60\n"
        )
        .unwrap();

        let config = ProcessorConfig::load(&path).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.tags, vec!["gpu".to_string()]);
        assert_eq!(config.task_interval(), Duration::from_secs(20));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_json_dispatcher_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.json");
        std::fs::write(
            &path,
            r#"{"bind_addr": "0.0.0.0:9000", "storage": {"backend": "filesystem", "root": "/var/grid"}}"#,
        )
        .unwrap();

        let config = DispatcherConfig::load(&path).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(
            config.storage,
            StorageConfig::Filesystem {
                root: PathBuf::from("/var/grid")
            }
        );
        assert_eq!(config.session_ttl(), Duration::from_secs(1800));
        assert_eq!(config.storage_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ProcessorConfig::load(dir.path().join("missing.yaml")),
            Err(ConfigError::Read { .. })
        ));

        let toml = dir.path().join("processor.toml");
        std::fs::write(&toml, "endpoints = []").unwrap();
        assert!(matches!(ProcessorConfig::load(&toml), Err(ConfigError::Parse { .. })));

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "tags: []").unwrap();
        assert!(matches!(ProcessorConfig::load(&empty), Err(ConfigError::NoEndpoints)));

        let bad_schedule = dir.path().join("bad.json");
        std::fs::write(&bad_schedule, r#"{"endpoints": [{"url": "http://a", "schedule": "mon=x"}]}"#).unwrap();
        assert!(matches!(
            ProcessorConfig::load(&bad_schedule),
            Err(ConfigError::InvalidSchedule { .. })
        ));

        let no_timeout = dir.path().join("dispatcher.yaml");
        std::fs::write(&no_timeout, "storage_timeout_secs: 0").unwrap();
        assert!(matches!(
            DispatcherConfig::load(&no_timeout),
            Err(ConfigError::Invalid { field, .. }) if field == "storage_timeout_secs"
        ));
    }
}
