//! Configuration loader and validator for the fan-out notification pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::bus::RetryPolicy;
use crate::model::OptOutPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
/// Every key has a default, so a minimal or absent file still yields a
/// runnable pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub fanout: FanoutSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// Topic/subscription names and delivery parameters for the message bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusSection {
    #[serde(default = "default_content_topic")]
    pub content_topic: String,
    #[serde(default = "default_batch_topic")]
    pub batch_topic: String,
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    #[serde(default = "default_fanout_subscription")]
    pub fanout_subscription: String,
    #[serde(default = "default_dispatch_subscription")]
    pub dispatch_subscription: String,
    #[serde(default = "default_dead_letter_subscription")]
    pub dead_letter_subscription: String,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
}

impl BusSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

/// Fan-out service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanoutSection {
    /// Followers per notification batch (`FOLLOWER_BATCH_SIZE`).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_fanout_max_in_flight")]
    pub max_in_flight: usize,
}

/// Dispatch worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_dispatch_max_in_flight")]
    pub max_in_flight: usize,
    /// Concurrent per-user sends inside one batch.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,
    #[serde(default)]
    pub opt_out_policy: OptOutPolicy,
}

/// Backing stores for followers and delivered notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

fn default_content_topic() -> String {
    "content-published".into()
}
fn default_batch_topic() -> String {
    "notification-batch".into()
}
fn default_dead_letter_topic() -> String {
    "notification-dead-letter".into()
}
fn default_fanout_subscription() -> String {
    "fanout-worker-sub".into()
}
fn default_dispatch_subscription() -> String {
    "notification-worker-sub".into()
}
fn default_dead_letter_subscription() -> String {
    "dead-letter-sub".into()
}
fn default_max_delivery_attempts() -> u32 {
    5
}
fn default_min_backoff_ms() -> u64 {
    10_000
}
fn default_max_backoff_ms() -> u64 {
    600_000
}
fn default_visibility_timeout_ms() -> u64 {
    30_000
}
fn default_page_size() -> u32 {
    500
}
fn default_fanout_max_in_flight() -> usize {
    10
}
fn default_workers() -> usize {
    3
}
fn default_dispatch_max_in_flight() -> usize {
    50
}
fn default_send_concurrency() -> usize {
    32
}
fn default_data_dir() -> String {
    "./data".into()
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            content_topic: default_content_topic(),
            batch_topic: default_batch_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            fanout_subscription: default_fanout_subscription(),
            dispatch_subscription: default_dispatch_subscription(),
            dead_letter_subscription: default_dead_letter_subscription(),
            max_delivery_attempts: default_max_delivery_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
        }
    }
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_in_flight: default_fanout_max_in_flight(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_in_flight: default_dispatch_max_in_flight(),
            send_concurrency: default_send_concurrency(),
            opt_out_policy: OptOutPolicy::default(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `store.data_dir` when the
    /// SQLite backend is selected).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.store.backend == StoreBackend::Sqlite && !self.store.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.store.data_dir)?;
        }
        Ok(())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.bus.content_topic.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.content_topic must be non-empty"));
    }
    if cfg.bus.batch_topic.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.batch_topic must be non-empty"));
    }
    if cfg.bus.dead_letter_topic.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.dead_letter_topic must be non-empty"));
    }
    if cfg.bus.fanout_subscription.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.fanout_subscription must be non-empty"));
    }
    if cfg.bus.dispatch_subscription.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.dispatch_subscription must be non-empty"));
    }
    if cfg.bus.dead_letter_subscription.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.dead_letter_subscription must be non-empty"));
    }
    if cfg.bus.max_delivery_attempts == 0 {
        return Err(ConfigError::Invalid("bus.max_delivery_attempts must be > 0"));
    }
    if cfg.bus.min_backoff_ms > cfg.bus.max_backoff_ms {
        return Err(ConfigError::Invalid("bus.min_backoff_ms must be <= bus.max_backoff_ms"));
    }
    if cfg.bus.visibility_timeout_ms == 0 {
        return Err(ConfigError::Invalid("bus.visibility_timeout_ms must be > 0"));
    }

    if cfg.fanout.page_size == 0 {
        return Err(ConfigError::Invalid("fanout.page_size must be > 0"));
    }
    if cfg.fanout.max_in_flight == 0 {
        return Err(ConfigError::Invalid("fanout.max_in_flight must be > 0"));
    }

    if cfg.dispatch.workers == 0 {
        return Err(ConfigError::Invalid("dispatch.workers must be > 0"));
    }
    if cfg.dispatch.max_in_flight == 0 {
        return Err(ConfigError::Invalid("dispatch.max_in_flight must be > 0"));
    }
    if cfg.dispatch.send_concurrency == 0 {
        return Err(ConfigError::Invalid("dispatch.send_concurrency must be > 0"));
    }

    if cfg.store.backend == StoreBackend::Sqlite && cfg.store.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("store.data_dir must be non-empty for the sqlite backend"));
    }

    Ok(())
}

/// Canonical example configuration, also used by the test suite.
pub fn example() -> &'static str {
    r#"bus:
  content_topic: "content-published"
  batch_topic: "notification-batch"
  dead_letter_topic: "notification-dead-letter"
  fanout_subscription: "fanout-worker-sub"
  dispatch_subscription: "notification-worker-sub"
  dead_letter_subscription: "dead-letter-sub"
  max_delivery_attempts: 5
  min_backoff_ms: 10000
  max_backoff_ms: 600000
  visibility_timeout_ms: 30000

fanout:
  page_size: 500
  max_in_flight: 10

dispatch:
  workers: 3
  max_in_flight: 50
  send_concurrency: 32
  opt_out_policy: "fail_open"

store:
  backend: "memory"
  data_dir: "./data"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.fanout.page_size, 500);
        assert_eq!(cfg.bus.max_delivery_attempts, 5);
        assert_eq!(cfg.dispatch.workers, 3);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn invalid_page_size() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.fanout.page_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("fanout.page_size")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_topic_names() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.bus.batch_topic = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("batch_topic")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.bus.dispatch_subscription = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_backoff_window() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.bus.min_backoff_ms = 1_000;
        cfg.bus.max_backoff_ms = 100;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("min_backoff_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_worker_counts() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.workers = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.bus.max_delivery_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn sqlite_backend_requires_data_dir() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.store.backend = StoreBackend::Sqlite;
        cfg.store.data_dir = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("store.data_dir")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir_for_sqlite() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.store.backend = StoreBackend::Sqlite;
        cfg.store.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.bus.content_topic, "content-published");
    }

    #[test]
    fn durations_convert_to_policy() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        let policy = cfg.bus.retry_policy();
        assert_eq!(policy.min_backoff, Duration::from_secs(10));
        assert_eq!(policy.max_backoff, Duration::from_secs(600));
        assert_eq!(cfg.bus.visibility_timeout(), Duration::from_secs(30));
    }
}
