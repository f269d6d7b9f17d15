//! Configuration for the change feed and the maintenance jobs
//!
//! Loaded from TOML; every section is optional and falls back to its
//! `Default`. A handful of `DICOM_OPS_*` environment variables override the
//! file for 12-factor deployments.

use crate::orchestration::{BatchingOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(std::io::Error),
    /// Config file is not valid TOML for this schema
    Parse(toml::de::Error),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub change_feed: ChangeFeedConfig,
    pub processor: ProcessorConfig,
    pub state_store: StateStoreConfig,
    pub jobs: JobsConfig,
}

impl OpsConfig {
    /// Configuration for tests (small pages and batches, no waiting)
    pub fn test() -> Self {
        OpsConfig {
            change_feed: ChangeFeedConfig::test(),
            processor: ProcessorConfig::test(),
            state_store: StateStoreConfig::default(),
            jobs: JobsConfig::test(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: OpsConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `DICOM_OPS_*` environment variables on top of this config
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{}={:?} is not a number", name, value)))
        }

        if let Some(v) = lookup("DICOM_OPS_PAGE_SIZE") {
            self.processor.page_size = parse("DICOM_OPS_PAGE_SIZE", v)?;
        }
        if let Some(v) = lookup("DICOM_OPS_STEADY_STATE_INTERVAL_MS") {
            self.processor.steady_state_interval =
                Duration::from_millis(parse("DICOM_OPS_STEADY_STATE_INTERVAL_MS", v)?);
        }
        if let Some(v) = lookup("DICOM_OPS_CATCH_UP_INTERVAL_MS") {
            self.processor.catch_up_interval =
                Duration::from_millis(parse("DICOM_OPS_CATCH_UP_INTERVAL_MS", v)?);
        }
        if let Some(v) = lookup("DICOM_OPS_MAX_DEGREE_OF_PARALLELISM") {
            self.change_feed.max_degree_of_parallelism =
                parse("DICOM_OPS_MAX_DEGREE_OF_PARALLELISM", v)?;
        }
        if let Some(v) = lookup("DICOM_OPS_STATE_PATH") {
            self.state_store.store_type = StateStoreType::LocalFs;
            self.state_store.local_path = Some(PathBuf::from(v));
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.change_feed.max_limit == 0 {
            return Err(ConfigError::Invalid("change_feed.max_limit must be > 0".into()));
        }
        if self.change_feed.max_degree_of_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "change_feed.max_degree_of_parallelism must be > 0".into(),
            ));
        }
        if self.processor.page_size == 0 {
            return Err(ConfigError::Invalid("processor.page_size must be > 0".into()));
        }
        if self.processor.catch_up_interval > self.processor.steady_state_interval {
            return Err(ConfigError::Invalid(
                "processor.catch_up_interval must not exceed steady_state_interval".into(),
            ));
        }
        if self.state_store.store_type == StateStoreType::LocalFs
            && self.state_store.local_path.is_none()
        {
            return Err(ConfigError::Invalid(
                "state_store.local_path is required for LocalFs".into(),
            ));
        }
        for (name, job) in self.jobs.iter() {
            job.validate()
                .map_err(|msg| ConfigError::Invalid(format!("jobs.{}: {}", name, msg)))?;
        }
        Ok(())
    }
}

/// Change feed query settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeFeedConfig {
    /// Concurrent metadata fetches per query
    pub max_degree_of_parallelism: usize,
    /// Largest page a caller may request
    pub max_limit: usize,
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        ChangeFeedConfig {
            max_degree_of_parallelism: 8,
            max_limit: 200,
        }
    }
}

impl ChangeFeedConfig {
    pub fn test() -> Self {
        ChangeFeedConfig {
            max_degree_of_parallelism: 2,
            max_limit: 10,
        }
    }
}

/// Polling settings for a feed consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Entries requested per poll
    pub page_size: usize,
    /// Wait after an empty page or a failed pass
    #[serde(with = "duration_millis")]
    pub steady_state_interval: Duration,
    /// Wait between non-empty pages while catching up
    #[serde(with = "duration_millis")]
    pub catch_up_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            page_size: 100,
            steady_state_interval: Duration::from_secs(5),
            catch_up_interval: Duration::ZERO,
        }
    }
}

impl ProcessorConfig {
    pub fn test() -> Self {
        ProcessorConfig {
            page_size: 3,
            steady_state_interval: Duration::from_millis(1_000),
            catch_up_interval: Duration::ZERO,
        }
    }
}

/// Backend for checkpoints and sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateStoreType {
    InMemory,
    LocalFs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreConfig {
    pub store_type: StateStoreType,
    /// Root directory (LocalFs only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Key prefix for every document
    pub prefix: String,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        StateStoreConfig {
            store_type: StateStoreType::InMemory,
            local_path: None,
            prefix: "dicom-ops".to_string(),
        }
    }
}

impl StateStoreConfig {
    pub fn local(path: PathBuf) -> Self {
        StateStoreConfig {
            store_type: StateStoreType::LocalFs,
            local_path: Some(path),
            prefix: "dicom-ops".to_string(),
        }
    }
}

/// Batching and retry settings of one job family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub batching: BatchingOptions,
    pub retry: RetryPolicy,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            batching: BatchingOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl JobConfig {
    pub fn test() -> Self {
        JobConfig {
            batching: BatchingOptions::new(10, 3),
            retry: RetryPolicy::test(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        self.batching.validate()?;
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub export: JobConfig,
    pub migration: JobConfig,
    pub cleanup: JobConfig,
    pub backfill: JobConfig,
    pub blob_delete: JobConfig,
}

impl JobsConfig {
    pub fn test() -> Self {
        JobsConfig {
            export: JobConfig::test(),
            migration: JobConfig::test(),
            cleanup: JobConfig::test(),
            backfill: JobConfig::test(),
            blob_delete: JobConfig::test(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &JobConfig)> {
        [
            ("export", &self.export),
            ("migration", &self.migration),
            ("cleanup", &self.cleanup),
            ("backfill", &self.backfill),
            ("blob_delete", &self.blob_delete),
        ]
        .into_iter()
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // TOML integers are i64; u128 does not serialize.
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for `Option<Duration>` as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = OpsConfig::default();
        config.validate().unwrap();
        assert_eq!(config.state_store.store_type, StateStoreType::InMemory);
        OpsConfig::test().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = OpsConfig::from_toml_str(
            r#"
            [processor]
            page_size = 50
            steady_state_interval = 2000

            [jobs.cleanup.batching]
            size = 500
            max_parallel_count = 4

            [jobs.cleanup.retry]
            max_attempts = 3
            initial_delay = 250
            backoff_multiplier = 3.0
            "#,
        )
        .unwrap();

        assert_eq!(config.processor.page_size, 50);
        assert_eq!(config.processor.steady_state_interval, Duration::from_millis(2000));
        assert_eq!(config.processor.catch_up_interval, Duration::ZERO);
        assert_eq!(config.jobs.cleanup.batching, BatchingOptions::new(500, 4));
        assert_eq!(config.jobs.cleanup.retry.max_attempts, 3);
        assert_eq!(config.jobs.cleanup.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.jobs.export, JobConfig::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = OpsConfig::test();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(OpsConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = OpsConfig::from_toml_str("[processor]\npage_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = OpsConfig::from_toml_str("[jobs.export.batching]\nsize = 0\nmax_parallel_count = 1\n")
            .unwrap_err();
        assert!(err.to_string().contains("jobs.export"));

        let err = OpsConfig::from_toml_str("[processor]\npage_size = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DICOM_OPS_PAGE_SIZE", "25"),
            ("DICOM_OPS_STEADY_STATE_INTERVAL_MS", "750"),
            ("DICOM_OPS_STATE_PATH", "/var/lib/dicom-ops"),
        ]
        .into_iter()
        .collect();

        let mut config = OpsConfig::default();
        config
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.processor.page_size, 25);
        assert_eq!(config.processor.steady_state_interval, Duration::from_millis(750));
        assert_eq!(config.state_store.store_type, StateStoreType::LocalFs);
        assert_eq!(
            config.state_store.local_path,
            Some(PathBuf::from("/var/lib/dicom-ops"))
        );

        let mut config = OpsConfig::default();
        let err = config
            .apply_overrides_from(|name| (name == "DICOM_OPS_PAGE_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.toml");
        std::fs::write(&path, "[change_feed]\nmax_limit = 50\n").unwrap();
        let config = OpsConfig::from_file(&path).unwrap();
        assert_eq!(config.change_feed.max_limit, 50);

        let missing = OpsConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }
}
