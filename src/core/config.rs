use crate::codec::Compression;
use crate::core::errors::{PoolError, Result};
use crate::core::logging::LoggingConfig;
use crate::pool::partition;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

/// Largest value the shared channel accepts in one piece: `2^30 - 1` bytes.
pub const DEFAULT_MAX_PART_SIZE: usize = (1 << 30) - 1;

/// Upper bound on every coordinator wait.
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    // Worker pool configuration
    /// Number of participants including the coordinator's helper.
    /// `0` or any negative value means one per CPU.
    pub workers: i64,
    /// Ratio of queued tasks to spawned workers above which the line
    /// pipeline processes parts itself
    pub helper_lead_factor: usize,

    // Wait configuration
    /// Maximum time a coordinator or direct writer sleeps between checks
    pub max_wait_timeout_ms: u64,
    /// How long the helper waits on an empty queue before giving up its turn
    pub helper_poll_timeout_ms: u64,
    /// Minimum time between two progress log lines
    pub progress_interval_ms: u64,

    // Transport configuration
    /// Largest serialized value stored without chunking
    pub max_part_size: usize,
    /// Compression applied to chunked values
    pub compression: Compression,
    /// Maximum number of documents per ordered part
    pub max_split_part: Option<usize>,
    /// Maximum number of words per line part in the line pipeline
    pub max_words_per_part: usize,

    /// Logging setup used by `init_tracing`
    pub logging: LoggingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            helper_lead_factor: 2,
            max_wait_timeout_ms: MAX_WAIT_TIMEOUT.as_millis() as u64,
            helper_poll_timeout_ms: 1_000,
            progress_interval_ms: 30_000,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            compression: Compression::None,
            max_split_part: None,
            max_words_per_part: 100_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new builder for PoolConfig
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Configuration with short waits, used by tests and local runs
    pub fn development() -> Self {
        Self {
            workers: 4,
            max_wait_timeout_ms: 200,
            helper_poll_timeout_ms: 20,
            progress_interval_ms: 1_000,
            ..Default::default()
        }
    }

    /// Parse a configuration from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PoolError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&text)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_wait_timeout_ms == 0 {
            return Err(PoolError::configuration_field(
                "max_wait_timeout_ms must be greater than 0",
                "max_wait_timeout_ms",
            ));
        }
        if self.helper_poll_timeout_ms > self.max_wait_timeout_ms {
            return Err(PoolError::configuration_field(
                "helper_poll_timeout_ms cannot exceed max_wait_timeout_ms",
                "helper_poll_timeout_ms",
            ));
        }
        if self.max_part_size == 0 {
            return Err(PoolError::configuration_field(
                "max_part_size must be greater than 0",
                "max_part_size",
            ));
        }
        if self.max_split_part == Some(0) {
            return Err(PoolError::configuration_field(
                "max_split_part must be greater than 0 when set",
                "max_split_part",
            ));
        }
        if self.max_words_per_part == 0 {
            return Err(PoolError::configuration_field(
                "max_words_per_part must be greater than 0",
                "max_words_per_part",
            ));
        }
        if let Compression::Zstd { level } = self.compression {
            if !(1..=22).contains(&level) {
                return Err(PoolError::configuration_field(
                    "zstd level must be between 1 and 22",
                    "compression",
                ));
            }
        }
        Ok(())
    }

    /// Number of participants after resolving "one per CPU"
    pub fn effective_workers(&self) -> usize {
        if self.workers <= 0 {
            num_cpus::get().max(1)
        } else {
            self.workers as usize
        }
    }

    pub fn max_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.max_wait_timeout_ms)
    }

    pub fn helper_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.helper_poll_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Ordered ranges over `0..total` for this pool, capped at `max_split_part`
    pub fn part_ranges(&self, total: usize) -> Vec<Range<usize>> {
        partition::part_ranges(total, self.effective_workers(), self.max_split_part)
    }
}

/// Builder for PoolConfig
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    /// Set the number of participants (`<= 0` means one per CPU)
    pub fn workers(mut self, workers: i64) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the coordinator wait bound
    pub fn max_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the helper's probe timeout
    pub fn helper_poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.helper_poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the progress log interval
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the transport limit
    pub fn max_part_size(mut self, bytes: usize) -> Self {
        self.config.max_part_size = bytes;
        self
    }

    /// Set chunk compression
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the maximum documents per ordered part
    pub fn max_split_part(mut self, max: Option<usize>) -> Self {
        self.config.max_split_part = max;
        self
    }

    /// Set the helper lead factor of the line pipeline
    pub fn helper_lead_factor(mut self, factor: usize) -> Self {
        self.config.helper_lead_factor = factor;
        self
    }

    /// Set the maximum words per line part
    pub fn max_words_per_part(mut self, words: usize) -> Self {
        self.config.max_words_per_part = words;
        self
    }

    /// Set logging
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_wait_timeout(), MAX_WAIT_TIMEOUT);
        assert_eq!(config.max_part_size, DEFAULT_MAX_PART_SIZE);
    }

    #[test]
    fn test_development_config() {
        let config = PoolConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_workers(), 4);
    }

    #[test]
    fn test_cpu_workers() {
        let config = PoolConfig::builder().workers(-1).build().unwrap();
        assert_eq!(config.effective_workers(), num_cpus::get().max(1));
        let config = PoolConfig::builder().workers(0).build().unwrap();
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PoolConfig::default();

        config.max_wait_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.max_wait_timeout_ms = 100;

        config.helper_poll_timeout_ms = 500;
        assert!(config.validate().is_err());
        config.helper_poll_timeout_ms = 50;

        config.max_part_size = 0;
        assert!(config.validate().is_err());
        config.max_part_size = 16;

        config.compression = Compression::Zstd { level: 40 };
        assert!(config.validate().is_err());
        config.compression = Compression::Zstd { level: 3 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::builder()
            .workers(6)
            .max_wait_timeout(Duration::from_secs(2))
            .helper_poll_timeout(Duration::from_millis(100))
            .max_part_size(4096)
            .max_split_part(Some(500))
            .build()
            .unwrap();

        assert_eq!(config.effective_workers(), 6);
        assert_eq!(config.max_wait_timeout(), Duration::from_secs(2));
        assert_eq!(config.helper_poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_part_size, 4096);
        assert_eq!(config.max_split_part, Some(500));
    }

    #[test]
    fn test_part_ranges_follow_split_cap() {
        let config = PoolConfig::builder().workers(2).build().unwrap();
        assert_eq!(config.part_ranges(10), vec![0..5, 5..10]);

        let config = PoolConfig::builder()
            .workers(2)
            .max_split_part(Some(3))
            .build()
            .unwrap();
        assert_eq!(config.part_ranges(10), vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
workers: 3
max_wait_timeout_ms: 500
helper_poll_timeout_ms: 10
max_part_size: 1024
compression:
  kind: zstd
  level: 5
logging:
  filter: "parpipe=debug"
"#;
        let config = PoolConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_part_size, 1024);
        assert_eq!(config.compression, Compression::Zstd { level: 5 });
        assert_eq!(config.logging.filter, "parpipe=debug");
        // untouched fields keep their defaults
        assert_eq!(config.max_words_per_part, 100_000);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = PoolConfig::from_json_str(r#"{"max_part_size": 0}"#).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.yaml");
        std::fs::write(&path, "workers: 2\n").unwrap();
        let config = PoolConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.workers, 2);

        let missing = PoolConfig::from_yaml_file(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(PoolError::Io { .. })));
    }
}
