use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StrataError};

/// Main configuration structure for Strata
///
/// Built once at startup and shared immutably by every component.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage layout (data directory, embedding dimension)
    #[serde(default)]
    pub storage: StorageConfig,
    /// Cache tier configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Durable tier configuration
    #[serde(default)]
    pub durable: DurableConfig,
    /// Migration orchestrator configuration
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists, falling back to built-in defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".strata").join("config.toml")),
            dirs::config_dir().map(|c| c.join("strata").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Parse and validate a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML config text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| StrataError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject option combinations no component can honor
    pub fn validate(&self) -> Result<()> {
        if self.storage.dimension == 0 {
            return Err(StrataError::Config(
                "storage.dimension must be greater than 0".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(StrataError::Config(format!(
                "cache.similarity_threshold must be within [-1, 1], got {}",
                self.cache.similarity_threshold
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(StrataError::Config(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }
        if self.durable.connection_pool_size == 0 {
            return Err(StrataError::Config(
                "durable.connection_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.durable.ann_partitions == 0 {
            return Err(StrataError::Config(
                "durable.ann_partitions must be greater than 0".to_string(),
            ));
        }
        if self.durable.max_attempts == 0 {
            return Err(StrataError::Config(
                "durable.max_attempts must be at least 1".to_string(),
            ));
        }
        let rate = self.migration.validation_sample_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(StrataError::Config(format!(
                "migration.validation_sample_rate must be within (0, 1], got {rate}"
            )));
        }
        if !(0.0..=1.0).contains(&self.migration.mismatch_tolerance) {
            return Err(StrataError::Config(format!(
                "migration.mismatch_tolerance must be within [0, 1], got {}",
                self.migration.mismatch_tolerance
            )));
        }
        if self.migration.batch_size == 0 || self.migration.workers == 0 {
            return Err(StrataError::Config(
                "migration.batch_size and migration.workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// On-disk layout and record shape
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for deployments, the active pointer and checkpoints
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Embedding dimension every record must have
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dimension: default_dimension(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn default_dimension() -> usize {
    1536
}

/// Cache tier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Default time-to-live for cached records, in seconds
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Minimum cosine similarity for a cache hit (inclusive)
    #[serde(default = "default_cache_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Maximum number of cached records before LRU eviction
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl_seconds(),
            similarity_threshold: default_cache_similarity_threshold(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_ttl_seconds() -> u64 {
    3600
}

fn default_cache_similarity_threshold() -> f32 {
    0.85
}

fn default_cache_max_entries() -> usize {
    10_000
}

/// Durable tier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DurableConfig {
    /// IVF partition count for the ANN index
    #[serde(default = "default_ann_partitions")]
    pub ann_partitions: usize,
    /// PQ sub-vector count for the ANN index
    #[serde(default = "default_ann_sub_vectors")]
    pub ann_sub_vectors: usize,
    /// Partitions searched per query (higher = better recall, slower)
    #[serde(default = "default_nprobes")]
    pub nprobes: usize,
    /// Maximum concurrent durable operations
    #[serde(default = "default_connection_pool_size")]
    pub connection_pool_size: usize,
    /// How long a request waits for a pooled connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Per-attempt deadline for a durable call
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Attempts for idempotent calls (1 = no retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubled on every retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// ANN candidates re-ranked exactly per result (0 = off)
    #[serde(default = "default_refine_factor")]
    pub refine_factor: u32,
    /// Reads record access times in one durable update per interval
    #[serde(default = "default_access_flush_ms")]
    pub access_flush_ms: u64,
}

impl DurableConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn access_flush(&self) -> Duration {
        Duration::from_millis(self.access_flush_ms)
    }
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            ann_partitions: default_ann_partitions(),
            ann_sub_vectors: default_ann_sub_vectors(),
            nprobes: default_nprobes(),
            connection_pool_size: default_connection_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            refine_factor: default_refine_factor(),
            access_flush_ms: default_access_flush_ms(),
        }
    }
}

fn default_ann_partitions() -> usize {
    1000
}

fn default_ann_sub_vectors() -> usize {
    16
}

fn default_nprobes() -> usize {
    20
}

fn default_connection_pool_size() -> usize {
    8
}

fn default_acquire_timeout_ms() -> u64 {
    1000
}

fn default_operation_timeout_ms() -> u64 {
    3000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_refine_factor() -> u32 {
    10
}

fn default_access_flush_ms() -> u64 {
    1000
}

/// Migration orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Fraction of records sampled during validation
    #[serde(default = "default_validation_sample_rate")]
    pub validation_sample_rate: f64,
    /// Maximum tolerated fraction of mismatching samples
    #[serde(default = "default_mismatch_tolerance")]
    pub mismatch_tolerance: f64,
    /// Deadline for the cutover critical section, in seconds
    #[serde(default = "default_cutover_timeout_seconds")]
    pub cutover_timeout_seconds: u64,
    /// Score difference under which two differing top-k sets are equivalent
    #[serde(default = "default_similarity_tolerance")]
    pub similarity_tolerance: f32,
    /// Result size compared per validation sample
    #[serde(default = "default_validation_top_k")]
    pub validation_top_k: usize,
    /// Records per replication batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent replication batches
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Error-free period required before the source is decommissioned
    #[serde(default = "default_soak_seconds")]
    pub soak_seconds: u64,
}

impl MigrationConfig {
    pub fn cutover_timeout(&self) -> Duration {
        Duration::from_secs(self.cutover_timeout_seconds)
    }

    pub fn soak(&self) -> Duration {
        Duration::from_secs(self.soak_seconds)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            validation_sample_rate: default_validation_sample_rate(),
            mismatch_tolerance: default_mismatch_tolerance(),
            cutover_timeout_seconds: default_cutover_timeout_seconds(),
            similarity_tolerance: default_similarity_tolerance(),
            validation_top_k: default_validation_top_k(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            soak_seconds: default_soak_seconds(),
        }
    }
}

fn default_validation_sample_rate() -> f64 {
    0.01
}

fn default_mismatch_tolerance() -> f64 {
    0.01
}

fn default_cutover_timeout_seconds() -> u64 {
    30
}

fn default_similarity_tolerance() -> f32 {
    0.01
}

fn default_validation_top_k() -> usize {
    5
}

fn default_batch_size() -> usize {
    500
}

fn default_workers() -> usize {
    4
}

fn default_soak_seconds() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.dimension, 1536);
        assert_eq!(config.cache.ttl_seconds, 3600);
        assert!((config.cache.similarity_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.durable.ann_partitions, 1000);
        assert_eq!(config.durable.connection_pool_size, 8);
        assert_eq!(config.durable.max_attempts, 3);
        assert_eq!(config.durable.refine_factor, 10);
        assert_eq!(config.durable.access_flush(), Duration::from_secs(1));
        assert!((config.migration.validation_sample_rate - 0.01).abs() < f64::EPSILON);
        assert!((config.migration.mismatch_tolerance - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.migration.cutover_timeout_seconds, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[storage]
data_dir = "/tmp/strata"
dimension = 384

[cache]
ttl_seconds = 60
similarity_threshold = 0.9
max_entries = 500

[durable]
ann_partitions = 256
connection_pool_size = 4
operation_timeout_ms = 1500

[migration]
validation_sample_rate = 0.05
mismatch_tolerance = 0.02
cutover_timeout_seconds = 10
workers = 2
"#;

        let config = Config::from_toml(toml_str).expect("Failed to parse TOML");

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/strata"));
        assert_eq!(config.storage.dimension, 384);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert!((config.cache.similarity_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.durable.ann_partitions, 256);
        assert_eq!(config.durable.connection_pool_size, 4);
        assert_eq!(
            config.durable.operation_timeout(),
            Duration::from_millis(1500)
        );
        assert!((config.migration.validation_sample_rate - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.migration.cutover_timeout(), Duration::from_secs(10));
        assert_eq!(config.migration.workers, 2);
    }

    #[test]
    fn test_toml_partial_deserialization() {
        let toml_str = r#"
[cache]
ttl_seconds = 120
"#;

        let config = Config::from_toml(toml_str).expect("Failed to parse partial TOML");

        assert_eq!(config.cache.ttl_seconds, 120);
        assert!((config.cache.similarity_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.durable.ann_partitions, 1000);
        assert_eq!(config.migration.batch_size, 500);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let toml_str = r#"
[durable]
connection_pool_size = 0
"#;

        let err = Config::from_toml(toml_str).unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_sample_rate() {
        let mut config = Config::default();
        config.migration.validation_sample_rate = 0.0;
        assert!(config.validate().is_err());

        config.migration.validation_sample_rate = 1.5;
        assert!(config.validate().is_err());

        config.migration.validation_sample_rate = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut config = Config::default();
        config.cache.similarity_threshold = 1.2;
        assert!(config.validate().is_err());
    }
}
