//! Pipeline configuration — a static TOML file read once by the binary.
//!
//! The library crates never read the environment or files on their own;
//! everything below is turned into plain parameters by [`crate::Pipeline`].
//!
//! ```toml
//! symbols = ["BTCUSDT", "ETHUSDT"]
//!
//! [storage]
//! root = "/var/lib/klineflow/objects"
//! bucket = "market-data"
//!
//! [warehouse]
//! root = "/var/lib/klineflow/warehouse"
//! project = "analytics"
//! dataset = "crypto"
//! ```

use klineflow_core::path::{is_valid_symbol, DEFAULT_PREFIX};
use klineflow_core::source::DEFAULT_BASE_URL;
use klineflow_core::{ExtractionConfig, PathCodec, ResumePolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub run: RunConfig,
}

/// Upstream klines API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub base_url: String,
    pub interval: String,
    /// Page size; a shorter page is treated as the trailing partial window.
    pub limit: usize,
    /// Start of history for a symbol with no objects yet.
    pub default_start_ms: i64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            interval: "1m".to_string(),
            limit: 720,
            default_start_ms: 1_609_459_200_000,
            max_attempts: 3,
            retry_delay_secs: 10,
            timeout_secs: 30,
        }
    }
}

/// Object storage bucket backed by a local directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Where Parquet files are staged before upload. Defaults to the system
    /// temp directory.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    pub root: PathBuf,
    pub project: String,
    pub dataset: String,
    /// Per-symbol tables are `{table_prefix}{symbol}` (lowercased symbol).
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default = "default_tracking_table")]
    pub tracking_table: String,
}

fn default_table_prefix() -> String {
    "raw_binance_klines_".to_string()
}

fn default_tracking_table() -> String {
    "bq_load_tracking".to_string()
}

/// Worker counts and resume behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub extract_workers: usize,
    /// Bounds concurrent warehouse jobs.
    pub load_workers: usize,
    /// Refine the resume point from the latest object's close times.
    pub resume_from_tail: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            extract_workers: 4,
            load_workers: 3,
            resume_from_tail: true,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a configuration string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.symbols.is_empty() {
            return invalid("symbols must not be empty".into());
        }
        let mut seen = BTreeSet::new();
        for symbol in &self.symbols {
            if !is_valid_symbol(symbol) {
                return invalid(format!("symbol '{symbol}' is not ASCII alphanumeric"));
            }
            if !seen.insert(symbol.as_str()) {
                return invalid(format!("symbol '{symbol}' is listed twice"));
            }
        }

        if self.source.limit == 0 {
            return invalid("source.limit must be at least 1".into());
        }
        if self.source.max_attempts == 0 {
            return invalid("source.max_attempts must be at least 1".into());
        }
        if self.source.interval.trim().is_empty() {
            return invalid("source.interval must not be empty".into());
        }
        if self.storage.bucket.trim().is_empty() {
            return invalid("storage.bucket must not be empty".into());
        }

        for (field, value) in [
            ("warehouse.project", &self.warehouse.project),
            ("warehouse.dataset", &self.warehouse.dataset),
            ("warehouse.tracking_table", &self.warehouse.tracking_table),
        ] {
            if !is_identifier(value) {
                return invalid(format!(
                    "{field} '{value}' must be non-empty letters, digits, '_' or '-'"
                ));
            }
        }
        let table_prefix = &self.warehouse.table_prefix;
        if !table_prefix.is_empty() && !is_identifier(table_prefix) {
            return invalid(format!(
                "warehouse.table_prefix '{table_prefix}' must be letters, digits, '_' or '-'"
            ));
        }

        if self.run.extract_workers == 0 || self.run.load_workers == 0 {
            return invalid("worker counts must be at least 1".into());
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.source.max_attempts,
            delay: Duration::from_secs(self.source.retry_delay_secs),
        }
    }

    pub fn extraction_config(&self) -> ExtractionConfig {
        ExtractionConfig {
            interval: self.source.interval.clone(),
            limit: self.source.limit,
            default_start_ms: self.source.default_start_ms,
            resume: if self.run.resume_from_tail {
                ResumePolicy::TailCloseTime
            } else {
                ResumePolicy::ObjectName
            },
        }
    }

    pub fn codec(&self) -> PathCodec {
        PathCodec::new(self.storage.prefix.as_str())
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
