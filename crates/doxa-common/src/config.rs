//! Configuration structs for every subsystem, with their documented
//! defaults. Loadable from TOML or JSON via [`Config::load`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub bm25: Bm25Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            commit: CommitConfig::default(),
            cache: CacheConfig::default(),
            streaming: StreamingConfig::default(),
            bm25: Bm25Config::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file, dispatching on extension.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Internal(format!("failed to read config file: {e}")))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Internal(format!("failed to parse TOML config: {e}")))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Internal(format!("failed to parse JSON config: {e}")))?
        };

        Ok(config)
    }
}

/// Commit engine retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Target size in bytes for compaction outputs.
    pub target_file_size: u64,
    /// Files at or below this size are eligible for compaction.
    pub min_file_size: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_backoff_ms: 50,
            max_backoff_ms: 5_000,
            target_file_size: 128 * 1024 * 1024,
            min_file_size: 16 * 1024 * 1024,
        }
    }
}

/// Cache TTLs per content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub data_ttl_secs: u64,
    pub metadata_ttl_secs: u64,
    pub bloom_ttl_secs: u64,
    pub stale_while_revalidate: bool,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_ttl_secs: 60,
            metadata_ttl_secs: 300,
            bloom_ttl_secs: 600,
            stale_while_revalidate: true,
            max_entries: 10_000,
        }
    }
}

/// Streaming refresh engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_buffer_size: usize,
    #[serde(default)]
    pub retry: StreamingRetryConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 1_000,
            max_buffer_size: 10_000,
            retry: StreamingRetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StreamingRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

/// BM25 scoring constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bm25Config {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}
