//! Store engine configuration: memory budget, disk layout and I/O retry policy.

use std::{path::PathBuf, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Minimum memory budget: 64 KiB.
const MIN_MEMORY_BUDGET_BYTES: u64 = 64 * 1024;

/// Smallest supported disk block size.
const MIN_DISK_BLOCK_SIZE: usize = 512;

/// Largest supported disk block size.
const MAX_DISK_BLOCK_SIZE: usize = 65536;

/// Store engine configuration.
///
/// # Validation Rules
///
/// - `memory_budget_bytes` must be >= 64 KiB
/// - `read_ahead_headroom_bytes` must be < `memory_budget_bytes`
/// - `disk_block_size` must be a power of two in 512..=65536
/// - `transfer_block_size` must be a non-zero multiple of `disk_block_size`
/// - `io_retry_limit` must be >= 1
///
/// # Example
///
/// ```no_run
/// # use genstore_types::config::StoreConfig;
/// let config = StoreConfig::builder()
///     .root_path("/var/lib/genstore".into())
///     .memory_budget_bytes(512 * 1024 * 1024)
///     .build()
///     .expect("valid store config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Directory holding one file per persisted generation.
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,
    /// Ceiling on bytes held by resident generations and their maps.
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: u64,
    /// Free budget required before read-ahead starts another generation read.
    #[serde(default = "default_read_ahead_headroom")]
    pub read_ahead_headroom_bytes: u64,
    /// Alignment of persisted image lengths.
    #[serde(default = "default_disk_block_size")]
    pub disk_block_size: usize,
    /// Bytes moved per read/write call before checking for preemption.
    #[serde(default = "default_transfer_block_size")]
    pub transfer_block_size: usize,
    /// Attempts allowed for a partial read or write before it fails.
    #[serde(default = "default_io_retry_limit")]
    pub io_retry_limit: u32,
    /// Pause between retries of a partial transfer.
    #[serde(default = "default_io_retry_backoff")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub io_retry_backoff: Duration,
    /// Delete every generation file when the disk scheduler starts.
    #[serde(default)]
    pub clear_on_start: bool,
}

#[bon::bon]
impl StoreConfig {
    /// Creates a new store configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any rule listed on
    /// [`StoreConfig`] is violated.
    #[builder]
    pub fn new(
        #[builder(default = default_root_path())] root_path: PathBuf,
        #[builder(default = default_memory_budget())] memory_budget_bytes: u64,
        #[builder(default = default_read_ahead_headroom())] read_ahead_headroom_bytes: u64,
        #[builder(default = default_disk_block_size())] disk_block_size: usize,
        #[builder(default = default_transfer_block_size())] transfer_block_size: usize,
        #[builder(default = default_io_retry_limit())] io_retry_limit: u32,
        #[builder(default = default_io_retry_backoff())] io_retry_backoff: Duration,
        #[builder(default)] clear_on_start: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            root_path,
            memory_budget_bytes,
            read_ahead_headroom_bytes,
            disk_block_size,
            transfer_block_size,
            io_retry_limit,
            io_retry_backoff,
            clear_on_start,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StoreConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_budget_bytes < MIN_MEMORY_BUDGET_BYTES {
            return Err(ConfigError::Validation {
                message: format!(
                    "memory_budget_bytes must be >= {} (64 KiB), got {}",
                    MIN_MEMORY_BUDGET_BYTES, self.memory_budget_bytes
                ),
            });
        }
        if self.read_ahead_headroom_bytes >= self.memory_budget_bytes {
            return Err(ConfigError::Validation {
                message: format!(
                    "read_ahead_headroom_bytes ({}) must be < memory_budget_bytes ({})",
                    self.read_ahead_headroom_bytes, self.memory_budget_bytes
                ),
            });
        }
        if !self.disk_block_size.is_power_of_two()
            || self.disk_block_size < MIN_DISK_BLOCK_SIZE
            || self.disk_block_size > MAX_DISK_BLOCK_SIZE
        {
            return Err(ConfigError::Validation {
                message: format!(
                    "disk_block_size must be a power of two in {}..={}, got {}",
                    MIN_DISK_BLOCK_SIZE, MAX_DISK_BLOCK_SIZE, self.disk_block_size
                ),
            });
        }
        if self.transfer_block_size == 0 || self.transfer_block_size % self.disk_block_size != 0 {
            return Err(ConfigError::Validation {
                message: format!(
                    "transfer_block_size must be a non-zero multiple of disk_block_size ({}), got {}",
                    self.disk_block_size, self.transfer_block_size
                ),
            });
        }
        if self.io_retry_limit == 0 {
            return Err(ConfigError::Validation {
                message: "io_retry_limit must be >= 1".to_string(),
            });
        }
        Ok(())
    }

    /// Rounds `len` up to the next disk block boundary.
    pub fn round_to_block(&self, len: usize) -> usize {
        len.div_ceil(self.disk_block_size) * self.disk_block_size
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            memory_budget_bytes: default_memory_budget(),
            read_ahead_headroom_bytes: default_read_ahead_headroom(),
            disk_block_size: default_disk_block_size(),
            transfer_block_size: default_transfer_block_size(),
            io_retry_limit: default_io_retry_limit(),
            io_retry_backoff: default_io_retry_backoff(),
            clear_on_start: false,
        }
    }
}

fn default_root_path() -> PathBuf {
    PathBuf::from("data/generations")
}

fn default_memory_budget() -> u64 {
    256 * 1024 * 1024 // 256 MiB
}

fn default_read_ahead_headroom() -> u64 {
    16 * 1024 * 1024 // 16 MiB
}

fn default_disk_block_size() -> usize {
    4096
}

fn default_transfer_block_size() -> usize {
    1024 * 1024
}

fn default_io_retry_limit() -> u32 {
    5000
}

fn default_io_retry_backoff() -> Duration {
    Duration::from_millis(4)
}
