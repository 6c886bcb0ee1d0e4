//! Configuration types for genstore.
//!
//! Config structs validate their values at construction time via fallible
//! builders. Post-deserialization validation is available via the
//! `validate()` method on each struct.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions.
#![allow(clippy::disallowed_methods)]

mod store;

use snafu::Snafu;
pub use store::*;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation { message: "test error".to_string() };
        assert_eq!(err.to_string(), "invalid config: test error");
    }

    // =========================================================================
    // StoreConfig validation tests
    // =========================================================================

    #[test]
    fn test_store_config_defaults_are_valid() {
        let config = StoreConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.memory_budget_bytes, 256 * 1024 * 1024);
        assert_eq!(config.read_ahead_headroom_bytes, 16 * 1024 * 1024);
        assert_eq!(config.disk_block_size, 4096);
        assert_eq!(config.transfer_block_size, 1024 * 1024);
        assert_eq!(config.io_retry_limit, 5000);
        assert_eq!(config.io_retry_backoff, Duration::from_millis(4));
        assert!(!config.clear_on_start);
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn test_store_config_builder_with_custom_values() {
        let config = StoreConfig::builder()
            .root_path(PathBuf::from("/tmp/gens"))
            .memory_budget_bytes(8 * 1024 * 1024)
            .read_ahead_headroom_bytes(1024 * 1024)
            .disk_block_size(512)
            .transfer_block_size(64 * 1024)
            .io_retry_limit(3)
            .io_retry_backoff(Duration::from_millis(1))
            .clear_on_start(true)
            .build()
            .expect("valid custom config");
        assert_eq!(config.root_path, PathBuf::from("/tmp/gens"));
        assert_eq!(config.disk_block_size, 512);
        assert_eq!(config.io_retry_limit, 3);
        assert!(config.clear_on_start);
    }

    #[test]
    fn test_store_config_memory_budget_minimum() {
        let result = StoreConfig::builder()
            .memory_budget_bytes(64 * 1024)
            .read_ahead_headroom_bytes(0)
            .build();
        assert!(result.is_ok());

        let result = StoreConfig::builder()
            .memory_budget_bytes(64 * 1024 - 1)
            .read_ahead_headroom_bytes(0)
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("memory_budget_bytes"));
        assert!(err.to_string().contains("64 KiB"));
    }

    #[test]
    fn test_store_config_headroom_must_fit_budget() {
        let result = StoreConfig::builder()
            .memory_budget_bytes(1024 * 1024)
            .read_ahead_headroom_bytes(1024 * 1024)
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("read_ahead_headroom_bytes"));
    }

    #[test]
    fn test_store_config_disk_block_size_rules() {
        for bad in [0usize, 256, 1000, 128 * 1024] {
            let result = StoreConfig::builder()
                .disk_block_size(bad)
                .transfer_block_size(1024 * 1024)
                .build();
            assert!(result.is_err(), "block size {bad} should be rejected");
        }
        assert!(StoreConfig::builder().disk_block_size(512).build().is_ok());
        assert!(StoreConfig::builder().disk_block_size(65536).build().is_ok());
    }

    #[test]
    fn test_store_config_transfer_block_must_be_multiple() {
        let result = StoreConfig::builder().transfer_block_size(4096 * 3 + 1).build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("transfer_block_size"));

        let result = StoreConfig::builder().transfer_block_size(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_store_config_retry_limit_nonzero() {
        let result = StoreConfig::builder().io_retry_limit(0).build();
        assert!(result.unwrap_err().to_string().contains("io_retry_limit"));
    }

    #[test]
    fn test_round_to_block() {
        let config = StoreConfig::default();
        assert_eq!(config.round_to_block(0), 0);
        assert_eq!(config.round_to_block(1), 4096);
        assert_eq!(config.round_to_block(4096), 4096);
        assert_eq!(config.round_to_block(4097), 8192);
    }

    #[test]
    fn test_store_config_serde_defaults_and_humantime() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"io_retry_backoff":"10ms","clear_on_start":true}"#).unwrap();
        assert_eq!(config.io_retry_backoff, Duration::from_millis(10));
        assert!(config.clear_on_start);
        assert_eq!(config.memory_budget_bytes, 256 * 1024 * 1024);
        config.validate().expect("deserialized config should validate");

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"10ms\""));
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_store_config_validate_after_deserialize_catches_errors() {
        let config: StoreConfig = serde_json::from_str(r#"{"disk_block_size":1000}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
