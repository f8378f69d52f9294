//! Configuration for connection migration
//!
//! Durations are stored as integer milliseconds so the configuration reads
//! naturally from TOML/JSON files and environment variables.

use crate::connection_id::MAX_CONNECTION_ID_LENGTH;
use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Prefix for environment variable overrides, e.g. `GQUIC_MIGRATION__AMPLIFICATION_FACTOR=5`
pub const ENV_PREFIX: &str = "GQUIC_MIGRATION";

/// Lowest `active_connection_id_limit` a peer may advertise (RFC 9000 §18.2)
pub const MIN_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

/// Connection migration configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Allow locally initiated (active) migration
    pub migration_enabled: bool,
    /// Bytes that may be sent to an unvalidated address per byte received from it
    pub amplification_factor: u64,
    /// PATH_CHALLENGE transmissions before a path is declared failed
    pub max_validation_attempts: u32,
    /// RTT assumed for paths without samples, in milliseconds
    pub initial_rtt_ms: u64,
    /// First challenge timeout as a multiple of the path RTT
    pub validation_timeout_rtt_factor: u32,
    /// Floor for the challenge timeout, in milliseconds
    pub min_validation_timeout_ms: u64,
    /// Length of locally issued connection IDs
    pub connection_id_length: usize,
    /// Number of peer connection IDs we are willing to store
    pub active_connection_id_limit: u64,
    /// How long a retired connection ID keeps routing packets, in milliseconds
    pub cid_retirement_grace_ms: u64,
    /// Idle time after which a non-active path is evicted, in milliseconds
    pub path_idle_timeout_ms: u64,
    /// Retention of failed paths, in milliseconds
    pub failed_path_retention_ms: u64,
    /// Maximum number of paths tracked per connection
    pub max_paths: usize,
    /// Number of completed migrations kept in the history log
    pub history_capacity: usize,
    /// PATH_CHALLENGE datagrams are padded up to this size when the budget allows
    pub min_probe_datagram_size: usize,
    /// Connection idle timeout in milliseconds, 0 disables it
    pub max_idle_timeout_ms: u64,
    /// Server only: address advertised in the preferred_address transport parameter
    pub preferred_address: Option<SocketAddr>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migration_enabled: true,
            amplification_factor: 3,
            max_validation_attempts: 3,
            initial_rtt_ms: 333,
            validation_timeout_rtt_factor: 3,
            min_validation_timeout_ms: 50,
            connection_id_length: 8,
            active_connection_id_limit: 4,
            cid_retirement_grace_ms: 3_000,
            path_idle_timeout_ms: 30_000,
            failed_path_retention_ms: 10_000,
            max_paths: 8,
            history_capacity: 32,
            min_probe_datagram_size: 1200,
            max_idle_timeout_ms: 30_000,
            preferred_address: None,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading migration config from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: MigrationConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.amplification_factor == 0 {
            return Err(MigrationError::Config(
                "amplification_factor must be at least 1".to_string(),
            ));
        }
        if self.max_validation_attempts == 0 {
            return Err(MigrationError::Config(
                "max_validation_attempts must be at least 1".to_string(),
            ));
        }
        if self.validation_timeout_rtt_factor == 0 {
            return Err(MigrationError::Config(
                "validation_timeout_rtt_factor must be at least 1".to_string(),
            ));
        }
        if self.connection_id_length == 0 || self.connection_id_length > MAX_CONNECTION_ID_LENGTH {
            return Err(MigrationError::Config(format!(
                "connection_id_length must be within 1..={}",
                MAX_CONNECTION_ID_LENGTH
            )));
        }
        if self.active_connection_id_limit < MIN_ACTIVE_CONNECTION_ID_LIMIT {
            return Err(MigrationError::Config(format!(
                "active_connection_id_limit must be at least {}",
                MIN_ACTIVE_CONNECTION_ID_LIMIT
            )));
        }
        if self.max_paths < 2 {
            return Err(MigrationError::Config("max_paths must be at least 2".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(MigrationError::Config(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms)
    }

    pub fn min_validation_timeout(&self) -> Duration {
        Duration::from_millis(self.min_validation_timeout_ms)
    }

    pub fn cid_retirement_grace(&self) -> Duration {
        Duration::from_millis(self.cid_retirement_grace_ms)
    }

    pub fn path_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.path_idle_timeout_ms)
    }

    pub fn failed_path_retention(&self) -> Duration {
        Duration::from_millis(self.failed_path_retention_ms)
    }

    /// Connection idle timeout, `None` when disabled
    pub fn max_idle_timeout(&self) -> Option<Duration> {
        (self.max_idle_timeout_ms > 0).then(|| Duration::from_millis(self.max_idle_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MigrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.amplification_factor, 3);
        assert_eq!(config.max_validation_attempts, 3);
        assert_eq!(config.initial_rtt(), Duration::from_millis(333));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = MigrationConfig { amplification_factor: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = MigrationConfig { connection_id_length: 21, ..Default::default() };
        assert!(config.validate().is_err());

        let config = MigrationConfig { active_connection_id_limit: 1, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_timeout_zero_disables() {
        let config = MigrationConfig { max_idle_timeout_ms: 0, ..Default::default() };
        assert!(config.max_idle_timeout().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("gquic-migration-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("migration.json");
        std::fs::write(
            &path,
            r#"{ "amplification_factor": 5, "preferred_address": "192.0.2.10:4433" }"#,
        )
        .unwrap();

        let config = MigrationConfig::load(Some(&path)).unwrap();
        assert_eq!(config.amplification_factor, 5);
        assert_eq!(config.preferred_address, Some("192.0.2.10:4433".parse().unwrap()));
        assert_eq!(config.max_validation_attempts, 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
