//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.destination.host.is_empty() {
        return Err(MigrateError::Config("destination.host is required".into()));
    }
    if config.source.pool_size == 0 || config.destination.pool_size == 0 {
        return Err(MigrateError::Config("pool_size must be at least 1".into()));
    }

    // Cannot migrate onto the same logical database
    if config.source.host == config.destination.host
        && config.source.port == config.destination.port
        && config.source.database == config.destination.database
    {
        return Err(MigrateError::Config(
            "source and destination cannot be the same database".into(),
        ));
    }

    let migration = &config.migration;
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if migration.match_pattern.is_empty() {
        return Err(MigrateError::Config(
            "migration.match_pattern cannot be empty".into(),
        ));
    }
    if migration.operation_timeout_ms == 0 {
        return Err(MigrateError::Config(
            "migration.operation_timeout_ms must be at least 1".into(),
        ));
    }
    if migration.retry_delay_ms > migration.max_retry_delay_ms {
        return Err(MigrateError::Config(format!(
            "migration.retry_delay_ms ({}) exceeds max_retry_delay_ms ({})",
            migration.retry_delay_ms, migration.max_retry_delay_ms
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, StoreConfig};

    fn valid_config() -> Config {
        Config {
            source: StoreConfig {
                host: "keydb-old".to_string(),
                ..StoreConfig::default()
            },
            destination: StoreConfig {
                host: "keydb-new".to_string(),
                ..StoreConfig::default()
            },
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.destination.host = config.source.host.clone();
        assert!(validate(&config).is_err());

        // Different logical db on the same server is fine
        config.destination.database = 1;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = valid_config();
        config.migration.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_retry_delay_above_cap_rejected() {
        let mut config = valid_config();
        config.migration.retry_delay_ms = 10_000;
        config.migration.max_retry_delay_ms = 1_000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_store_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }
}
