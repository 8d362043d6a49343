//! Configuration loading and validation.
//!
//! Configuration comes from a YAML file, from `SOURCE_KEYDB_*`, `DEST_KEYDB_*`
//! and `MIGRATION_*` environment variables, or both (environment wins).

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use std::path::Path;
use std::str::FromStr;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults plus process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config {
            source: StoreConfig::default(),
            destination: StoreConfig::default(),
            migration: MigrationConfig::default(),
        };
        config.apply_env_with(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())?;
        self.validate()
    }

    /// Override fields from an arbitrary variable lookup.
    ///
    /// Unset and empty variables leave the current value untouched; a value that
    /// does not parse is a configuration error.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        apply_store_env(&mut self.source, "SOURCE_KEYDB", &get)?;
        apply_store_env(&mut self.destination, "DEST_KEYDB", &get)?;

        let m = &mut self.migration;
        if let Some(v) = get("MIGRATION_BATCH_SIZE") {
            m.batch_size = parse_var("MIGRATION_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MIGRATION_WORKERS") {
            m.workers = Some(parse_var("MIGRATION_WORKERS", &v)?);
        }
        if let Some(v) = get("MIGRATION_MATCH") {
            m.match_pattern = v;
        }
        if let Some(v) = get("MIGRATION_TIMEOUT_SECS") {
            m.timeout_secs = parse_var("MIGRATION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("MIGRATION_OPERATION_TIMEOUT_MS") {
            m.operation_timeout_ms = parse_var("MIGRATION_OPERATION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("MIGRATION_RETRY_COUNT") {
            m.retry_count = parse_var("MIGRATION_RETRY_COUNT", &v)?;
        }
        if let Some(v) = get("MIGRATION_RETRY_DELAY_MS") {
            m.retry_delay_ms = parse_var("MIGRATION_RETRY_DELAY_MS", &v)?;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

fn apply_store_env<G>(store: &mut StoreConfig, prefix: &str, get: &G) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(v) = get(&format!("{prefix}_HOST")) {
        store.host = v;
    }
    if let Some(v) = get(&format!("{prefix}_PORT")) {
        store.port = parse_var(&format!("{prefix}_PORT"), &v)?;
    }
    if let Some(v) = get(&format!("{prefix}_PASSWORD")) {
        store.password = v;
    }
    if let Some(v) = get(&format!("{prefix}_USERNAME")) {
        store.username = Some(v);
    }
    if let Some(v) = get(&format!("{prefix}_DB")) {
        store.database = parse_var(&format!("{prefix}_DB"), &v)?;
    }
    if let Some(v) = get(&format!("{prefix}_POOL_SIZE")) {
        store.pool_size = parse_var(&format!("{prefix}_POOL_SIZE"), &v)?;
    }
    Ok(())
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MigrateError::Config(format!("{name}: invalid value '{value}'")))
}

impl StoreConfig {
    /// `host:port/db` label for logs; never includes credentials.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Build connection info for the redis client.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.database,
                username: self.username.clone(),
                password: (!self.password.is_empty()).then(|| self.password.clone()),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r#"
source:
  host: keydb-old
  password: hunter2
destination:
  host: keydb-new
  port: 6380
  database: 2
migration:
  batch_size: 500
  workers: 16
  retry_count: 2
  backoff: fixed
"#;

    #[test]
    fn test_from_yaml_with_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 6379);
        assert_eq!(config.source.pool_size, 20);
        assert_eq!(config.destination.port, 6380);
        assert_eq!(config.destination.database, 2);
        assert_eq!(config.migration.batch_size, 500);
        assert_eq!(config.migration.get_workers(), 16);
        assert_eq!(config.migration.retry_count, 2);
        assert_eq!(config.migration.backoff, BackoffStrategy::Fixed);
        assert_eq!(config.migration.match_pattern, "*");
        assert_eq!(config.migration.progress_interval_secs, 10);
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.source.host, "keydb-old");
        assert_eq!(config.destination.host, "keydb-new");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Config::load("/nonexistent/keydb-migrate.yaml").unwrap_err();
        assert!(matches!(err, MigrateError::Io(_)));
    }

    #[test]
    fn test_empty_yaml_is_error() {
        assert!(Config::from_yaml("").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_yaml(YAML).unwrap();
        let vars: HashMap<&str, &str> = [
            ("SOURCE_KEYDB_HOST", "10.0.0.5"),
            ("DEST_KEYDB_POOL_SIZE", "64"),
            ("MIGRATION_WORKERS", "8"),
            ("MIGRATION_RETRY_DELAY_MS", "250"),
            ("MIGRATION_BATCH_SIZE", ""),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_with(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.source.host, "10.0.0.5");
        assert_eq!(config.destination.pool_size, 64);
        assert_eq!(config.migration.workers, Some(8));
        assert_eq!(config.migration.retry_delay_ms, 250);
        // empty variable keeps file value
        assert_eq!(config.migration.batch_size, 500);
    }

    #[test]
    fn test_env_invalid_number_is_config_error() {
        let mut config = Config::from_yaml(YAML).unwrap();
        let err = config
            .apply_env_with(|k| (k == "SOURCE_KEYDB_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_connection_info_omits_empty_password() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(
            config.source.connection_info().redis.password.as_deref(),
            Some("hunter2")
        );
        assert!(config.destination.connection_info().redis.password.is_none());
        assert_eq!(config.destination.connection_info().redis.db, 2);
    }

    #[test]
    fn test_auto_tuning_raises_pool_to_workers() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.migration.workers = None;
        config.apply_auto_tuning(&SystemResources {
            cpu_cores: 32,
        });
        assert_eq!(config.migration.workers, Some(64));
        assert_eq!(config.source.pool_size, 64);
        assert_eq!(config.destination.pool_size, 64);
    }

    #[test]
    fn test_auto_tuning_respects_workers_override() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.migration.workers = Some(96);
        config.apply_auto_tuning(&SystemResources { cpu_cores: 2 });
        assert_eq!(config.migration.workers, Some(96));
        assert_eq!(config.source.pool_size, 96);
        assert!(config.destination.pool_size >= 96);
    }

    #[test]
    fn test_endpoint_has_no_credentials() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.endpoint(), "keydb-old:6379/0");
    }
}
