// Configuration module
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use trellis_gateway::GatewayConfig;
use trellis_schema::{MaintenanceConfig, SchemaConfig};
use trellis_store::DatabaseConfig;

/// Top-level server configuration, one section per subsystem. Every field
/// has a default so a missing config file yields a runnable local setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: GatewayConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; console-only when unset.
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default = "default_true")]
    pub log_to_console: bool,
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Per-target level overrides, e.g. `trellis_live = "debug"`.
    #[serde(default)]
    pub targets: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_log_level(),
            file_path: None,
            log_to_console: default_true(),
            format: default_log_format(),
            targets: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file; a missing file falls back to defaults, a
    /// malformed one is fatal.
    pub fn load(path: &str) -> anyhow::Result<AppConfig> {
        if !Path::new(path).exists() {
            eprintln!("config file {} not found, using defaults", path);
            return Ok(AppConfig::default());
        }
        let raw = fs::read_to_string(path)?;
        let config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path, e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let config = AppConfig::default();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.log_to_console);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [database]
            host = "db.internal"
            port = 5433
            user = "svc"
            password = "secret"
            database = "trellis"

            [server]
            port = 9000
            development = true
            "#,
        )
        .unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.server.port, 9000);
        assert!(config.server.development);
        // Untouched sections keep their defaults
        assert_eq!(config.maintenance.gc_hour, 4);
    }
}
