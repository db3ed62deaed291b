use std::path::{Path, PathBuf};

use crate::config::schema::OperatorConfig;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/operator-config-v1.json");

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "FOREMAN_CONFIG";

/// `$FOREMAN_CONFIG`, else `~/.foreman.yaml`.
pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".foreman.yaml"),
    }
}

pub fn load_default_config() -> Result<OperatorConfig, ConfigError> {
    load_config(config_path())
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<OperatorConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<OperatorConfig, ConfigError> {
    let value: serde_json::Value = serde_yaml::from_str(content)?;
    if value.is_null() {
        return Err(ConfigError::Validation {
            message: "config is empty".to_string(),
        });
    }

    validate_schema(&value)?;

    let config: OperatorConfig = serde_json::from_value(value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let compiled = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let errors: Vec<String> = compiled
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path()))
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: errors.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &OperatorConfig) -> Result<(), ConfigError> {
    if config.cluster.contains('/') {
        return Err(ConfigError::Validation {
            message: format!("cluster must be a single path segment: {}", config.cluster),
        });
    }

    if config.base_path.starts_with("gs://") && config.base_path.trim_end_matches('/') == "gs:/" {
        return Err(ConfigError::Validation {
            message: "basePath has no bucket".to_string(),
        });
    }

    Ok(())
}
