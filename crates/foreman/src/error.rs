use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the rollout operator.
#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Invalid resource id '{0}': expected <namespace>/<name>")]
    InvalidResourceId(String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid {asset_type}/{release} asset: {reason}")]
    InvalidAsset {
        asset_type: String,
        release: String,
        reason: String,
    },

    #[error("Schema check failed: {}", violations.join("; "))]
    SchemaViolation { violations: Vec<String> },

    #[error("Lock '{key}' is held by another owner")]
    LockContention { key: String },

    #[error("Unlock error: lock '{key}' has negative reference count")]
    LockUnderflow { key: String },

    #[error("Deadline exceeded while {what}")]
    Timeout { what: String },

    #[error("Interrupted while {what}")]
    Interrupted { what: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Cluster operation failed: {0}")]
    Cluster(String),

    #[error("Backing store operation failed: {0}")]
    Store(String),

    #[error("Templating failed: {0}")]
    Template(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Command '{program}' failed: {message}")]
    Command { program: String, message: String },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to {action} resource {resource}: {source}")]
    Operation {
        action: &'static str,
        resource: String,
        #[source]
        source: Box<ForemanError>,
    },
}

impl ForemanError {
    /// Builds an `Io` error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ForemanError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ForemanError::NotFound { .. } => true,
            ForemanError::Operation { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if the error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForemanError::LockContention { .. })
    }

    /// Wraps the error with the action and resource it aborted.
    pub fn during(self, action: &'static str, resource: impl Into<String>) -> Self {
        ForemanError::Operation {
            action,
            resource: resource.into(),
            source: Box::new(self),
        }
    }
}

/// Errors raised while loading the operator configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Result type for operator operations.
pub type Result<T> = std::result::Result<T, ForemanError>;
