//! Error types for the Anomalyst core.
//!
//! Uses `thiserror` for public API error types. Configuration problems are
//! the only failures the orchestration layer produces on its own; they are
//! raised synchronously and abort the run.

use std::path::PathBuf;

/// Top-level error type for the core library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while validating the run configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown visualization mode: {mode}. Please choose one of ['full', 'simple']")]
    UnknownVisualizationMode { mode: String },

    #[error("Unknown task type: {task}. Please choose one of ['classification', 'segmentation']")]
    UnknownTask { task: String },

    #[error("Unknown normalization type {method}. Available types are either none, min_max or cdf")]
    UnknownNormalization { method: String },

    #[error("OpenVINO and NNCF cannot be set simultaneously.")]
    ExportConflict,

    #[error("--nncf expects a path to nncf config which is a yaml file, but got {}", path.display())]
    InvalidNncfConfig { path: PathBuf },

    #[error("Unknown backbone: {name}. Available backbones are {available:?}")]
    UnknownBackbone {
        name: String,
        available: &'static [&'static str],
    },

    #[error("Unknown feature layer: {name}. Available layers are {available:?}")]
    UnknownLayer {
        name: String,
        available: &'static [&'static str],
    },

    #[error("Unknown metric: {name}. Available metrics are ['F1Score', 'AUROC']")]
    UnknownMetric { name: String },

    #[error("Invalid input size {height}x{width}: both sides must be positive multiples of {multiple}")]
    InvalidInputSize {
        height: usize,
        width: usize,
        multiple: usize,
    },

    #[error("Invalid tiling configuration: {reason}")]
    InvalidTiling { reason: String },

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used across the core crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::UnknownVisualizationMode {
            mode: "fancy".into(),
        };
        assert!(err.to_string().contains("fancy"));

        let err = ConfigError::UnknownTask {
            task: "regression".into(),
        };
        assert!(err.to_string().contains("regression"));

        assert_eq!(
            ConfigError::ExportConflict.to_string(),
            "OpenVINO and NNCF cannot be set simultaneously."
        );
    }

    #[test]
    fn test_config_error_wraps_into_error() {
        let err: Error = ConfigError::invalid("trainer.max_epochs", "must be positive").into();
        assert!(matches!(err, Error::Config(ConfigError::Invalid { .. })));
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
