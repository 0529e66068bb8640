//! Error types for the visualization crate.

use anomalyst_core::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Cannot render an image grid without any image")]
    EmptyGrid,

    #[error("Segmentation visualization requires a predicted mask")]
    MissingPredictedMask,

    #[error("Batch field '{field}' has {actual} entries, expected {expected}")]
    DimensionMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VisionError>;
