//! # Anomalyst Core
//!
//! Configuration, run-directory layout and callback planning shared by the
//! Anomalyst crates. Nothing in here touches tensors or images.

pub mod callbacks;
pub mod config;
pub mod error;
pub mod persistence;
pub mod project;

pub use callbacks::{CallbackSpec, MODEL_FILENAME, build_callbacks};
pub use config::{
    AnomalyMapMode, CallbackEntry, DataConfig, EarlyStoppingConfig, MetricsConfig, ModelConfig,
    MonitorMode, NormalizationMethod, RunConfig, Task, TilingConfig, TrainerConfig,
    VisualizationConfig, VisualizationMode, load_config,
};
pub use error::{ConfigError, Error, Result};
pub use project::{RunLayout, apply_layout};
