//! # Anomalyst ML
//!
//! The reverse distillation network, the MVTec folder datamodule and the
//! trainer that drives a model through fit, validate, test and predict with a
//! pipeline of callbacks.

pub mod data;
pub mod error;
pub mod models;
pub mod training;

use burn::backend::{Autodiff, NdArray};

pub use data::{Batch, FolderDataModule};
pub use error::{MlError, Result};
pub use models::{AnomalyModule, ReverseDistillation, Tiler};
pub use training::{
    CallbackAction, PredictionRecord, Stage, Trainer, TrainerState, TrainingCallback,
    instantiate_callbacks, merge_callback_specs,
};

/// CPU backend used for inference.
pub type InferenceBackend = NdArray<f32>;

/// CPU backend with gradient tracking, used for fitting.
pub type TrainingBackend = Autodiff<InferenceBackend>;
