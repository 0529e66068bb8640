//! Anomaly models and the trainer-facing module trait.

pub mod reverse_distillation;
pub mod tiler;

use anomalyst_core::CallbackSpec;
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::tensor::Tensor;
use burn::tensor::backend::AutodiffBackend;

use crate::error::Result;
pub use reverse_distillation::ReverseDistillation;
pub use tiler::Tiler;

/// Lifecycle hooks the [`Trainer`](crate::training::Trainer) drives a model through.
///
/// Training runs on the autodiff backend; validation, testing and prediction run
/// on its inner backend so no graph is recorded.
pub trait AnomalyModule<B: AutodiffBackend>: AutodiffModule<B> + Sized {
    /// Learning rate used for every optimizer step.
    fn learning_rate(&self) -> f64;

    /// Optimizer over the trainable parameters. It must not borrow the model,
    /// which is moved through every optimizer step.
    fn configure_optimizers(&self) -> impl Optimizer<Self, B> + use<Self, B>;

    /// Scalar loss for a batch of normalized images `[N, 3, H, W]`.
    fn training_step(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 1>>;

    /// Anomaly maps `[N, H, W]` for a batch of normalized images.
    fn validation_step(
        &self,
        images: Tensor<B::InnerBackend, 4>,
    ) -> Result<Tensor<B::InnerBackend, 3>>;

    /// Callbacks the model needs regardless of the run configuration.
    fn configure_callbacks(&self) -> Vec<CallbackSpec>;

    /// Enable or disable tiled processing of inputs.
    fn set_tiler(&mut self, tiler: Option<Tiler>) -> Result<()>;
}
