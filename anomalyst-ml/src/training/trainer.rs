//! The trainer: drives a model through fit, validate, test and predict while
//! dispatching callback hooks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anomalyst_core::{RunConfig, Task};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::ElementConversion;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info, warn};

use super::callbacks::{CallbackAction, TrainingCallback};
use super::metrics::MetricCollection;
use super::outputs::{PredictionRecord, StepOutputs};
use super::state::{Stage, Thresholds, TrainerState};
use crate::data::{Batch, FolderDataModule};
use crate::error::{MlError, Result};
use crate::models::AnomalyModule;

/// Threshold used before calibration when no default is configured.
pub const FALLBACK_THRESHOLD: f32 = 0.5;

pub struct Trainer<B: AutodiffBackend, M: AnomalyModule<B>> {
    max_epochs: usize,
    limit_train_batches: Option<usize>,
    check_val_every_n_epoch: usize,
    adaptive_threshold: bool,
    image_metric_names: Vec<String>,
    pixel_metric_names: Vec<String>,
    task: Task,
    datamodule: FolderDataModule,
    callbacks: Vec<Box<dyn TrainingCallback<B, M>>>,
    state: TrainerState,
    device: B::Device,
}

fn run_inference<B, M>(
    model: &M,
    batch: Batch,
    device: &B::Device,
    thresholds: &Thresholds,
    task: Task,
) -> Result<StepOutputs>
where
    B: AutodiffBackend,
    M: AnomalyModule<B>,
{
    let images = batch.to_tensor::<B::InnerBackend>(device);
    let maps = model.validation_step(images)?;
    let mut outputs = StepOutputs::from_maps(batch, maps)?;
    outputs.apply_thresholds(thresholds, task);
    Ok(outputs)
}

fn update_metrics(
    outputs: &StepOutputs,
    image_metrics: &mut MetricCollection,
    pixel_metrics: &mut MetricCollection,
) {
    if let Some(labels) = &outputs.labels {
        image_metrics.update(&outputs.pred_scores, labels);
    }
    if let Some(masks) = &outputs.gt_masks {
        for (map, mask) in outputs.anomaly_maps.iter().zip(masks) {
            pixel_metrics.update_pixels(map, mask);
        }
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> Trainer<B, M> {
    /// Build a trainer over a datamodule. The datamodule is scanned here, so
    /// missing dataset folders fail before any model work.
    pub fn new(
        config: &RunConfig,
        mut datamodule: FolderDataModule,
        callbacks: Vec<Box<dyn TrainingCallback<B, M>>>,
        device: B::Device,
    ) -> Result<Self> {
        // Reject unknown metric names up front.
        MetricCollection::new("image", &config.metrics.image_metric_names)?;
        MetricCollection::new("pixel", &config.metrics.pixel_metric_names)?;
        datamodule.setup()?;

        let metrics = &config.metrics;
        let thresholds = Thresholds {
            image: metrics
                .default_image_threshold
                .map_or(FALLBACK_THRESHOLD, |t| t as f32),
            pixel: metrics
                .default_pixel_threshold
                .map_or(FALLBACK_THRESHOLD, |t| t as f32),
        };

        info!(
            callbacks = ?callbacks.iter().map(|c| c.name()).collect::<Vec<_>>(),
            max_epochs = config.trainer.max_epochs,
            adaptive_threshold = metrics.adaptive_threshold,
            "Trainer ready"
        );

        Ok(Self {
            max_epochs: config.trainer.max_epochs,
            limit_train_batches: config.trainer.limit_train_batches,
            check_val_every_n_epoch: config.trainer.check_val_every_n_epoch.max(1),
            adaptive_threshold: metrics.adaptive_threshold,
            image_metric_names: metrics.image_metric_names.clone(),
            pixel_metric_names: metrics.pixel_metric_names.clone(),
            task: config.visualization.parsed_task()?,
            datamodule,
            callbacks,
            state: TrainerState::new(thresholds, !metrics.adaptive_threshold),
            device,
        })
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn datamodule(&self) -> &FolderDataModule {
        &self.datamodule
    }

    /// Setting the returned flag stops the current stage at the next batch.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.state.cancel_flag()
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.state.set_cancel_flag(flag);
        self
    }

    fn setup(&mut self, stage: Stage, model: &mut M) -> Result<()> {
        self.state.stage = stage;
        debug!(stage = %stage, "Setting up callbacks");
        for callback in self.callbacks.iter_mut() {
            callback.setup(stage, model, &self.device, &mut self.state)?;
        }
        Ok(())
    }

    fn teardown(&mut self, stage: Stage) -> Result<()> {
        for callback in self.callbacks.iter_mut() {
            callback.teardown(stage, &self.state)?;
        }
        Ok(())
    }

    /// Dispatch `on_save_checkpoint` if requested; returns whether to stop.
    fn handle_actions(&mut self, model: &M, actions: &[CallbackAction]) -> Result<bool> {
        if actions.contains(&CallbackAction::Checkpoint) {
            for callback in self.callbacks.iter_mut() {
                callback.on_save_checkpoint(model, &self.state)?;
            }
        }
        Ok(actions.contains(&CallbackAction::Stop))
    }

    fn metric_collections(&self) -> Result<(MetricCollection, MetricCollection)> {
        Ok((
            MetricCollection::new("image", &self.image_metric_names)?,
            MetricCollection::new("pixel", &self.pixel_metric_names)?,
        ))
    }

    /// One pass over the validation split: calibrate thresholds, compute
    /// metrics and collect the callbacks' requests.
    fn validation_pass(
        &mut self,
        model: &M,
    ) -> Result<(BTreeMap<String, f64>, Vec<CallbackAction>)> {
        let (mut image_metrics, mut pixel_metrics) = self.metric_collections()?;
        for callback in self.callbacks.iter_mut() {
            callback.on_validation_start(&self.state)?;
        }

        for batch in self.datamodule.val_batches()? {
            self.state.check_cancelled()?;
            let mut outputs = run_inference::<B, M>(
                model,
                batch?,
                &self.device,
                &self.state.thresholds,
                self.task,
            )?;
            update_metrics(&outputs, &mut image_metrics, &mut pixel_metrics);
            for callback in self.callbacks.iter_mut() {
                callback.on_validation_batch_end(&mut outputs, &self.state)?;
            }
        }

        if self.adaptive_threshold {
            match image_metrics.adaptive_threshold() {
                Some(threshold) => self.state.thresholds.image = threshold,
                None => warn!("No anomalous validation images; image threshold unchanged"),
            }
            // Without ground-truth masks the pixel threshold follows the image one.
            self.state.thresholds.pixel = pixel_metrics
                .adaptive_threshold()
                .unwrap_or(self.state.thresholds.image);
            self.state.thresholds_calibrated = true;
        }

        let thresholds = self.state.thresholds;
        let mut metrics = image_metrics.compute(thresholds.image);
        metrics.extend(pixel_metrics.compute(thresholds.pixel));
        info!(
            epoch = self.state.epoch,
            image_threshold = thresholds.image,
            pixel_threshold = thresholds.pixel,
            metrics = ?metrics,
            "Validation finished"
        );
        self.state.metrics.extend(metrics.clone());

        let mut actions = Vec::with_capacity(self.callbacks.len());
        for callback in self.callbacks.iter_mut() {
            actions.push(callback.on_validation_end(&mut self.state)?);
        }
        Ok((metrics, actions))
    }

    /// Train `model` for up to `max_epochs`, validating on schedule. Returns the
    /// trained model.
    pub fn fit(&mut self, mut model: M) -> Result<M> {
        self.setup(Stage::Fit, &mut model)?;
        for callback in self.callbacks.iter_mut() {
            callback.on_fit_start(&model, &self.state)?;
        }

        let mut optim = model.configure_optimizers();
        let lr = model.learning_rate();

        for epoch in 0..self.max_epochs {
            self.state.epoch = epoch;
            let mut total = 0.0f64;
            let mut steps = 0usize;

            for (index, batch) in self.datamodule.train_batches(epoch)?.enumerate() {
                if self.limit_train_batches.is_some_and(|limit| index >= limit) {
                    break;
                }
                self.state.check_cancelled()?;
                let images = batch?.to_tensor::<B>(&self.device);
                let loss = model.training_step(images)?;
                let value = f64::from(loss.clone().into_scalar().elem::<f32>());
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);

                self.state.global_step += 1;
                total += value;
                steps += 1;
                debug!(epoch, step = self.state.global_step, loss = value, "Training step");
            }

            if steps == 0 {
                return Err(MlError::training("no training batches were run"));
            }
            let mean_loss = total / steps as f64;
            if !mean_loss.is_finite() {
                return Err(MlError::training(format!(
                    "loss diverged at epoch {epoch}: {mean_loss}"
                )));
            }
            self.state.train_losses.push(mean_loss);
            info!(
                epoch = epoch + 1,
                max_epochs = self.max_epochs,
                loss = mean_loss,
                "Epoch finished"
            );

            let mut actions = Vec::new();
            for callback in self.callbacks.iter_mut() {
                actions.push(callback.on_train_epoch_end(&self.state)?);
            }
            let last = epoch + 1 == self.max_epochs;
            if (epoch + 1) % self.check_val_every_n_epoch == 0 || last {
                let (_, validation_actions) = self.validation_pass(&model)?;
                actions.extend(validation_actions);
            }
            if self.handle_actions(&model, &actions)? {
                info!(epoch = epoch + 1, "Stopping early");
                break;
            }
        }

        for callback in self.callbacks.iter_mut() {
            callback.on_fit_end(&model, &self.state)?;
        }
        self.teardown(Stage::Fit)?;
        Ok(model)
    }

    /// Run the validation split once and return its metrics.
    pub fn validate(&mut self, model: &mut M) -> Result<BTreeMap<String, f64>> {
        self.setup(Stage::Validate, model)?;
        let (metrics, _) = self.validation_pass(model)?;
        self.teardown(Stage::Validate)?;
        Ok(metrics)
    }

    /// Evaluate on the test split. Thresholds that were never calibrated are
    /// calibrated on the validation split first.
    pub fn test(&mut self, model: &mut M) -> Result<BTreeMap<String, f64>> {
        self.setup(Stage::Test, model)?;
        if !self.state.thresholds_calibrated {
            info!("Thresholds are not calibrated; running a validation pass first");
            self.validation_pass(model)?;
        }

        let (mut image_metrics, mut pixel_metrics) = self.metric_collections()?;
        for batch in self.datamodule.test_batches()? {
            self.state.check_cancelled()?;
            let mut outputs = run_inference::<B, M>(
                model,
                batch?,
                &self.device,
                &self.state.thresholds,
                self.task,
            )?;
            update_metrics(&outputs, &mut image_metrics, &mut pixel_metrics);
            for callback in self.callbacks.iter_mut() {
                callback.on_test_batch_end(&mut outputs, &self.state)?;
            }
        }

        let thresholds = self.state.thresholds;
        let mut metrics = image_metrics.compute(thresholds.image);
        metrics.extend(pixel_metrics.compute(thresholds.pixel));
        info!(metrics = ?metrics, "Test finished");
        self.state.metrics.extend(metrics.clone());
        self.teardown(Stage::Test)?;
        Ok(metrics)
    }

    /// Predict every image at `input` (a file or a directory).
    pub fn predict(&mut self, model: &mut M, input: &Path) -> Result<Vec<PredictionRecord>> {
        self.setup(Stage::Predict, model)?;
        if !self.state.thresholds_calibrated {
            warn!(
                image_threshold = self.state.thresholds.image,
                pixel_threshold = self.state.thresholds.pixel,
                "Predicting with uncalibrated thresholds"
            );
        }

        let mut records = Vec::new();
        for batch in self.datamodule.predict_batches(input)? {
            self.state.check_cancelled()?;
            let mut outputs = run_inference::<B, M>(
                model,
                batch?,
                &self.device,
                &self.state.thresholds,
                self.task,
            )?;
            for callback in self.callbacks.iter_mut() {
                callback.on_predict_batch_end(&mut outputs, &self.state)?;
            }
            records.extend(outputs.records());
        }
        info!(images = records.len(), "Prediction finished");
        self.teardown(Stage::Predict)?;
        Ok(records)
    }
}
