//! Training callbacks: the hook trait, early stopping, timing, tiling, and
//! instantiation of the planned callback pipeline.

use std::time::Instant;

use anomalyst_core::{CallbackSpec, EarlyStoppingConfig, MonitorMode, NormalizationMethod};
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info, warn};

use super::checkpoint::{LoadModelCallback, ModelCheckpoint};
use super::export::{ExportCallback, ExportFormat};
use super::normalization::{CdfNormalizationCallback, MinMaxNormalizationCallback};
use super::outputs::StepOutputs;
use super::state::{Stage, TrainerState};
use super::visualizer::VisualizerCallback;
use crate::error::Result;
use crate::models::{AnomalyModule, Tiler};

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
    Checkpoint,
}

/// Hooks invoked by the [`Trainer`](super::Trainer). Every hook has a no-op default.
pub trait TrainingCallback<B: AutodiffBackend, M: AnomalyModule<B>>: Send {
    fn name(&self) -> &'static str;

    /// Called once before any stage runs; the only hook that may change the model.
    fn setup(
        &mut self,
        _stage: Stage,
        _model: &mut M,
        _device: &B::Device,
        _state: &mut TrainerState,
    ) -> Result<()> {
        Ok(())
    }

    fn on_fit_start(&mut self, _model: &M, _state: &TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_train_epoch_end(&mut self, _state: &TrainerState) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_validation_start(&mut self, _state: &TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        _outputs: &mut StepOutputs,
        _state: &TrainerState,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after thresholds and metrics of the validation pass are in `state`.
    fn on_validation_end(&mut self, _state: &mut TrainerState) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_save_checkpoint(&mut self, _model: &M, _state: &TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_test_batch_end(&mut self, _outputs: &mut StepOutputs, _state: &TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_predict_batch_end(
        &mut self,
        _outputs: &mut StepOutputs,
        _state: &TrainerState,
    ) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _model: &M, _state: &TrainerState) -> Result<()> {
        Ok(())
    }

    fn teardown(&mut self, _stage: Stage, _state: &TrainerState) -> Result<()> {
        Ok(())
    }
}

/// Stops training once the monitored metric has not improved for `patience`
/// validation passes.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub monitor: String,
    pub mode: MonitorMode,
    pub patience: usize,
    pub min_delta: f64,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStopping {
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            monitor: config.metric.clone(),
            mode: config.mode,
            patience: config.patience,
            min_delta: config.min_delta.abs(),
            counter: 0,
            best: None,
        }
    }

    fn improved(&self, value: f64, best: f64) -> bool {
        match self.mode {
            MonitorMode::Min => value < best - self.min_delta,
            MonitorMode::Max => value > best + self.min_delta,
        }
    }

    /// Feed one observation of the monitored metric.
    pub fn observe(&mut self, value: f64) -> CallbackAction {
        match self.best {
            Some(best) if !self.improved(value, best) => {
                self.counter += 1;
                if self.counter >= self.patience {
                    CallbackAction::Stop
                } else {
                    CallbackAction::Continue
                }
            }
            _ => {
                self.best = Some(value);
                self.counter = 0;
                CallbackAction::Continue
            }
        }
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for EarlyStopping {
    fn name(&self) -> &'static str {
        "EarlyStopping"
    }

    fn on_validation_end(&mut self, state: &mut TrainerState) -> Result<CallbackAction> {
        let Some(value) = state.metric(&self.monitor) else {
            warn!(metric = %self.monitor, "Early stopping metric not available");
            return Ok(CallbackAction::Continue);
        };
        let action = self.observe(value);
        if action == CallbackAction::Stop {
            info!(
                metric = %self.monitor,
                best = ?self.best,
                epoch = state.epoch,
                "Early stopping: no improvement for {} validations",
                self.patience
            );
        }
        Ok(action)
    }
}

/// Logs the wall time of each stage and the test throughput.
#[derive(Debug, Default)]
pub struct Timer {
    started: Option<Instant>,
    test_images: usize,
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for Timer {
    fn name(&self) -> &'static str {
        "Timer"
    }

    fn setup(
        &mut self,
        _stage: Stage,
        _model: &mut M,
        _device: &B::Device,
        _state: &mut TrainerState,
    ) -> Result<()> {
        self.started = Some(Instant::now());
        self.test_images = 0;
        Ok(())
    }

    fn on_test_batch_end(&mut self, outputs: &mut StepOutputs, _state: &TrainerState) -> Result<()> {
        self.test_images += outputs.len();
        Ok(())
    }

    fn teardown(&mut self, stage: Stage, _state: &TrainerState) -> Result<()> {
        let Some(started) = self.started.take() else {
            return Ok(());
        };
        let elapsed = started.elapsed().as_secs_f64();
        if stage == Stage::Test && self.test_images > 0 {
            info!(
                stage = %stage,
                elapsed_secs = elapsed,
                images = self.test_images,
                fps = self.test_images as f64 / elapsed.max(f64::EPSILON),
                "Testing took {elapsed:.2}s"
            );
        } else {
            info!(stage = %stage, elapsed_secs = elapsed, "Stage took {elapsed:.2}s");
        }
        Ok(())
    }
}

/// Switches the model to tiled processing before any stage runs.
#[derive(Debug, Clone, Copy)]
pub struct TilerConfiguration {
    tile_size: usize,
    stride: usize,
}

impl TilerConfiguration {
    pub fn new(tile_size: usize, stride: usize) -> Self {
        Self { tile_size, stride }
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for TilerConfiguration {
    fn name(&self) -> &'static str {
        "TilerConfiguration"
    }

    fn setup(
        &mut self,
        _stage: Stage,
        model: &mut M,
        _device: &B::Device,
        _state: &mut TrainerState,
    ) -> Result<()> {
        model.set_tiler(Some(Tiler::new(self.tile_size, self.stride)?))?;
        debug!(tile_size = self.tile_size, stride = self.stride, "Tiling enabled");
        Ok(())
    }
}

/// Merge the model's own callbacks into the configured pipeline. A model
/// callback replaces a configured one of the same kind in place; others are
/// appended.
pub fn merge_callback_specs(
    mut configured: Vec<CallbackSpec>,
    from_model: Vec<CallbackSpec>,
) -> Vec<CallbackSpec> {
    for spec in from_model {
        match configured.iter().position(|c| c.name() == spec.name()) {
            Some(index) => configured[index] = spec,
            None => configured.push(spec),
        }
    }
    configured
}

/// Turn callback specs into live callbacks, in order.
pub fn instantiate_callbacks<B, M>(
    specs: Vec<CallbackSpec>,
) -> Result<Vec<Box<dyn TrainingCallback<B, M>>>>
where
    B: AutodiffBackend,
    M: AnomalyModule<B> + 'static,
{
    specs
        .into_iter()
        .map(|spec| -> Result<Box<dyn TrainingCallback<B, M>>> {
            Ok(match spec {
                CallbackSpec::EarlyStopping(config) => Box::new(EarlyStopping::new(&config)),
                CallbackSpec::ModelCheckpoint {
                    dirpath,
                    filename,
                    monitor,
                    mode,
                } => Box::new(ModelCheckpoint::new(dirpath, filename, monitor, mode)),
                CallbackSpec::LoadModel { weights_path } => {
                    Box::new(LoadModelCallback::new(weights_path))
                }
                CallbackSpec::Timer => Box::new(Timer::default()),
                CallbackSpec::Normalization { method } => match method {
                    NormalizationMethod::MinMax => {
                        Box::new(MinMaxNormalizationCallback::default())
                    }
                    NormalizationMethod::Cdf => {
                        Box::new(CdfNormalizationCallback::default())
                    }
                },
                CallbackSpec::OpenVinoExport {
                    input_size,
                    dirpath,
                    filename,
                } => Box::new(ExportCallback::new(
                    ExportFormat::OpenVino,
                    input_size,
                    dirpath,
                    filename,
                )),
                CallbackSpec::NncfExport {
                    config_path,
                    dirpath,
                    filename,
                } => Box::new(ExportCallback::nncf(config_path, dirpath, filename)?),
                CallbackSpec::TilerConfiguration { tile_size, stride } => {
                    Box::new(TilerConfiguration::new(tile_size, stride))
                }
                CallbackSpec::Visualizer {
                    mode,
                    task,
                    image_save_path,
                    save_images,
                    show_images,
                    log_images,
                } => Box::new(VisualizerCallback::new(
                    mode,
                    task,
                    image_save_path,
                    save_images,
                    show_images,
                    log_images,
                )),
            })
        })
        .collect()
}
