//! Checkpoint saving and loading.
//!
//! Weights go through burn's `BinFileRecorder`; a JSON sidecar next to them
//! records thresholds, normalization statistics and a content hash.

use std::path::{Path, PathBuf};

use anomalyst_core::MonitorMode;
use anomalyst_core::persistence::{atomic_write_json, load_json};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::AutodiffBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::callbacks::{CallbackAction, TrainingCallback};
use super::state::{CdfStats, MinMaxStats, Stage, Thresholds, TrainerState};
use crate::error::{MlError, Result};
use crate::models::AnomalyModule;

/// Metadata stored next to a weights file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: String,
    pub epoch: usize,
    pub global_step: usize,
    pub monitor: Option<String>,
    pub score: Option<f64>,
    pub thresholds: Thresholds,
    pub min_max: Option<MinMaxStats>,
    pub cdf: Option<CdfStats>,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Extension `BinFileRecorder` gives weights files.
pub const WEIGHTS_EXTENSION: &str = "bin";

/// Path of the weights file the recorder writes for `path`.
pub fn weights_file(path: &Path) -> PathBuf {
    path.with_extension(WEIGHTS_EXTENSION)
}

/// Path of the JSON sidecar for `path`.
pub fn sidecar_file(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// SHA-256 of a file, hex encoded.
pub fn file_hash(path: &Path) -> Result<(String, u64)> {
    let bytes = std::fs::read(path)?;
    Ok((format!("{:x}", Sha256::digest(&bytes)), bytes.len() as u64))
}

/// Save `model` at `path` (extension replaced) and write its sidecar.
pub fn save_checkpoint<B, M>(
    model: &M,
    path: &Path,
    state: &TrainerState,
    monitor: Option<&str>,
) -> Result<CheckpointMeta>
where
    B: AutodiffBackend,
    M: AnomalyModule<B>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model.clone().save_file(path.to_path_buf(), &recorder)?;

    let weights = weights_file(path);
    let (hash, size_bytes) = file_hash(&weights)?;
    let meta = CheckpointMeta {
        id: uuid::Uuid::new_v4().to_string(),
        epoch: state.epoch,
        global_step: state.global_step,
        monitor: monitor.map(str::to_string),
        score: monitor.and_then(|m| state.metric(m)),
        thresholds: state.thresholds,
        min_max: state.min_max,
        cdf: state.cdf,
        hash,
        size_bytes,
        created_at: Utc::now(),
    };
    atomic_write_json(&sidecar_file(path), &meta)?;
    info!(path = %weights.display(), epoch = meta.epoch, "Checkpoint saved");
    Ok(meta)
}

/// Saves the model whenever the monitored metric improves, or after every
/// validation when nothing is monitored. A model is always saved at the end
/// of fitting if no checkpoint was written before.
#[derive(Debug)]
pub struct ModelCheckpoint {
    dirpath: PathBuf,
    filename: String,
    monitor: Option<String>,
    mode: MonitorMode,
    best: Option<f64>,
    pending: bool,
    saved: bool,
}

impl ModelCheckpoint {
    pub fn new(
        dirpath: PathBuf,
        filename: String,
        monitor: Option<String>,
        mode: MonitorMode,
    ) -> Self {
        Self {
            dirpath,
            filename,
            monitor,
            mode,
            best: None,
            pending: false,
            saved: false,
        }
    }

    /// Checkpoint stem; the recorder adds the extension.
    pub fn path(&self) -> PathBuf {
        self.dirpath.join(&self.filename)
    }

    fn is_improvement(&self, value: f64) -> bool {
        match (self.best, self.mode) {
            (None, _) => true,
            (Some(best), MonitorMode::Max) => value > best,
            (Some(best), MonitorMode::Min) => value < best,
        }
    }

    fn save<B: AutodiffBackend, M: AnomalyModule<B>>(
        &mut self,
        model: &M,
        state: &TrainerState,
    ) -> Result<()> {
        save_checkpoint::<B, M>(model, &self.path(), state, self.monitor.as_deref())?;
        self.pending = false;
        self.saved = true;
        Ok(())
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }

    fn on_validation_end(&mut self, state: &mut TrainerState) -> Result<CallbackAction> {
        if state.stage != Stage::Fit {
            return Ok(CallbackAction::Continue);
        }
        let Some(monitor) = &self.monitor else {
            self.pending = true;
            return Ok(CallbackAction::Checkpoint);
        };
        match state.metric(monitor) {
            Some(value) if self.is_improvement(value) => {
                debug!(metric = %monitor, value, previous = ?self.best, "Monitored metric improved");
                self.best = Some(value);
                self.pending = true;
                Ok(CallbackAction::Checkpoint)
            }
            Some(_) => Ok(CallbackAction::Continue),
            None => {
                warn!(metric = %monitor, "Checkpoint metric not available");
                Ok(CallbackAction::Continue)
            }
        }
    }

    fn on_save_checkpoint(&mut self, model: &M, state: &TrainerState) -> Result<()> {
        if self.pending {
            self.save::<B, M>(model, state)?;
        }
        Ok(())
    }

    fn on_fit_end(&mut self, model: &M, state: &TrainerState) -> Result<()> {
        if !self.saved {
            self.save::<B, M>(model, state)?;
        }
        Ok(())
    }
}

/// Loads weights and calibration from a checkpoint before any stage runs.
#[derive(Debug)]
pub struct LoadModelCallback {
    weights_path: PathBuf,
}

impl LoadModelCallback {
    pub fn new(weights_path: PathBuf) -> Self {
        Self { weights_path }
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for LoadModelCallback {
    fn name(&self) -> &'static str {
        "LoadModel"
    }

    fn setup(
        &mut self,
        stage: Stage,
        model: &mut M,
        device: &B::Device,
        state: &mut TrainerState,
    ) -> Result<()> {
        let weights = weights_file(&self.weights_path);
        if !weights.is_file() {
            return Err(MlError::checkpoint(format!(
                "checkpoint not found: {}",
                weights.display()
            )));
        }
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        *model = model
            .clone()
            .load_file(self.weights_path.clone(), &recorder, device)?;

        let sidecar = sidecar_file(&self.weights_path);
        match load_json::<CheckpointMeta>(&sidecar)? {
            Some(meta) => {
                let (hash, _) = file_hash(&weights)?;
                if hash != meta.hash {
                    warn!(path = %weights.display(), "Checkpoint hash does not match its metadata");
                }
                state.thresholds = meta.thresholds;
                state.thresholds_calibrated = true;
                state.min_max = meta.min_max;
                state.cdf = meta.cdf;
                info!(
                    path = %weights.display(),
                    stage = %stage,
                    epoch = meta.epoch,
                    image_threshold = meta.thresholds.image,
                    pixel_threshold = meta.thresholds.pixel,
                    "Loaded checkpoint"
                );
            }
            None => {
                warn!(path = %sidecar.display(), "Checkpoint has no metadata; thresholds not restored");
            }
        }
        Ok(())
    }
}
