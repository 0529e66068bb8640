//! Run directory layout.
//!
//! Fresh runs live under `<root>/<model>/<data>/<category>/<timestamp>/`, with weights in
//! `weights/` and exported artifacts in `compressed/`. A run resumed from a checkpoint
//! reuses the directory two levels above the checkpoint file.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

use crate::config::RunConfig;

/// Root used when `trainer.default_root_dir` is unset.
pub const DEFAULT_RESULTS_ROOT: &str = "./results";

/// Timestamp format of run directories.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Resolved directories of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the run root for `config` at time `now`.
    pub fn resolve(config: &RunConfig, now: DateTime<Local>) -> Self {
        if let Some(checkpoint) = &config.trainer.resume_from_checkpoint {
            // <root>/weights/model.bin -> <root>
            let root = checkpoint
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Self::new(root);
        }

        let base = config
            .trainer
            .default_root_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_ROOT));
        let model_name = last_segment(&config.model.name).to_lowercase();
        let data_name = last_segment(&config.data.name).to_lowercase();
        let mut root = base.join(model_name).join(data_name);
        if !config.data.category.is_empty() {
            root = root.join(&config.data.category);
        }
        Self::new(root.join(now.format(TIMESTAMP_FORMAT).to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.root.join("weights")
    }

    pub fn compressed_dir(&self) -> PathBuf {
        self.root.join("compressed")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Checkpoint stem; the recorder appends its own extension.
    pub fn checkpoint_stem(&self) -> PathBuf {
        self.weights_dir().join("model")
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Pin the run directory and the image output path into `config`.
///
/// After this call `trainer.default_root_dir` is the run root, and
/// `visualization.image_save_path` falls back to `project.path`, then to
/// `<run root>/images`.
pub fn apply_layout(config: &mut RunConfig, now: DateTime<Local>) -> RunLayout {
    let layout = RunLayout::resolve(config, now);
    if config.visualization.image_save_path.is_none() {
        config.visualization.image_save_path = Some(
            config
                .project
                .path
                .clone()
                .unwrap_or_else(|| layout.images_dir()),
        );
    }
    config.trainer.default_root_dir = Some(layout.root().to_path_buf());
    tracing::debug!(root = %layout.root().display(), "Resolved run directory");
    layout
}
