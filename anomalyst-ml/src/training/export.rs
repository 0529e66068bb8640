//! Model export after fitting.
//!
//! Both formats write a burn record of the inference-only model plus a JSON
//! metadata file into the export directory. The compressed format stores
//! half-precision weights and keeps a copy of its compression config.

use std::path::{Path, PathBuf};

use anomalyst_core::persistence::{atomic_write, atomic_write_json};
use burn::module::{AutodiffModule, Module};
use burn::record::{BinFileRecorder, FullPrecisionSettings, HalfPrecisionSettings};
use burn::tensor::backend::AutodiffBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::callbacks::TrainingCallback;
use super::checkpoint::{WEIGHTS_EXTENSION, file_hash};
use super::state::{CdfStats, MinMaxStats, Thresholds, TrainerState};
use crate::error::{MlError, Result};
use crate::models::AnomalyModule;

pub const METADATA_FILE: &str = "metadata.json";
pub const NNCF_CONFIG_FILE: &str = "nncf_config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    OpenVino,
    Nncf,
}

impl ExportFormat {
    fn precision(&self) -> &'static str {
        match self {
            ExportFormat::OpenVino => "f32",
            ExportFormat::Nncf => "f16",
        }
    }
}

/// Everything a deployment needs besides the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub format: ExportFormat,
    pub precision: String,
    pub weights: PathBuf,
    pub hash: String,
    pub input_size: Option<[usize; 2]>,
    pub thresholds: Thresholds,
    pub min_max: Option<MinMaxStats>,
    pub cdf: Option<CdfStats>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ExportCallback {
    format: ExportFormat,
    input_size: Option<[usize; 2]>,
    dirpath: PathBuf,
    filename: String,
    nncf_config: Option<serde_yaml::Value>,
}

impl ExportCallback {
    pub fn new(format: ExportFormat, input_size: [usize; 2], dirpath: PathBuf, filename: String) -> Self {
        Self {
            format,
            input_size: Some(input_size),
            dirpath,
            filename,
            nncf_config: None,
        }
    }

    /// Compressed export; the config file must parse as YAML.
    pub fn nncf(config_path: PathBuf, dirpath: PathBuf, filename: String) -> Result<Self> {
        let raw = std::fs::read_to_string(&config_path).map_err(|e| {
            MlError::export(format!("cannot read {}: {e}", config_path.display()))
        })?;
        let config: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        Ok(Self {
            format: ExportFormat::Nncf,
            input_size: None,
            dirpath,
            filename,
            nncf_config: Some(config),
        })
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    fn write_weights<B: AutodiffBackend, M: AnomalyModule<B>>(&self, model: &M) -> Result<PathBuf> {
        let stem = self.dirpath.join(&self.filename);
        let inference = model.valid();
        match self.format {
            ExportFormat::OpenVino => {
                inference.save_file(stem.clone(), &BinFileRecorder::<FullPrecisionSettings>::new())?
            }
            ExportFormat::Nncf => {
                inference.save_file(stem.clone(), &BinFileRecorder::<HalfPrecisionSettings>::new())?
            }
        }
        Ok(stem.with_extension(WEIGHTS_EXTENSION))
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for ExportCallback {
    fn name(&self) -> &'static str {
        match self.format {
            ExportFormat::OpenVino => "OpenVINO",
            ExportFormat::Nncf => "NNCF",
        }
    }

    fn on_fit_end(&mut self, model: &M, state: &TrainerState) -> Result<()> {
        std::fs::create_dir_all(&self.dirpath)?;
        let weights = self.write_weights::<B, M>(model)?;
        let (hash, _) = file_hash(&weights)?;

        if let Some(config) = &self.nncf_config {
            let yaml = serde_yaml::to_string(config)?;
            atomic_write(&self.dirpath.join(NNCF_CONFIG_FILE), yaml.as_bytes())?;
        }

        let metadata = ExportMetadata {
            format: self.format,
            precision: self.format.precision().to_string(),
            weights: weights.clone(),
            hash,
            input_size: self.input_size,
            thresholds: state.thresholds,
            min_max: state.min_max,
            cdf: state.cdf,
            created_at: Utc::now(),
        };
        atomic_write_json(&self.dirpath.join(METADATA_FILE), &metadata)?;
        info!(
            format = ?self.format,
            path = %weights.display(),
            "Exported model"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nncf_requires_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("nncf.yaml");
        std::fs::write(&good, "compression:\n  algorithm: quantization\n").unwrap();
        let callback = ExportCallback::nncf(good, dir.path().join("out"), "model".into()).unwrap();
        assert_eq!(callback.format, ExportFormat::Nncf);
        assert!(callback.nncf_config.is_some());

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "compression: [unterminated").unwrap();
        assert!(ExportCallback::nncf(bad, dir.path().join("out"), "model".into()).is_err());
    }
}
