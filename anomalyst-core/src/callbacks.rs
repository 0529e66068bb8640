//! Configuration → callback-set mapping.
//!
//! [`build_callbacks`] turns a [`RunConfig`] into an ordered list of
//! [`CallbackSpec`] values. It is pure: no file is written and no model is touched,
//! so the callback pipeline of a run can be inspected and tested before training
//! starts. The ml crate instantiates each spec into a concrete callback.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{
    EarlyStoppingConfig, MonitorMode, NormalizationMethod, RunConfig, Task, VisualizationMode,
};
use crate::error::ConfigError;
use crate::project::RunLayout;

/// File stem used for checkpoints and exported models.
pub const MODEL_FILENAME: &str = "model";

/// Declarative description of one callback in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackSpec {
    EarlyStopping(EarlyStoppingConfig),
    ModelCheckpoint {
        dirpath: PathBuf,
        filename: String,
        monitor: Option<String>,
        mode: MonitorMode,
    },
    LoadModel {
        weights_path: PathBuf,
    },
    Timer,
    Normalization {
        method: NormalizationMethod,
    },
    OpenVinoExport {
        input_size: [usize; 2],
        dirpath: PathBuf,
        filename: String,
    },
    NncfExport {
        config_path: PathBuf,
        dirpath: PathBuf,
        filename: String,
    },
    TilerConfiguration {
        tile_size: usize,
        stride: usize,
    },
    Visualizer {
        mode: VisualizationMode,
        task: Task,
        image_save_path: Option<PathBuf>,
        save_images: bool,
        show_images: bool,
        log_images: bool,
    },
}

impl CallbackSpec {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            CallbackSpec::EarlyStopping(_) => "EarlyStopping",
            CallbackSpec::ModelCheckpoint { .. } => "ModelCheckpoint",
            CallbackSpec::LoadModel { .. } => "LoadModel",
            CallbackSpec::Timer => "Timer",
            CallbackSpec::Normalization {
                method: NormalizationMethod::MinMax,
            } => "MinMaxNormalization",
            CallbackSpec::Normalization {
                method: NormalizationMethod::Cdf,
            } => "CdfNormalization",
            CallbackSpec::OpenVinoExport { .. } => "OpenVINO",
            CallbackSpec::NncfExport { .. } => "NNCF",
            CallbackSpec::TilerConfiguration { .. } => "TilerConfiguration",
            CallbackSpec::Visualizer { .. } => "Visualizer",
        }
    }
}

/// Parse the `trainer.callbacks` entries into early stopping configs.
fn trainer_callbacks(config: &RunConfig) -> Result<Vec<EarlyStoppingConfig>, ConfigError> {
    config
        .trainer
        .callbacks
        .iter()
        .map(|entry| match entry.name() {
            "EarlyStopping" => {
                let args = if entry.init_args.is_null() {
                    serde_json::Value::Object(serde_json::Map::new())
                } else {
                    entry.init_args.clone()
                };
                serde_json::from_value(args).map_err(|e| {
                    ConfigError::invalid("trainer.callbacks.EarlyStopping", e.to_string())
                })
            }
            other => Err(ConfigError::invalid(
                "trainer.callbacks",
                format!("unsupported callback '{other}'"),
            )),
        })
        .collect()
}

/// Map a validated configuration to the ordered callback pipeline.
///
/// Order: trainer-declared callbacks, checkpointing, checkpoint loading, timing,
/// normalization, export, tiling, visualization.
pub fn build_callbacks(config: &RunConfig) -> Result<Vec<CallbackSpec>, ConfigError> {
    let root = config
        .trainer
        .default_root_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(crate::project::DEFAULT_RESULTS_ROOT));
    let layout = RunLayout::new(root);

    let mut callbacks = Vec::new();

    // Checkpoint monitoring follows a declared EarlyStopping callback, if any.
    let mut monitor = None;
    let mut mode = MonitorMode::Max;
    for early_stopping in trainer_callbacks(config)? {
        monitor = Some(early_stopping.metric.clone());
        mode = early_stopping.mode;
        callbacks.push(CallbackSpec::EarlyStopping(early_stopping));
    }

    callbacks.push(CallbackSpec::ModelCheckpoint {
        dirpath: layout.weights_dir(),
        filename: MODEL_FILENAME.to_string(),
        monitor,
        mode,
    });

    if let Some(weights_path) = &config.trainer.resume_from_checkpoint {
        callbacks.push(CallbackSpec::LoadModel {
            weights_path: weights_path.clone(),
        });
    }

    callbacks.push(CallbackSpec::Timer);

    if let Some(method) = NormalizationMethod::parse(&config.metrics.normalization_method)? {
        callbacks.push(CallbackSpec::Normalization { method });
    }

    if config.openvino && config.nncf_config().is_some() {
        return Err(ConfigError::ExportConflict);
    }

    if config.openvino {
        callbacks.push(CallbackSpec::OpenVinoExport {
            input_size: config.data.image_size,
            dirpath: layout.compressed_dir(),
            filename: MODEL_FILENAME.to_string(),
        });
    }

    if let Some(nncf) = config.nncf_config() {
        let is_yaml = matches!(
            nncf.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !nncf.is_file() || !is_yaml {
            return Err(ConfigError::InvalidNncfConfig { path: nncf.to_path_buf() });
        }
        callbacks.push(CallbackSpec::NncfExport {
            config_path: nncf.to_path_buf(),
            dirpath: layout.compressed_dir(),
            filename: MODEL_FILENAME.to_string(),
        });
    }

    if let Some((tile_size, stride)) = config.tiling.resolved()? {
        callbacks.push(CallbackSpec::TilerConfiguration { tile_size, stride });
    }

    let vis = &config.visualization;
    callbacks.push(CallbackSpec::Visualizer {
        mode: vis.parsed_mode()?,
        task: vis.parsed_task()?,
        image_save_path: vis.image_save_path.clone(),
        save_images: vis.save_images,
        show_images: vis.show_images,
        log_images: vis.log_images,
    });

    tracing::debug!(
        callbacks = ?callbacks.iter().map(CallbackSpec::name).collect::<Vec<_>>(),
        "Planned callback pipeline"
    );
    Ok(callbacks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallbackEntry;
    use pretty_assertions::assert_eq;

    fn names(specs: &[CallbackSpec]) -> Vec<&'static str> {
        specs.iter().map(CallbackSpec::name).collect()
    }

    fn base_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.trainer.default_root_dir = Some(PathBuf::from("/runs/rd"));
        config
    }

    #[test]
    fn test_default_pipeline() {
        let specs = build_callbacks(&base_config()).unwrap();
        assert_eq!(
            names(&specs),
            vec!["ModelCheckpoint", "Timer", "MinMaxNormalization", "Visualizer"]
        );
        assert_eq!(
            specs[0],
            CallbackSpec::ModelCheckpoint {
                dirpath: PathBuf::from("/runs/rd/weights"),
                filename: "model".into(),
                monitor: None,
                mode: MonitorMode::Max,
            }
        );
    }

    #[test]
    fn test_checkpoint_follows_early_stopping() {
        let mut config = base_config();
        config.trainer.callbacks.push(CallbackEntry {
            class_path: "pytorch_lightning.callbacks.EarlyStopping".into(),
            init_args: serde_json::json!({"monitor": "image_AUROC", "mode": "min", "patience": 2}),
        });
        let specs = build_callbacks(&config).unwrap();
        assert_eq!(names(&specs)[..2], ["EarlyStopping", "ModelCheckpoint"]);
        match &specs[1] {
            CallbackSpec::ModelCheckpoint { monitor, mode, .. } => {
                assert_eq!(monitor.as_deref(), Some("image_AUROC"));
                assert_eq!(*mode, MonitorMode::Min);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_trainer_callback() {
        let mut config = base_config();
        config.trainer.callbacks.push(CallbackEntry {
            class_path: "LearningRateMonitor".into(),
            init_args: serde_json::Value::Null,
        });
        assert!(build_callbacks(&config).is_err());
    }

    #[test]
    fn test_resume_adds_load_model() {
        let mut config = base_config();
        config.trainer.resume_from_checkpoint = Some(PathBuf::from("/runs/rd/weights/model.bin"));
        let specs = build_callbacks(&config).unwrap();
        assert!(specs.contains(&CallbackSpec::LoadModel {
            weights_path: PathBuf::from("/runs/rd/weights/model.bin")
        }));
    }

    #[test]
    fn test_normalization_selection() {
        let mut config = base_config();
        config.metrics.normalization_method = "cdf".into();
        assert!(names(&build_callbacks(&config).unwrap()).contains(&"CdfNormalization"));

        config.metrics.normalization_method = "none".into();
        let specs = build_callbacks(&config).unwrap();
        assert!(!specs.iter().any(|s| matches!(s, CallbackSpec::Normalization { .. })));

        config.metrics.normalization_method = "softmax".into();
        assert!(matches!(
            build_callbacks(&config),
            Err(ConfigError::UnknownNormalization { .. })
        ));
    }

    #[test]
    fn test_openvino_and_nncf_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let nncf = dir.path().join("nncf.yaml");
        std::fs::write(&nncf, "compression: {}\n").unwrap();

        let mut config = base_config();
        config.openvino = true;
        config.nncf = Some(nncf);
        assert_eq!(build_callbacks(&config), Err(ConfigError::ExportConflict));
    }

    #[test]
    fn test_openvino_export_goes_to_compressed() {
        let mut config = base_config();
        config.openvino = true;
        let specs = build_callbacks(&config).unwrap();
        assert!(specs.contains(&CallbackSpec::OpenVinoExport {
            input_size: [256, 256],
            dirpath: PathBuf::from("/runs/rd/compressed"),
            filename: "model".into(),
        }));
    }

    #[test]
    fn test_nncf_requires_existing_yaml() {
        let mut config = base_config();
        config.nncf = Some(PathBuf::from("/nonexistent/nncf.yaml"));
        assert!(matches!(
            build_callbacks(&config),
            Err(ConfigError::InvalidNncfConfig { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("nncf.txt");
        std::fs::write(&txt, "").unwrap();
        config.nncf = Some(txt);
        assert!(build_callbacks(&config).is_err());

        let yaml = dir.path().join("nncf.yaml");
        std::fs::write(&yaml, "compression: {}\n").unwrap();
        config.nncf = Some(yaml);
        assert!(names(&build_callbacks(&config).unwrap()).contains(&"NNCF"));
    }

    #[test]
    fn test_empty_nncf_path_adds_no_export() {
        let mut config = base_config();
        config.nncf = Some(PathBuf::new());
        let specs = build_callbacks(&config).unwrap();
        assert!(!names(&specs).contains(&"NNCF"));

        config.openvino = true;
        let specs = build_callbacks(&config).unwrap();
        assert!(names(&specs).contains(&"OpenVINO"));
    }

    #[test]
    fn test_tiling_toggle() {
        let mut config = base_config();
        config.tiling.enable = true;
        config.tiling.tile_size = Some(128);
        config.tiling.stride = Some(64);
        let specs = build_callbacks(&config).unwrap();
        assert!(specs.contains(&CallbackSpec::TilerConfiguration {
            tile_size: 128,
            stride: 64
        }));
    }

    #[test]
    fn test_visualizer_rejects_unknown_mode() {
        let mut config = base_config();
        config.visualization.mode = "fancy".into();
        assert!(matches!(
            build_callbacks(&config),
            Err(ConfigError::UnknownVisualizationMode { .. })
        ));
    }
}
