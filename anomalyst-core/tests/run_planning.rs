//! Config file → run layout → callback pipeline, as the CLI drives it.

use std::path::{Path, PathBuf};

use anomalyst_core::{
    CallbackSpec, MonitorMode, NormalizationMethod, apply_layout, build_callbacks, load_config,
};
use chrono::{Local, TimeZone};
use pretty_assertions::assert_eq;

const CONFIG: &str = r#"
seed: 3
model:
  name: reverse_distillation
  input_size: [128, 128]
data:
  name: mvtec
  category: carpet
  image_size: [128, 128]
trainer:
  max_epochs: 2
  callbacks:
    - class_path: pytorch_lightning.callbacks.EarlyStopping
      init_args:
        monitor: image_F1Score
        mode: max
        patience: 5
metrics:
  normalization_method: cdf
tiling:
  enable: true
  tile_size: 64
  stride: 32
visualization:
  save_images: true
"#;

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("run.yaml");
    std::fs::write(&path, CONFIG).unwrap();
    path
}

#[test]
fn yaml_config_plans_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path());
    let results = dir.path().join("results");
    let overrides = vec![format!("trainer.default_root_dir={}", results.display())];

    let mut config = load_config(Some(&path), &overrides).unwrap();
    config.validate().unwrap();
    let now = Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
    let layout = apply_layout(&mut config, now);

    let root = results.join("reverse_distillation/mvtec/carpet/2025-01-02_03-04-05");
    assert_eq!(layout.root(), root.as_path());
    assert_eq!(config.visualization.image_save_path, Some(root.join("images")));

    let specs = build_callbacks(&config).unwrap();
    let names: Vec<_> = specs.iter().map(CallbackSpec::name).collect();
    assert_eq!(
        names,
        vec![
            "EarlyStopping",
            "ModelCheckpoint",
            "Timer",
            "CdfNormalization",
            "TilerConfiguration",
            "Visualizer",
        ]
    );
    assert_eq!(
        specs[1],
        CallbackSpec::ModelCheckpoint {
            dirpath: root.join("weights"),
            filename: "model".into(),
            monitor: Some("image_F1Score".into()),
            mode: MonitorMode::Max,
        }
    );
    assert_eq!(
        specs[3],
        CallbackSpec::Normalization {
            method: NormalizationMethod::Cdf
        }
    );
    assert_eq!(
        specs[4],
        CallbackSpec::TilerConfiguration {
            tile_size: 64,
            stride: 32
        }
    );
}

#[test]
fn resumed_run_reuses_checkpoint_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path());
    let checkpoint = dir.path().join("old_run/weights/model.bin");
    let overrides = vec![format!(
        "trainer.resume_from_checkpoint={}",
        checkpoint.display()
    )];

    let mut config = load_config(Some(&path), &overrides).unwrap();
    let layout = apply_layout(&mut config, Local::now());
    assert_eq!(layout.root(), dir.path().join("old_run").as_path());

    let specs = build_callbacks(&config).unwrap();
    assert!(specs.contains(&CallbackSpec::LoadModel {
        weights_path: checkpoint
    }));
}

#[test]
fn unknown_trainer_callback_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.yaml");
    std::fs::write(
        &path,
        "trainer:\n  callbacks:\n    - class_path: my.callbacks.Sparkles\n",
    )
    .unwrap();
    let config = load_config(Some(&path), &[]).unwrap();
    assert!(build_callbacks(&config).is_err());
}
