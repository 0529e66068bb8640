//! End-to-end runs of the trainer on a tiny synthetic MVTec-style dataset.

use std::path::{Path, PathBuf};

use anomalyst_core::{RunConfig, apply_layout, build_callbacks};
use anomalyst_ml::training::checkpoint::{CheckpointMeta, sidecar_file, weights_file};
use anomalyst_ml::{
    AnomalyModule, FolderDataModule, ReverseDistillation, Trainer, TrainingBackend,
    instantiate_callbacks, merge_callback_specs,
};
use chrono::{Local, TimeZone};
use image::{GrayImage, Luma, Rgb, RgbImage};
use pretty_assertions::assert_eq;

const SIZE: u32 = 64;

fn textured(seed: u32) -> RgbImage {
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        let v = 100 + ((x * 7 + y * 13 + seed * 31) % 23) as u8;
        Rgb([v, v, v])
    })
}

fn defective(seed: u32) -> (RgbImage, GrayImage) {
    let mut image = textured(seed);
    let mut mask = GrayImage::new(SIZE, SIZE);
    for y in 20..36 {
        for x in 24..40 {
            image.put_pixel(x, y, Rgb([250, 30, 30]));
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    (image, mask)
}

fn write_dataset(root: &Path) {
    let category = root.join("widget");
    let dir = |p: &str| {
        let d = category.join(p);
        std::fs::create_dir_all(&d).unwrap();
        d
    };
    let train = dir("train/good");
    for i in 0..4 {
        textured(i).save(train.join(format!("{i:03}.png"))).unwrap();
    }
    let good = dir("test/good");
    for i in 0..2 {
        textured(10 + i).save(good.join(format!("{i:03}.png"))).unwrap();
    }
    let scratch = dir("test/scratch");
    let gt = dir("ground_truth/scratch");
    for i in 0..2 {
        let (image, mask) = defective(20 + i);
        image.save(scratch.join(format!("{i:03}.png"))).unwrap();
        mask.save(gt.join(format!("{i:03}_mask.png"))).unwrap();
    }
}

fn config(root: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.seed = Some(42);
    config.model.input_size = [SIZE as usize, SIZE as usize];
    config.data.image_size = [SIZE as usize, SIZE as usize];
    config.data.root = root.join("data");
    config.data.category = "widget".into();
    config.data.train_batch_size = 2;
    config.data.eval_batch_size = 2;
    config.trainer.max_epochs = 1;
    config.trainer.default_root_dir = Some(root.join("results"));
    config
}

type Model = ReverseDistillation<TrainingBackend>;

fn trainer(config: &RunConfig, model: &Model) -> Trainer<TrainingBackend, Model> {
    config.validate().unwrap();
    let specs = merge_callback_specs(build_callbacks(config).unwrap(), model.configure_callbacks());
    let callbacks = instantiate_callbacks::<TrainingBackend, Model>(specs).unwrap();
    let datamodule = FolderDataModule::new(&config.data, config.seed);
    Trainer::new(config, datamodule, callbacks, Default::default()).unwrap()
}

fn fixed_time() -> chrono::DateTime<Local> {
    Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn fit_once(root: &Path) -> (RunConfig, PathBuf) {
    write_dataset(&root.join("data"));
    let mut config = config(root);
    let layout = apply_layout(&mut config, fixed_time());
    let device = Default::default();
    let model = Model::new(&config.model, &device).unwrap();
    let mut trainer = trainer(&config, &model);
    trainer.fit(model).unwrap();
    assert_eq!(trainer.state().train_losses.len(), 1);
    assert!(trainer.state().thresholds_calibrated);
    (config, layout.checkpoint_stem())
}

#[test]
fn fit_writes_checkpoint_with_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stem) = fit_once(dir.path());

    let expected_root = dir
        .path()
        .join("results/reverse_distillation/mvtec/widget/2024-05-01_12-00-00");
    assert_eq!(stem, expected_root.join("weights/model"));
    assert!(weights_file(&stem).is_file());

    let raw = std::fs::read_to_string(sidecar_file(&stem)).unwrap();
    let meta: CheckpointMeta = serde_json::from_str(&raw).unwrap();
    assert_eq!(meta.epoch, 0);
    assert!(meta.min_max.is_some());
    assert_eq!(meta.hash.len(), 64);
}

#[test]
fn test_stage_restores_calibration_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, stem) = fit_once(dir.path());
    config.trainer.resume_from_checkpoint = Some(weights_file(&stem));
    config.visualization.save_images = true;
    config.visualization.image_save_path = Some(dir.path().join("images"));

    let device = Default::default();
    let mut model = Model::new(&config.model, &device).unwrap();
    let mut trainer = trainer(&config, &model);
    let metrics = trainer.test(&mut model).unwrap();

    assert!(trainer.state().thresholds_calibrated);
    assert!(metrics.contains_key("image_AUROC"));
    assert!(metrics.contains_key("pixel_F1Score"));
    assert!(dir.path().join("images/scratch/000.png").is_file());
    assert!(dir.path().join("images/good/001.png").is_file());
}

#[test]
fn predict_returns_one_record_per_image() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"));
    let config = config(dir.path());
    let device = Default::default();
    let mut model = Model::new(&config.model, &device).unwrap();
    let mut trainer = trainer(&config, &model);

    let input = dir.path().join("data/widget/test");
    let records = trainer.predict(&mut model, &input).unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.anomalous_pixels.is_some()));
    assert!(records[0].path.ends_with("good/000.png"));
}

#[test]
fn cancelled_fit_stops_with_error() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"));
    let config = config(dir.path());
    let device = Default::default();
    let model = Model::new(&config.model, &device).unwrap();
    let mut trainer = trainer(&config, &model);
    trainer
        .cancel_flag()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(matches!(
        trainer.fit(model),
        Err(anomalyst_ml::MlError::Cancelled)
    ));
}
