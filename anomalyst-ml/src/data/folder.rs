//! Datamodule over the MVTec folder layout.
//!
//! ```text
//! <root>/<category>/train/good/*.png
//! <root>/<category>/test/<defect>/*.png            (`good` holds normal samples)
//! <root>/<category>/ground_truth/<defect>/<stem>_mask.png
//! ```
//!
//! The test split doubles as the validation split. Sample order is deterministic;
//! training batches are reshuffled every epoch from `seed + epoch`.

use std::path::{Path, PathBuf};

use anomalyst_core::DataConfig;
use image::GrayImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::batch::{Batch, load_image, load_mask};
use crate::error::{MlError, Result};

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];
const NORMAL_DIR: &str = "good";

/// A single image of the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    /// `true` for anomalous samples.
    pub label: bool,
    pub mask: Option<PathBuf>,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by name.
fn list_images(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file() && is_image(path))
        .collect()
}

/// Immediate subdirectories of `dir`, sorted by name.
fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}

pub struct FolderDataModule {
    root: PathBuf,
    image_size: [usize; 2],
    train_batch_size: usize,
    eval_batch_size: usize,
    seed: Option<u64>,
    train: Vec<Sample>,
    test: Vec<Sample>,
}

impl FolderDataModule {
    pub fn new(config: &DataConfig, seed: Option<u64>) -> Self {
        let root = if config.category.is_empty() {
            config.root.clone()
        } else {
            config.root.join(&config.category)
        };
        Self {
            root,
            image_size: config.image_size,
            train_batch_size: config.train_batch_size.max(1),
            eval_batch_size: config.eval_batch_size.max(1),
            seed,
            train: Vec::new(),
            test: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_size(&self) -> [usize; 2] {
        self.image_size
    }

    /// Scan the dataset folders.
    pub fn setup(&mut self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(MlError::dataset(format!(
                "dataset directory not found: {}",
                self.root.display()
            )));
        }

        self.train = list_images(&self.root.join("train").join(NORMAL_DIR))
            .into_iter()
            .map(|path| Sample {
                path,
                label: false,
                mask: None,
            })
            .collect();

        self.test.clear();
        let ground_truth = self.root.join("ground_truth");
        for defect_dir in list_dirs(&self.root.join("test")) {
            let defect = defect_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let label = defect != NORMAL_DIR;
            for path in list_images(&defect_dir) {
                let mask = if label {
                    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                    let mask = ground_truth.join(&defect).join(format!("{stem}_mask.png"));
                    if mask.is_file() {
                        Some(mask)
                    } else {
                        warn!(image = %path.display(), "No ground-truth mask for anomalous image");
                        None
                    }
                } else {
                    None
                };
                self.test.push(Sample { path, label, mask });
            }
        }

        info!(
            root = %self.root.display(),
            train = self.train.len(),
            test = self.test.len(),
            "Dataset scanned"
        );
        if self.train.is_empty() && self.test.is_empty() {
            return Err(MlError::dataset(format!(
                "no images found under {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    pub fn train_samples(&self) -> &[Sample] {
        &self.train
    }

    pub fn test_samples(&self) -> &[Sample] {
        &self.test
    }

    fn load_batch(&self, samples: &[Sample], with_targets: bool) -> Result<Batch> {
        let [height, width] = self.image_size;
        let images = samples
            .iter()
            .map(|s| load_image(&s.path, self.image_size))
            .collect::<Result<Vec<_>>>()?;
        let paths = samples.iter().map(|s| s.path.clone()).collect();
        if !with_targets {
            return Batch::new(images, None, None, paths, self.image_size);
        }
        let labels = samples.iter().map(|s| s.label).collect();
        let masks = samples
            .iter()
            .map(|s| match &s.mask {
                Some(path) => load_mask(path, self.image_size),
                None => Ok(GrayImage::new(width as u32, height as u32)),
            })
            .collect::<Result<Vec<_>>>()?;
        Batch::new(images, Some(labels), Some(masks), paths, self.image_size)
    }

    fn batches(
        &self,
        samples: Vec<Sample>,
        batch_size: usize,
        with_targets: bool,
    ) -> impl Iterator<Item = Result<Batch>> + '_ {
        let groups: Vec<Vec<Sample>> = samples.chunks(batch_size).map(<[Sample]>::to_vec).collect();
        groups
            .into_iter()
            .map(move |group| self.load_batch(&group, with_targets))
    }

    /// Training batches for `epoch`, shuffled deterministically when a seed is set.
    pub fn train_batches(&self, epoch: usize) -> Result<impl Iterator<Item = Result<Batch>> + '_> {
        if self.train.is_empty() {
            return Err(MlError::dataset(format!(
                "no training images under {}",
                self.root.join("train").join(NORMAL_DIR).display()
            )));
        }
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
            None => StdRng::from_entropy(),
        };
        let mut samples = self.train.clone();
        samples.shuffle(&mut rng);
        debug!(epoch, samples = samples.len(), "Shuffled training samples");
        Ok(self.batches(samples, self.train_batch_size, false))
    }

    pub fn val_batches(&self) -> Result<impl Iterator<Item = Result<Batch>> + '_> {
        self.test_batches()
    }

    pub fn test_batches(&self) -> Result<impl Iterator<Item = Result<Batch>> + '_> {
        if self.test.is_empty() {
            return Err(MlError::dataset(format!(
                "no test images under {}",
                self.root.join("test").display()
            )));
        }
        Ok(self.batches(self.test.clone(), self.eval_batch_size, true))
    }

    /// Unlabeled batches from a single image or every image below a directory.
    pub fn predict_batches(
        &self,
        input: &Path,
    ) -> Result<impl Iterator<Item = Result<Batch>> + '_> {
        let paths: Vec<PathBuf> = if input.is_file() {
            vec![input.to_path_buf()]
        } else {
            WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.into_path())
                .filter(|path| path.is_file() && is_image(path))
                .collect()
        };
        if paths.is_empty() {
            return Err(MlError::dataset(format!(
                "no images found at {}",
                input.display()
            )));
        }
        let samples = paths
            .into_iter()
            .map(|path| Sample {
                path,
                label: false,
                mask: None,
            })
            .collect();
        Ok(self.batches(samples, self.eval_batch_size, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};
    use pretty_assertions::assert_eq;

    fn write_dataset(root: &Path) {
        let category = root.join("bottle");
        for (dir, count) in [("train/good", 5), ("test/good", 2), ("test/broken", 2)] {
            std::fs::create_dir_all(category.join(dir)).unwrap();
            for i in 0..count {
                RgbImage::from_pixel(40, 40, Rgb([i as u8 * 20, 10, 10]))
                    .save(category.join(dir).join(format!("{i:03}.png")))
                    .unwrap();
            }
        }
        let gt = category.join("ground_truth/broken");
        std::fs::create_dir_all(&gt).unwrap();
        GrayImage::from_pixel(40, 40, Luma([255]))
            .save(gt.join("000_mask.png"))
            .unwrap();
    }

    fn config(root: &Path) -> DataConfig {
        DataConfig {
            root: root.to_path_buf(),
            category: "bottle".into(),
            image_size: [32, 32],
            train_batch_size: 2,
            eval_batch_size: 3,
            ..DataConfig::default()
        }
    }

    #[test]
    fn test_setup_scans_layout() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let mut dm = FolderDataModule::new(&config(dir.path()), Some(7));
        dm.setup().unwrap();
        assert_eq!(dm.train_samples().len(), 5);
        let labels: Vec<bool> = dm.test_samples().iter().map(|s| s.label).collect();
        assert_eq!(labels, vec![true, true, false, false]);
        assert!(dm.test_samples()[0].mask.is_some());
        assert!(dm.test_samples()[1].mask.is_none());
    }

    #[test]
    fn test_train_batches_are_seeded() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let mut dm = FolderDataModule::new(&config(dir.path()), Some(7));
        dm.setup().unwrap();
        let order = |epoch| -> Vec<PathBuf> {
            dm.train_batches(epoch)
                .unwrap()
                .flat_map(|b| b.unwrap().paths)
                .collect()
        };
        assert_eq!(order(0), order(0));
        let sizes: Vec<usize> = dm.train_batches(0).unwrap().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_eval_batches_carry_targets() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let mut dm = FolderDataModule::new(&config(dir.path()), None);
        dm.setup().unwrap();
        let batch = dm.test_batches().unwrap().next().unwrap().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.images[0].dimensions(), (32, 32));
        let masks = batch.masks.unwrap();
        assert_eq!(masks[0].get_pixel(5, 5).0[0], 1);
        assert_eq!(masks[2].get_pixel(5, 5).0[0], 0);
    }

    #[test]
    fn test_predict_batches_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let mut dm = FolderDataModule::new(&config(dir.path()), None);
        dm.setup().unwrap();
        let input = dir.path().join("bottle/test");
        let count: usize = dm
            .predict_batches(&input)
            .unwrap()
            .map(|b| b.unwrap().len())
            .sum();
        assert_eq!(count, 4);
        assert!(dm.predict_batches(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut dm = FolderDataModule::new(&config(dir.path()), None);
        assert!(dm.setup().is_err());
    }
}
