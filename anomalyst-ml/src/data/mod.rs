//! Datasets and batching.

pub mod batch;
pub mod folder;

pub use batch::{Batch, IMAGENET_MEAN, IMAGENET_STD, load_image, load_mask};
pub use folder::{FolderDataModule, IMAGE_EXTENSIONS, Sample};
