//! Renders prediction records into images.

use std::path::{Path, PathBuf};

use anomalyst_core::{ConfigError, Task, VisualizationMode};
use image::RgbImage;
use tracing::debug;

use crate::error::{Result, VisionError};
use crate::grid::{ColorMap, ImageGrid};
use crate::post_process::{
    BOUNDARY_COLOR, BoundaryMode, add_anomalous_label, add_normal_label, mark_boundaries,
};
use crate::result::{ImageResult, PredictionBatch};

/// Composes the visual output for each prediction according to a mode and task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visualizer {
    mode: VisualizationMode,
    task: Task,
}

impl Visualizer {
    pub fn new(mode: VisualizationMode, task: Task) -> Self {
        Self { mode, task }
    }

    /// Parse both settings, failing on the first unknown value.
    pub fn from_names(mode: &str, task: &str) -> std::result::Result<Self, ConfigError> {
        Ok(Self::new(mode.parse()?, task.parse()?))
    }

    pub fn mode(&self) -> VisualizationMode {
        self.mode
    }

    pub fn task(&self) -> Task {
        self.task
    }

    /// Lazily visualize every sample of `batch`, in order.
    pub fn visualize_batch<'a>(
        &'a self,
        batch: &'a PredictionBatch,
    ) -> impl Iterator<Item = Result<RgbImage>> + 'a {
        (0..batch.len())
            .filter_map(move |i| batch.image_result(i))
            .map(move |result| self.visualize_image(&result))
    }

    pub fn visualize_image(&self, result: &ImageResult) -> Result<RgbImage> {
        match self.mode {
            VisualizationMode::Full => self.visualize_full(result),
            VisualizationMode::Simple => self.visualize_simple(result),
        }
    }

    fn visualize_full(&self, result: &ImageResult) -> Result<RgbImage> {
        let mut grid = ImageGrid::new();
        match self.task {
            Task::Segmentation => {
                let pred_mask = result
                    .pred_mask()
                    .ok_or(VisionError::MissingPredictedMask)?;
                grid = grid.add_image(result.image().clone(), Some("Image"), None);
                if let Some(gt_mask) = result.gt_mask() {
                    grid = grid.add_image(gt_mask.clone(), Some("Ground Truth"), Some(ColorMap::Gray));
                }
                grid = grid
                    .add_image(result.heat_map().clone(), Some("Predicted Heat Map"), None)
                    .add_image(pred_mask.clone(), Some("Predicted Mask"), Some(ColorMap::Gray));
                if let Some(segmentations) = result.segmentations() {
                    grid = grid.add_image(
                        segmentations.clone(),
                        Some("Segmentation Result"),
                        None,
                    );
                }
            }
            Task::Classification => {
                grid = grid
                    .add_image(result.image().clone(), Some("Image"), None)
                    .add_image(labeled_heat_map(result), Some("Prediction"), None);
            }
        }
        debug!(panels = grid.len(), task = %self.task, "Rendering visualization grid");
        grid.generate()
    }

    fn visualize_simple(&self, result: &ImageResult) -> Result<RgbImage> {
        match self.task {
            Task::Segmentation => {
                let pred_mask = result
                    .pred_mask()
                    .ok_or(VisionError::MissingPredictedMask)?;
                Ok(mark_boundaries(
                    result.heat_map(),
                    pred_mask,
                    BOUNDARY_COLOR,
                    BoundaryMode::Thick,
                ))
            }
            Task::Classification => Ok(labeled_heat_map(result)),
        }
    }

    /// Open `image` in the system image viewer.
    ///
    /// The image is written to a PNG under [`show_dir`]; the call returns once
    /// the viewer process has been spawned. The file is left in place because
    /// the viewer reads it after this returns.
    pub fn show(title: &str, image: &RgbImage) -> Result<()> {
        let path = show_path(title);
        Self::save(&path, image)?;
        debug!(path = %path.display(), "Opening visualization");
        open::that(&path)?;
        Ok(())
    }

    /// Write `image` to `path`, creating missing parent directories. The file
    /// format follows the extension.
    pub fn save(path: &Path, image: &RgbImage) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        image.save(path)?;
        Ok(())
    }
}

/// Directory [`Visualizer::show`] writes its images to.
pub fn show_dir() -> PathBuf {
    std::env::temp_dir().join("anomalyst")
}

/// A fresh PNG path under [`show_dir`] named after `title`.
pub fn show_path(title: &str) -> PathBuf {
    let slug: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    show_dir().join(format!("{slug}-{}.png", uuid::Uuid::new_v4()))
}

fn labeled_heat_map(result: &ImageResult) -> RgbImage {
    if result.pred_label() {
        add_anomalous_label(result.heat_map(), result.pred_score())
    } else {
        add_normal_label(result.heat_map(), 1.0 - result.pred_score())
    }
}
