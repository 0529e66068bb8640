//! Renders test and predict outputs to disk, to the screen, or to the log.

use std::path::{Path, PathBuf};

use anomalyst_core::{Task, VisualizationMode};
use anomalyst_vision::Visualizer;
use burn::tensor::backend::AutodiffBackend;
use image::RgbImage;
use tracing::{info, warn};

use super::callbacks::TrainingCallback;
use super::outputs::StepOutputs;
use super::state::TrainerState;
use crate::error::Result;
use crate::models::AnomalyModule;

#[derive(Debug)]
pub struct VisualizerCallback {
    visualizer: Visualizer,
    image_save_path: Option<PathBuf>,
    save_images: bool,
    show_images: bool,
    log_images: bool,
}

impl VisualizerCallback {
    pub fn new(
        mode: VisualizationMode,
        task: Task,
        image_save_path: Option<PathBuf>,
        save_images: bool,
        show_images: bool,
        log_images: bool,
    ) -> Self {
        if save_images && image_save_path.is_none() {
            warn!("save_images is set but no image_save_path is configured; images will not be saved");
        }
        Self {
            visualizer: Visualizer::new(mode, task),
            image_save_path,
            save_images,
            show_images,
            log_images,
        }
    }

    fn enabled(&self) -> bool {
        (self.save_images && self.image_save_path.is_some()) || self.show_images || self.log_images
    }

    /// `<root>/<parent dir name>/<file name>` of a source image.
    pub fn output_path(root: &Path, source: &Path) -> PathBuf {
        let parent = source
            .parent()
            .and_then(Path::file_name)
            .map(PathBuf::from)
            .unwrap_or_default();
        let name = source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("image.png"));
        root.join(parent).join(name)
    }

    fn emit(&self, source: &Path, image: &RgbImage) -> Result<()> {
        if self.save_images
            && let Some(root) = &self.image_save_path
        {
            let path = Self::output_path(root, source);
            Visualizer::save(&path, image)?;
        }
        if self.log_images {
            info!(
                image = %source.display(),
                width = image.width(),
                height = image.height(),
                "Visualization ready"
            );
        }
        if self.show_images {
            let title = source.display().to_string();
            Visualizer::show(&title, image)?;
        }
        Ok(())
    }

    fn render(&self, outputs: &StepOutputs) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let batch = outputs.to_prediction_batch()?;
        for (image, source) in self.visualizer.visualize_batch(&batch).zip(&outputs.paths) {
            self.emit(source, &image?)?;
        }
        Ok(())
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for VisualizerCallback {
    fn name(&self) -> &'static str {
        "Visualizer"
    }

    fn on_test_batch_end(&mut self, outputs: &mut StepOutputs, _state: &TrainerState) -> Result<()> {
        self.render(outputs)
    }

    fn on_predict_batch_end(
        &mut self,
        outputs: &mut StepOutputs,
        _state: &TrainerState,
    ) -> Result<()> {
        self.render(outputs)
    }
}
