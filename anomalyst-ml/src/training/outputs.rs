//! Host-side step outputs and their post-processing.

use std::path::PathBuf;

use anomalyst_core::Task;
use anomalyst_vision::{AnomalyMap, PredictionBatch, compute_mask};
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use super::state::Thresholds;
use crate::data::Batch;
use crate::error::{MlError, Result};

/// Structuring element size of the opening applied to predicted masks.
pub const MASK_KERNEL_SIZE: u32 = 4;

/// Predictions for one batch, with the inputs they were computed from.
#[derive(Debug, Clone)]
pub struct StepOutputs {
    pub images: Vec<RgbImage>,
    pub paths: Vec<PathBuf>,
    pub labels: Option<Vec<bool>>,
    pub gt_masks: Option<Vec<GrayImage>>,
    pub anomaly_maps: Vec<AnomalyMap>,
    pub pred_scores: Vec<f32>,
    pub pred_labels: Vec<bool>,
    pub pred_masks: Option<Vec<GrayImage>>,
}

impl StepOutputs {
    /// Download `[N, H, W]` anomaly maps and score each image by its maximum.
    pub fn from_maps<B: Backend>(batch: Batch, maps: Tensor<B, 3>) -> Result<Self> {
        let [n, height, width] = maps.dims();
        if n != batch.len() || [height, width] != batch.size() {
            return Err(MlError::model(format!(
                "anomaly maps {:?} do not match batch of {} images at {:?}",
                [n, height, width],
                batch.len(),
                batch.size()
            )));
        }
        let values = maps.into_data().to_vec::<f32>()?;
        let plane = height * width;
        let anomaly_maps = (0..n)
            .map(|i| {
                AnomalyMap::from_raw(
                    width as u32,
                    height as u32,
                    values[i * plane..(i + 1) * plane].to_vec(),
                )
                .ok_or_else(|| MlError::model("anomaly map buffer has the wrong size"))
            })
            .collect::<Result<Vec<_>>>()?;
        let pred_scores = anomaly_maps
            .iter()
            .map(|map| map.pixels().map(|p| p.0[0]).fold(f32::NEG_INFINITY, f32::max))
            .collect();

        Ok(Self {
            images: batch.images,
            paths: batch.paths,
            labels: batch.labels,
            gt_masks: batch.masks,
            anomaly_maps,
            pred_scores,
            pred_labels: vec![false; n],
            pred_masks: None,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Label images by `image` threshold and, for segmentation, derive masks
    /// from the `pixel` threshold.
    pub fn apply_thresholds(&mut self, thresholds: &Thresholds, task: Task) {
        self.pred_labels = self
            .pred_scores
            .iter()
            .map(|&score| score >= thresholds.image)
            .collect();
        self.pred_masks = match task {
            Task::Segmentation => Some(
                self.anomaly_maps
                    .iter()
                    .map(|map| compute_mask(map, thresholds.pixel, MASK_KERNEL_SIZE))
                    .collect(),
            ),
            Task::Classification => None,
        };
    }

    /// Visualization input for this batch.
    pub fn to_prediction_batch(&self) -> Result<PredictionBatch> {
        let mut batch = PredictionBatch::new(
            self.images.clone(),
            self.pred_scores.clone(),
            self.pred_labels.clone(),
            self.anomaly_maps.clone(),
        )?;
        if let Some(masks) = &self.pred_masks {
            batch = batch.with_pred_masks(masks.clone())?;
        }
        if let Some(masks) = &self.gt_masks {
            batch = batch.with_gt_masks(masks.clone())?;
        }
        Ok(batch)
    }

    pub fn records(&self) -> Vec<PredictionRecord> {
        (0..self.len())
            .map(|i| PredictionRecord {
                path: self.paths[i].clone(),
                pred_score: self.pred_scores[i],
                pred_label: self.pred_labels[i],
                anomalous_pixels: self
                    .pred_masks
                    .as_ref()
                    .map(|masks| masks[i].pixels().filter(|p| p.0[0] > 0).count()),
            })
            .collect()
    }
}

/// Serializable summary of one prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub path: PathBuf,
    pub pred_score: f32,
    pub pred_label: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomalous_pixels: Option<usize>,
}
