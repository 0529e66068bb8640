//! Per-sample prediction records.

use image::{GrayImage, RgbImage};

use crate::error::{Result, VisionError};
use crate::post_process::{
    AnomalyMap, BOUNDARY_COLOR, BoundaryMode, HEATMAP_ALPHA, mark_boundaries, normalize_mask,
    superimpose_anomaly_map,
};

/// Everything needed to visualize the prediction for one image.
///
/// The heat map and segmentation overlays are computed once in [`ImageResult::new`];
/// the record is read-only afterwards.
#[derive(Debug, Clone)]
pub struct ImageResult {
    image: RgbImage,
    pred_score: f32,
    pred_label: bool,
    anomaly_map: AnomalyMap,
    gt_mask: Option<GrayImage>,
    pred_mask: Option<GrayImage>,
    heat_map: RgbImage,
    segmentations: Option<RgbImage>,
}

impl ImageResult {
    /// Build the record and its derived overlays.
    ///
    /// Masks with values in `{0, 1}` are rescaled to `{0, 255}`; each mask is
    /// checked against its own range.
    pub fn new(
        image: RgbImage,
        pred_score: f32,
        pred_label: bool,
        anomaly_map: AnomalyMap,
        gt_mask: Option<GrayImage>,
        pred_mask: Option<GrayImage>,
    ) -> Self {
        let heat_map = superimpose_anomaly_map(&anomaly_map, &image, HEATMAP_ALPHA, false);
        let pred_mask = pred_mask.map(normalize_mask);
        let gt_mask = gt_mask.map(normalize_mask);
        let segmentations = pred_mask
            .as_ref()
            .map(|mask| mark_boundaries(&image, mask, BOUNDARY_COLOR, BoundaryMode::Thick));
        Self {
            image,
            pred_score,
            pred_label,
            anomaly_map,
            gt_mask,
            pred_mask,
            heat_map,
            segmentations,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn pred_score(&self) -> f32 {
        self.pred_score
    }

    /// `true` when the image was predicted anomalous.
    pub fn pred_label(&self) -> bool {
        self.pred_label
    }

    pub fn anomaly_map(&self) -> &AnomalyMap {
        &self.anomaly_map
    }

    pub fn gt_mask(&self) -> Option<&GrayImage> {
        self.gt_mask.as_ref()
    }

    pub fn pred_mask(&self) -> Option<&GrayImage> {
        self.pred_mask.as_ref()
    }

    /// Anomaly map superimposed on the source image.
    pub fn heat_map(&self) -> &RgbImage {
        &self.heat_map
    }

    /// Source image with the predicted mask contour drawn on top.
    pub fn segmentations(&self) -> Option<&RgbImage> {
        self.segmentations.as_ref()
    }
}

/// Predictions and ground truth for a batch of images, in host memory.
#[derive(Debug, Clone, Default)]
pub struct PredictionBatch {
    images: Vec<RgbImage>,
    pred_scores: Vec<f32>,
    pred_labels: Vec<bool>,
    anomaly_maps: Vec<AnomalyMap>,
    pred_masks: Option<Vec<GrayImage>>,
    gt_masks: Option<Vec<GrayImage>>,
}

impl PredictionBatch {
    pub fn new(
        images: Vec<RgbImage>,
        pred_scores: Vec<f32>,
        pred_labels: Vec<bool>,
        anomaly_maps: Vec<AnomalyMap>,
    ) -> Result<Self> {
        let expected = images.len();
        check_len("pred_scores", expected, pred_scores.len())?;
        check_len("pred_labels", expected, pred_labels.len())?;
        check_len("anomaly_maps", expected, anomaly_maps.len())?;
        Ok(Self {
            images,
            pred_scores,
            pred_labels,
            anomaly_maps,
            pred_masks: None,
            gt_masks: None,
        })
    }

    pub fn with_pred_masks(mut self, masks: Vec<GrayImage>) -> Result<Self> {
        check_len("pred_masks", self.len(), masks.len())?;
        self.pred_masks = Some(masks);
        Ok(self)
    }

    pub fn with_gt_masks(mut self, masks: Vec<GrayImage>) -> Result<Self> {
        check_len("gt_masks", self.len(), masks.len())?;
        self.gt_masks = Some(masks);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Assemble the [`ImageResult`] of sample `index`.
    pub fn image_result(&self, index: usize) -> Option<ImageResult> {
        let image = self.images.get(index)?.clone();
        Some(ImageResult::new(
            image,
            self.pred_scores[index],
            self.pred_labels[index],
            self.anomaly_maps[index].clone(),
            self.gt_masks.as_ref().map(|m| m[index].clone()),
            self.pred_masks.as_ref().map(|m| m[index].clone()),
        ))
    }
}

fn check_len(field: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(VisionError::DimensionMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}
