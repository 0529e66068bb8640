//! Integration tests for the visualizer across every mode/task combination.

use anomalyst_core::{Task, VisualizationMode};
use anomalyst_vision::post_process::BOUNDARY_COLOR;
use anomalyst_vision::{
    AnomalyMap, BoundaryMode, ImageGrid, ImageResult, PANEL_SIZE, PredictionBatch, Visualizer,
    add_anomalous_label, add_normal_label, mark_boundaries,
};
use image::imageops;
use image::{GrayImage, Luma, Rgb, RgbImage};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn sample_image(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]))
}

fn sample_map(w: u32, h: u32) -> AnomalyMap {
    AnomalyMap::from_fn(w, h, |x, y| Luma([((x + y) as f32 / (w + h) as f32).min(1.0)]))
}

fn sample_mask(w: u32, h: u32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| Luma([u8::from(x > w / 2 && y > h / 2)]))
}

fn sample_result() -> ImageResult {
    ImageResult::new(
        sample_image(48, 48),
        0.83,
        true,
        sample_map(48, 48),
        Some(sample_mask(48, 48)),
        Some(sample_mask(48, 48)),
    )
}

#[test]
fn every_combination_has_deterministic_dimensions() {
    let cases = [
        (VisualizationMode::Full, Task::Segmentation, (5 * PANEL_SIZE, PANEL_SIZE)),
        (VisualizationMode::Full, Task::Classification, (2 * PANEL_SIZE, PANEL_SIZE)),
        (VisualizationMode::Simple, Task::Segmentation, (48, 48)),
        (VisualizationMode::Simple, Task::Classification, (48, 48)),
    ];
    let result = sample_result();
    for (mode, task, expected) in cases {
        let vis = Visualizer::new(mode, task);
        let first = vis.visualize_image(&result).unwrap();
        let second = vis.visualize_image(&result).unwrap();
        assert_eq!(first.dimensions(), expected, "{mode}/{task}");
        assert!(first == second, "{mode}/{task} is not deterministic");
    }
}

fn panel(grid: &RgbImage, index: u32) -> RgbImage {
    imageops::crop_imm(grid, index * PANEL_SIZE, 0, PANEL_SIZE, PANEL_SIZE).to_image()
}

fn single_panel(image: RgbImage, title: &str) -> RgbImage {
    ImageGrid::new().add_image(image, Some(title), None).generate().unwrap()
}

#[test]
fn full_classification_panels_are_image_and_labeled_heat_map() {
    let vis = Visualizer::new(VisualizationMode::Full, Task::Classification);

    let anomalous = sample_result();
    let out = vis.visualize_image(&anomalous).unwrap();
    assert_eq!(out.dimensions(), (2 * PANEL_SIZE, PANEL_SIZE));
    assert!(panel(&out, 0) == single_panel(anomalous.image().clone(), "Image"));
    let expected = single_panel(
        add_anomalous_label(anomalous.heat_map(), anomalous.pred_score()),
        "Prediction",
    );
    assert!(panel(&out, 1) == expected);

    let normal = ImageResult::new(sample_image(48, 48), 0.2, false, sample_map(48, 48), None, None);
    let out = vis.visualize_image(&normal).unwrap();
    let expected = single_panel(
        add_normal_label(normal.heat_map(), 1.0 - normal.pred_score()),
        "Prediction",
    );
    assert!(panel(&out, 1) == expected);
    let wrong_label = single_panel(
        add_anomalous_label(normal.heat_map(), normal.pred_score()),
        "Prediction",
    );
    assert!(panel(&out, 1) != wrong_label);
}

#[test]
fn unknown_names_are_rejected() {
    let err = Visualizer::from_names("fancy", "segmentation").unwrap_err();
    assert!(err.to_string().contains("fancy"));
    let err = Visualizer::from_names("full", "regression").unwrap_err();
    assert!(err.to_string().contains("regression"));
}

#[test]
fn simple_segmentation_draws_mask_boundary_on_heat_map() {
    let result = sample_result();
    let vis = Visualizer::new(VisualizationMode::Simple, Task::Segmentation);
    let out = vis.visualize_image(&result).unwrap();
    let expected = mark_boundaries(
        result.heat_map(),
        result.pred_mask().unwrap(),
        BOUNDARY_COLOR,
        BoundaryMode::Thick,
    );
    assert!(out == expected);
}

#[test]
fn batch_iterator_is_lazy_and_ordered() {
    let batch = PredictionBatch::new(
        vec![sample_image(16, 16), sample_image(24, 24)],
        vec![0.1, 0.9],
        vec![false, true],
        vec![sample_map(16, 16), sample_map(24, 24)],
    )
    .unwrap();
    let vis = Visualizer::new(VisualizationMode::Simple, Task::Classification);
    let sizes: Vec<_> = vis
        .visualize_batch(&batch)
        .map(|r| r.unwrap().dimensions())
        .collect();
    assert_eq!(sizes, vec![(16, 16), (24, 24)]);

    // Segmentation without predicted masks fails per item.
    let vis = Visualizer::new(VisualizationMode::Full, Task::Segmentation);
    assert!(vis.visualize_batch(&batch).all(|r| r.is_err()));
}

#[test]
fn save_creates_nested_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a").join("b").join("out.png");
    let image = sample_image(20, 10);
    Visualizer::save(&path, &image).unwrap();
    let loaded = image::open(&path).unwrap().to_rgb8();
    assert_eq!(loaded.dimensions(), (20, 10));
    assert!(loaded == image);
}

proptest! {
    #[test]
    fn full_grid_width_scales_with_panels(w in 4u32..64, h in 4u32..64, with_gt in any::<bool>()) {
        let gt = with_gt.then(|| sample_mask(w, h));
        let result = ImageResult::new(
            sample_image(w, h),
            0.5,
            false,
            sample_map(w, h),
            gt,
            Some(sample_mask(w, h)),
        );
        let vis = Visualizer::new(VisualizationMode::Full, Task::Segmentation);
        let out = vis.visualize_image(&result).unwrap();
        let panels = if with_gt { 5 } else { 4 };
        prop_assert_eq!(out.dimensions(), (panels * PANEL_SIZE, PANEL_SIZE));
    }

    #[test]
    fn heat_map_keeps_image_size(w in 1u32..40, h in 1u32..40, mw in 1u32..40, mh in 1u32..40) {
        let result = ImageResult::new(sample_image(w, h), 0.2, false, sample_map(mw, mh), None, None);
        prop_assert_eq!(result.heat_map().dimensions(), (w, h));
    }
}
