//! # Anomalyst Vision
//!
//! Turns anomaly predictions into images: heat maps superimposed on the input,
//! predicted and ground-truth masks, segmentation boundaries, label banners and
//! side-by-side grids.

pub mod error;
pub mod font;
pub mod grid;
pub mod post_process;
pub mod result;
pub mod visualizer;

pub use error::{Result, VisionError};
pub use grid::{ColorMap, GridImage, ImageGrid, PANEL_SIZE};
pub use post_process::{
    AnomalyMap, BoundaryMode, add_anomalous_label, add_normal_label, anomaly_map_to_color_map,
    compute_mask, mark_boundaries, superimpose_anomaly_map,
};
pub use result::{ImageResult, PredictionBatch};
pub use visualizer::{Visualizer, show_dir, show_path};
