//! Anomaly map computation from encoder/decoder feature pairs.

use anomalyst_core::AnomalyMapMode;
use burn::tensor::module::{conv2d, interpolate};
use burn::tensor::ops::{ConvOptions, InterpolateMode, InterpolateOptions};
use burn::tensor::{Tensor, TensorData, backend::Backend};

use super::loss::cosine_similarity;
use crate::error::{MlError, Result};

/// Standard deviation of the smoothing kernel, in pixels.
pub const BLUR_SIGMA: f32 = 4.0;

/// Normalized 1-D Gaussian kernel of radius `round(4 * sigma)`.
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (4.0 * sigma + 0.5) as usize;
    let denom = 2.0 * sigma * sigma;
    let weights: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / denom).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Separable Gaussian blur of single-channel maps `[N, 1, H, W]`.
///
/// Borders use normalized convolution: the zero-padded result is divided by the
/// blurred all-ones image, so a constant map stays constant up to the edges.
pub fn gaussian_blur<B: Backend>(maps: Tensor<B, 4>, sigma: f32) -> Tensor<B, 4> {
    let kernel = gaussian_kernel(sigma);
    let size = kernel.len();
    let radius = size / 2;
    let device = maps.device();
    let [_, _, height, width] = maps.dims();

    let horizontal =
        Tensor::<B, 4>::from_data(TensorData::new(kernel.clone(), [1, 1, 1, size]), &device);
    let vertical = Tensor::<B, 4>::from_data(TensorData::new(kernel, [1, 1, size, 1]), &device);
    let blur = |x: Tensor<B, 4>| {
        let x = conv2d(
            x,
            horizontal.clone(),
            None,
            ConvOptions::new([1, 1], [0, radius], [1, 1], 1),
        );
        conv2d(
            x,
            vertical.clone(),
            None,
            ConvOptions::new([1, 1], [radius, 0], [1, 1], 1),
        )
    };

    let weights = blur(Tensor::ones([1, 1, height, width], &device));
    blur(maps) / weights
}

/// Combines per-layer distance maps into one smoothed anomaly map.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyMapGenerator {
    mode: AnomalyMapMode,
    sigma: f32,
}

impl AnomalyMapGenerator {
    pub fn new(mode: AnomalyMapMode) -> Self {
        Self {
            mode,
            sigma: BLUR_SIGMA,
        }
    }

    /// Anomaly maps `[N, 1, H, W]` at `size = [H, W]`.
    pub fn generate<B: Backend>(
        &self,
        pairs: Vec<(Tensor<B, 4>, Tensor<B, 4>)>,
        size: [usize; 2],
    ) -> Result<Tensor<B, 4>> {
        let mut layer_maps = pairs.into_iter().map(|(encoder, decoder)| {
            let distance = cosine_similarity(encoder, decoder, 1).neg().add_scalar(1.0);
            interpolate(
                distance,
                size,
                InterpolateOptions::new(InterpolateMode::Bilinear),
            )
        });
        let first = layer_maps
            .next()
            .ok_or_else(|| MlError::model("anomaly map needs at least one feature layer"))?;
        let combined = layer_maps.fold(first, |acc, map| match self.mode {
            AnomalyMapMode::Add => acc + map,
            AnomalyMapMode::Multiply => acc * map,
        });
        Ok(gaussian_blur(combined, self.sigma))
    }
}
