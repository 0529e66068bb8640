//! Host-side batches and image preprocessing.

use std::path::{Path, PathBuf};

use burn::tensor::{Tensor, TensorData, backend::Backend};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};

use crate::error::{MlError, Result};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One batch of images on the host, ready to be uploaded to any backend.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Source images resized to the model input size.
    pub images: Vec<RgbImage>,
    /// `true` for anomalous samples; `None` when labels are unknown (prediction).
    pub labels: Option<Vec<bool>>,
    /// Binary ground-truth masks (0/1) at the model input size.
    pub masks: Option<Vec<GrayImage>>,
    pub paths: Vec<PathBuf>,
    size: [usize; 2],
}

impl Batch {
    pub fn new(
        images: Vec<RgbImage>,
        labels: Option<Vec<bool>>,
        masks: Option<Vec<GrayImage>>,
        paths: Vec<PathBuf>,
        size: [usize; 2],
    ) -> Result<Self> {
        let n = images.len();
        let lengths_match = paths.len() == n
            && labels.as_ref().is_none_or(|l| l.len() == n)
            && masks.as_ref().is_none_or(|m| m.len() == n);
        if !lengths_match {
            return Err(MlError::dataset("batch fields have mismatched lengths"));
        }
        Ok(Self {
            images,
            labels,
            masks,
            paths,
            size,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// `[height, width]` of every image in the batch.
    pub fn size(&self) -> [usize; 2] {
        self.size
    }

    /// ImageNet-normalized images as a `[N, 3, H, W]` tensor.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let [height, width] = self.size;
        let plane = height * width;
        let mut data = vec![0.0f32; self.len() * 3 * plane];
        for (i, image) in self.images.iter().enumerate() {
            let offset = i * 3 * plane;
            for (x, y, pixel) in image.enumerate_pixels() {
                let idx = y as usize * width + x as usize;
                for c in 0..3 {
                    let value = pixel.0[c] as f32 / 255.0;
                    data[offset + c * plane + idx] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
                }
            }
        }
        Tensor::from_data(TensorData::new(data, [self.len(), 3, height, width]), device)
    }
}

/// Load an RGB image and resize it to `[height, width]`.
pub fn load_image(path: &Path, size: [usize; 2]) -> Result<RgbImage> {
    let image = image::open(path)
        .map_err(|e| MlError::dataset(format!("failed to open image {}: {e}", path.display())))?
        .to_rgb8();
    let [height, width] = size;
    if image.dimensions() == (width as u32, height as u32) {
        return Ok(image);
    }
    Ok(imageops::resize(
        &image,
        width as u32,
        height as u32,
        FilterType::Triangle,
    ))
}

/// Load a mask, resize it with nearest-neighbour sampling and binarize it to 0/1.
pub fn load_mask(path: &Path, size: [usize; 2]) -> Result<GrayImage> {
    let mask = image::open(path)
        .map_err(|e| MlError::dataset(format!("failed to open mask {}: {e}", path.display())))?
        .to_luma8();
    let [height, width] = size;
    let mask = imageops::resize(&mask, width as u32, height as u32, FilterType::Nearest);
    Ok(GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([u8::from(mask.get_pixel(x, y).0[0] > 127)])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_to_tensor_normalizes_channels() {
        let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 128]));
        let batch = Batch::new(
            vec![image],
            None,
            None,
            vec![PathBuf::from("a.png")],
            [2, 4],
        )
        .unwrap();
        let tensor = batch.to_tensor::<TestBackend>(&Default::default());
        assert_eq!(tensor.dims(), [1, 3, 2, 4]);
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let green = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((values[0] - red).abs() < 1e-5);
        assert!((values[8] - green).abs() < 1e-5);
    }

    #[test]
    fn test_batch_length_mismatch() {
        let result = Batch::new(
            vec![RgbImage::new(2, 2)],
            Some(vec![true, false]),
            None,
            vec![PathBuf::from("a.png")],
            [2, 2],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_mask_binarizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        GrayImage::from_fn(8, 8, |x, _| Luma([if x < 4 { 0 } else { 255 }]))
            .save(&path)
            .unwrap();
        let mask = load_mask(&path, [4, 4]).unwrap();
        assert_eq!(mask.dimensions(), (4, 4));
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
        assert_eq!(mask.get_pixel(3, 0).0[0], 1);
    }
}
