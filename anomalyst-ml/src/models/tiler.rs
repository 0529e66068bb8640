//! Splits large images into overlapping square tiles and stitches outputs back.
//!
//! Tiles are taken on a regular grid with the configured stride. When the grid
//! does not reach the far edge, one more tile is anchored on that edge, so every
//! pixel is covered. Overlapping outputs are averaged on reassembly.

use burn::tensor::{Tensor, TensorData, backend::Backend};

use crate::error::{MlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tiler {
    tile_size: usize,
    stride: usize,
}

impl Tiler {
    pub fn new(tile_size: usize, stride: usize) -> Result<Self> {
        if tile_size == 0 || stride == 0 || stride > tile_size {
            return Err(MlError::invalid_input(format!(
                "invalid tiling: tile {tile_size}, stride {stride}"
            )));
        }
        Ok(Self { tile_size, stride })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    fn starts(&self, extent: usize) -> Vec<usize> {
        if extent <= self.tile_size {
            return vec![0];
        }
        let last = extent - self.tile_size;
        let mut starts: Vec<usize> = (0..=last).step_by(self.stride).collect();
        if starts.last() != Some(&last) {
            starts.push(last);
        }
        starts
    }

    /// Top-left corners of all tiles covering an image of `[height, width]`.
    pub fn positions(&self, size: [usize; 2]) -> Vec<(usize, usize)> {
        let xs = self.starts(size[1]);
        self.starts(size[0])
            .into_iter()
            .flat_map(|y| xs.iter().map(move |&x| (y, x)))
            .collect()
    }

    fn check_size(&self, height: usize, width: usize) -> Result<()> {
        if height < self.tile_size || width < self.tile_size {
            return Err(MlError::invalid_input(format!(
                "image {height}x{width} is smaller than tile size {}",
                self.tile_size
            )));
        }
        Ok(())
    }

    /// `[N, C, H, W]` to `[T * N, C, tile, tile]`, tile-major.
    pub fn tile<B: Backend>(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [n, c, h, w] = images.dims();
        self.check_size(h, w)?;
        let t = self.tile_size;
        let tiles = self
            .positions([h, w])
            .into_iter()
            .map(|(y, x)| images.clone().slice([0..n, 0..c, y..y + t, x..x + t]))
            .collect();
        Ok(Tensor::cat(tiles, 0))
    }

    /// Reassemble tile outputs `[T * N, C, tile, tile]` into `[N, C, H, W]`,
    /// averaging where tiles overlap.
    pub fn untile<B: Backend>(&self, tiles: Tensor<B, 4>, size: [usize; 2]) -> Result<Tensor<B, 4>> {
        let [h, w] = size;
        self.check_size(h, w)?;
        let positions = self.positions(size);
        let [total, c, th, tw] = tiles.dims();
        let t = self.tile_size;
        if th != t || tw != t || total % positions.len() != 0 {
            return Err(MlError::invalid_input(format!(
                "cannot untile {total} tiles of {th}x{tw} into {h}x{w}"
            )));
        }
        let n = total / positions.len();
        let device = tiles.device();

        let mut counts = vec![0.0f32; h * w];
        let mut output = Tensor::<B, 4>::zeros([n, c, h, w], &device);
        for (i, (y, x)) in positions.into_iter().enumerate() {
            let tile = tiles.clone().slice([i * n..(i + 1) * n, 0..c, 0..t, 0..t]);
            let ranges = [0..n, 0..c, y..y + t, x..x + t];
            let current = output.clone().slice(ranges.clone());
            output = output.slice_assign(ranges, current + tile);
            for row in y..y + t {
                for col in x..x + t {
                    counts[row * w + col] += 1.0;
                }
            }
        }
        let counts = Tensor::<B, 4>::from_data(TensorData::new(counts, [1, 1, h, w]), &device);
        Ok(output / counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use pretty_assertions::assert_eq;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_positions_cover_edges() {
        let tiler = Tiler::new(4, 3).unwrap();
        assert_eq!(tiler.starts(10), vec![0, 3, 6]);
        assert_eq!(tiler.starts(11), vec![0, 3, 6, 7]);
        assert_eq!(tiler.positions([4, 8]), vec![(0, 0), (0, 3), (0, 4)]);
    }

    #[test]
    fn test_invalid_tiler() {
        assert!(Tiler::new(0, 1).is_err());
        assert!(Tiler::new(4, 5).is_err());
    }

    #[test]
    fn test_tile_untile_restores_image() {
        let device = Default::default();
        let values: Vec<f32> = (0..2 * 10 * 10).map(|v| v as f32).collect();
        let images =
            Tensor::<TestBackend, 4>::from_data(TensorData::new(values.clone(), [2, 1, 10, 10]), &device);
        let tiler = Tiler::new(4, 3).unwrap();
        let tiles = tiler.tile(images).unwrap();
        assert_eq!(tiles.dims(), [2 * 9, 1, 4, 4]);
        let restored = tiler.untile(tiles, [10, 10]).unwrap();
        let restored = restored.into_data().to_vec::<f32>().unwrap();
        for (a, b) in restored.iter().zip(values.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_tile_rejects_small_images() {
        let device = Default::default();
        let tiler = Tiler::new(8, 8).unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);
        assert!(tiler.tile(images).is_err());
    }
}
