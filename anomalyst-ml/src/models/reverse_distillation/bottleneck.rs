//! One-class bottleneck embedding.
//!
//! Brings every encoder stage to 1/16 resolution, concatenates them and fuses the
//! result into a compact embedding at 1/32 that the decoder reconstructs from.

use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::activation::relu;
use burn::tensor::{Tensor, backend::Backend};

/// Channels of the bottleneck embedding.
pub const EMBEDDING_CHANNELS: usize = 512;

fn down<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[derive(Module, Debug)]
pub struct OneClassBottleneck<B: Backend> {
    down1a: Conv2d<B>,
    down1b: Conv2d<B>,
    down2: Conv2d<B>,
    fuse: Conv2d<B>,
}

impl<B: Backend> OneClassBottleneck<B> {
    pub fn new(widths: [usize; 3], device: &B::Device) -> Self {
        let [w1, w2, w3] = widths;
        Self {
            down1a: down([w1, w2], device),
            down1b: down([w2, w3], device),
            down2: down([w2, w3], device),
            fuse: down([3 * w3, EMBEDDING_CHANNELS], device),
        }
    }

    pub fn forward(&self, features: [Tensor<B, 4>; 3]) -> Tensor<B, 4> {
        let [f1, f2, f3] = features;
        let x1 = relu(self.down1b.forward(relu(self.down1a.forward(f1))));
        let x2 = relu(self.down2.forward(f2));
        let x = Tensor::cat(vec![x1, x2, f3], 1);
        relu(self.fuse.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_embedding_shape() {
        let device = Default::default();
        let bottleneck = OneClassBottleneck::<TestBackend>::new([8, 16, 32], &device);
        let features = [
            Tensor::zeros([1, 8, 16, 16], &device),
            Tensor::zeros([1, 16, 8, 8], &device),
            Tensor::zeros([1, 32, 4, 4], &device),
        ];
        assert_eq!(
            bottleneck.forward(features).dims(),
            [1, EMBEDDING_CHANNELS, 2, 2]
        );
    }
}
