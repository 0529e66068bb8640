//! Decoder mirroring the encoder stages in reverse.

use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::tensor::activation::relu;
use burn::tensor::{Tensor, backend::Backend};

use super::bottleneck::EMBEDDING_CHANNELS;

/// Upsample by two, then refine. The refined output is not activated so it can
/// match non-negative encoder features from either side.
#[derive(Module, Debug)]
pub struct UpStage<B: Backend> {
    up: ConvTranspose2d<B>,
    refine: Conv2d<B>,
}

impl<B: Backend> UpStage<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            up: ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
                .with_stride([2, 2])
                .init(device),
            refine: Conv2dConfig::new([out_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.refine.forward(relu(self.up.forward(input)))
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    up3: UpStage<B>,
    up2: UpStage<B>,
    up1: UpStage<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn new(widths: [usize; 3], device: &B::Device) -> Self {
        let [w1, w2, w3] = widths;
        Self {
            up3: UpStage::new(EMBEDDING_CHANNELS, w3, device),
            up2: UpStage::new(w3, w2, device),
            up1: UpStage::new(w2, w1, device),
        }
    }

    /// Reconstructed features, ordered like the encoder output (`layer1` first).
    pub fn forward(&self, embedding: Tensor<B, 4>) -> [Tensor<B, 4>; 3] {
        let d3 = self.up3.forward(embedding);
        let d2 = self.up2.forward(relu(d3.clone()));
        let d1 = self.up1.forward(relu(d2.clone()));
        [d1, d2, d3]
    }
}
