//! Frozen convolutional feature extractor.
//!
//! A small ResNet-style encoder: a stride-2 stem followed by three stride-2
//! stages (`layer1`..`layer3`) at 1/4, 1/8 and 1/16 of the input resolution.

use anomalyst_core::ConfigError;
use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::activation::relu;
use burn::tensor::{Tensor, backend::Backend};

/// Names of the feature stages, in resolution order.
pub const LAYER_NAMES: &[&str] = &["layer1", "layer2", "layer3"];

/// Backbones the extractor can be built as.
pub const BACKBONES: &[&str] = &["resnet_tiny", "resnet_small"];

/// Channel layout of a backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneSpec {
    pub stem: usize,
    pub widths: [usize; 3],
    /// Convolutions per stage; the first one downsamples.
    pub depth: usize,
}

impl BackboneSpec {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "resnet_tiny" => Ok(Self {
                stem: 32,
                widths: [64, 128, 256],
                depth: 1,
            }),
            "resnet_small" => Ok(Self {
                stem: 64,
                widths: [64, 128, 256],
                depth: 2,
            }),
            other => Err(ConfigError::UnknownBackbone {
                name: other.to_string(),
                available: BACKBONES,
            }),
        }
    }
}

/// Map layer names to stage indices, rejecting unknown or empty selections.
pub fn layer_indices(layers: &[String]) -> Result<Vec<usize>, ConfigError> {
    if layers.is_empty() {
        return Err(ConfigError::invalid("model.layers", "at least one layer is required"));
    }
    let mut indices = layers
        .iter()
        .map(|name| {
            LAYER_NAMES
                .iter()
                .position(|l| l == name)
                .ok_or_else(|| ConfigError::UnknownLayer {
                    name: name.clone(),
                    available: LAYER_NAMES,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

fn conv3x3<B: Backend>(channels: [usize; 2], stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// Sequence of 3x3 convolutions, the first of which has stride 2.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn new(in_channels: usize, out_channels: usize, depth: usize, device: &B::Device) -> Self {
        let mut convs = vec![conv3x3([in_channels, out_channels], 2, device)];
        for _ in 1..depth.max(1) {
            convs.push(conv3x3([out_channels, out_channels], 1, device));
        }
        Self { convs }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convs
            .iter()
            .fold(input, |x, conv| relu(conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    stem: Conv2d<B>,
    layer1: Stage<B>,
    layer2: Stage<B>,
    layer3: Stage<B>,
}

impl<B: Backend> FeatureExtractor<B> {
    pub fn new(spec: BackboneSpec, device: &B::Device) -> Self {
        let [w1, w2, w3] = spec.widths;
        Self {
            stem: conv3x3([3, spec.stem], 2, device),
            layer1: Stage::new(spec.stem, w1, spec.depth, device),
            layer2: Stage::new(w1, w2, spec.depth, device),
            layer3: Stage::new(w2, w3, spec.depth, device),
        }
    }

    /// Features of `layer1`, `layer2` and `layer3`.
    pub fn forward(&self, images: Tensor<B, 4>) -> [Tensor<B, 4>; 3] {
        let x = relu(self.stem.forward(images));
        let f1 = self.layer1.forward(x);
        let f2 = self.layer2.forward(f1.clone());
        let f3 = self.layer3.forward(f2.clone());
        [f1, f2, f3]
    }
}
