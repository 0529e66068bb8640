//! Anomaly detection via reverse distillation from a one-class embedding.
//!
//! A frozen encoder produces multi-scale features; a trainable bottleneck squeezes
//! them into a compact embedding and a decoder reconstructs the encoder features
//! from it. On normal images the reconstruction matches; anomalous regions show up
//! as cosine distance between encoder and decoder features.

pub mod anomaly_map;
pub mod bottleneck;
pub mod decoder;
pub mod encoder;
pub mod loss;

use anomalyst_core::{AnomalyMapMode, CallbackSpec, ConfigError, EarlyStoppingConfig, ModelConfig};
use burn::module::{AutodiffModule, Ignored, Module};
use burn::optim::{AdamConfig, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{AnomalyModule, Tiler};
use anomaly_map::AnomalyMapGenerator;
use bottleneck::OneClassBottleneck;
use decoder::Decoder;
use encoder::{BackboneSpec, FeatureExtractor, layer_indices};
use loss::reverse_distillation_loss;

/// Input sides must be divisible by this (the embedding sits at 1/32).
pub const SIZE_MULTIPLE: usize = 32;

/// Non-learnable settings carried alongside the weights.
#[derive(Debug, Clone)]
pub struct Settings {
    layers: Vec<usize>,
    input_size: [usize; 2],
    anomaly_map_mode: AnomalyMapMode,
    lr: f64,
    beta1: f64,
    beta2: f64,
    early_stopping: EarlyStoppingConfig,
    tiler: Option<Tiler>,
}

#[derive(Module, Debug)]
pub struct ReverseDistillation<B: Backend> {
    encoder: FeatureExtractor<B>,
    bottleneck: OneClassBottleneck<B>,
    decoder: Decoder<B>,
    settings: Ignored<Settings>,
}

fn check_input_size(input_size: [usize; 2]) -> std::result::Result<(), ConfigError> {
    let [height, width] = input_size;
    let valid = |side: usize| side > 0 && side % SIZE_MULTIPLE == 0;
    if !valid(height) || !valid(width) {
        return Err(ConfigError::InvalidInputSize {
            height,
            width,
            multiple: SIZE_MULTIPLE,
        });
    }
    Ok(())
}

impl<B: Backend> ReverseDistillation<B> {
    /// Build the network. The encoder is frozen; when `backbone_weights` is set,
    /// its weights are loaded from that burn record first.
    pub fn new(config: &ModelConfig, device: &B::Device) -> Result<Self> {
        let spec = BackboneSpec::from_name(&config.backbone)?;
        let layers = layer_indices(&config.layers)?;
        check_input_size(config.input_size)?;

        let mut encoder = FeatureExtractor::new(spec, device);
        if let Some(path) = &config.backbone_weights {
            let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
            encoder = encoder.load_file(path.clone(), &recorder, device)?;
            info!(path = %path.display(), "Loaded backbone weights");
        }

        debug!(
            backbone = %config.backbone,
            layers = ?layers,
            input_size = ?config.input_size,
            "Built reverse distillation model"
        );

        Ok(Self {
            encoder: encoder.no_grad(),
            bottleneck: OneClassBottleneck::new(spec.widths, device),
            decoder: Decoder::new(spec.widths, device),
            settings: Ignored(Settings {
                layers,
                input_size: config.input_size,
                anomaly_map_mode: config.anomaly_map_mode,
                lr: config.lr,
                beta1: config.beta1,
                beta2: config.beta2,
                early_stopping: config.early_stopping.clone(),
                tiler: None,
            }),
        })
    }

    pub fn input_size(&self) -> [usize; 2] {
        self.settings.0.input_size
    }

    pub fn tiler(&self) -> Option<Tiler> {
        self.settings.0.tiler
    }

    /// Encoder features and their reconstructions for the selected layers.
    fn feature_pairs(&self, images: Tensor<B, 4>) -> Vec<(Tensor<B, 4>, Tensor<B, 4>)> {
        let encoder = self.encoder.forward(images);
        let embedding = self.bottleneck.forward(encoder.clone());
        let decoder = self.decoder.forward(embedding);
        encoder
            .into_iter()
            .zip(decoder)
            .enumerate()
            .filter(|(i, _)| self.settings.0.layers.contains(i))
            .map(|(_, pair)| pair)
            .collect()
    }

    fn tile(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        match &self.settings.0.tiler {
            Some(tiler) => tiler.tile(images),
            None => Ok(images),
        }
    }

    /// Reverse distillation loss of a batch.
    pub fn loss(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 1>> {
        let device = images.device();
        let images = self.tile(images)?;
        Ok(reverse_distillation_loss(self.feature_pairs(images), &device))
    }

    /// Anomaly maps `[N, H, W]` at the spatial size of `images`.
    pub fn anomaly_maps(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 3>> {
        let [n, _, height, width] = images.dims();
        let tiles = self.tile(images)?;
        let [_, _, tile_h, tile_w] = tiles.dims();
        let generator = AnomalyMapGenerator::new(self.settings.0.anomaly_map_mode);
        let maps = generator.generate(self.feature_pairs(tiles), [tile_h, tile_w])?;
        let maps = match &self.settings.0.tiler {
            Some(tiler) => tiler.untile(maps, [height, width])?,
            None => maps,
        };
        Ok(maps.reshape([n, height, width]))
    }
}

impl<B: AutodiffBackend> AnomalyModule<B> for ReverseDistillation<B> {
    fn learning_rate(&self) -> f64 {
        self.settings.0.lr
    }

    /// Adam over the bottleneck and decoder; the frozen encoder receives no gradients.
    fn configure_optimizers(&self) -> impl Optimizer<Self, B> + use<B> {
        AdamConfig::new()
            .with_beta_1(self.settings.0.beta1 as f32)
            .with_beta_2(self.settings.0.beta2 as f32)
            .init::<B, Self>()
    }

    fn training_step(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 1>> {
        self.loss(images)
    }

    fn validation_step(
        &self,
        images: Tensor<B::InnerBackend, 4>,
    ) -> Result<Tensor<B::InnerBackend, 3>> {
        self.valid().anomaly_maps(images)
    }

    fn configure_callbacks(&self) -> Vec<CallbackSpec> {
        vec![CallbackSpec::EarlyStopping(
            self.settings.0.early_stopping.clone(),
        )]
    }

    fn set_tiler(&mut self, tiler: Option<Tiler>) -> Result<()> {
        if let Some(tiler) = &tiler {
            let tile = tiler.tile_size();
            let [height, width] = self.settings.0.input_size;
            if tile % SIZE_MULTIPLE != 0 || tile > height || tile > width {
                return Err(ConfigError::InvalidTiling {
                    reason: format!(
                        "tile size {tile} must be a multiple of {SIZE_MULTIPLE} and fit in {height}x{width}"
                    ),
                }
                .into());
            }
        }
        self.settings.0.tiler = tiler;
        Ok(())
    }
}
