//! Cosine-distance loss between encoder and decoder features.

use burn::tensor::{Tensor, backend::Backend};

const NORM_EPS: f64 = 1e-8;

/// Cosine similarity along `dim`, keeping that dimension with size 1.
pub fn cosine_similarity<B: Backend, const D: usize>(
    a: Tensor<B, D>,
    b: Tensor<B, D>,
    dim: usize,
) -> Tensor<B, D> {
    let dot = (a.clone() * b.clone()).sum_dim(dim);
    let norm_a = (a.clone() * a).sum_dim(dim).add_scalar(NORM_EPS).sqrt();
    let norm_b = (b.clone() * b).sum_dim(dim).add_scalar(NORM_EPS).sqrt();
    dot / (norm_a * norm_b)
}

/// Sum over layers of `mean(1 - cos(flatten(encoder), flatten(decoder)))`, where
/// each sample's feature map is flattened into one vector.
pub fn reverse_distillation_loss<B: Backend>(
    pairs: Vec<(Tensor<B, 4>, Tensor<B, 4>)>,
    device: &B::Device,
) -> Tensor<B, 1> {
    pairs
        .into_iter()
        .fold(Tensor::zeros([1], device), |total, (encoder, decoder)| {
            let encoder = encoder.flatten::<2>(1, 3);
            let decoder = decoder.flatten::<2>(1, 3);
            let distance = cosine_similarity(encoder, decoder, 1)
                .neg()
                .add_scalar(1.0)
                .mean();
            total + distance
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, ElementConversion};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_identical_features_have_zero_loss() {
        let device = Default::default();
        let features =
            Tensor::<TestBackend, 4>::random([2, 4, 3, 3], Distribution::Uniform(0.1, 1.0), &device);
        let loss = reverse_distillation_loss(vec![(features.clone(), features)], &device);
        let value: f32 = loss.into_scalar().elem();
        assert!(value.abs() < 1e-4, "loss = {value}");
    }

    #[test]
    fn test_opposite_features_have_loss_two() {
        let device = Default::default();
        let features = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device);
        let loss = reverse_distillation_loss(vec![(features.clone(), features.neg())], &device);
        let value: f32 = loss.into_scalar().elem();
        assert!((value - 2.0).abs() < 1e-4, "loss = {value}");
    }

    #[test]
    fn test_loss_sums_layers() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device);
        let pairs = vec![(a.clone(), a.clone().neg()), (a.clone(), a.neg())];
        let value: f32 = reverse_distillation_loss(pairs, &device).into_scalar().elem();
        assert!((value - 4.0).abs() < 1e-4);
    }
}
