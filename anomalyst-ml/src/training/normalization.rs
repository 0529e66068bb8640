//! Score normalization callbacks.
//!
//! Statistics are gathered from raw validation outputs. Test and predict
//! outputs are then mapped into `[0, 1]` so that the calibrated thresholds land
//! on 0.5.

use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, warn};

use super::callbacks::{CallbackAction, TrainingCallback};
use super::outputs::StepOutputs;
use super::state::{CdfStats, MinMaxStats, Thresholds, TrainerState};
use crate::error::Result;
use crate::models::AnomalyModule;

/// Floor applied before taking logarithms of anomaly scores.
const LOG_EPS: f32 = 1e-12;

/// `((value - threshold) / (max - min)) + 0.5`, clamped to `[0, 1]`.
pub fn min_max_normalize(value: f32, threshold: f32, stats: MinMaxStats) -> f32 {
    let range = (stats.max - stats.min).max(f32::EPSILON);
    ((value - threshold) / range + 0.5).clamp(0.0, 1.0)
}

/// Error function, Abramowitz & Stegun 7.1.26 (absolute error below 1.5e-7).
pub fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// Standard normal cumulative distribution function.
pub fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Standardize `ln(value)` and `ln(threshold)` with the given log statistics and
/// return `Φ(z(value) - z(threshold))`.
pub fn cdf_normalize(value: f32, threshold: f32, mean: f32, std: f32) -> f32 {
    let std = f64::from(std.max(LOG_EPS));
    let z = |v: f32| (f64::from(v.max(LOG_EPS)).ln() - f64::from(mean)) / std;
    standard_normal_cdf(z(value) - z(threshold)) as f32
}

fn normalize_outputs(
    outputs: &mut StepOutputs,
    image: impl Fn(f32) -> f32,
    pixel: impl Fn(f32) -> f32,
) {
    for score in outputs.pred_scores.iter_mut() {
        *score = image(*score);
    }
    for map in outputs.anomaly_maps.iter_mut() {
        for p in map.pixels_mut() {
            p.0[0] = pixel(p.0[0]);
        }
    }
}

/// Min-max normalization over a single range shared by maps and scores.
#[derive(Debug, Default)]
pub struct MinMaxNormalizationCallback {
    stats: Option<MinMaxStats>,
    warned: bool,
}

impl MinMaxNormalizationCallback {
    fn normalize(&mut self, outputs: &mut StepOutputs, state: &TrainerState) {
        let Some(stats) = state.min_max else {
            if !self.warned {
                warn!("No min-max statistics available; outputs are left unnormalized");
                self.warned = true;
            }
            return;
        };
        let Thresholds { image, pixel } = state.thresholds;
        normalize_outputs(
            outputs,
            |v| min_max_normalize(v, image, stats),
            |v| min_max_normalize(v, pixel, stats),
        );
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M>
    for MinMaxNormalizationCallback
{
    fn name(&self) -> &'static str {
        "MinMaxNormalization"
    }

    fn on_validation_start(&mut self, _state: &TrainerState) -> Result<()> {
        self.stats = None;
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        outputs: &mut StepOutputs,
        _state: &TrainerState,
    ) -> Result<()> {
        let pixels = outputs
            .anomaly_maps
            .iter()
            .flat_map(|map| map.pixels().map(|p| p.0[0]));
        let batch = MinMaxStats::from_values(outputs.pred_scores.iter().copied().chain(pixels));
        self.stats = match (self.stats, batch) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    fn on_validation_end(&mut self, state: &mut TrainerState) -> Result<CallbackAction> {
        if let Some(stats) = self.stats {
            debug!(min = stats.min, max = stats.max, "Min-max statistics updated");
            state.min_max = Some(stats);
        }
        Ok(CallbackAction::Continue)
    }

    fn on_test_batch_end(&mut self, outputs: &mut StepOutputs, state: &TrainerState) -> Result<()> {
        self.normalize(outputs, state);
        Ok(())
    }

    fn on_predict_batch_end(
        &mut self,
        outputs: &mut StepOutputs,
        state: &TrainerState,
    ) -> Result<()> {
        self.normalize(outputs, state);
        Ok(())
    }
}

/// Streaming mean and variance.
#[derive(Debug, Default, Clone, Copy)]
struct RunningStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl RunningStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn mean_std(&self) -> Option<(f32, f32)> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let var = (self.sum_sq / n - mean * mean).max(0.0);
        Some((mean as f32, var.sqrt() as f32))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LogStats {
    image: RunningStats,
    pixel: RunningStats,
}

impl LogStats {
    fn push(&mut self, outputs: &StepOutputs, index: usize) {
        self.image
            .push(f64::from(outputs.pred_scores[index].max(LOG_EPS)).ln());
        for p in outputs.anomaly_maps[index].pixels() {
            self.pixel.push(f64::from(p.0[0].max(LOG_EPS)).ln());
        }
    }

    fn finish(&self) -> Option<CdfStats> {
        let (image_mean, image_std) = self.image.mean_std()?;
        let (pixel_mean, pixel_std) = self.pixel.mean_std()?;
        Some(CdfStats {
            image_mean,
            image_std,
            pixel_mean,
            pixel_std,
        })
    }
}

/// Normalization through the normal CDF of standardized log-scores.
///
/// Statistics come from validation samples labelled normal, or from every
/// validation sample when none is.
#[derive(Debug, Default)]
pub struct CdfNormalizationCallback {
    normal: LogStats,
    all: LogStats,
    warned: bool,
}

impl CdfNormalizationCallback {
    fn normalize(&mut self, outputs: &mut StepOutputs, state: &TrainerState) {
        let Some(stats) = state.cdf else {
            if !self.warned {
                warn!("No CDF statistics available; outputs are left unnormalized");
                self.warned = true;
            }
            return;
        };
        let Thresholds { image, pixel } = state.thresholds;
        normalize_outputs(
            outputs,
            |v| cdf_normalize(v, image, stats.image_mean, stats.image_std),
            |v| cdf_normalize(v, pixel, stats.pixel_mean, stats.pixel_std),
        );
    }
}

impl<B: AutodiffBackend, M: AnomalyModule<B>> TrainingCallback<B, M> for CdfNormalizationCallback {
    fn name(&self) -> &'static str {
        "CdfNormalization"
    }

    fn on_validation_start(&mut self, _state: &TrainerState) -> Result<()> {
        self.normal = LogStats::default();
        self.all = LogStats::default();
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        outputs: &mut StepOutputs,
        _state: &TrainerState,
    ) -> Result<()> {
        for i in 0..outputs.len() {
            self.all.push(outputs, i);
            let normal = outputs.labels.as_ref().is_none_or(|labels| !labels[i]);
            if normal {
                self.normal.push(outputs, i);
            }
        }
        Ok(())
    }

    fn on_validation_end(&mut self, state: &mut TrainerState) -> Result<CallbackAction> {
        let stats = if self.normal.image.count > 0 {
            self.normal.finish()
        } else {
            self.all.finish()
        };
        if let Some(stats) = stats {
            debug!(?stats, "CDF statistics updated");
            state.cdf = Some(stats);
        }
        Ok(CallbackAction::Continue)
    }

    fn on_test_batch_end(&mut self, outputs: &mut StepOutputs, state: &TrainerState) -> Result<()> {
        self.normalize(outputs, state);
        Ok(())
    }

    fn on_predict_batch_end(
        &mut self,
        outputs: &mut StepOutputs,
        state: &TrainerState,
    ) -> Result<()> {
        self.normalize(outputs, state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_min_max_maps_threshold_to_half() {
        let stats = MinMaxStats { min: 0.0, max: 2.0 };
        assert_eq!(min_max_normalize(0.7, 0.7, stats), 0.5);
        assert_eq!(min_max_normalize(10.0, 0.7, stats), 1.0);
        assert_eq!(min_max_normalize(-10.0, 0.7, stats), 0.0);
    }

    #[test]
    fn test_erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_79).abs() < 1e-6);
        assert!((standard_normal_cdf(1.96) - 0.975).abs() < 1e-3);
    }

    #[test]
    fn test_cdf_maps_threshold_to_half() {
        let value = cdf_normalize(0.3, 0.3, -1.2, 0.4);
        assert!((value - 0.5).abs() < 1e-6);
        assert!(cdf_normalize(0.6, 0.3, -1.2, 0.4) > 0.5);
        assert!(cdf_normalize(0.0, 0.3, -1.2, 0.4) < 0.5);
    }

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        for v in [1.0, 2.0, 3.0] {
            stats.push(v);
        }
        let (mean, std) = stats.mean_std().unwrap();
        assert!((mean - 2.0).abs() < 1e-6);
        assert!((std - (2.0f32 / 3.0).sqrt()).abs() < 1e-6);
        assert!(RunningStats::default().mean_std().is_none());
    }

    proptest! {
        #[test]
        fn prop_min_max_is_monotonic(a in -5.0f32..5.0, b in -5.0f32..5.0, thr in -1.0f32..1.0) {
            let stats = MinMaxStats { min: -5.0, max: 5.0 };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(min_max_normalize(lo, thr, stats) <= min_max_normalize(hi, thr, stats));
        }
    }
}
