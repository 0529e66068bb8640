//! Mutable run state shared between the trainer and its callbacks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};

/// Which entry point is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fit,
    Validate,
    Test,
    Predict,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fit => write!(f, "fit"),
            Stage::Validate => write!(f, "validate"),
            Stage::Test => write!(f, "test"),
            Stage::Predict => write!(f, "predict"),
        }
    }
}

/// Image- and pixel-level decision thresholds, in raw anomaly-score units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub image: f32,
    pub pixel: f32,
}

/// Shared minimum and maximum over validation anomaly maps and scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxStats {
    pub min: f32,
    pub max: f32,
}

impl MinMaxStats {
    /// Stats of the finite values in `values`; `None` when there are none.
    pub fn from_values(values: impl IntoIterator<Item = f32>) -> Option<Self> {
        values
            .into_iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<Self>, v| {
                Some(match acc {
                    Some(s) => Self {
                        min: s.min.min(v),
                        max: s.max.max(v),
                    },
                    None => Self { min: v, max: v },
                })
            })
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Mean and standard deviation of log-scores of normal samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CdfStats {
    pub image_mean: f32,
    pub image_std: f32,
    pub pixel_mean: f32,
    pub pixel_std: f32,
}

/// Everything the trainer knows about the current run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub stage: Stage,
    pub epoch: usize,
    pub global_step: usize,
    pub thresholds: Thresholds,
    /// `true` once thresholds come from validation data, a checkpoint, or fixed defaults.
    pub thresholds_calibrated: bool,
    pub min_max: Option<MinMaxStats>,
    pub cdf: Option<CdfStats>,
    /// Latest value of every computed metric, e.g. `image_AUROC`.
    pub metrics: BTreeMap<String, f64>,
    /// Mean training loss per epoch.
    pub train_losses: Vec<f64>,
    #[serde(skip)]
    cancel: Arc<AtomicBool>,
}

impl TrainerState {
    pub fn new(thresholds: Thresholds, calibrated: bool) -> Self {
        Self {
            stage: Stage::Fit,
            epoch: 0,
            global_step: 0,
            thresholds,
            thresholds_calibrated: calibrated,
            min_max: None,
            cdf: None,
            metrics: BTreeMap::new(),
            train_losses: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the run at the next batch boundary once set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Share an externally owned cancellation flag, e.g. one set by a signal handler.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = flag;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MlError::Cancelled);
        }
        Ok(())
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_min_max_ignores_non_finite() {
        let stats = MinMaxStats::from_values([0.5, f32::NAN, -1.0, 2.0, f32::INFINITY]).unwrap();
        assert_eq!(stats, MinMaxStats { min: -1.0, max: 2.0 });
        assert!(MinMaxStats::from_values([f32::NAN]).is_none());
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let state = TrainerState::new(Thresholds { image: 0.5, pixel: 0.5 }, false);
        assert!(state.check_cancelled().is_ok());
        state.cancel_flag().store(true, Ordering::Relaxed);
        assert!(matches!(state.check_cancelled(), Err(MlError::Cancelled)));
    }

    #[test]
    fn test_state_serializes_without_flag() {
        let mut state = TrainerState::new(Thresholds { image: 0.3, pixel: 0.4 }, true);
        state.metrics.insert("image_AUROC".into(), 1.0);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["metrics"]["image_AUROC"], 1.0);
        assert!(json.get("cancel").is_none());
        let back: TrainerState = serde_json::from_value(json).unwrap();
        assert_eq!(back.thresholds, state.thresholds);
    }
}
