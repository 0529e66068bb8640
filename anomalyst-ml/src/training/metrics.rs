//! Image- and pixel-level anomaly metrics and adaptive thresholding.

use std::collections::BTreeMap;
use std::str::FromStr;

use anomalyst_core::ConfigError;
use anomalyst_vision::AnomalyMap;
use image::GrayImage;
use tracing::{debug, warn};

/// A metric that can be requested by name in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Auroc,
    F1Score,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Auroc => "AUROC",
            MetricKind::F1Score => "F1Score",
        }
    }
}

impl FromStr for MetricKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUROC" => Ok(MetricKind::Auroc),
            "F1Score" => Ok(MetricKind::F1Score),
            other => Err(ConfigError::UnknownMetric {
                name: other.to_string(),
            }),
        }
    }
}

/// Area under the ROC curve via the rank-sum statistic, with tied scores
/// sharing their average rank. `None` unless both classes are present.
pub fn auroc(preds: &[f32], targets: &[bool]) -> Option<f64> {
    let positives = targets.iter().filter(|t| **t).count();
    let negatives = targets.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..preds.len()).collect();
    order.sort_by(|&a, &b| preds[a].total_cmp(&preds[b]));

    let mut rank_sum = 0.0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && preds[order[j + 1]] == preds[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += rank * order[i..=j].iter().filter(|&&k| targets[k]).count() as f64;
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// F1 score of `preds >= threshold` against `targets`.
pub fn f1_score(preds: &[f32], targets: &[bool], threshold: f32) -> f64 {
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
    for (&p, &t) in preds.iter().zip(targets) {
        match (p >= threshold, t) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        return 0.0;
    }
    2.0 * tp as f64 / denom as f64
}

/// The score threshold that maximises F1. Candidates are the observed scores;
/// on ties the higher threshold wins. `None` without anomalous targets.
pub fn adaptive_threshold(preds: &[f32], targets: &[bool]) -> Option<f32> {
    let positives = targets.iter().filter(|t| **t).count();
    if positives == 0 || preds.is_empty() {
        return None;
    }

    let mut order: Vec<usize> = (0..preds.len()).collect();
    order.sort_by(|&a, &b| preds[b].total_cmp(&preds[a]));

    let (mut tp, mut fp) = (0usize, 0usize);
    let mut best: Option<(f64, f32)> = None;
    let mut i = 0;
    while i < order.len() {
        let score = preds[order[i]];
        while i < order.len() && preds[order[i]] == score {
            if targets[order[i]] {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let f1 = 2.0 * tp as f64 / (2 * tp + fp + (positives - tp)) as f64;
        if best.is_none_or(|(best_f1, _)| f1 > best_f1) {
            best = Some((f1, score));
        }
    }
    best.map(|(_, threshold)| threshold)
}

/// Scores kept exactly before a collection folds them into a histogram.
pub const EXACT_SCORE_LIMIT: usize = 1 << 22;

/// Bin count of the histogram a collection folds into.
pub const HISTOGRAM_BINS: usize = 1 << 14;

/// Fixed-width histogram of scores split by target class.
///
/// Each bin is one tie group: AUROC gives pairs in the same bin half credit,
/// and a bin counts as predicted anomalous when its lower edge reaches the
/// threshold. Scores outside the initial range land in the edge bins.
#[derive(Debug, Clone)]
pub struct ScoreHistogram {
    min: f32,
    width: f32,
    positives: Vec<u64>,
    negatives: Vec<u64>,
}

impl ScoreHistogram {
    /// Histogram over the finite range of `preds`, filled with every pair.
    pub fn from_scores(preds: &[f32], targets: &[bool], bins: usize) -> Self {
        let bins = bins.max(1);
        let (min, max) = preds
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<(f32, f32)>, v| {
                Some(acc.map_or((v, v), |(lo, hi)| (lo.min(v), hi.max(v))))
            })
            .unwrap_or((0.0, 1.0));
        let width = if max > min {
            (max - min) / bins as f32
        } else {
            1.0
        };
        let mut histogram = Self {
            min,
            width,
            positives: vec![0; bins],
            negatives: vec![0; bins],
        };
        for (&score, &target) in preds.iter().zip(targets) {
            histogram.add(score, target);
        }
        histogram
    }

    fn bin(&self, score: f32) -> usize {
        let last = self.positives.len() - 1;
        let index = ((score - self.min) / self.width).floor();
        if index.is_nan() {
            last
        } else {
            (index.max(0.0) as usize).min(last)
        }
    }

    fn edge(&self, bin: usize) -> f32 {
        self.min + bin as f32 * self.width
    }

    pub fn add(&mut self, score: f32, target: bool) {
        let bin = self.bin(score);
        if target {
            self.positives[bin] += 1;
        } else {
            self.negatives[bin] += 1;
        }
    }

    pub fn len(&self) -> usize {
        (self.positives.iter().sum::<u64>() + self.negatives.iter().sum::<u64>()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn auroc(&self) -> Option<f64> {
        let p: u64 = self.positives.iter().sum();
        let n: u64 = self.negatives.iter().sum();
        if p == 0 || n == 0 {
            return None;
        }
        let mut below = 0u64;
        let mut area = 0.0f64;
        for (&pos, &neg) in self.positives.iter().zip(&self.negatives) {
            area += pos as f64 * (below as f64 + neg as f64 / 2.0);
            below += neg;
        }
        Some(area / (p as f64 * n as f64))
    }

    pub fn f1_score(&self, threshold: f32) -> f64 {
        let (mut tp, mut fp, mut fn_) = (0u64, 0u64, 0u64);
        for bin in 0..self.positives.len() {
            if self.edge(bin) >= threshold {
                tp += self.positives[bin];
                fp += self.negatives[bin];
            } else {
                fn_ += self.positives[bin];
            }
        }
        let denom = 2 * tp + fp + fn_;
        if denom == 0 {
            return 0.0;
        }
        2.0 * tp as f64 / denom as f64
    }

    /// Lower bin edge that maximises F1; the higher edge wins ties.
    pub fn adaptive_threshold(&self) -> Option<f32> {
        let positives: u64 = self.positives.iter().sum();
        if positives == 0 {
            return None;
        }
        let (mut tp, mut fp) = (0u64, 0u64);
        let mut best: Option<(f64, f32)> = None;
        for bin in (0..self.positives.len()).rev() {
            if self.positives[bin] == 0 && self.negatives[bin] == 0 {
                continue;
            }
            tp += self.positives[bin];
            fp += self.negatives[bin];
            let f1 = 2.0 * tp as f64 / (2 * tp + fp + (positives - tp)) as f64;
            if best.is_none_or(|(best_f1, _)| f1 > best_f1) {
                best = Some((f1, self.edge(bin)));
            }
        }
        best.map(|(_, threshold)| threshold)
    }
}

#[derive(Debug, Clone)]
enum Scores {
    Exact { preds: Vec<f32>, targets: Vec<bool> },
    Binned(ScoreHistogram),
}

/// Accumulates predictions over an epoch and computes the configured metrics
/// under a common name prefix (`image_AUROC`, `pixel_F1Score`, ...).
///
/// Scores are kept exactly up to a limit, then folded into a [`ScoreHistogram`]
/// so pixel-level accumulation stays bounded in memory.
#[derive(Debug, Clone)]
pub struct MetricCollection {
    prefix: String,
    kinds: Vec<MetricKind>,
    scores: Scores,
    exact_limit: usize,
}

impl MetricCollection {
    pub fn new(prefix: &str, names: &[String]) -> Result<Self, ConfigError> {
        let kinds = names
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<MetricKind>, _>>()?;
        Ok(Self {
            prefix: prefix.to_string(),
            kinds,
            scores: Scores::Exact {
                preds: Vec::new(),
                targets: Vec::new(),
            },
            exact_limit: EXACT_SCORE_LIMIT,
        })
    }

    /// Fold into a histogram once more than `limit` scores have been seen.
    pub fn with_exact_limit(mut self, limit: usize) -> Self {
        self.exact_limit = limit;
        self
    }

    pub fn is_binned(&self) -> bool {
        matches!(self.scores, Scores::Binned(_))
    }

    fn extend(&mut self, pairs: impl IntoIterator<Item = (f32, bool)>) {
        match &mut self.scores {
            Scores::Exact { preds, targets } => {
                for (score, target) in pairs {
                    preds.push(score);
                    targets.push(target);
                }
                if preds.len() > self.exact_limit {
                    let histogram = ScoreHistogram::from_scores(preds, targets, HISTOGRAM_BINS);
                    debug!(
                        metrics = %self.prefix,
                        scores = histogram.len(),
                        bins = HISTOGRAM_BINS,
                        "Folding scores into a histogram"
                    );
                    self.scores = Scores::Binned(histogram);
                }
            }
            Scores::Binned(histogram) => {
                for (score, target) in pairs {
                    histogram.add(score, target);
                }
            }
        }
    }

    pub fn update(&mut self, preds: &[f32], targets: &[bool]) {
        self.extend(preds.iter().copied().zip(targets.iter().copied()));
    }

    /// Add every pixel of `map` with the matching (0/1 or 0/255) mask pixel as target.
    pub fn update_pixels(&mut self, map: &AnomalyMap, mask: &GrayImage) {
        if map.dimensions() != mask.dimensions() {
            warn!(
                map = ?map.dimensions(),
                mask = ?mask.dimensions(),
                "Skipping pixel metrics for mismatched mask"
            );
            return;
        }
        self.extend(
            map.pixels()
                .map(|p| p.0[0])
                .zip(mask.pixels().map(|p| p.0[0] > 0)),
        );
    }

    pub fn len(&self) -> usize {
        match &self.scores {
            Scores::Exact { preds, .. } => preds.len(),
            Scores::Binned(histogram) => histogram.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn adaptive_threshold(&self) -> Option<f32> {
        match &self.scores {
            Scores::Exact { preds, targets } => adaptive_threshold(preds, targets),
            Scores::Binned(histogram) => histogram.adaptive_threshold(),
        }
    }

    fn value(&self, kind: MetricKind, threshold: f32) -> Option<f64> {
        match (&self.scores, kind) {
            (Scores::Exact { preds, targets }, MetricKind::Auroc) => auroc(preds, targets),
            (Scores::Exact { preds, targets }, MetricKind::F1Score) => {
                Some(f1_score(preds, targets, threshold))
            }
            (Scores::Binned(histogram), MetricKind::Auroc) => histogram.auroc(),
            (Scores::Binned(histogram), MetricKind::F1Score) => {
                Some(histogram.f1_score(threshold))
            }
        }
    }

    /// Every configured metric that is defined for the accumulated data.
    pub fn compute(&self, threshold: f32) -> BTreeMap<String, f64> {
        let mut values = BTreeMap::new();
        if self.is_empty() {
            return values;
        }
        for &kind in &self.kinds {
            let key = format!("{}_{}", self.prefix, kind.name());
            match self.value(kind, threshold) {
                Some(v) => {
                    values.insert(key, v);
                }
                None => warn!(metric = %key, "Metric undefined: only one class present"),
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_auroc_perfect_and_inverted() {
        let preds = [0.1, 0.2, 0.8, 0.9];
        let targets = [false, false, true, true];
        assert_eq!(auroc(&preds, &targets), Some(1.0));
        let inverted = [true, true, false, false];
        assert_eq!(auroc(&preds, &inverted), Some(0.0));
    }

    #[test]
    fn test_auroc_ties_count_half() {
        assert_eq!(auroc(&[0.5, 0.5], &[false, true]), Some(0.5));
        assert_eq!(auroc(&[0.5, 0.5], &[true, true]), None);
    }

    #[test]
    fn test_f1_score() {
        let preds = [0.1, 0.6, 0.7, 0.2];
        let targets = [false, true, false, true];
        // tp = 1, fp = 1, fn = 1
        assert!((f1_score(&preds, &targets, 0.5) - 0.5).abs() < 1e-12);
        assert_eq!(f1_score(&[0.1], &[false], 0.5), 0.0);
    }

    #[test]
    fn test_adaptive_threshold_separates_classes() {
        let preds = [0.1, 0.3, 0.7, 0.9];
        let targets = [false, false, true, true];
        assert_eq!(adaptive_threshold(&preds, &targets), Some(0.7));
        assert_eq!(adaptive_threshold(&preds, &[false; 4]), None);
    }

    #[test]
    fn test_collection_prefixes_and_rejects_unknown() {
        let names = vec!["F1Score".to_string(), "AUROC".to_string()];
        let mut image = MetricCollection::new("image", &names).unwrap();
        image.update(&[0.2, 0.8], &[false, true]);
        let values = image.compute(0.5);
        assert_eq!(
            values.keys().cloned().collect::<Vec<_>>(),
            vec!["image_AUROC".to_string(), "image_F1Score".to_string()]
        );
        assert_eq!(values["image_F1Score"], 1.0);

        let err = MetricCollection::new("pixel", &["PRO".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMetric { .. }));
    }

    #[test]
    fn test_pixel_update_reads_masks() {
        let mut pixel = MetricCollection::new("pixel", &["AUROC".to_string()]).unwrap();
        let map = AnomalyMap::from_fn(4, 1, |x, _| Luma([x as f32]));
        let mask = GrayImage::from_fn(4, 1, |x, _| Luma([u8::from(x >= 2)]));
        pixel.update_pixels(&map, &mask);
        assert_eq!(pixel.len(), 4);
        assert_eq!(pixel.compute(0.5)["pixel_AUROC"], 1.0);
    }

    #[test]
    fn test_histogram_matches_exact_on_separable_scores() {
        let preds = [0.05, 0.2, 0.3, 0.6, 0.8, 0.95];
        let targets = [false, false, false, true, true, true];
        let histogram = ScoreHistogram::from_scores(&preds, &targets, 64);
        assert_eq!(histogram.len(), 6);
        assert_eq!(histogram.auroc(), Some(1.0));
        let threshold = histogram.adaptive_threshold().unwrap();
        assert!(threshold > 0.3 && threshold <= 0.6);
        assert_eq!(histogram.f1_score(threshold), 1.0);
    }

    #[test]
    fn test_histogram_same_bin_is_a_tie() {
        let histogram = ScoreHistogram::from_scores(&[0.0, 0.5, 0.5001, 1.0], &[false, false, true, true], 4);
        // 0.5 and 0.5001 share a bin, so that pair counts half.
        assert_eq!(histogram.auroc(), Some(0.875));
        assert!(ScoreHistogram::from_scores(&[0.4], &[true], 8).auroc().is_none());
    }

    #[test]
    fn test_collection_folds_pixels_past_limit() {
        let names = vec!["F1Score".to_string(), "AUROC".to_string()];
        let mut pixel = MetricCollection::new("pixel", &names)
            .unwrap()
            .with_exact_limit(16);
        let map = AnomalyMap::from_fn(8, 8, |x, _| Luma([x as f32 / 7.0]));
        let mask = GrayImage::from_fn(8, 8, |x, _| Luma([if x >= 4 { 255 } else { 0 }]));
        pixel.update_pixels(&map, &mask);
        assert!(pixel.is_binned());
        pixel.update_pixels(&map, &mask);
        assert_eq!(pixel.len(), 128);

        let threshold = pixel.adaptive_threshold().unwrap();
        assert!(threshold > 3.0 / 7.0 && threshold <= 4.0 / 7.0 + 1e-6);
        let values = pixel.compute(threshold);
        assert_eq!(values["pixel_AUROC"], 1.0);
        assert_eq!(values["pixel_F1Score"], 1.0);
    }

    proptest! {
        #[test]
        fn prop_auroc_in_unit_interval(
            data in prop::collection::vec((0.0f32..1.0, any::<bool>()), 2..64)
        ) {
            let (preds, targets): (Vec<f32>, Vec<bool>) = data.into_iter().unzip();
            if let Some(value) = auroc(&preds, &targets) {
                prop_assert!((0.0..=1.0).contains(&value));
            }
        }

        #[test]
        fn prop_adaptive_threshold_is_optimal(
            data in prop::collection::vec((0.0f32..1.0, any::<bool>()), 2..32)
        ) {
            let (preds, targets): (Vec<f32>, Vec<bool>) = data.into_iter().unzip();
            if let Some(threshold) = adaptive_threshold(&preds, &targets) {
                let best = f1_score(&preds, &targets, threshold);
                for &candidate in &preds {
                    prop_assert!(f1_score(&preds, &targets, candidate) <= best + 1e-12);
                }
            }
        }
    }
}
