//! Scoring: reconstruction-error distributions, anomaly thresholds, and
//! distributional distance.
//!
//! Distribution summaries use Welford's online algorithm so a full pass
//! over a dataset needs constant memory beyond the retained sample. The
//! distance between two error distributions is the two-sample
//! Kolmogorov-Smirnov statistic over their retained samples, a number in
//! `[0, 1]` where 0 means indistinguishable.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ingest::DecodedItem;
use crate::model::ReconstructionModel;

/// Summary of a set of per-item reconstruction errors.
///
/// Holds running moments plus a capped sample of raw errors for the KS
/// distance. Saved inside the baseline archive as the reference
/// statistics; reloading reproduces it exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDistribution {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    sample: Vec<f32>,
    sample_cap: usize,
}

impl ErrorDistribution {
    pub fn new(sample_cap: usize) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            sample: Vec::new(),
            sample_cap,
        }
    }

    /// Record one error value (Welford update).
    pub fn record(&mut self, value: f32) {
        let v = value as f64;
        self.count += 1;
        let delta = v - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (v - self.mean);
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        if self.sample.len() < self.sample_cap {
            self.sample.push(value);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Anomaly threshold: `mean + k * stddev`.
    pub fn threshold(&self, k: f32) -> f32 {
        (self.mean + k as f64 * self.std_dev()) as f32
    }

    /// The retained raw errors, in recording order.
    pub fn sample(&self) -> &[f32] {
        &self.sample
    }
}

/// Two-sample Kolmogorov-Smirnov statistic: the largest gap between the
/// empirical CDFs of `a` and `b`. Returns 0.0 when either sample is empty.
pub fn ks_statistic(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut sa = a.to_vec();
    sa.sort_by(|x, y| x.total_cmp(y));
    let mut sb = b.to_vec();
    sb.sort_by(|x, y| x.total_cmp(y));

    let n = sa.len() as f64;
    let m = sb.len() as f64;
    let (mut i, mut j) = (0usize, 0usize);
    let mut d = 0.0f64;

    while i < sa.len() && j < sb.len() {
        let x = sa[i].min(sb[j]);
        while i < sa.len() && sa[i] <= x {
            i += 1;
        }
        while j < sb.len() && sb[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / n - j as f64 / m).abs());
    }

    d
}

/// Per-item verdict, appended to the result sink in batch order.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Item identifier: path relative to the source root.
    pub image: String,
    pub path: PathBuf,
    pub score: f32,
    pub anomalous: bool,
    pub batch: usize,
}

/// One scored batch: per-item verdicts plus the batch error distribution.
#[derive(Debug)]
pub struct ScoredBatch {
    pub seq: usize,
    pub verdicts: Vec<Verdict>,
    pub distribution: ErrorDistribution,
}

/// Score a decoded batch against a threshold derived from the baseline.
pub fn score_batch(
    model: &dyn ReconstructionModel,
    items: &[DecodedItem],
    seq: usize,
    threshold: f32,
    sample_cap: usize,
) -> ScoredBatch {
    let mut distribution = ErrorDistribution::new(sample_cap);
    let mut verdicts = Vec::with_capacity(items.len());

    for item in items {
        let score = model.reconstruction_error(item.pixels.view());
        distribution.record(score);
        verdicts.push(Verdict {
            image: item.record.relative.clone(),
            path: item.record.path.clone(),
            score,
            anomalous: score > threshold,
            batch: seq,
        });
    }

    ScoredBatch {
        seq,
        verdicts,
        distribution,
    }
}

/// Euclidean norm of an item's latent representation, written to the
/// per-batch cluster diagnostics.
pub fn latent_norm(model: &dyn ReconstructionModel, pixels: ArrayView1<'_, f32>) -> f32 {
    model.encode(pixels).mapv(|v| v * v).sum().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_naive() {
        let values = [0.1f32, 0.4, 0.35, 0.8, 0.05, 0.6];
        let mut dist = ErrorDistribution::new(100);
        for v in values {
            dist.record(v);
        }

        let n = values.len() as f64;
        let mean: f64 = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var: f64 = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);

        assert!((dist.mean() - mean).abs() < 1e-12);
        assert!((dist.std_dev() - var.sqrt()).abs() < 1e-12);
        assert_eq!(dist.count(), 6);
    }

    #[test]
    fn threshold_is_mean_plus_k_sigma() {
        let mut dist = ErrorDistribution::new(100);
        for v in [1.0f32, 2.0, 3.0] {
            dist.record(v);
        }
        let expected = (dist.mean() + 2.0 * dist.std_dev()) as f32;
        assert!((dist.threshold(2.0) - expected).abs() < 1e-6);
    }

    #[test]
    fn sample_respects_cap() {
        let mut dist = ErrorDistribution::new(3);
        for i in 0..10 {
            dist.record(i as f32);
        }
        assert_eq!(dist.sample().len(), 3);
        assert_eq!(dist.count(), 10);
    }

    #[test]
    fn ks_identical_samples_is_zero() {
        let a = [0.1f32, 0.2, 0.3, 0.4];
        assert_eq!(ks_statistic(&a, &a), 0.0);
    }

    #[test]
    fn ks_disjoint_samples_is_one() {
        let a = [0.0f32, 0.1, 0.2];
        let b = [5.0f32, 5.1, 5.2];
        assert_eq!(ks_statistic(&a, &b), 1.0);
    }

    #[test]
    fn ks_is_symmetric_and_bounded() {
        let a = [0.1f32, 0.5, 0.9, 0.3];
        let b = [0.2f32, 0.4, 0.6];
        let d1 = ks_statistic(&a, &b);
        let d2 = ks_statistic(&b, &a);
        assert!((d1 - d2).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&d1));
    }

    #[test]
    fn ks_empty_sample_is_zero() {
        let a = [0.1f32];
        assert_eq!(ks_statistic(&a, &[]), 0.0);
        assert_eq!(ks_statistic(&[], &a), 0.0);
    }
}
