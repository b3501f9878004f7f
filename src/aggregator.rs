// --- Median-of-Means Gradient Filter ---

use crate::error::{FedError, Result};
use crate::params::{GradientVector, ParamVec};
use crate::simd::dot_product;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterRule {
    R1,
    R2,
    Degenerate,
    PassThrough,
}

/// Symmetric W x W matrix of Euclidean distances with an exactly zero diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    n: usize,
    data: Vec<f64>,
}

impl DistanceMatrix {
    /// Uses `|x|^2 + |y|^2 - 2 x.y`, clamped at zero before the square root
    /// so rounding never yields NaN.
    pub fn compute(rows: &[Vec<f64>]) -> Self {
        let n = rows.len();
        let sq: Vec<f64> = rows.iter().map(|r| dot_product(r, r)).collect();
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d2 = sq[i] + sq[j] - 2.0 * dot_product(&rows[i], &rows[j]);
                let d = d2.max(0.0).sqrt();
                data[i * n + j] = d;
                data[j * n + i] = d;
            }
        }
        DistanceMatrix { n, data }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub good_set: Vec<bool>,
    /// Mean of the good gradients; `None` when the good set is empty.
    pub control_variate: Option<ParamVec>,
    pub distances: DistanceMatrix,
    pub threshold: f64,
    pub rule: FilterRule,
}

impl Aggregation {
    pub fn good_count(&self) -> usize {
        self.good_set.iter().filter(|&&g| g).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustAggregator {
    sigma: f64,
    delta: f64,
    alpha: f64,
}

impl RobustAggregator {
    pub fn new(sigma: f64, delta: f64, alpha: f64) -> Result<Self> {
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(FedError::config("sigma", format!("must be positive, got {}", sigma)));
        }
        if !(delta > 0.0 && delta < 1.0) {
            return Err(FedError::config("delta", format!("must lie in (0, 1), got {}", delta)));
        }
        if !(alpha >= 0.0 && alpha < 1.0) {
            return Err(FedError::config("alpha", format!("must lie in [0, 1), got {}", alpha)));
        }
        Ok(RobustAggregator { sigma, delta, alpha })
    }

    /// `2 sigma sqrt(V / B)` with `V = 2 ln(2W / delta)`.
    pub fn threshold(&self, num_workers: usize, batch_size: usize) -> Result<f64> {
        if batch_size == 0 {
            return Err(FedError::InvalidBatchSize);
        }
        let v = 2.0 * (2.0 * num_workers as f64 / self.delta).ln();
        Ok(2.0 * self.sigma * (v / batch_size as f64).sqrt())
    }

    pub fn aggregate(&self, gradients: &[GradientVector], batch_size: usize) -> Result<Aggregation> {
        let threshold = self.threshold(gradients.len(), batch_size)?;
        let (rows, distances) = stack(gradients)?;
        let w = gradients.len();

        let mut rule = FilterRule::R1;
        let mut good_set = filter(&rows, &distances, threshold);
        let good = good_set.iter().filter(|&&g| g).count();

        if good == 0 || (good as f64) < (1.0 - self.alpha) * w as f64 {
            let radius = 2.0 * self.sigma;
            debug!(
                "[Filter] R1 kept {}/{} at threshold {:.4}, retrying at 2 sigma = {:.4}",
                good, w, threshold, radius
            );
            good_set = filter(&rows, &distances, radius);
            rule = if good_set.iter().any(|&g| g) {
                FilterRule::R2
            } else {
                warn!("[Filter] no MoM candidates within 2 sigma; round is degenerate");
                FilterRule::Degenerate
            };
        }

        let control_variate = mean_of(gradients, &good_set)?;
        Ok(Aggregation {
            good_set,
            control_variate,
            distances,
            threshold,
            rule,
        })
    }
}

pub fn aggregate_plain(gradients: &[GradientVector]) -> Result<Aggregation> {
    let (_, distances) = stack(gradients)?;
    let good_set = vec![true; gradients.len()];
    let control_variate = mean_of(gradients, &good_set)?;
    Ok(Aggregation {
        good_set,
        control_variate,
        distances,
        threshold: f64::INFINITY,
        rule: FilterRule::PassThrough,
    })
}

fn stack(gradients: &[GradientVector]) -> Result<(Vec<Vec<f64>>, DistanceMatrix)> {
    let first = gradients.first().ok_or(FedError::EmptyFederation)?;
    for g in &gradients[1..] {
        first.check_compatible(g)?;
    }
    let rows: Vec<Vec<f64>> = gradients.iter().map(|g| g.flatten()).collect();
    let distances = DistanceMatrix::compute(&rows);
    Ok((rows, distances))
}

/// Good set at `radius`: MoM candidates are the workers within `radius` of
/// strictly more than half the federation; the centre is the candidate
/// closest to the candidates' mean, and the good set is everyone within
/// `radius` of that centre.
fn filter(rows: &[Vec<f64>], distances: &DistanceMatrix, radius: f64) -> Vec<bool> {
    let w = rows.len();
    let candidates: Vec<usize> = (0..w)
        .filter(|&i| {
            let close = distances.row(i).iter().filter(|&&d| d <= radius).count();
            close as f64 > w as f64 / 2.0
        })
        .collect();
    if candidates.is_empty() {
        return vec![false; w];
    }

    let dim = rows[0].len();
    let mut centre = vec![0.0; dim];
    for &i in &candidates {
        for (c, v) in centre.iter_mut().zip(rows[i].iter()) {
            *c += v;
        }
    }
    let inv = 1.0 / candidates.len() as f64;
    centre.iter_mut().for_each(|c| *c *= inv);

    let mut med = candidates[0];
    let mut best = f64::INFINITY;
    for &i in &candidates {
        let d: f64 = rows[i].iter().zip(centre.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
        if d < best {
            best = d;
            med = i;
        }
    }

    distances.row(med).iter().map(|&d| d <= radius).collect()
}

fn mean_of(gradients: &[GradientVector], good_set: &[bool]) -> Result<Option<ParamVec>> {
    if !good_set.iter().any(|&g| g) {
        return Ok(None);
    }
    let selected = gradients.iter().zip(good_set).filter(|(_, &g)| g).map(|(p, _)| p);
    ParamVec::mean(selected).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grad(v: &[f64]) -> ParamVec {
        // Two tensors so reshaping is exercised.
        let split = v.len() / 2;
        ParamVec::new(
            vec![vec![split], vec![v.len() - split]],
            vec![v[..split].to_vec(), v[split..].to_vec()],
        )
        .unwrap()
    }

    fn agg() -> RobustAggregator {
        RobustAggregator::new(1.0, 0.1, 0.4).unwrap()
    }

    #[test]
    fn distance_matrix_is_symmetric_with_zero_diagonal() {
        let rows = vec![vec![1.0, 2.0, 3.0], vec![-1.0, 0.5, 2.0], vec![1e8, 1e8, 1e8], vec![1.0, 2.0, 3.0]];
        let d = DistanceMatrix::compute(&rows);
        for i in 0..4 {
            assert_eq!(d.get(i, i), 0.0);
            for j in 0..4 {
                assert_eq!(d.get(i, j), d.get(j, i));
                assert!(d.get(i, j) >= 0.0 && !d.get(i, j).is_nan());
            }
        }
        assert_eq!(d.get(0, 3), 0.0);
        let expected = (4.0f64 + 2.25 + 1.0).sqrt();
        assert!((d.get(0, 1) - expected).abs() < 1e-9);
    }

    #[test]
    fn threshold_formula() {
        let t = agg().threshold(5, 10).unwrap();
        let v = 2.0 * (2.0 * 5.0 / 0.1f64).ln();
        assert!((t - 2.0 * (v / 10.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn all_honest_are_kept() {
        let grads: Vec<_> = (0..5).map(|i| grad(&[1.0 + 0.01 * i as f64, 2.0, -1.0, 0.5])).collect();
        let out = agg().aggregate(&grads, 10).unwrap();
        assert_eq!(out.good_set, vec![true; 5]);
        assert_eq!(out.rule, FilterRule::R1);
        let mean = ParamVec::mean(&grads).unwrap();
        let mu = out.control_variate.unwrap();
        assert_eq!(mu.shapes(), grads[0].shapes());
        assert!(mu.distance(&mean).unwrap() < 1e-12);
    }

    #[test]
    fn far_minority_is_excluded() {
        let mut grads: Vec<_> = (0..3).map(|i| grad(&[0.1 * i as f64, 0.0, 0.0, 0.0])).collect();
        grads.push(grad(&[100.0, 0.0, 0.0, 0.0]));
        grads.push(grad(&[0.0, -100.0, 0.0, 0.0]));
        let out = agg().aggregate(&grads, 10).unwrap();
        assert_eq!(out.good_set, vec![true, true, true, false, false]);
        let mu = out.control_variate.unwrap();
        assert!((mu.flatten()[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn tight_threshold_falls_back_to_two_sigma() {
        // Spacing 0.1 is far above the R1 threshold at this batch size but
        // well inside 2 sigma.
        let grads: Vec<_> = (0..5).map(|i| grad(&[0.1 * i as f64, 0.0, 0.0, 0.0])).collect();
        let a = agg();
        assert!(a.threshold(5, 1_000_000).unwrap() < 0.1);
        let out = a.aggregate(&grads, 1_000_000).unwrap();
        assert_eq!(out.rule, FilterRule::R2);
        assert!(out.good_count() > 0);
    }

    #[test]
    fn scattered_gradients_are_degenerate() {
        let grads: Vec<_> = (0..5).map(|i| grad(&[10.0 * i as f64, 0.0, 0.0, 0.0])).collect();
        let out = agg().aggregate(&grads, 1_000_000).unwrap();
        assert_eq!(out.rule, FilterRule::Degenerate);
        assert_eq!(out.good_set, vec![false; 5]);
        assert!(out.control_variate.is_none());
    }

    #[test]
    fn single_worker_is_trivially_good() {
        let out = agg().aggregate(&[grad(&[3.0, 4.0])], 1).unwrap();
        assert_eq!(out.good_set, vec![true]);
        assert_eq!(out.control_variate.unwrap().flatten(), vec![3.0, 4.0]);
    }

    #[test]
    fn zero_batch_is_rejected() {
        let grads = vec![grad(&[1.0, 1.0]), grad(&[1.0, 1.0])];
        assert!(matches!(agg().aggregate(&grads, 0), Err(FedError::InvalidBatchSize)));
    }

    #[test]
    fn bad_hyperparameters_are_rejected() {
        assert!(RobustAggregator::new(0.0, 0.1, 0.2).is_err());
        assert!(RobustAggregator::new(1.0, 1.0, 0.2).is_err());
        assert!(RobustAggregator::new(1.0, 0.1, 1.0).is_err());
        assert!(RobustAggregator::new(1.0, f64::NAN, 0.2).is_err());
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let a = grad(&[1.0, 2.0, 3.0, 4.0]);
        let b = ParamVec::new(vec![vec![4]], vec![vec![1.0, 2.0, 3.0, 4.0]]).unwrap();
        assert!(agg().aggregate(&[a, b], 5).is_err());
    }

    #[test]
    fn plain_mode_trusts_everyone() {
        let grads = vec![grad(&[0.0, 0.0]), grad(&[100.0, 0.0])];
        let out = aggregate_plain(&grads).unwrap();
        assert_eq!(out.rule, FilterRule::PassThrough);
        assert_eq!(out.good_set, vec![true, true]);
        assert_eq!(out.control_variate.unwrap().flatten(), vec![50.0, 0.0]);
        assert!((out.distances.get(0, 1) - 100.0).abs() < 1e-9);
    }
}
