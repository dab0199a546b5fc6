//! Resampling strategies for the particle population.
//!
//! Every strategy maps a weight distribution to a list of `num_samples` indices (with repetition). Slot `k` of
//! the output names the input particle that should be copied into slot `k`. The strategies only differ in how
//! they place draw points on the weight CDF:
//!
//! - **Systematic**: one offset `u0 ∈ [0, 1/N)`, draw points `u0 + k/N`.
//! - **Stratified**: one independent offset per stratum, `(k + u_k)/N`.
//! - **Residual**: `floor(N w_i)` guaranteed copies, the remaining slots drawn systematically from the
//!   residual weights `N w_i - floor(N w_i)`.
//! - **Naive**: `N` independent categorical draws (multinomial resampling).
//!
//! All of them are unbiased: the expected number of copies of particle `i` is `N w_i`. Weights are expected to
//! be normalized, but the functions scale draw points by the actual weight sum and fall back to uniform
//! weights if the sum is not positive, so they always return exactly `num_samples` valid indices.
use log::trace;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    #[default]
    Residual,
    Systematic,
    Stratified,
    Naive,
}

impl ResamplingStrategy {
    /// Draw `weights.len()` indices from the weight distribution.
    pub fn resample<R: Rng + ?Sized>(&self, weights: &[f64], rng: &mut R) -> Vec<usize> {
        let n = weights.len();
        let indices = match self {
            ResamplingStrategy::Residual => residual_resample(weights, n, rng),
            ResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ResamplingStrategy::Naive => naive_resample(weights, n, rng),
        };
        trace!("{self:?} resampling selected {indices:?}");
        indices
    }
}

/// Cumulative weights with a lookup from a draw point to the particle it falls on.
struct WeightCdf {
    cumulative: Vec<f64>,
    last_positive: usize,
}
impl WeightCdf {
    fn new(weights: &[f64]) -> Self {
        let usable = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let total: f64 = weights.iter().map(|&w| usable(w)).sum();
        let uniform = !(total > 0.0 && total.is_finite());
        let mut cumulative = Vec::with_capacity(weights.len());
        let mut running = 0.0;
        let mut last_positive = weights.len().saturating_sub(1);
        for (i, &w) in weights.iter().enumerate() {
            let w = if uniform { 1.0 } else { usable(w) };
            running += w;
            cumulative.push(running);
            if w > 0.0 {
                last_positive = i;
            }
        }
        WeightCdf {
            cumulative,
            last_positive,
        }
    }
    fn total(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }
    /// Index of the first particle whose cumulative weight exceeds `u`.
    fn select(&self, u: f64) -> usize {
        let i = self.cumulative.partition_point(|&c| c <= u);
        i.min(self.last_positive)
    }
}

/// Systematic resampling: a single random offset and evenly spaced draw points.
pub fn systematic_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    if weights.is_empty() || num_samples == 0 {
        return Vec::new();
    }
    let cdf = WeightCdf::new(weights);
    let step = cdf.total() / num_samples as f64;
    let offset = rng.random::<f64>() * step;
    (0..num_samples)
        .map(|k| cdf.select(offset + k as f64 * step))
        .collect()
}

/// Stratified resampling: one independent draw inside each of `num_samples` equal strata.
pub fn stratified_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    if weights.is_empty() || num_samples == 0 {
        return Vec::new();
    }
    let cdf = WeightCdf::new(weights);
    let step = cdf.total() / num_samples as f64;
    (0..num_samples)
        .map(|k| cdf.select((k as f64 + rng.random::<f64>()) * step))
        .collect()
}

/// Naive (multinomial) resampling: independent categorical draws.
pub fn naive_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    if weights.is_empty() || num_samples == 0 {
        return Vec::new();
    }
    let cdf = WeightCdf::new(weights);
    let total = cdf.total();
    (0..num_samples)
        .map(|_| cdf.select(rng.random::<f64>() * total))
        .collect()
}

/// Residual resampling: deterministic `floor(N w_i)` copies, remainder drawn systematically from the
/// residual weights.
pub fn residual_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    if weights.is_empty() || num_samples == 0 {
        return Vec::new();
    }
    let cdf = WeightCdf::new(weights);
    let total = cdf.total();
    let mut previous = 0.0;
    let normalized: Vec<f64> = cdf
        .cumulative
        .iter()
        .map(|&c| {
            let w = (c - previous) / total;
            previous = c;
            w
        })
        .collect();

    let mut indices = Vec::with_capacity(num_samples);
    let mut residual = vec![0.0; normalized.len()];
    for (i, &w) in normalized.iter().enumerate() {
        let expected = w * num_samples as f64;
        let copies = (expected.floor() as usize).min(num_samples - indices.len());
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = expected - expected.floor();
    }

    let remaining = num_samples - indices.len();
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const STRATEGIES: [ResamplingStrategy; 4] = [
        ResamplingStrategy::Residual,
        ResamplingStrategy::Systematic,
        ResamplingStrategy::Stratified,
        ResamplingStrategy::Naive,
    ];

    fn counts(indices: &[usize], n: usize) -> Vec<usize> {
        let mut c = vec![0; n];
        for &i in indices {
            c[i] += 1;
        }
        c
    }

    #[test]
    fn every_strategy_returns_n_valid_indices() {
        let mut rng = StdRng::seed_from_u64(1);
        let weights = [0.1, 0.0, 0.4, 0.2, 0.05, 0.25];
        for strategy in STRATEGIES {
            for _ in 0..50 {
                let indices = strategy.resample(&weights, &mut rng);
                assert_eq!(indices.len(), weights.len());
                assert!(indices.iter().all(|&i| i < weights.len()));
                assert!(
                    !indices.contains(&1),
                    "{strategy:?} selected a zero-weight particle"
                );
            }
        }
    }

    #[test]
    fn floored_all_zero_weights_still_yield_n_indices() {
        let mut rng = StdRng::seed_from_u64(2);
        let weights = vec![1e-30; 7];
        for strategy in STRATEGIES {
            let indices = strategy.resample(&weights, &mut rng);
            assert_eq!(indices.len(), 7);
            assert!(indices.iter().all(|&i| i < 7));
        }
        let zeros = vec![0.0; 5];
        for strategy in STRATEGIES {
            assert_eq!(strategy.resample(&zeros, &mut rng).len(), 5);
        }
    }

    #[test]
    fn empirical_copy_counts_converge_to_expected() {
        let mut rng = StdRng::seed_from_u64(3);
        let weights = [0.5, 0.25, 0.125, 0.0625, 0.0625];
        let n = weights.len();
        let trials = 20_000;
        for strategy in STRATEGIES {
            let mut totals = vec![0usize; n];
            for _ in 0..trials {
                for (i, c) in counts(&strategy.resample(&weights, &mut rng), n)
                    .into_iter()
                    .enumerate()
                {
                    totals[i] += c;
                }
            }
            for (i, &w) in weights.iter().enumerate() {
                let mean = totals[i] as f64 / trials as f64;
                let expected = n as f64 * w;
                assert!(
                    (mean - expected).abs() < 0.05,
                    "{strategy:?}: particle {i} copied {mean:.3} times on average, expected {expected:.3}"
                );
            }
        }
    }

    #[test]
    fn residual_gives_guaranteed_copies() {
        let mut rng = StdRng::seed_from_u64(4);
        let weights = [0.85, 0.05, 0.05, 0.05];
        for _ in 0..100 {
            let c = counts(&residual_resample(&weights, 4, &mut rng), 4);
            assert!(c[0] >= 3);
        }
    }

    #[test]
    fn systematic_spacing_is_deterministic_for_uniform_weights() {
        let mut rng = StdRng::seed_from_u64(5);
        let weights = [0.25; 4];
        let indices = systematic_resample(&weights, 4, &mut rng);
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn unnormalized_weights_are_scaled() {
        let mut rng = StdRng::seed_from_u64(6);
        let weights = [3.0, 1.0];
        let c = counts(&systematic_resample(&weights, 4, &mut rng), 2);
        assert_eq!(c, vec![3, 1]);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let mut rng = StdRng::seed_from_u64(7);
        for strategy in STRATEGIES {
            assert!(strategy.resample(&[], &mut rng).is_empty());
        }
    }
}
