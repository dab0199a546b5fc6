//! The particle population: weights, adaptive resampling and pose averaging.
//!
//! [`ParticlePopulation`] owns a fixed-size, ordered set of [`Particle`]s. Its length never changes after
//! construction; resampling reassigns poses between slots instead of rebuilding the set. The population also
//! carries the `old_time`/`time` pair the controller uses to compute `dt`.
//!
//! ## Adaptive resampling
//!
//! After a measurement update the weights are normalized and the effective sample size
//!
//! $$
//! N_{eff} = \frac{1}{\sum_i w_i^2}
//! $$
//!
//! is compared against `resampling_threshold * N`. Only when it drops below does the population resample:
//! slots that were never drawn (lost) receive the poses of surplus draws (dupes), one to one, and every
//! particle is then jittered with the configured covariance so exact copies separate again.
//!
//! ## Heading average
//!
//! Yaw is averaged with a circular correction: when every particle's `|yaw|` exceeds π/2 the cloud straddles
//! the ±π discontinuity, so negative yaws are shifted by 2π before taking the mean. Without it, headings of
//! `π - ε` and `-π + ε` (nearly identical) would average to 0 (the opposite direction).
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt::{self, Debug};
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{Matrix6, Vector6};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::particle::{Particle, ParticleModels};
use crate::resampling::ResamplingStrategy;
use crate::{FilterError, Odometry, Pose, Result, wrap_to_pi};

/// How the population is summarized into a single pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AveragingStrategy {
    /// Plain mean over all particles
    #[default]
    Unweighted,
    /// Mean using the normalized weights of the latest update
    Weighted,
    /// Pose of the particle with the largest latest likelihood
    HighestWeight,
}

/// Result of [`ParticlePopulation::maybe_resample`].
#[derive(Clone, Debug, PartialEq)]
pub enum ResampleOutcome {
    /// N_eff fell below the threshold; `replaced` slots received new poses.
    Resampled { n_eff: f64, replaced: usize },
    /// N_eff was high enough, poses untouched.
    Skipped { n_eff: f64 },
    /// The weights summed to zero (or were not finite); nothing was done.
    Degenerate,
}

/// Summarized estimate of the population at a point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseEstimate {
    pub stamp: f64,
    pub pose: Pose,
    /// Spread of the particle set around `pose`, ordered [x, y, z, roll, pitch, yaw]
    pub covariance: Matrix6<f64>,
}

/// Normalize weights to sum to one.
///
/// Fails with [`FilterError::DegenerateWeights`] when the sum is zero or not finite.
pub fn normalize(weights: &[f64]) -> Result<Vec<f64>> {
    let sum: f64 = weights.iter().sum();
    if !(sum > 0.0 && sum.is_finite()) || weights.iter().any(|w| *w < 0.0) {
        return Err(FilterError::DegenerateWeights);
    }
    Ok(weights.iter().map(|w| w / sum).collect())
}

/// Effective sample size `1 / Σ w_i²` of the normalized weights.
///
/// Lies in `[1, N]` for any weight vector with a positive sum: `N` for uniform weights, 1 when a single
/// particle carries all the weight. Degenerate weights give 0.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    match normalize(weights) {
        Ok(normalized) => 1.0 / normalized.iter().map(|w| w * w).sum::<f64>(),
        Err(_) => 0.0,
    }
}

/// Split resampled indices into slots that were never drawn and surplus draws.
///
/// Every index after its first occurrence is a duplicate. With `indices.len() == n` both lists have the same
/// length, pairing each lost slot with one surplus draw.
pub fn lost_and_dupes(indices: &[usize], n: usize) -> (Vec<usize>, Vec<usize>) {
    let mut kept = vec![false; n];
    let mut dupes = Vec::new();
    for &i in indices {
        if kept[i] {
            dupes.push(i);
        } else {
            kept[i] = true;
        }
    }
    let lost = (0..n).filter(|&i| !kept[i]).collect();
    (lost, dupes)
}

fn argmax(weights: &[f64]) -> usize {
    weights
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i)
}

/// Index drawn most often, the lowest one on ties.
fn most_drawn(indices: &[usize], n: usize) -> usize {
    let mut counts = vec![0usize; n];
    for &i in indices {
        counts[i] += 1;
    }
    counts
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        .map_or(0, |(i, _)| i)
}

/// Weighted mean of poses with the circular yaw correction. `weights` must be normalized.
pub fn mean_pose(poses: &[Pose], weights: &[f64]) -> Pose {
    let mut mean = Vector6::<f64>::zeros();
    for (pose, &w) in poses.iter().zip(weights.iter()) {
        mean += Vector6::from(*pose) * w;
    }
    let yaws: Vec<f64> = poses.iter().map(|p| p.yaw).collect();
    mean[5] = circular_mean_yaw(&yaws, weights);
    Pose::from(mean)
}

/// Weighted mean heading, shifting negative yaws by 2π when the set straddles ±π.
pub fn circular_mean_yaw(yaws: &[f64], weights: &[f64]) -> f64 {
    let min_abs = yaws.iter().map(|y| y.abs()).fold(f64::INFINITY, f64::min);
    let near_discontinuity = min_abs > FRAC_PI_2;
    let mean: f64 = yaws
        .iter()
        .zip(weights.iter())
        .map(|(&yaw, &w)| {
            let yaw = if near_discontinuity && yaw < 0.0 {
                yaw + 2.0 * PI
            } else {
                yaw
            };
            yaw * w
        })
        .sum();
    wrap_to_pi(mean)
}

/// Weighted covariance of poses about `mean`, with yaw differences wrapped.
pub fn pose_covariance(poses: &[Pose], weights: &[f64], mean: &Pose) -> Matrix6<f64> {
    let center = Vector6::from(*mean);
    let mut cov = Matrix6::<f64>::zeros();
    for (pose, &w) in poses.iter().zip(weights.iter()) {
        let mut diff = Vector6::from(*pose) - center;
        diff[5] = wrap_to_pi(diff[5]);
        cov += diff * diff.transpose() * w;
    }
    cov
}

pub struct ParticlePopulation {
    particles: Vec<Particle>,
    /// Normalized weights of the latest cycle, uniform after a resample
    weights: Vec<f64>,
    /// Slot holding the strongest hypothesis of the latest update
    best_slot: Option<usize>,
    resampling_strategy: ResamplingStrategy,
    averaging_strategy: AveragingStrategy,
    resampling_threshold: f64,
    jitter_covariance: [f64; 6],
    weight_floor: f64,
    rng: StdRng,
    old_time: Option<f64>,
    time: Option<f64>,
}
impl Debug for ParticlePopulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.average_pose();
        let min_weight = self.weights.iter().copied().fold(f64::INFINITY, f64::min);
        let max_weight = self.weights.iter().copied().fold(0.0, f64::max);
        f.debug_struct("ParticlePopulation")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &effective_sample_size(&self.weights))
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field(
                "mean_position",
                &format_args!("({:.3}, {:.3}, {:.3}) m", mean.x, mean.y, mean.z),
            )
            .field(
                "mean_attitude",
                &format_args!("({:.3}, {:.3}, {:.3}) rad", mean.roll, mean.pitch, mean.yaw),
            )
            .field("resampling_strategy", &self.resampling_strategy)
            .field("old_time", &self.old_time)
            .finish()
    }
}

impl ParticlePopulation {
    /// Spawn `config.num_particles` particles around `initial_pose`, spread by the initial covariance.
    ///
    /// Uses `config.seed` when set, otherwise a fresh random seed.
    pub fn new(config: &FilterConfig, models: Arc<ParticleModels>, initial_pose: &Pose) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random::<u64>);
        let mut rng = StdRng::seed_from_u64(seed);
        let particles = (0..config.num_particles)
            .map(|i| {
                Particle::spawn(
                    i,
                    initial_pose,
                    &config.init_covariance,
                    models.clone(),
                    &mut rng,
                )
            })
            .collect();
        Self::with_rng(particles, config, rng)
    }

    /// Wrap an existing particle set. Particle `i` must sit in slot `i`.
    pub fn from_particles(particles: Vec<Particle>, config: &FilterConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random::<u64>);
        Self::with_rng(particles, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(particles: Vec<Particle>, config: &FilterConfig, rng: StdRng) -> Self {
        assert!(!particles.is_empty(), "Population needs at least one particle");
        let n = particles.len();
        ParticlePopulation {
            particles,
            weights: vec![1.0 / n as f64; n],
            best_slot: None,
            resampling_strategy: config.resampling_strategy,
            averaging_strategy: config.averaging_strategy,
            resampling_threshold: config.resampling_threshold,
            jitter_covariance: config.jitter_covariance,
            weight_floor: config.weight_floor,
            rng,
            old_time: None,
            time: None,
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    pub fn poses(&self) -> Vec<Pose> {
        self.particles.iter().map(|p| p.pose).collect()
    }
    /// Normalized weights of the latest cycle.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
    pub fn resampling_strategy(&self) -> ResamplingStrategy {
        self.resampling_strategy
    }
    pub fn old_time(&self) -> Option<f64> {
        self.old_time
    }
    pub fn time(&self) -> Option<f64> {
        self.time
    }

    /// Record the arrival of time `t` and return the previous `old_time`.
    pub fn tick(&mut self, t: f64) -> Option<f64> {
        self.time = Some(t);
        self.old_time
    }
    /// Close the cycle by moving `time` into `old_time`.
    pub fn settle_clock(&mut self) {
        self.old_time = self.time;
    }

    /// Propagate every particle through its motion model.
    pub fn predict(&mut self, control: &Odometry, dt: f64) {
        for particle in &mut self.particles {
            particle.motion_pred(control, dt, &mut self.rng);
        }
    }

    /// Run the measurement update on every particle and collect raw weights.
    ///
    /// Likelihoods are taken relative to the best particle (`exp(ll_i - max ll)`), which leaves their ratios
    /// unchanged while keeping them clear of underflow. The weight floor is added to every entry so the sum
    /// is strictly positive. The result is not normalized.
    ///
    /// When no particle explains the measurement at all (every likelihood is zero) the floor is not applied
    /// and all-zero weights are returned, which [`maybe_resample`](Self::maybe_resample) reports as
    /// degenerate.
    pub fn compute_weights(&mut self, measured_ranges: &[f64]) -> Vec<f64> {
        for particle in &mut self.particles {
            particle.meas_update(measured_ranges);
        }
        let max_log = self
            .particles
            .iter()
            .map(|p| p.log_likelihood())
            .fold(f64::NEG_INFINITY, f64::max);
        if !max_log.is_finite() {
            warn!(
                "No particle explains the measurement of {} ranges; all likelihoods are zero",
                measured_ranges.len()
            );
            return vec![0.0; self.particles.len()];
        }
        self.particles
            .iter()
            .map(|p| {
                let w = (p.log_likelihood() - max_log).exp();
                let w = if w.is_finite() { w } else { 0.0 };
                w + self.weight_floor
            })
            .collect()
    }

    /// Resample if and only if the effective sample size is below `threshold * N`.
    pub fn maybe_resample(&mut self, weights: &[f64]) -> ResampleOutcome {
        assert_eq!(
            weights.len(),
            self.particles.len(),
            "One weight per particle is required"
        );
        let normalized = match normalize(weights) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!("{e}; skipping resampling");
                return ResampleOutcome::Degenerate;
            }
        };
        let n = self.particles.len();
        let n_eff = 1.0 / normalized.iter().map(|w| w * w).sum::<f64>();
        let best = argmax(&normalized);
        debug!("N_eff {n_eff:.3} of {n}");

        if n_eff < self.resampling_threshold * n as f64 {
            let indices = self
                .resampling_strategy
                .resample(&normalized, &mut self.rng);
            let (lost, dupes) = lost_and_dupes(&indices, n);
            self.reassign_poses(&lost, &dupes);
            // drawn slots keep their own pose
            self.best_slot = Some(if indices.contains(&best) {
                best
            } else {
                most_drawn(&indices, n)
            });
            for particle in &mut self.particles {
                particle.add_noise(&self.jitter_covariance, &mut self.rng);
            }
            self.weights = vec![1.0 / n as f64; n];
            info!(
                "Resampled with N_eff {n_eff:.2} < {:.2}: {} slots replaced",
                self.resampling_threshold * n as f64,
                lost.len()
            );
            ResampleOutcome::Resampled {
                n_eff,
                replaced: lost.len(),
            }
        } else {
            debug!("Number of effective particles high ({n_eff:.2}) - not resampling");
            self.weights = normalized;
            self.best_slot = Some(best);
            ResampleOutcome::Skipped { n_eff }
        }
    }

    /// Copy the pose of `dupes[k]` into slot `lost[k]`. Weights are left alone.
    ///
    /// Source poses are read before any slot is written, so a slot that is both a source and a target
    /// still hands over its original pose.
    pub fn reassign_poses(&mut self, lost: &[usize], dupes: &[usize]) {
        debug_assert_eq!(lost.len(), dupes.len());
        let sources: Vec<Pose> = dupes.iter().map(|&d| self.particles[d].pose).collect();
        for (&slot, pose) in lost.iter().zip(sources) {
            self.particles[slot].pose = pose;
        }
    }

    /// Summarize the particle set into a single pose according to the averaging strategy.
    pub fn average_pose(&self) -> Pose {
        let poses = self.poses();
        match self.averaging_strategy {
            AveragingStrategy::Unweighted => {
                let uniform = vec![1.0 / poses.len() as f64; poses.len()];
                mean_pose(&poses, &uniform)
            }
            AveragingStrategy::Weighted => mean_pose(&poses, &self.weights),
            AveragingStrategy::HighestWeight => match self.best_slot {
                Some(slot) => self.particles[slot].pose,
                None => self
                    .particles
                    .iter()
                    .max_by(|a, b| a.weight.total_cmp(&b.weight))
                    .map(|p| p.pose)
                    .unwrap_or_default(),
            },
        }
    }

    /// Mean pose with its covariance, stamped with `stamp`.
    pub fn estimate(&self, stamp: f64) -> PoseEstimate {
        let pose = self.average_pose();
        let covariance = match self.averaging_strategy {
            AveragingStrategy::HighestWeight => Matrix6::zeros(),
            AveragingStrategy::Weighted => pose_covariance(&self.poses(), &self.weights, &pose),
            AveragingStrategy::Unweighted => {
                let n = self.particles.len();
                pose_covariance(&self.poses(), &vec![1.0 / n as f64; n], &pose)
            }
        };
        PoseEstimate {
            stamp,
            pose,
            covariance,
        }
    }

    /// Simulated sensor reading at `pose` using the shared models.
    pub fn predict_meas(&self, pose: &Pose) -> Vec<f64> {
        self.particles[0].predict_meas(pose)
    }
}
