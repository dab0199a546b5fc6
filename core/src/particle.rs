//! A single pose hypothesis of the particle filter.
//!
//! Each [`Particle`] owns its pose, its latest (unnormalized) weight and the last process-noise draw it used.
//! The motion and measurement models, the measurement noise and the fixed sensor transforms live in
//! [`ParticleModels`], which is built once and shared read-only by every particle of a population.
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use nalgebra::Vector6;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::models::{MeasurementModel, MotionModel};
use crate::transforms::SensorTransforms;
use crate::{Odometry, Pose, wrap_to_pi};

/// Models and constants shared by every particle.
pub struct ParticleModels {
    pub motion: Box<dyn MotionModel>,
    pub measurement: Box<dyn MeasurementModel>,
    pub transforms: SensorTransforms,
    /// Process noise variances per second, [x, y, z, roll, pitch, yaw]
    pub motion_covariance: [f64; 6],
    /// Per-beam range variance
    pub measurement_variance: f64,
}
impl Debug for ParticleModels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleModels")
            .field("transforms", &self.transforms)
            .field("motion_covariance", &self.motion_covariance)
            .field("measurement_variance", &self.measurement_variance)
            .finish_non_exhaustive()
    }
}

/// Draw zero-mean Gaussian noise with per-axis variances `variances * scale`.
pub fn gaussian_noise<R: Rng + ?Sized>(
    variances: &[f64; 6],
    scale: f64,
    rng: &mut R,
) -> Vector6<f64> {
    Vector6::from_fn(|i, _| {
        let var = variances[i] * scale;
        if var > 0.0 && var.is_finite() {
            let z: f64 = StandardNormal.sample(&mut *rng);
            z * var.sqrt()
        } else {
            0.0
        }
    })
}

#[derive(Clone)]
pub struct Particle {
    index: usize,
    pub pose: Pose,
    /// Likelihood from the latest measurement update
    pub weight: f64,
    log_likelihood: f64,
    last_noise: Vector6<f64>,
    models: Arc<ParticleModels>,
}
impl Debug for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("index", &self.index)
            .field("pose", &self.pose)
            .field("weight", &self.weight)
            .field("log_likelihood", &self.log_likelihood)
            .finish()
    }
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Particle #{} {} w: {:.4e}",
            self.index, self.pose, self.weight
        )
    }
}
impl Particle {
    /// Create particle `index` at exactly `pose` with unit weight.
    pub fn new(index: usize, pose: Pose, models: Arc<ParticleModels>) -> Self {
        Particle {
            index,
            pose,
            weight: 1.0,
            log_likelihood: 0.0,
            last_noise: Vector6::zeros(),
            models,
        }
    }
    /// Create particle `index` around `mean`, perturbed with the initial covariance.
    pub fn spawn<R: Rng + ?Sized>(
        index: usize,
        mean: &Pose,
        init_covariance: &[f64; 6],
        models: Arc<ParticleModels>,
        rng: &mut R,
    ) -> Self {
        let mut particle = Particle::new(index, *mean, models);
        particle.add_noise(init_covariance, rng);
        particle
    }
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }
    /// Process noise drawn during the latest prediction.
    pub fn last_noise(&self) -> &Vector6<f64> {
        &self.last_noise
    }
    pub fn models(&self) -> &Arc<ParticleModels> {
        &self.models
    }

    /// Propagate the pose through the motion model over `dt` seconds.
    ///
    /// Process noise is drawn independently for this particle on every call with variance
    /// `motion_covariance * dt`. Non-positive `dt` leaves the particle untouched.
    pub fn motion_pred<R: Rng + ?Sized>(&mut self, control: &Odometry, dt: f64, rng: &mut R) {
        if !(dt > 0.0) {
            return;
        }
        let noise = gaussian_noise(&self.models.motion_covariance, dt, rng);
        self.pose = self.models.motion.predict(&self.pose, control, dt, &noise);
        self.last_noise = noise;
    }

    /// Re-weight the particle against measured ranges.
    ///
    /// The predicted ranges at the current pose are compared under the Gaussian measurement noise. The weight
    /// is the exponentiated log-likelihood, so it is always `>= 0`; empty or unusable measurements give 0.
    pub fn meas_update(&mut self, measured_ranges: &[f64]) {
        let predicted = self
            .models
            .measurement
            .simulate(&self.pose, &self.models.transforms);
        let log_likelihood = self.models.measurement.log_likelihood(
            &predicted,
            measured_ranges,
            self.models.measurement_variance,
        );
        self.log_likelihood = if log_likelihood.is_nan() {
            f64::NEG_INFINITY
        } else {
            log_likelihood
        };
        let weight = self.log_likelihood.exp();
        self.weight = if weight.is_finite() { weight } else { 0.0 };
    }

    /// Perturb the pose with independent zero-mean noise of the given per-axis variances.
    pub fn add_noise<R: Rng + ?Sized>(&mut self, covariance: &[f64; 6], rng: &mut R) {
        let noise = gaussian_noise(covariance, 1.0, rng);
        self.pose.x += noise[0];
        self.pose.y += noise[1];
        self.pose.z += noise[2];
        self.pose.roll += noise[3];
        self.pose.pitch += noise[4];
        self.pose.yaw = wrap_to_pi(self.pose.yaw + noise[5]);
    }

    /// Simulated sensor reading for an arbitrary pose with this particle's models.
    pub fn predict_meas(&self, pose: &Pose) -> Vec<f64> {
        self.models
            .measurement
            .simulate(pose, &self.models.transforms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bathymetry, MultibeamSonar, OdometryMotionModel};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn models(motion_covariance: [f64; 6]) -> Arc<ParticleModels> {
        let seabed = Arc::new(Bathymetry::flat(-40.0, 500.0));
        Arc::new(ParticleModels {
            motion: Box::new(OdometryMotionModel),
            measurement: Box::new(MultibeamSonar::new(seabed, 5, 1.5, 150.0)),
            transforms: SensorTransforms::default(),
            motion_covariance,
            measurement_variance: 0.5,
        })
    }

    fn forward_odometry(speed: f64) -> Odometry {
        Odometry {
            stamp: 1.0,
            pose: Pose::default(),
            linear_velocity: Vector3::new(speed, 0.0, 0.0),
            angular_velocity: Vector3::zeros(),
        }
    }

    #[test]
    fn motion_pred_without_noise_follows_odometry() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut particle = Particle::new(0, Pose::new(0.0, 0.0, -10.0, 0.0, 0.0, 0.0), models([0.0; 6]));
        particle.motion_pred(&forward_odometry(2.0), 0.5, &mut rng);
        assert_approx_eq!(particle.pose.x, 1.0, 1e-12);
        assert_approx_eq!(particle.pose.y, 0.0, 1e-12);
        assert_eq!(*particle.last_noise(), Vector6::zeros());
    }

    #[test]
    fn motion_pred_with_zero_dt_is_a_no_op() {
        let mut rng = StdRng::seed_from_u64(2);
        let start = Pose::new(1.0, 2.0, -10.0, 0.0, 0.0, 0.3);
        let mut particle = Particle::new(0, start, models([1.0; 6]));
        particle.motion_pred(&forward_odometry(2.0), 0.0, &mut rng);
        assert_eq!(particle.pose, start);
    }

    #[test]
    fn motion_noise_differs_between_particles() {
        let mut rng = StdRng::seed_from_u64(3);
        let shared = models([0.5, 0.5, 0.0, 0.0, 0.0, 0.01]);
        let mut a = Particle::new(0, Pose::default(), shared.clone());
        let mut b = Particle::new(1, Pose::default(), shared);
        a.motion_pred(&forward_odometry(1.0), 1.0, &mut rng);
        b.motion_pred(&forward_odometry(1.0), 1.0, &mut rng);
        assert_ne!(a.pose, b.pose);
        assert_eq!(a.last_noise()[2], 0.0);
    }

    #[test]
    fn meas_update_prefers_the_true_pose() {
        let shared = models([0.0; 6]);
        let truth = Pose::new(0.0, 0.0, -10.0, 0.0, 0.0, 0.0);
        let measured = Particle::new(99, truth, shared.clone()).predict_meas(&truth);

        let mut good = Particle::new(0, truth, shared.clone());
        let mut bad = Particle::new(1, Pose::new(0.0, 0.0, -12.0, 0.0, 0.0, 0.0), shared);
        good.meas_update(&measured);
        bad.meas_update(&measured);
        assert_approx_eq!(good.weight, 1.0, 1e-9);
        assert!(bad.weight < good.weight);
        assert!(bad.weight >= 0.0);
        assert!(bad.log_likelihood() < 0.0);
    }

    #[test]
    fn meas_update_with_empty_scan_gives_zero_weight() {
        let mut particle = Particle::new(0, Pose::default(), models([0.0; 6]));
        particle.meas_update(&[]);
        assert_eq!(particle.weight, 0.0);
        assert_eq!(particle.log_likelihood(), f64::NEG_INFINITY);
    }

    #[test]
    fn add_noise_only_touches_axes_with_variance() {
        let mut rng = StdRng::seed_from_u64(4);
        let start = Pose::new(10.0, 20.0, -5.0, 0.1, 0.2, 0.3);
        let mut particle = Particle::new(0, start, models([0.0; 6]));
        particle.add_noise(&[3.0, 3.0, 0.0, 0.0, 0.0, 0.0], &mut rng);
        assert_ne!(particle.pose.x, start.x);
        assert_ne!(particle.pose.y, start.y);
        assert_eq!(particle.pose.z, start.z);
        assert_eq!(particle.pose.roll, start.roll);
        assert_eq!(particle.pose.pitch, start.pitch);
        assert_eq!(particle.pose.yaw, start.yaw);
    }

    #[test]
    fn spawn_spreads_particles_with_initial_covariance() {
        let mut rng = StdRng::seed_from_u64(5);
        let shared = models([0.0; 6]);
        let mean = Pose::default();
        let spread: Vec<Particle> = (0..500)
            .map(|i| Particle::spawn(i, &mean, &[4.0, 1.0, 0.0, 0.0, 0.0, 0.0], shared.clone(), &mut rng))
            .collect();
        let var_x = spread.iter().map(|p| p.pose.x.powi(2)).sum::<f64>() / 500.0;
        let var_y = spread.iter().map(|p| p.pose.y.powi(2)).sum::<f64>() / 500.0;
        assert!((var_x - 4.0).abs() < 1.0, "var_x = {var_x}");
        assert!((var_y - 1.0).abs() < 0.3, "var_y = {var_y}");
        assert!(spread.iter().all(|p| p.pose.z == 0.0));
    }
}
