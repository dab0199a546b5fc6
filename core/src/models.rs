//! Motion and measurement models plugged into each particle.
//!
//! The particle filter engine only sees two contracts:
//!
//! - [`MotionModel`]: `predict(pose, control, dt, noise) -> pose'`, deterministic given the noise draw.
//! - [`MeasurementModel`]: `simulate(pose, transforms) -> predicted ranges` plus a likelihood comparing
//!   predicted and measured ranges.
//!
//! The defaults provided here are an odometry-velocity motion model and a multibeam echosounder simulated
//! by ray marching against a gridded bathymetry. Either can be swapped without touching the filter.
use std::sync::Arc;

use nalgebra::{Isometry3, Point3, Vector3, Vector6};

use crate::transforms::SensorTransforms;
use crate::{Odometry, Pose, SonarScan, wrap_to_pi};

/// Generic motion model trait for propagating a particle's pose
pub trait MotionModel: Send + Sync {
    /// Advance `pose` by `dt` seconds under `control`, perturbed by the noise draw
    /// `[x, y, z, roll, pitch, yaw]`.
    fn predict(&self, pose: &Pose, control: &Odometry, dt: f64, noise: &Vector6<f64>) -> Pose;
}

/// Generic measurement model trait for range sensors
pub trait MeasurementModel: Send + Sync {
    /// Simulated ranges the sensor would return with the vehicle at `pose`.
    fn simulate(&self, pose: &Pose, transforms: &SensorTransforms) -> Vec<f64>;
    /// Log-likelihood of `measured` given `predicted`.
    fn log_likelihood(&self, predicted: &[f64], measured: &[f64], variance: f64) -> f64 {
        gaussian_range_log_likelihood(predicted, measured, variance)
    }
    /// Likelihood of `measured` given `predicted`, always `>= 0`.
    fn likelihood(&self, predicted: &[f64], measured: &[f64], variance: f64) -> f64 {
        let w = self.log_likelihood(predicted, measured, variance).exp();
        if w.is_finite() { w } else { 0.0 }
    }
}

/// Independent Gaussian log-likelihood over paired beams.
///
/// Beams are paired by position; extra beams on either side are ignored, as are pairs where either range is
/// not finite. With nothing left to compare the result is `-inf` (zero likelihood).
pub fn gaussian_range_log_likelihood(predicted: &[f64], measured: &[f64], variance: f64) -> f64 {
    if !(variance > 0.0) {
        return f64::NEG_INFINITY;
    }
    let mut quad = 0.0;
    let mut used = 0usize;
    for (p, m) in predicted.iter().zip(measured.iter()) {
        if p.is_finite() && m.is_finite() {
            quad += (p - m).powi(2);
            used += 1;
        }
    }
    if used == 0 {
        return f64::NEG_INFINITY;
    }
    -0.5 * quad / variance
}

/// Convert a map-frame point cloud into per-beam ranges seen from `map_to_sonar`.
pub fn scan_to_ranges(scan: &SonarScan, map_to_sonar: &Isometry3<f64>) -> Vec<f64> {
    let sonar_from_map = map_to_sonar.inverse();
    scan.points
        .iter()
        .map(|p| (sonar_from_map * p).coords.norm())
        .collect()
}

/// Velocity-integrating motion model driven by odometry.
///
/// Body-frame linear velocity is rotated by the particle's own heading and integrated over `dt`; body rates
/// are integrated into roll, pitch and yaw. The noise draw is added on top and yaw is wrapped to (-π, π].
#[derive(Clone, Copy, Debug, Default)]
pub struct OdometryMotionModel;

impl MotionModel for OdometryMotionModel {
    fn predict(&self, pose: &Pose, control: &Odometry, dt: f64, noise: &Vector6<f64>) -> Pose {
        let (sin_yaw, cos_yaw) = pose.yaw.sin_cos();
        let v = control.linear_velocity;
        let w = control.angular_velocity;
        Pose {
            x: pose.x + (v[0] * cos_yaw - v[1] * sin_yaw) * dt + noise[0],
            y: pose.y + (v[0] * sin_yaw + v[1] * cos_yaw) * dt + noise[1],
            z: pose.z + v[2] * dt + noise[2],
            roll: pose.roll + w[0] * dt + noise[3],
            pitch: pose.pitch + w[1] * dt + noise[4],
            yaw: wrap_to_pi(pose.yaw + w[2] * dt + noise[5]),
        }
    }
}

/// Regular grid of seabed elevations (map frame, z up) with bilinear interpolation.
#[derive(Clone, Debug, PartialEq)]
pub struct Bathymetry {
    origin_x: f64,
    origin_y: f64,
    resolution: f64,
    nx: usize,
    ny: usize,
    /// Row-major, `elevations[iy * nx + ix]`
    elevations: Vec<f64>,
}
impl Bathymetry {
    /// Sample `f(x, y)` on an `nx` by `ny` grid starting at the origin.
    pub fn from_fn<F: Fn(f64, f64) -> f64>(
        origin: (f64, f64),
        resolution: f64,
        nx: usize,
        ny: usize,
        f: F,
    ) -> Self {
        assert!(resolution > 0.0, "Grid resolution must be positive");
        assert!(nx >= 2 && ny >= 2, "Grid needs at least 2x2 cells");
        let mut elevations = Vec::with_capacity(nx * ny);
        for iy in 0..ny {
            for ix in 0..nx {
                elevations.push(f(
                    origin.0 + ix as f64 * resolution,
                    origin.1 + iy as f64 * resolution,
                ));
            }
        }
        Bathymetry {
            origin_x: origin.0,
            origin_y: origin.1,
            resolution,
            nx,
            ny,
            elevations,
        }
    }
    /// A level seabed at `elevation` covering the square `[-half_extent, half_extent]^2`.
    pub fn flat(elevation: f64, half_extent: f64) -> Self {
        let resolution = (half_extent / 8.0).max(1.0);
        let cells = ((2.0 * half_extent / resolution).ceil() as usize + 1).max(2);
        Bathymetry::from_fn(
            (-half_extent, -half_extent),
            resolution,
            cells,
            cells,
            |_, _| elevation,
        )
    }
    /// Seabed elevation at `(x, y)`, `None` outside the grid.
    pub fn elevation_at(&self, x: f64, y: f64) -> Option<f64> {
        let gx = (x - self.origin_x) / self.resolution;
        let gy = (y - self.origin_y) / self.resolution;
        if !(gx >= 0.0 && gy >= 0.0) {
            return None;
        }
        let max_x = (self.nx - 1) as f64;
        let max_y = (self.ny - 1) as f64;
        if gx > max_x || gy > max_y {
            return None;
        }
        let ix = (gx.floor() as usize).min(self.nx - 2);
        let iy = (gy.floor() as usize).min(self.ny - 2);
        let fx = gx - ix as f64;
        let fy = gy - iy as f64;
        let at = |i: usize, j: usize| self.elevations[j * self.nx + i];
        let bottom = at(ix, iy) * (1.0 - fx) + at(ix + 1, iy) * fx;
        let top = at(ix, iy + 1) * (1.0 - fx) + at(ix + 1, iy + 1) * fx;
        Some(bottom * (1.0 - fy) + top * fy)
    }
}

/// Multibeam echosounder simulated against a [`Bathymetry`].
///
/// Beams fan out across-track in the sonar frame's y-z plane, pointing down (-z), from port to starboard.
#[derive(Clone, Debug)]
pub struct MultibeamSonar {
    seabed: Arc<Bathymetry>,
    num_beams: usize,
    swath_angle: f64,
    max_range: f64,
    step: f64,
}
impl MultibeamSonar {
    pub fn new(seabed: Arc<Bathymetry>, num_beams: usize, swath_angle: f64, max_range: f64) -> Self {
        assert!(num_beams > 0, "Sonar needs at least one beam");
        let step = (seabed.resolution / 4.0).clamp(0.05, 1.0);
        MultibeamSonar {
            seabed,
            num_beams,
            swath_angle,
            max_range,
            step,
        }
    }
    pub fn num_beams(&self) -> usize {
        self.num_beams
    }
    pub fn max_range(&self) -> f64 {
        self.max_range
    }
    /// Unit direction of beam `k` in the sonar frame.
    pub fn beam_direction(&self, k: usize) -> Vector3<f64> {
        let angle = if self.num_beams == 1 {
            0.0
        } else {
            -0.5 * self.swath_angle + self.swath_angle * k as f64 / (self.num_beams - 1) as f64
        };
        Vector3::new(0.0, angle.sin(), -angle.cos())
    }
    /// Range along one ray to the seabed, capped at the maximum range.
    fn cast(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> f64 {
        let below = |t: f64| {
            let p = *origin + direction * t;
            match self.seabed.elevation_at(p.x, p.y) {
                Some(z) => p.z <= z,
                None => false,
            }
        };
        if below(0.0) {
            return 0.0;
        }
        let mut t = 0.0;
        while t < self.max_range {
            let next = (t + self.step).min(self.max_range);
            if below(next) {
                let (mut lo, mut hi) = (t, next);
                for _ in 0..20 {
                    let mid = 0.5 * (lo + hi);
                    if below(mid) {
                        hi = mid;
                    } else {
                        lo = mid;
                    }
                }
                return 0.5 * (lo + hi);
            }
            t = next;
        }
        self.max_range
    }
    /// Ranges for every beam with the sonar at `map_to_sonar`.
    pub fn ranges_from(&self, map_to_sonar: &Isometry3<f64>) -> Vec<f64> {
        let origin = Point3::from(map_to_sonar.translation.vector);
        (0..self.num_beams)
            .map(|k| {
                let direction = map_to_sonar.rotation * self.beam_direction(k);
                self.cast(&origin, &direction)
            })
            .collect()
    }
    /// Map-frame points of a ping with `ranges`, georeferenced with `map_to_sonar`.
    pub fn points_from_ranges(&self, ranges: &[f64], map_to_sonar: &Isometry3<f64>) -> Vec<Point3<f64>> {
        ranges
            .iter()
            .enumerate()
            .map(|(k, &r)| map_to_sonar * Point3::from(self.beam_direction(k) * r))
            .collect()
    }
}
impl MeasurementModel for MultibeamSonar {
    fn simulate(&self, pose: &Pose, transforms: &SensorTransforms) -> Vec<f64> {
        self.ranges_from(&transforms.sonar_in_map(pose))
    }
}
