//! Bathymetric particle-filter localization for autonomous underwater vehicles
//!
//! This crate estimates the six degree-of-freedom pose of an underwater vehicle by fusing dead-reckoning
//! odometry with multibeam echosounder (MBES) returns using a Sequential Monte Carlo (particle) filter. Each
//! particle carries one pose hypothesis that is propagated by a motion model and re-weighted by comparing the
//! sonar return it *would* observe against the one actually measured. Hypotheses that explain the seabed poorly
//! are discarded during resampling in favour of those that explain it well.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the rigid-body transforms and linear algebra.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides
//!   random number generation for process noise, initial spread, resampling draws and post-resample jitter.
//! - [`crossbeam`](https://crates.io/crates/crossbeam): Provides the event channels that feed the filter thread.
//!
//! ## Crate overview
//!
//! - [config]: Filter configuration, file I/O (JSON/YAML/TOML) and legacy covariance-string parsing.
//! - [controller]: The event-driven filter controller (predict, update, adaptive resample, publish).
//! - [error]: Error type shared by the crate.
//! - [messages]: Input events (odometry and sonar scans) and event streams.
//! - [models]: Motion and measurement model traits along with the default odometry and multibeam models.
//! - [particle]: A single pose hypothesis and its shared, read-only models.
//! - [population]: The fixed-size particle population, weight statistics, resampling and pose averaging.
//! - [resampling]: Systematic, stratified, residual and naive (multinomial) resampling.
//! - [sim]: A synthetic survey used to exercise the filter end-to-end.
//! - [transforms]: Static sensor-mount and map/odometry alignment transforms.
//!
//! ## Coordinate and state definitions
//!
//! A pose is the six-element vector
//!
//! $$
//! x = [p_x, p_y, p_z, \phi, \theta, \psi]
//! $$
//!
//! where $p_x$, $p_y$ and $p_z$ are positions in meters in the odometry frame (z up) and $\phi$, $\theta$,
//! $\psi$ are roll, pitch and yaw in radians (XYZ Euler rotation, the same convention as
//! [`nalgebra::UnitQuaternion::from_euler_angles`]). Yaw is kept in $(-\pi, \pi]$; averaging it is done with
//! the circular correction in [population::ParticlePopulation::average_pose].
//!
//! Three frames matter to the filter:
//! - `map`: the frame the seabed (bathymetry) is expressed in.
//! - `odom`: the frame particle poses and odometry are expressed in, related to `map` by a fixed alignment.
//! - `mbes_link`: the sonar frame, related to the vehicle `base_link` by a fixed mount transform.
//!
//! Both fixed transforms are acquired once at start-up (see [transforms::SensorTransforms::acquire]) and shared
//! read-only by every particle.
pub mod config;
pub mod controller;
pub mod error;
pub mod messages;
pub mod models;
pub mod particle;
pub mod population;
pub mod resampling;
pub mod sim;
pub mod transforms;

pub use error::{FilterError, Result};

use std::fmt::{self, Display};

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Six degree-of-freedom vehicle pose.
///
/// Orientation is stored as roll, pitch and yaw (radians). Conversions to and from
/// [`Isometry3`] go through a unit quaternion so the rotation is always valid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position along x in meters
    pub x: f64,
    /// Position along y in meters
    pub y: f64,
    /// Position along z in meters (positive up)
    pub z: f64,
    /// Roll in radians
    pub roll: f64,
    /// Pitch in radians
    pub pitch: f64,
    /// Yaw (heading) in radians
    pub yaw: f64,
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose {{ x: {:.3} m, y: {:.3} m, z: {:.3} m, attitude: [{:.2} deg, {:.2} deg, {:.2} deg] }}",
            self.x,
            self.y,
            self.z,
            self.roll.to_degrees(),
            self.pitch.to_degrees(),
            self.yaw.to_degrees()
        )
    }
}
impl Pose {
    pub fn new(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Pose {
            x,
            y,
            z,
            roll,
            pitch,
            yaw,
        }
    }
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_euler_angles(self.roll, self.pitch, self.yaw)
    }
    /// Rigid-body transform taking points from the body frame into the pose's parent frame.
    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(self.x, self.y, self.z),
            self.orientation(),
        )
    }
    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        let (roll, pitch, yaw) = iso.rotation.euler_angles();
        let t = iso.translation.vector;
        Pose::new(t[0], t[1], t[2], roll, pitch, yaw)
    }
    /// Planar distance to another pose, ignoring depth.
    pub fn horizontal_distance(&self, other: &Pose) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}
impl From<Pose> for Vector6<f64> {
    fn from(pose: Pose) -> Self {
        Vector6::new(pose.x, pose.y, pose.z, pose.roll, pose.pitch, pose.yaw)
    }
}
impl From<Vector6<f64>> for Pose {
    fn from(v: Vector6<f64>) -> Self {
        Pose::new(v[0], v[1], v[2], v[3], v[4], v[5])
    }
}
impl From<[f64; 6]> for Pose {
    fn from(v: [f64; 6]) -> Self {
        Pose::new(v[0], v[1], v[2], v[3], v[4], v[5])
    }
}
impl TryFrom<&[f64]> for Pose {
    type Error = FilterError;

    fn try_from(slice: &[f64]) -> Result<Self> {
        if slice.len() != 6 {
            return Err(FilterError::InvalidConfig(format!(
                "a pose needs 6 values [x, y, z, roll, pitch, yaw], got {}",
                slice.len()
            )));
        }
        Ok(Pose::new(
            slice[0], slice[1], slice[2], slice[3], slice[4], slice[5],
        ))
    }
}

/// Odometry message: the dead-reckoned pose plus body-frame velocities.
///
/// This is the control input of the motion model. `stamp` is in seconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Odometry {
    pub stamp: f64,
    /// Dead-reckoned pose of `base_link` in the odometry frame
    pub pose: Pose,
    /// Body-frame linear velocity (m/s)
    pub linear_velocity: Vector3<f64>,
    /// Body-frame angular velocity (rad/s)
    pub angular_velocity: Vector3<f64>,
}
impl Display for Odometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Odometry(t: {:.3} s, {}, v: [{:.3}, {:.3}, {:.3}] m/s, w: [{:.4}, {:.4}, {:.4}] rad/s)",
            self.stamp,
            self.pose,
            self.linear_velocity[0],
            self.linear_velocity[1],
            self.linear_velocity[2],
            self.angular_velocity[0],
            self.angular_velocity[1],
            self.angular_velocity[2]
        )
    }
}

/// A single multibeam ping as a point cloud expressed in the map frame.
///
/// Points are ordered by beam, port to starboard.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SonarScan {
    pub stamp: f64,
    pub points: Vec<Point3<f64>>,
}
impl SonarScan {
    pub fn new(stamp: f64, points: Vec<Point3<f64>>) -> Self {
        SonarScan { stamp, points }
    }
    pub fn len(&self) -> usize {
        self.points.len()
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Wrap an angle to the range $-\pi$ to $\pi$ radians
///
/// # Example
/// ```rust
/// use auvpf::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped_angle = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped_angle + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi<T>(angle: T) -> T
where
    T: PartialOrd + Copy + std::ops::SubAssign + std::ops::AddAssign + From<f64>,
{
    let mut wrapped: T = angle;
    while wrapped > T::from(std::f64::consts::PI) {
        wrapped -= T::from(2.0 * std::f64::consts::PI);
    }
    while wrapped < T::from(-std::f64::consts::PI) {
        wrapped += T::from(2.0 * std::f64::consts::PI);
    }
    wrapped
}

/// Build a rigid transform from `[x, y, z, roll, pitch, yaw]`.
pub fn isometry_from_components(components: &[f64; 6]) -> Isometry3<f64> {
    Pose::from(*components).to_isometry()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn pose_isometry_round_trip() {
        let pose = Pose::new(1.0, -2.0, -30.0, 0.05, -0.1, 2.5);
        let back = Pose::from_isometry(&pose.to_isometry());
        assert_approx_eq!(back.x, pose.x, 1e-12);
        assert_approx_eq!(back.y, pose.y, 1e-12);
        assert_approx_eq!(back.z, pose.z, 1e-12);
        assert_approx_eq!(back.roll, pose.roll, 1e-9);
        assert_approx_eq!(back.pitch, pose.pitch, 1e-9);
        assert_approx_eq!(back.yaw, pose.yaw, 1e-9);
    }

    #[test]
    fn pose_from_slice_rejects_wrong_length() {
        let short = [1.0, 2.0, 3.0];
        assert!(Pose::try_from(&short[..]).is_err());
        let full = [1.0, 2.0, 3.0, 0.0, 0.0, 0.5];
        let pose = Pose::try_from(&full[..]).unwrap();
        assert_eq!(pose.yaw, 0.5);
    }

    #[test]
    fn wrap_to_pi_wraps_both_directions() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(0.25_f64), 0.25, 1e-15);
    }

    #[test]
    fn horizontal_distance_ignores_depth() {
        let a = Pose::new(0.0, 0.0, -10.0, 0.0, 0.0, 0.0);
        let b = Pose::new(3.0, 4.0, -50.0, 0.0, 0.0, 1.0);
        assert_approx_eq!(a.horizontal_distance(&b), 5.0, 1e-12);
    }
}
