//! Fixed sensor-mount and frame-alignment transforms.
//!
//! The filter needs two static transforms: the sonar mount relative to the vehicle body (`base_link` to
//! `mbes_link`) and the alignment of the odometry frame in the map (`map` to `odom`). They are looked up once
//! at start-up with a bounded wait and are read-only afterwards, so every particle shares them without
//! synchronization.
//!
//! A failed lookup is not fatal. [`SensorTransforms::acquire`] logs the failure and continues with identity
//! transforms, flagging the result as degraded. Estimates produced in that state are only as good as the
//! identity assumption.
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info};
use nalgebra::Isometry3;

use crate::config::FilterConfig;
use crate::{FilterError, Pose, Result, isometry_from_components};

/// Source of named frame transforms, e.g. a transform tree or a static table.
pub trait TransformSource {
    /// Transform taking points from `source` into `target`, if currently known.
    fn lookup(&self, target: &str, source: &str) -> Option<Isometry3<f64>>;
}

/// A fixed table of transforms.
#[derive(Clone, Debug, Default)]
pub struct StaticTransforms {
    frames: HashMap<(String, String), Isometry3<f64>>,
}
impl StaticTransforms {
    pub fn new() -> Self {
        Self::default()
    }
    /// Register the transform taking points from `source` into `target`.
    pub fn insert(&mut self, target: &str, source: &str, transform: Isometry3<f64>) {
        self.frames
            .insert((target.to_string(), source.to_string()), transform);
    }
    /// The mount and alignment transforms described by a configuration.
    pub fn from_config(config: &FilterConfig) -> Self {
        let mut table = StaticTransforms::new();
        table.insert(
            &config.base_frame,
            &config.sonar_frame,
            isometry_from_components(&config.sonar_mount),
        );
        table.insert(
            &config.map_frame,
            &config.odom_frame,
            isometry_from_components(&config.map_to_odom),
        );
        table
    }
}
impl TransformSource for StaticTransforms {
    fn lookup(&self, target: &str, source: &str) -> Option<Isometry3<f64>> {
        if let Some(t) = self.frames.get(&(target.to_string(), source.to_string())) {
            return Some(*t);
        }
        self.frames
            .get(&(source.to_string(), target.to_string()))
            .map(|t| t.inverse())
    }
}

/// Poll `source` until the transform is available or `timeout` elapses.
pub fn lookup_with_timeout<S: TransformSource + ?Sized>(
    source: &S,
    target_frame: &str,
    source_frame: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Isometry3<f64>> {
    let start = Instant::now();
    loop {
        if let Some(transform) = source.lookup(target_frame, source_frame) {
            return Ok(transform);
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(FilterError::TransformUnavailable {
                target_frame: target_frame.to_string(),
                source_frame: source_frame.to_string(),
                waited_s: waited.as_secs_f64(),
            });
        }
        thread::sleep(poll_interval.min(timeout - waited));
    }
}

/// The two static transforms shared by all particles.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorTransforms {
    /// Sonar frame expressed in the vehicle body frame
    pub base_to_sonar: Isometry3<f64>,
    /// Odometry frame expressed in the map frame
    pub map_to_odom: Isometry3<f64>,
    /// Set when a start-up lookup failed and identity was substituted
    pub degraded: bool,
}
impl Default for SensorTransforms {
    fn default() -> Self {
        SensorTransforms::new(Isometry3::identity(), Isometry3::identity())
    }
}
impl SensorTransforms {
    pub fn new(base_to_sonar: Isometry3<f64>, map_to_odom: Isometry3<f64>) -> Self {
        SensorTransforms {
            base_to_sonar,
            map_to_odom,
            degraded: false,
        }
    }

    /// Look up both transforms with the configured bounded wait.
    ///
    /// Failures are logged and replaced by identity; the returned value then has `degraded` set.
    pub fn acquire<S: TransformSource + ?Sized>(source: &S, config: &FilterConfig) -> Self {
        let timeout = Duration::from_secs_f64(config.transform_timeout_s.max(0.0));
        let poll = Duration::from_millis(50);
        info!("Waiting for transforms");
        let mount = lookup_with_timeout(
            source,
            &config.base_frame,
            &config.sonar_frame,
            timeout,
            poll,
        );
        let alignment = lookup_with_timeout(
            source,
            &config.map_frame,
            &config.odom_frame,
            timeout,
            poll,
        );
        let mut degraded = false;
        let base_to_sonar = mount.unwrap_or_else(|e| {
            error!("Could not look up sonar mount transform: {e}; continuing with identity");
            degraded = true;
            Isometry3::identity()
        });
        let map_to_odom = alignment.unwrap_or_else(|e| {
            error!("Could not look up map alignment transform: {e}; continuing with identity");
            degraded = true;
            Isometry3::identity()
        });
        if !degraded {
            info!("Transforms locked");
        }
        SensorTransforms {
            base_to_sonar,
            map_to_odom,
            degraded,
        }
    }

    /// Pose of the sonar in the map frame for a vehicle at `vehicle` (odometry frame).
    pub fn sonar_in_map(&self, vehicle: &Pose) -> Isometry3<f64> {
        self.map_to_odom * vehicle.to_isometry() * self.base_to_sonar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{Point3, Translation3, UnitQuaternion};

    #[test]
    fn static_lookup_inverts_reverse_direction() {
        let mut table = StaticTransforms::new();
        table.insert(
            "a",
            "b",
            Isometry3::from_parts(Translation3::new(1.0, 2.0, 3.0), UnitQuaternion::identity()),
        );
        let forward = table.lookup("a", "b").unwrap();
        let reverse = table.lookup("b", "a").unwrap();
        let p = forward * reverse * Point3::new(4.0, 5.0, 6.0);
        assert_approx_eq!(p.x, 4.0, 1e-12);
        assert!(table.lookup("a", "c").is_none());
    }

    #[test]
    fn lookup_with_timeout_gives_up() {
        let table = StaticTransforms::new();
        let result = lookup_with_timeout(
            &table,
            "map",
            "odom",
            Duration::from_millis(20),
            Duration::from_millis(5),
        );
        assert!(matches!(result, Err(FilterError::TransformUnavailable { .. })));
    }

    #[test]
    fn acquire_degrades_instead_of_failing() {
        let config = FilterConfig {
            transform_timeout_s: 0.01,
            ..FilterConfig::default()
        };
        let transforms = SensorTransforms::acquire(&StaticTransforms::new(), &config);
        assert!(transforms.degraded);
        assert_eq!(transforms.base_to_sonar, Isometry3::identity());
    }

    #[test]
    fn acquire_reads_configured_transforms() {
        let config = FilterConfig {
            sonar_mount: [0.5, 0.0, -1.0, 0.0, 0.0, 0.0],
            map_to_odom: [100.0, 200.0, 0.0, 0.0, 0.0, 0.0],
            ..FilterConfig::default()
        };
        let transforms = SensorTransforms::acquire(&StaticTransforms::from_config(&config), &config);
        assert!(!transforms.degraded);
        let sonar = transforms.sonar_in_map(&Pose::new(1.0, 2.0, -10.0, 0.0, 0.0, 0.0));
        let t = sonar.translation.vector;
        assert_approx_eq!(t[0], 101.5, 1e-12);
        assert_approx_eq!(t[1], 202.0, 1e-12);
        assert_approx_eq!(t[2], -11.0, 1e-12);
    }
}
