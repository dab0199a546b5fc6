//! Synthetic AUV survey used to exercise the filter end-to-end.
//!
//! This module provides:
//! - [`SurveyScenario`]: a ground-truth vehicle moving at constant speed and turn rate over a hilly synthetic
//!   seabed, with a dead-reckoning sensor whose velocity errors make the odometry drift.
//! - [`SurveyScenario::generate`]: the odometry and sonar [`EventStream`] of the survey together with the
//!   true and dead-reckoned trajectories.
//! - [`run_survey`]: replays the stream through a [`FilterController`] and collects [`EstimateRecord`]s.
//! - CSV import/export for the records.
use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use nalgebra::{Vector3, Vector6};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::controller::{FilterController, FilterOutput};
use crate::messages::{EventStream, build_event_stream};
use crate::models::{Bathymetry, MotionModel, MultibeamSonar, OdometryMotionModel};
use crate::population::ResampleOutcome;
use crate::transforms::{SensorTransforms, StaticTransforms};
use crate::{FilterError, Odometry, Pose, Result, SonarScan, isometry_from_components};

/// Parameters of a synthetic survey.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyScenario {
    pub duration_s: f64,
    pub odom_rate_hz: f64,
    /// Scans are emitted on every odometry tick closest to this rate
    pub sonar_rate_hz: f64,
    /// True forward speed (m/s)
    pub speed_mps: f64,
    /// True turn rate (rad/s)
    pub yaw_rate_rps: f64,
    /// True starting pose in the odometry frame
    pub start: Pose,
    /// Standard deviation of the forward/lateral velocity error (m/s)
    pub velocity_noise_std: f64,
    /// Constant forward velocity error (m/s)
    pub velocity_bias_mps: f64,
    /// Standard deviation of the turn-rate error (rad/s)
    pub yaw_rate_noise_std: f64,
    /// Mean seabed elevation (m, negative below the surface)
    pub seabed_elevation_m: f64,
    pub hill_amplitude_m: f64,
    pub hill_wavelength_m: f64,
    /// The seabed grid covers `[-half_extent, half_extent]^2`
    pub map_half_extent_m: f64,
    pub map_resolution_m: f64,
    pub seed: u64,
}
impl Default for SurveyScenario {
    fn default() -> Self {
        SurveyScenario {
            duration_s: 60.0,
            odom_rate_hz: 10.0,
            sonar_rate_hz: 1.0,
            speed_mps: 1.5,
            yaw_rate_rps: 0.01,
            start: Pose::new(0.0, 0.0, -20.0, 0.0, 0.0, 0.0),
            velocity_noise_std: 0.05,
            velocity_bias_mps: 0.05,
            yaw_rate_noise_std: 0.002,
            seabed_elevation_m: -60.0,
            hill_amplitude_m: 8.0,
            hill_wavelength_m: 80.0,
            map_half_extent_m: 300.0,
            map_resolution_m: 5.0,
            seed: 42,
        }
    }
}

/// Events of a survey with the trajectories behind them.
///
/// `truth[i]` and `dead_reckoning[i]` belong to the `i`-th odometry event of `events`.
#[derive(Clone, Debug)]
pub struct SurveyData {
    pub events: EventStream,
    pub truth: Vec<Pose>,
    pub dead_reckoning: Vec<Pose>,
}

impl SurveyScenario {
    /// Sinusoidal hills over a level seabed.
    pub fn seabed(&self) -> Bathymetry {
        let cells = ((2.0 * self.map_half_extent_m / self.map_resolution_m).ceil() as usize + 1).max(2);
        let k = 2.0 * PI / self.hill_wavelength_m;
        let (mean, amplitude) = (self.seabed_elevation_m, self.hill_amplitude_m);
        Bathymetry::from_fn(
            (-self.map_half_extent_m, -self.map_half_extent_m),
            self.map_resolution_m,
            cells,
            cells,
            move |x, y| mean + amplitude * (k * x).sin() * (0.7 * k * y).cos(),
        )
    }

    /// Simulate the survey: odometry on every tick, sonar scans on every `odom_rate / sonar_rate`-th tick.
    ///
    /// Scans are ranged from the true pose and georeferenced with the dead-reckoned pose of the same tick,
    /// the way a vehicle without external positioning would store them.
    pub fn generate(&self, config: &FilterConfig, seabed: Arc<Bathymetry>) -> Result<SurveyData> {
        if !(self.odom_rate_hz > 0.0 && self.sonar_rate_hz > 0.0 && self.duration_s >= 0.0) {
            return Err(FilterError::InvalidConfig(
                "survey rates must be positive and duration non-negative".to_string(),
            ));
        }
        let velocity_noise = Normal::new(0.0, self.velocity_noise_std)
            .map_err(|e| FilterError::InvalidConfig(format!("velocity_noise_std: {e}")))?;
        let yaw_noise = Normal::new(0.0, self.yaw_rate_noise_std)
            .map_err(|e| FilterError::InvalidConfig(format!("yaw_rate_noise_std: {e}")))?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let sonar = MultibeamSonar::new(
            seabed,
            config.sonar.num_beams,
            config.sonar.swath_angle_rad,
            config.sonar.max_range_m,
        );
        let transforms = SensorTransforms::new(
            isometry_from_components(&config.sonar_mount),
            isometry_from_components(&config.map_to_odom),
        );
        let motion = OdometryMotionModel;
        let no_noise = Vector6::zeros();

        let dt = 1.0 / self.odom_rate_hz;
        let steps = (self.duration_s * self.odom_rate_hz).round() as usize;
        let scan_every = (self.odom_rate_hz / self.sonar_rate_hz).round().max(1.0) as usize;
        let true_control = |stamp: f64| Odometry {
            stamp,
            pose: Pose::default(),
            linear_velocity: Vector3::new(self.speed_mps, 0.0, 0.0),
            angular_velocity: Vector3::new(0.0, 0.0, self.yaw_rate_rps),
        };

        let mut truth = vec![self.start];
        let mut dead_reckoning = vec![self.start];
        let mut odometry = vec![Odometry {
            pose: self.start,
            ..true_control(0.0)
        }];
        let mut scans = Vec::new();
        for step in 1..=steps {
            let stamp = step as f64 * dt;
            let true_ctrl = true_control(stamp);
            let measured = Odometry {
                stamp,
                pose: Pose::default(),
                linear_velocity: Vector3::new(
                    self.speed_mps + self.velocity_bias_mps + velocity_noise.sample(&mut rng),
                    velocity_noise.sample(&mut rng),
                    0.0,
                ),
                angular_velocity: Vector3::new(
                    0.0,
                    0.0,
                    self.yaw_rate_rps + yaw_noise.sample(&mut rng),
                ),
            };
            let true_pose = motion.predict(&truth[step - 1], &true_ctrl, dt, &no_noise);
            let dr_pose = motion.predict(&dead_reckoning[step - 1], &measured, dt, &no_noise);

            if step % scan_every == 0 {
                let ranges = sonar.ranges_from(&transforms.sonar_in_map(&true_pose));
                let points = sonar.points_from_ranges(&ranges, &transforms.sonar_in_map(&dr_pose));
                scans.push(SonarScan::new(stamp, points));
            }
            odometry.push(Odometry {
                pose: dr_pose,
                ..measured
            });
            truth.push(true_pose);
            dead_reckoning.push(dr_pose);
        }

        Ok(SurveyData {
            events: build_event_stream(odometry, scans, Utc::now()),
            truth,
            dead_reckoning,
        })
    }
}

/// One row of filter output compared against ground truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    /// Date-time string (RFC 3339)
    pub time: String,
    /// Seconds since the start of the survey
    pub elapsed_s: f64,
    pub true_x: f64,
    pub true_y: f64,
    pub true_z: f64,
    pub true_yaw: f64,
    pub est_x: f64,
    pub est_y: f64,
    pub est_z: f64,
    pub est_yaw: f64,
    /// Particle spread along x and y (1 sigma, meters)
    pub std_x: f64,
    pub std_y: f64,
    /// Horizontal distance between estimate and truth
    pub error_m: f64,
    /// Horizontal distance between dead reckoning and truth
    pub dr_error_m: f64,
    pub updated: bool,
    pub resampled: bool,
    /// Effective sample size of this cycle's update, empty without one
    pub n_eff: Option<f64>,
}
impl EstimateRecord {
    fn from_output(
        output: &FilterOutput,
        time: DateTime<Utc>,
        truth: &Pose,
        dead_reckoning: &Pose,
    ) -> Self {
        let est = &output.estimate.pose;
        let cov = &output.estimate.covariance;
        let n_eff = match output.resample {
            Some(ResampleOutcome::Resampled { n_eff, .. }) | Some(ResampleOutcome::Skipped { n_eff }) => {
                Some(n_eff)
            }
            _ => None,
        };
        EstimateRecord {
            time: time.to_rfc3339(),
            elapsed_s: output.stamp,
            true_x: truth.x,
            true_y: truth.y,
            true_z: truth.z,
            true_yaw: truth.yaw,
            est_x: est.x,
            est_y: est.y,
            est_z: est.z,
            est_yaw: est.yaw,
            std_x: cov[(0, 0)].max(0.0).sqrt(),
            std_y: cov[(1, 1)].max(0.0).sqrt(),
            error_m: est.horizontal_distance(truth),
            dr_error_m: dead_reckoning.horizontal_distance(truth),
            updated: output.updated,
            resampled: matches!(output.resample, Some(ResampleOutcome::Resampled { .. })),
            n_eff,
        }
    }

    /// Reads records from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            records.push(result.map_err(csv_error)?);
        }
        Ok(records)
    }

    /// Writes records to a CSV file with a header row.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
        for record in records {
            writer.serialize(record).map_err(csv_error)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn csv_error(e: csv::Error) -> FilterError {
    FilterError::Format(e.to_string())
}

/// Aggregate accuracy of a survey run.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SurveySummary {
    pub cycles: usize,
    pub updates: usize,
    pub resamples: usize,
    pub mean_error_m: f64,
    pub final_error_m: f64,
    pub final_dr_error_m: f64,
}
impl SurveySummary {
    pub fn from_records(records: &[EstimateRecord]) -> Self {
        let Some(last) = records.last() else {
            return SurveySummary::default();
        };
        SurveySummary {
            cycles: records.len(),
            updates: records.iter().filter(|r| r.updated).count(),
            resamples: records.iter().filter(|r| r.resampled).count(),
            mean_error_m: records.iter().map(|r| r.error_m).sum::<f64>() / records.len() as f64,
            final_error_m: last.error_m,
            final_dr_error_m: last.dr_error_m,
        }
    }
}

/// Run the filter over a simulated survey and compare every output with ground truth.
///
/// The filter starts at the scenario's true start pose, spread by the configured initial covariance.
pub fn run_survey(config: &FilterConfig, scenario: &SurveyScenario) -> Result<Vec<EstimateRecord>> {
    let seabed = Arc::new(scenario.seabed());
    let data = scenario.generate(config, seabed.clone())?;
    info!(
        "Simulated {:.1} s survey: {} odometry messages, {} scans",
        data.events.duration(),
        data.events.odometry_count(),
        data.events.scan_count()
    );
    let mut controller = FilterController::with_default_models(
        config,
        seabed,
        &StaticTransforms::from_config(config),
        &scenario.start,
    )?;

    let start_time = data.events.start_time;
    let mut records = Vec::with_capacity(data.truth.len());
    let mut tick = 0usize;
    for event in data.events.events {
        let is_odometry = event.is_odometry();
        if let Some(output) = controller.handle(event) {
            let time = start_time + chrono::Duration::microseconds((output.stamp * 1e6).round() as i64);
            records.push(EstimateRecord::from_output(
                &output,
                time,
                &data.truth[tick],
                &data.dead_reckoning[tick],
            ));
        }
        if is_odometry {
            tick += 1;
        }
    }

    let summary = SurveySummary::from_records(&records);
    info!(
        "Survey finished: {} cycles, {} updates, {} resamples, mean error {:.2} m, final error {:.2} m (dead reckoning {:.2} m)",
        summary.cycles,
        summary.updates,
        summary.resamples,
        summary.mean_error_m,
        summary.final_error_m,
        summary.final_dr_error_m
    );
    Ok(records)
}
