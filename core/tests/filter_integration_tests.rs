//! End-to-end tests of the particle filter on simulated surveys
//!
//! These tests drive the public API the way an application would: build a configuration, simulate a survey
//! over a synthetic seabed, and feed its odometry and sonar events through a [`FilterController`] either
//! directly or over channels. They verify that:
//! 1. Every resampling and averaging strategy runs a full survey with a fixed population size
//! 2. Terrain updates pull the estimate back towards the truth when odometry drifts
//! 3. The channel-driven filter thread produces the same outputs as direct replay
//! 4. Custom motion and measurement models plug into the population unchanged
//!
//! The error bounds are regression checks observed on the synthetic seabed, not design goals.
use std::sync::Arc;

use assert_approx_eq::assert_approx_eq;
use nalgebra::Vector6;

use auvpf::config::{FilterConfig, SonarConfig};
use auvpf::controller::{FilterController, FilterOutput, OdometryOutcome};
use auvpf::messages::Event;
use auvpf::models::{MeasurementModel, MotionModel};
use auvpf::particle::ParticleModels;
use auvpf::population::AveragingStrategy;
use auvpf::resampling::ResamplingStrategy;
use auvpf::sim::{SurveyScenario, SurveySummary, run_survey};
use auvpf::transforms::{SensorTransforms, StaticTransforms};
use auvpf::{Odometry, Pose};

fn config(num_particles: usize) -> FilterConfig {
    FilterConfig {
        num_particles,
        seed: Some(2024),
        sonar: SonarConfig {
            num_beams: 24,
            ..SonarConfig::default()
        },
        ..FilterConfig::default()
    }
}

fn scenario(duration_s: f64) -> SurveyScenario {
    SurveyScenario {
        duration_s,
        map_half_extent_m: 200.0,
        ..SurveyScenario::default()
    }
}

#[test]
fn every_strategy_completes_a_survey() {
    for resampling in [
        ResamplingStrategy::Residual,
        ResamplingStrategy::Systematic,
        ResamplingStrategy::Stratified,
        ResamplingStrategy::Naive,
    ] {
        for averaging in [
            AveragingStrategy::Unweighted,
            AveragingStrategy::Weighted,
            AveragingStrategy::HighestWeight,
        ] {
            let cfg = FilterConfig {
                resampling_strategy: resampling,
                averaging_strategy: averaging,
                ..config(30)
            };
            let records = run_survey(&cfg, &scenario(5.0)).expect("survey failed");
            assert_eq!(records.len(), 50, "{resampling:?}/{averaging:?}");
            assert!(
                records
                    .iter()
                    .all(|r| r.error_m.is_finite() && r.est_yaw.abs() <= std::f64::consts::PI),
                "{resampling:?}/{averaging:?} produced a non-finite estimate"
            );
        }
    }
}

#[test]
fn terrain_updates_bound_odometry_drift() {
    let cfg = config(100);
    let drifting = SurveyScenario {
        velocity_bias_mps: 0.3,
        ..scenario(30.0)
    };
    let records = run_survey(&cfg, &drifting).expect("survey failed");
    let summary = SurveySummary::from_records(&records);
    assert_eq!(summary.updates, 30);
    assert!(summary.final_dr_error_m > 8.0);
    let tail: Vec<f64> = records.iter().rev().take(50).map(|r| r.error_m).collect();
    let tail_mean = tail.iter().sum::<f64>() / tail.len() as f64;
    assert!(
        tail_mean < 0.75 * summary.final_dr_error_m,
        "filter error {tail_mean:.2} m vs dead reckoning {:.2} m",
        summary.final_dr_error_m
    );
}

#[test]
fn filter_thread_matches_direct_replay() {
    let cfg = config(20);
    let survey = scenario(3.0);
    let seabed = Arc::new(survey.seabed());
    let data = survey.generate(&cfg, seabed.clone()).unwrap();
    let build = || {
        FilterController::with_default_models(
            &cfg,
            seabed.clone(),
            &StaticTransforms::from_config(&cfg),
            &survey.start,
        )
        .unwrap()
    };

    let mut direct = build();
    let replayed: Vec<FilterOutput> = data
        .events
        .events
        .iter()
        .cloned()
        .filter_map(|event| direct.handle(event))
        .collect();

    let (tx, rx, handle) = build().spawn();
    for event in data.events.events.iter().cloned() {
        tx.send(event).unwrap();
    }
    drop(tx);
    let threaded: Vec<FilterOutput> = rx.iter().collect();
    let finished = handle.join().unwrap().unwrap();

    // the thread publishes a start-up snapshot first
    assert_eq!(threaded.len(), replayed.len() + 1);
    assert_eq!(&threaded[1..], &replayed[..]);
    assert_eq!(finished.stats(), direct.stats());
    assert_eq!(finished.stats().predictions, 30);
    assert_eq!(finished.stats().updates, 3);
}

#[test]
fn config_file_drives_the_filter() {
    let path = std::env::temp_dir().join("auvpf_integration_config.yaml");
    let written = FilterConfig {
        resampling_strategy: ResamplingStrategy::Stratified,
        jitter_covariance: [1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        ..config(12)
    };
    written.to_file(&path).unwrap();
    let cfg = FilterConfig::from_file(&path).unwrap();
    assert_eq!(cfg, written);

    let records = run_survey(&cfg, &scenario(2.0)).unwrap();
    assert_eq!(records.len(), 20);
    let _ = std::fs::remove_file(&path);
}

/// Moves every particle by a fixed step per second along x.
struct ConstantDrift;
impl MotionModel for ConstantDrift {
    fn predict(&self, pose: &Pose, _control: &Odometry, dt: f64, noise: &Vector6<f64>) -> Pose {
        Pose {
            x: pose.x + 2.0 * dt + noise[0],
            ..*pose
        }
    }
}

/// Reports the vehicle depth as a single range.
struct DepthGauge;
impl MeasurementModel for DepthGauge {
    fn simulate(&self, pose: &Pose, _transforms: &SensorTransforms) -> Vec<f64> {
        vec![-pose.z]
    }
}

#[test]
fn custom_models_plug_into_the_controller() {
    let cfg = FilterConfig {
        motion_covariance: [0.0; 6],
        init_covariance: [0.0; 6],
        ..config(5)
    };
    let models = Arc::new(ParticleModels {
        motion: Box::new(ConstantDrift),
        measurement: Box::new(DepthGauge),
        transforms: SensorTransforms::default(),
        motion_covariance: cfg.motion_covariance,
        measurement_variance: cfg.measurement_variance,
    });
    let mut filter =
        FilterController::new(&cfg, models, &Pose::new(0.0, 0.0, -15.0, 0.0, 0.0, 0.0)).unwrap();

    let tick = |stamp: f64| Event::Odometry(Odometry {
        stamp,
        ..Odometry::default()
    });
    assert!(filter.handle(tick(0.0)).is_none());
    let out = filter.handle(tick(1.5)).unwrap();
    assert_approx_eq!(out.estimate.pose.x, 3.0, 1e-12);
    assert_eq!(out.predicted_ranges, vec![15.0]);
    assert!(out.particles.iter().all(|p| p.z == -15.0));
    assert_eq!(
        filter.on_odometry(&Odometry {
            stamp: 1.0,
            ..Odometry::default()
        }),
        OdometryOutcome::OutOfOrder {
            stamp: 1.0,
            old_time: 1.5
        }
    );
}

#[test]
fn invalid_config_is_rejected() {
    let cfg = FilterConfig {
        num_particles: 0,
        ..config(1)
    };
    assert!(run_survey(&cfg, &scenario(1.0)).is_err());
}
