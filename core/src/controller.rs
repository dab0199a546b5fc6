//! Event-driven filter controller.
//!
//! [`FilterController`] owns the particle population and the two scan buffers used to detect new sonar data:
//! the latest scan received and the stamp of the last scan consumed by an update. It is a small state machine
//!
//! ```text
//! AwaitingFirstOdom --(second odometry)--> Running
//! ```
//!
//! driven by two input kinds:
//!
//! - **Sonar scan**: replaces the buffered latest scan. Never touches particle state.
//! - **Odometry at time `t`**: the first message only starts the clock. Afterwards, if `t > old_time`, the
//!   population is predicted over `dt = t - old_time`; if the buffered scan is newer than the last consumed
//!   one, the scan is converted into sonar-frame ranges, the particles are re-weighted and adaptively
//!   resampled, and the scan is marked consumed. An output is then published. `old_time` always advances to
//!   `t`, so late or duplicate stamps are absorbed without running a cycle.
//!
//! Only the odometry path mutates the population and every call runs to completion, so a single owner (the
//! filter thread started by [`FilterController::spawn`] or a caller replaying an
//! [`crate::messages::EventStream`]) needs no locks.
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};

use crate::config::FilterConfig;
use crate::messages::Event;
use crate::models::{Bathymetry, MultibeamSonar, OdometryMotionModel, scan_to_ranges};
use crate::particle::ParticleModels;
use crate::population::{ParticlePopulation, PoseEstimate, ResampleOutcome};
use crate::transforms::{SensorTransforms, TransformSource};
use crate::{FilterError, Odometry, Pose, Result, SonarScan};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    AwaitingFirstOdom,
    Running,
}

/// What an odometry message did to the filter.
#[derive(Clone, Debug, PartialEq)]
pub enum OdometryOutcome {
    /// First message; the clock now starts at its stamp.
    ClockStarted,
    /// Stamp not after `old_time`; nothing ran but the clock moved to `stamp`.
    OutOfOrder { stamp: f64, old_time: f64 },
    /// A full cycle ran and produced an output.
    Processed(FilterOutput),
}
impl OdometryOutcome {
    pub fn into_output(self) -> Option<FilterOutput> {
        match self {
            OdometryOutcome::Processed(output) => Some(output),
            _ => None,
        }
    }
}

/// Running totals of the work done by the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub predictions: usize,
    pub updates: usize,
    pub resamples: usize,
    pub degenerate: usize,
    pub out_of_order: usize,
    pub scans_received: usize,
}

/// Published once per processed odometry message.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterOutput {
    pub stamp: f64,
    /// Every particle pose, in slot order
    pub particles: Vec<Pose>,
    pub estimate: PoseEstimate,
    /// Simulated ranges at the estimated pose
    pub predicted_ranges: Vec<f64>,
    /// Whether this cycle consumed a new scan
    pub updated: bool,
    pub resample: Option<ResampleOutcome>,
}

#[derive(Debug)]
pub struct FilterController {
    population: ParticlePopulation,
    transforms: SensorTransforms,
    state: ControllerState,
    latest_scan: Option<SonarScan>,
    consumed_scan_stamp: Option<f64>,
    stats: CycleStats,
}

impl FilterController {
    /// Validate the configuration and spawn the population around `initial_pose`.
    pub fn new(
        config: &FilterConfig,
        models: Arc<ParticleModels>,
        initial_pose: &Pose,
    ) -> Result<Self> {
        config.validate()?;
        let transforms = models.transforms.clone();
        let population = ParticlePopulation::new(config, models, initial_pose);
        info!(
            "Filter created with {} particles, {:?} resampling, {:?} averaging",
            config.num_particles, config.resampling_strategy, config.averaging_strategy
        );
        Ok(Self::from_population(population, transforms))
    }

    /// Build the default odometry and multibeam models over `seabed` and acquire the fixed transforms
    /// from `source` with the configured bounded wait.
    pub fn with_default_models<S: TransformSource + ?Sized>(
        config: &FilterConfig,
        seabed: Arc<Bathymetry>,
        source: &S,
        initial_pose: &Pose,
    ) -> Result<Self> {
        config.validate()?;
        let transforms = SensorTransforms::acquire(source, config);
        let models = Arc::new(ParticleModels {
            motion: Box::new(OdometryMotionModel),
            measurement: Box::new(MultibeamSonar::new(
                seabed,
                config.sonar.num_beams,
                config.sonar.swath_angle_rad,
                config.sonar.max_range_m,
            )),
            transforms,
            motion_covariance: config.motion_covariance,
            measurement_variance: config.measurement_variance,
        });
        Self::new(config, models, initial_pose)
    }

    /// Wrap an existing population.
    pub fn from_population(population: ParticlePopulation, transforms: SensorTransforms) -> Self {
        if transforms.degraded {
            warn!("Filter running with identity transforms; estimates may be offset");
        }
        FilterController {
            population,
            transforms,
            state: ControllerState::AwaitingFirstOdom,
            latest_scan: None,
            consumed_scan_stamp: None,
            stats: CycleStats::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }
    pub fn stats(&self) -> CycleStats {
        self.stats
    }
    pub fn population(&self) -> &ParticlePopulation {
        &self.population
    }
    pub fn transforms(&self) -> &SensorTransforms {
        &self.transforms
    }
    pub fn latest_scan(&self) -> Option<&SonarScan> {
        self.latest_scan.as_ref()
    }

    /// Buffer a scan, replacing any unconsumed one.
    pub fn on_sonar(&mut self, scan: SonarScan) {
        if let Some(previous) = self.latest_scan.as_ref().filter(|_| self.has_new_scan()) {
            debug!(
                "Scan at {:.3} s dropped unconsumed in favour of {:.3} s",
                previous.stamp, scan.stamp
            );
        }
        self.stats.scans_received += 1;
        self.latest_scan = Some(scan);
    }

    fn has_new_scan(&self) -> bool {
        match (&self.latest_scan, self.consumed_scan_stamp) {
            (Some(scan), Some(consumed)) => scan.stamp > consumed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Run one filter cycle for an odometry message.
    pub fn on_odometry(&mut self, odom: &Odometry) -> OdometryOutcome {
        let t = odom.stamp;
        let previous = self.population.tick(t);
        let outcome = match previous {
            None => {
                debug!("First odometry at {t:.3} s, clock started");
                OdometryOutcome::ClockStarted
            }
            Some(old_time) if t > old_time => {
                self.state = ControllerState::Running;
                OdometryOutcome::Processed(self.cycle(odom, t - old_time))
            }
            Some(old_time) => {
                debug!("Odometry at {t:.3} s is not after {old_time:.3} s; skipping cycle");
                self.stats.out_of_order += 1;
                OdometryOutcome::OutOfOrder { stamp: t, old_time }
            }
        };
        self.population.settle_clock();
        outcome
    }

    fn cycle(&mut self, odom: &Odometry, dt: f64) -> FilterOutput {
        self.population.predict(odom, dt);
        self.stats.predictions += 1;

        let mut resample = None;
        let updated = self.has_new_scan();
        if let Some(scan) = self.latest_scan.as_ref().filter(|_| updated) {
            let map_to_sonar = self.transforms.sonar_in_map(&odom.pose);
            let ranges = scan_to_ranges(scan, &map_to_sonar);
            let weights = self.population.compute_weights(&ranges);
            let outcome = self.population.maybe_resample(&weights);
            match outcome {
                ResampleOutcome::Resampled { .. } => self.stats.resamples += 1,
                ResampleOutcome::Degenerate => self.stats.degenerate += 1,
                ResampleOutcome::Skipped { .. } => {}
            }
            self.consumed_scan_stamp = Some(scan.stamp);
            self.stats.updates += 1;
            resample = Some(outcome);
        }

        let mut output = self.output(odom.stamp);
        output.updated = updated;
        output.resample = resample;
        output
    }

    fn output(&self, stamp: f64) -> FilterOutput {
        let estimate = self.population.estimate(stamp);
        let predicted_ranges = self.population.predict_meas(&estimate.pose);
        FilterOutput {
            stamp,
            particles: self.population.poses(),
            estimate,
            predicted_ranges,
            updated: false,
            resample: None,
        }
    }

    /// Output built from the current population without running a cycle.
    pub fn snapshot(&self) -> FilterOutput {
        self.output(self.population.old_time().unwrap_or(0.0))
    }

    /// Dispatch an event, returning the output of a processed cycle.
    pub fn handle(&mut self, event: Event) -> Option<FilterOutput> {
        match event {
            Event::Sonar(scan) => {
                self.on_sonar(scan);
                None
            }
            Event::Odometry(odom) => self.on_odometry(&odom).into_output(),
        }
    }

    /// Publish a start-up snapshot, then process events until the input channel closes.
    pub fn run(&mut self, events: Receiver<Event>, outputs: Sender<FilterOutput>) -> Result<()> {
        outputs
            .send(self.snapshot())
            .map_err(|_| FilterError::ChannelClosed)?;
        for event in events.iter() {
            if let Some(output) = self.handle(event) {
                outputs
                    .send(output)
                    .map_err(|_| FilterError::ChannelClosed)?;
            }
        }
        info!(
            "Input closed after {} predictions, {} updates, {} resamples",
            self.stats.predictions, self.stats.updates, self.stats.resamples
        );
        Ok(())
    }

    /// Move the controller onto its own thread connected by unbounded channels.
    ///
    /// Dropping the returned sender stops the thread; joining it gives back the controller.
    pub fn spawn(
        mut self,
    ) -> (
        Sender<Event>,
        Receiver<FilterOutput>,
        JoinHandle<Result<FilterController>>,
    ) {
        let (event_tx, event_rx) = channel::unbounded();
        let (output_tx, output_rx) = channel::unbounded();
        let handle = thread::spawn(move || {
            self.run(event_rx, output_tx)?;
            Ok(self)
        });
        (event_tx, output_rx, handle)
    }
}
