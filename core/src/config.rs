//! Filter configuration.
//!
//! [`FilterConfig`] collects every tunable the filter recognizes. It can be written to and read from JSON,
//! YAML or TOML, choosing the format by file extension. Every field has a default so partial files are
//! accepted.
//!
//! Covariances were historically passed around as bracketed strings (`"[0.1, 0.1, 0.0, 0.0, 0.0, 0.01]"`);
//! [`parse_covariance`] accepts that form and [`covariance_or_default`] falls back to a default with a
//! warning when the string is malformed, so a bad launch parameter degrades rather than aborts start-up.
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::population::AveragingStrategy;
use crate::resampling::ResamplingStrategy;
use crate::{FilterError, Result};

pub const DEFAULT_NUM_PARTICLES: usize = 10;
pub const DEFAULT_MEASUREMENT_VARIANCE: f64 = 0.01;
pub const DEFAULT_MOTION_COVARIANCE: [f64; 6] = [0.01, 0.01, 0.0, 0.0, 0.0, 0.001];
pub const DEFAULT_INIT_COVARIANCE: [f64; 6] = [1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
pub const DEFAULT_JITTER_COVARIANCE: [f64; 6] = [3.0, 3.0, 0.0, 0.0, 0.0, 0.0];
pub const DEFAULT_RESAMPLING_THRESHOLD: f64 = 0.5;
/// Added to every raw weight before normalization. Must be small next to meaningful likelihood
/// differences but large enough that the weight sum never underflows to zero.
pub const DEFAULT_WEIGHT_FLOOR: f64 = 1e-30;
pub const DEFAULT_TRANSFORM_TIMEOUT_S: f64 = 10.0;

fn default_num_particles() -> usize {
    DEFAULT_NUM_PARTICLES
}
fn default_map_frame() -> String {
    "map".to_string()
}
fn default_odom_frame() -> String {
    "odom".to_string()
}
fn default_base_frame() -> String {
    "base_link".to_string()
}
fn default_sonar_frame() -> String {
    "mbes_link".to_string()
}
fn default_measurement_variance() -> f64 {
    DEFAULT_MEASUREMENT_VARIANCE
}
fn default_motion_covariance() -> [f64; 6] {
    DEFAULT_MOTION_COVARIANCE
}
fn default_init_covariance() -> [f64; 6] {
    DEFAULT_INIT_COVARIANCE
}
fn default_jitter_covariance() -> [f64; 6] {
    DEFAULT_JITTER_COVARIANCE
}
fn default_resampling_threshold() -> f64 {
    DEFAULT_RESAMPLING_THRESHOLD
}
fn default_weight_floor() -> f64 {
    DEFAULT_WEIGHT_FLOOR
}
fn default_transform_timeout_s() -> f64 {
    DEFAULT_TRANSFORM_TIMEOUT_S
}
fn default_sonar_mount() -> [f64; 6] {
    [0.0, 0.0, -0.5, 0.0, 0.0, 0.0]
}

/// Multibeam geometry used by the sonar simulator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonarConfig {
    /// Number of beams in the fan
    pub num_beams: usize,
    /// Full across-track opening angle of the fan (radians)
    pub swath_angle_rad: f64,
    /// Beams that do not reach the seabed within this range report it
    pub max_range_m: f64,
}
impl Default for SonarConfig {
    fn default() -> Self {
        SonarConfig {
            num_beams: 64,
            swath_angle_rad: 2.1,
            max_range_m: 150.0,
        }
    }
}

/// Particle filter configuration.
///
/// ## Example
///
/// ```
/// use auvpf::config::FilterConfig;
/// use auvpf::resampling::ResamplingStrategy;
///
/// let cfg = FilterConfig {
///     num_particles: 200,
///     resampling_strategy: ResamplingStrategy::Systematic,
///     seed: Some(7),
///     ..FilterConfig::default()
/// };
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    #[serde(default = "default_map_frame")]
    pub map_frame: String,
    #[serde(default = "default_odom_frame")]
    pub odom_frame: String,
    #[serde(default = "default_base_frame")]
    pub base_frame: String,
    #[serde(default = "default_sonar_frame")]
    pub sonar_frame: String,
    /// Per-beam range variance (m^2)
    #[serde(default = "default_measurement_variance")]
    pub measurement_variance: f64,
    /// Process noise variances per second for [x, y, z, roll, pitch, yaw]
    #[serde(default = "default_motion_covariance")]
    pub motion_covariance: [f64; 6],
    /// Variances of the initial particle spread
    #[serde(default = "default_init_covariance")]
    pub init_covariance: [f64; 6],
    #[serde(default)]
    pub resampling_strategy: ResamplingStrategy,
    /// Resample when N_eff drops below this fraction of N
    #[serde(default = "default_resampling_threshold")]
    pub resampling_threshold: f64,
    /// Variances of the jitter applied to every particle after resampling
    #[serde(default = "default_jitter_covariance")]
    pub jitter_covariance: [f64; 6],
    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,
    #[serde(default)]
    pub averaging_strategy: AveragingStrategy,
    /// RNG seed; `None` draws a fresh seed per run
    #[serde(default)]
    pub seed: Option<u64>,
    /// Bounded wait for the start-up transform lookups
    #[serde(default = "default_transform_timeout_s")]
    pub transform_timeout_s: f64,
    /// Sonar pose in the vehicle frame, [x, y, z, roll, pitch, yaw]
    #[serde(default = "default_sonar_mount")]
    pub sonar_mount: [f64; 6],
    /// Odometry frame pose in the map frame, [x, y, z, roll, pitch, yaw]
    #[serde(default)]
    pub map_to_odom: [f64; 6],
    #[serde(default)]
    pub sonar: SonarConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: default_num_particles(),
            map_frame: default_map_frame(),
            odom_frame: default_odom_frame(),
            base_frame: default_base_frame(),
            sonar_frame: default_sonar_frame(),
            measurement_variance: default_measurement_variance(),
            motion_covariance: default_motion_covariance(),
            init_covariance: default_init_covariance(),
            resampling_strategy: ResamplingStrategy::default(),
            resampling_threshold: default_resampling_threshold(),
            jitter_covariance: default_jitter_covariance(),
            weight_floor: default_weight_floor(),
            averaging_strategy: AveragingStrategy::default(),
            seed: None,
            transform_timeout_s: default_transform_timeout_s(),
            sonar_mount: default_sonar_mount(),
            map_to_odom: [0.0; 6],
            sonar: SonarConfig::default(),
        }
    }
}

impl FilterConfig {
    /// Check the invariants the filter relies on.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidConfig(
                "num_particles must be at least 1".to_string(),
            ));
        }
        if !(self.measurement_variance > 0.0 && self.measurement_variance.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "measurement_variance must be positive, got {}",
                self.measurement_variance
            )));
        }
        for (name, cov) in [
            ("motion_covariance", &self.motion_covariance),
            ("init_covariance", &self.init_covariance),
            ("jitter_covariance", &self.jitter_covariance),
        ] {
            if cov.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(FilterError::InvalidConfig(format!(
                    "{name} entries must be finite and non-negative, got {cov:?}"
                )));
            }
        }
        if !(self.resampling_threshold > 0.0 && self.resampling_threshold <= 1.0) {
            return Err(FilterError::InvalidConfig(format!(
                "resampling_threshold must lie in (0, 1], got {}",
                self.resampling_threshold
            )));
        }
        if !(self.weight_floor > 0.0 && self.weight_floor.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "weight_floor must be positive, got {}",
                self.weight_floor
            )));
        }
        if !(self.transform_timeout_s >= 0.0 && self.transform_timeout_s.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "transform_timeout_s must be finite and non-negative, got {}",
                self.transform_timeout_s
            )));
        }
        if self.sonar.num_beams == 0 {
            return Err(FilterError::InvalidConfig(
                "sonar needs at least one beam".to_string(),
            ));
        }
        if !(self.sonar.max_range_m > 0.0 && self.sonar.max_range_m.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "sonar max_range_m must be finite and positive, got {}",
                self.sonar.max_range_m
            )));
        }
        if !self.sonar.swath_angle_rad.is_finite() {
            return Err(FilterError::InvalidConfig(format!(
                "sonar swath_angle_rad must be finite, got {}",
                self.sonar.swath_angle_rad
            )));
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| FilterError::Format(e.to_string()))
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| FilterError::Format(e.to_string()))
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(|e| FilterError::Format(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| FilterError::Format(e.to_string()))
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(|e| FilterError::Format(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| FilterError::Format(e.to_string()))
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(FilterError::InvalidConfig(format!(
                "unsupported config file extension: {}",
                p.display()
            ))),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(FilterError::InvalidConfig(format!(
                "unsupported config file extension: {}",
                p.display()
            ))),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Parse a six-element covariance from its legacy string form.
///
/// Brackets are optional and entries may be separated by commas and/or whitespace.
///
/// ```
/// use auvpf::config::parse_covariance;
/// let cov = parse_covariance("motion_covariance", "[0.1, 0.1, 0.0, 0.0, 0.0, 0.01]").unwrap();
/// assert_eq!(cov[5], 0.01);
/// ```
pub fn parse_covariance(name: &str, text: &str) -> Result<[f64; 6]> {
    let parse_error = || FilterError::CovarianceParse {
        name: name.to_string(),
        value: text.to_string(),
    };
    let values = text
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|_| parse_error()))
        .collect::<Result<Vec<f64>>>()?;
    let cov: [f64; 6] = values.try_into().map_err(|_| parse_error())?;
    if cov.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(parse_error());
    }
    Ok(cov)
}

/// Parse a covariance string, reporting a malformed value and falling back to `default`.
pub fn covariance_or_default(name: &str, text: Option<&str>, default: [f64; 6]) -> [f64; 6] {
    match text {
        None => {
            warn!("No {name} given, using default {default:?}");
            default
        }
        Some(text) => parse_covariance(name, text).unwrap_or_else(|e| {
            warn!("{e}; using default {default:?}");
            default
        }),
    }
}
