//! Run configuration for the localizer.
//!
//! A [`LocalizationConfig`] collects the particle filter parameters, the visual odometry
//! parameters ([`OdometryConfig`]), the area definition ([`AreaConfig`]) and the run
//! bookkeeping (trials, steps, seed, output naming). Every field has a default, so a
//! configuration file only needs to list what it changes.
//!
//! Configurations are read and written as JSON, YAML or TOML, chosen by file extension:
//!
//! ```no_run
//! use aerialmcl::config::LocalizationConfig;
//!
//! let mut cfg = LocalizationConfig::default();
//! cfg.num_particles = 5000;
//! cfg.to_file("run.yaml").unwrap();
//! let loaded = LocalizationConfig::from_file("run.yaml").unwrap();
//! assert_eq!(loaded.num_particles, 5000);
//! ```
use crate::error::{LocalizationError, Result};
use crate::geo::{BoundingBox, DEFAULT_EDGE_STRIP};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Default seed, shared by the route files and the filter RNG
pub const DEFAULT_SEED: u64 = 442;

/// Visual odometry parameters: ORB extraction, matching gates and RANSAC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryConfig {
    /// Maximum number of keypoints per frame
    pub num_features: usize,
    pub pyramid_levels: usize,
    /// Downscaling factor between consecutive pyramid levels
    pub scale_factor: f64,
    /// FAST intensity threshold
    pub fast_threshold: u8,
    /// Fewer matches than this falls back to the previous estimate
    pub min_matches: usize,
    /// This many RANSAC inliers or fewer falls back to the previous estimate
    pub min_inliers: usize,
    pub ransac_reprojection_threshold: f64,
    pub ransac_max_iterations: usize,
    pub ransac_confidence: f64,
    /// Produce a side-by-side match visualization with every estimate
    pub debug_images: bool,
}
impl Default for OdometryConfig {
    fn default() -> Self {
        OdometryConfig {
            num_features: 500,
            pyramid_levels: 8,
            scale_factor: 1.2,
            fast_threshold: 20,
            min_matches: 100,
            min_inliers: 50,
            ransac_reprojection_threshold: 3.0,
            ransac_max_iterations: 2000,
            ransac_confidence: 0.995,
            debug_images: false,
        }
    }
}

/// Where the vehicle may be.
///
/// Without a `total_bbox` the descriptor grid's coordinate bounds serve as both the total
/// and the working box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    /// Fraction of the total extent trimmed from each side to form the working box
    pub edge_strip: f64,
    pub total_bbox: Option<BoundingBox>,
    /// Explicit working box; otherwise the total box minus `edge_strip` on each side
    pub working_bbox: Option<BoundingBox>,
}
impl Default for AreaConfig {
    fn default() -> Self {
        AreaConfig {
            edge_strip: DEFAULT_EDGE_STRIP,
            total_bbox: None,
            working_bbox: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Initial (and maximum) particle count
    pub num_particles: usize,
    /// Floor below which pruning never shrinks the population
    pub min_particles: usize,
    /// Fraction of the population kept by pruning before resampling
    pub prune_fraction: f64,
    /// Motion noise standard deviation in meters along (latitude, longitude)
    pub particle_noise_m: [f64; 2],
    /// Motion noise standard deviation of the yaw in radians
    pub yaw_noise_std: f64,
    /// Resample when the effective sample size drops below this fraction of N
    pub resample_threshold: f64,
    /// Radius of the embedding hypersphere
    pub descriptor_radius: f64,
    /// Clamp negative likelihoods to zero instead of keeping the raw linear mapping
    pub clamp_likelihood: bool,
    /// Meters per pixel of the sensed image
    pub ground_sample_distance: f64,
    pub orientation_bins: usize,
    /// Route indices to run; all routes when absent
    pub trials: Option<Vec<usize>>,
    /// Steps per trial; the full route when absent
    pub steps: Option<usize>,
    pub seed: u64,
    /// Keep the sensed image scale fixed
    pub no_scale: bool,
    /// Record the full particle population at every step
    pub save_states: bool,
    /// Do not write results to disk
    pub nosave: bool,
    pub experiment_name: String,
    pub area_name: String,
    pub results_dir: PathBuf,
    pub odometry: OdometryConfig,
    pub area: AreaConfig,
}
impl Default for LocalizationConfig {
    fn default() -> Self {
        LocalizationConfig {
            num_particles: 20000,
            min_particles: 5000,
            prune_fraction: 0.90,
            particle_noise_m: [10.0, 10.0],
            yaw_noise_std: 0.087,
            resample_threshold: 2.0 / 3.0,
            descriptor_radius: 32.0,
            clamp_likelihood: false,
            ground_sample_distance: 0.37,
            orientation_bins: 8,
            trials: None,
            steps: None,
            seed: DEFAULT_SEED,
            no_scale: false,
            save_states: false,
            nosave: false,
            experiment_name: "untitled".to_string(),
            area_name: "area".to_string(),
            results_dir: PathBuf::from("./results"),
            odometry: OdometryConfig::default(),
            area: AreaConfig::default(),
        }
    }
}

impl LocalizationConfig {
    /// Check that the parameters describe a runnable filter.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(LocalizationError::InvalidConfig(msg));
        if self.num_particles == 0 {
            return invalid("num_particles must be positive".into());
        }
        if self.min_particles == 0 {
            return invalid("min_particles must be positive".into());
        }
        if !(self.prune_fraction > 0.0 && self.prune_fraction <= 1.0) {
            return invalid(format!("prune_fraction ({}) must be in (0, 1]", self.prune_fraction));
        }
        if self.particle_noise_m.iter().any(|s| !(*s >= 0.0)) || !(self.yaw_noise_std >= 0.0) {
            return invalid("noise standard deviations must be non-negative".into());
        }
        if !(self.resample_threshold >= 0.0 && self.resample_threshold <= 1.0) {
            return invalid(format!(
                "resample_threshold ({}) must be in [0, 1]",
                self.resample_threshold
            ));
        }
        if !(self.descriptor_radius > 0.0) {
            return invalid("descriptor_radius must be positive".into());
        }
        if !(self.ground_sample_distance > 0.0) {
            return invalid("ground_sample_distance must be positive".into());
        }
        if self.orientation_bins == 0 {
            return invalid("orientation_bins must be positive".into());
        }
        if !(self.odometry.scale_factor > 1.0) || self.odometry.pyramid_levels == 0 {
            return invalid("odometry pyramid needs at least one level and scale_factor > 1".into());
        }
        if !(self.odometry.ransac_confidence > 0.0 && self.odometry.ransac_confidence < 1.0) {
            return invalid("ransac_confidence must be in (0, 1)".into());
        }
        if !(self.area.edge_strip >= 0.0 && self.area.edge_strip < 0.5) {
            return invalid(format!("edge_strip ({}) must be in [0, 0.5)", self.area.edge_strip));
        }
        Ok(())
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_cfg() -> LocalizationConfig {
        LocalizationConfig {
            num_particles: 8000,
            particle_noise_m: [5.0, 7.5],
            trials: Some(vec![0, 3]),
            steps: Some(120),
            seed: 7,
            experiment_name: "ablation".into(),
            area: AreaConfig {
                total_bbox: Some(BoundingBox::new(51.46, -0.13, 51.55, -0.05)),
                ..AreaConfig::default()
            },
            ..LocalizationConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = LocalizationConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.seed, 442);
        assert_eq!(cfg.num_particles, 20000);
        assert_eq!(cfg.min_particles, 5000);
        assert_eq!(cfg.odometry.min_matches, 100);
        assert_eq!(cfg.odometry.pyramid_levels, 8);
        assert_eq!(cfg.seed, DEFAULT_SEED);
    }
    #[test]
    fn json_roundtrip() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("json");
        cfg.to_file(&path).unwrap();
        assert_eq!(LocalizationConfig::from_file(&path).unwrap(), cfg);
    }
    #[test]
    fn yaml_roundtrip() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("yml");
        cfg.to_file(&path).unwrap();
        assert_eq!(LocalizationConfig::from_file(&path).unwrap(), cfg);
    }
    #[test]
    fn toml_roundtrip() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        cfg.to_file(&path).unwrap();
        assert_eq!(LocalizationConfig::from_file(&path).unwrap(), cfg);
    }
    #[test]
    fn partial_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("json");
        std::fs::write(&path, r#"{ "num_particles": 6000, "odometry": { "min_inliers": 20 } }"#).unwrap();
        let cfg = LocalizationConfig::from_file(&path).unwrap();
        assert_eq!(cfg.num_particles, 6000);
        assert_eq!(cfg.min_particles, 5000);
        assert_eq!(cfg.odometry.min_inliers, 20);
        assert_eq!(cfg.odometry.min_matches, 100);
        assert_eq!(cfg.seed, 442);
    }
    #[test]
    fn unsupported_extension_error() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("txt");
        let result = cfg.to_file(&path);
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
        let result = LocalizationConfig::from_file(&path);
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
    }
    #[test]
    fn validate_rejects_bad_values() {
        let cfg = LocalizationConfig {
            min_particles: 0,
            ..LocalizationConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(LocalizationError::InvalidConfig(_))));
        let cfg = LocalizationConfig {
            particle_noise_m: [-1.0, 10.0],
            ..LocalizationConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = LocalizationConfig {
            descriptor_radius: 0.0,
            ..LocalizationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
