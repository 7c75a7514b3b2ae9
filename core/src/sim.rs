//! Route and result files for localization experiments.
//!
//! This module provides:
//! - [`RouteRecord`] and [`load_routes`]/[`write_routes`] for the ground-truth routes that drive
//!   a simulated or replayed flight
//! - [`StepRecord`] and [`StateRecord`], the per-step rows of a run
//! - [`LocalizationResult`], which collects the rows of all trials and reads/writes them as CSV
//!
//! A result consists of `localisation-{experiment}-{area}-{seed}.csv`, one row per trial and
//! step with the fused estimate, the odometry-only estimate and the raw motion measurement, and
//! optionally `localisation-{experiment}-{area}-{seed}-states.csv` with a full particle
//! snapshot per step.
use crate::Pose;
use crate::error::{LocalizationError, Result};
use crate::particle::Particle;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One ground-truth pose of a route.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub trial: usize,
    pub step: usize,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Heading in radians
    pub yaw: f64,
}

/// Routes keyed by trial index, each ordered by step.
pub type Routes = BTreeMap<usize, Vec<Pose>>;

/// Read routes from CSV (`trial,step,latitude,longitude,yaw`).
///
/// Rows may come in any order, but every trial must cover steps `0..n` exactly once.
pub fn load_routes<P: AsRef<Path>>(path: P) -> Result<Routes> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(LocalizationError::MissingResource(format!(
            "route file {}",
            path.display()
        )));
    }
    let mut rdr = csv::Reader::from_path(path)?;
    let mut by_trial: BTreeMap<usize, Vec<RouteRecord>> = BTreeMap::new();
    for result in rdr.deserialize() {
        let record: RouteRecord = result?;
        by_trial.entry(record.trial).or_default().push(record);
    }
    if by_trial.is_empty() {
        return Err(LocalizationError::MalformedResource(format!(
            "{} contains no routes",
            path.display()
        )));
    }
    let mut routes = Routes::new();
    for (trial, mut records) in by_trial {
        records.sort_by_key(|r| r.step);
        for (expected, record) in records.iter().enumerate() {
            if record.step != expected {
                return Err(LocalizationError::MalformedResource(format!(
                    "{}: trial {trial} expected step {expected}, found step {}",
                    path.display(),
                    record.step
                )));
            }
        }
        routes.insert(
            trial,
            records
                .iter()
                .map(|r| Pose::new(r.latitude, r.longitude, r.yaw))
                .collect(),
        );
    }
    Ok(routes)
}

/// Write routes to CSV.
pub fn write_routes<P: AsRef<Path>>(routes: &Routes, path: P) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for (trial, poses) in routes {
        for (step, pose) in poses.iter().enumerate() {
            writer.serialize(RouteRecord {
                trial: *trial,
                step,
                latitude: pose.latitude,
                longitude: pose.longitude,
                yaw: pose.yaw,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// The fused estimate, the odometry-only estimate and the motion measurement of one step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub trial: usize,
    pub step: usize,
    /// Particle filter latitude estimate in degrees
    pub latitude: f64,
    /// Particle filter longitude estimate in degrees
    pub longitude: f64,
    /// Particle filter yaw estimate in radians
    pub yaw: f64,
    pub vo_latitude: f64,
    pub vo_longitude: f64,
    pub vo_yaw: f64,
    /// Measured displacement along the image x axis in meters
    pub dx: f64,
    /// Measured displacement along the image y axis in meters
    pub dy: f64,
    /// Measured heading change in radians
    pub dturn: f64,
}
impl StepRecord {
    pub fn estimate(&self) -> Pose {
        Pose::new(self.latitude, self.longitude, self.yaw)
    }
    pub fn odometry(&self) -> Pose {
        Pose::new(self.vo_latitude, self.vo_longitude, self.vo_yaw)
    }
}

/// One particle of a population snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub trial: usize,
    pub step: usize,
    pub particle: usize,
    pub latitude: f64,
    pub longitude: f64,
    pub yaw: f64,
    pub weight: f64,
}

/// All rows of a localization run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalizationResult {
    pub experiment: String,
    pub area: String,
    pub seed: u64,
    pub steps: Vec<StepRecord>,
    /// Particle snapshots, when requested
    pub states: Option<Vec<StateRecord>>,
}
impl LocalizationResult {
    pub fn new(experiment: &str, area: &str, seed: u64, save_states: bool) -> Self {
        LocalizationResult {
            experiment: experiment.to_string(),
            area: area.to_string(),
            seed,
            steps: Vec::new(),
            states: save_states.then(Vec::new),
        }
    }
    /// Base file name `localisation-{experiment}-{area}-{seed}`
    pub fn stem(&self) -> String {
        format!("localisation-{}-{}-{}", self.experiment, self.area, self.seed)
    }
    /// Record a population snapshot (ignored unless states are kept).
    pub fn push_states(&mut self, trial: usize, step: usize, particles: &[Particle]) {
        if let Some(states) = self.states.as_mut() {
            states.extend(particles.iter().enumerate().map(|(i, p)| StateRecord {
                trial,
                step,
                particle: i,
                latitude: p.latitude,
                longitude: p.longitude,
                yaw: p.yaw,
                weight: p.weight,
            }));
        }
    }
    /// Trials present in the result, ascending
    pub fn trials(&self) -> Vec<usize> {
        let mut trials: Vec<usize> = self.steps.iter().map(|r| r.trial).collect();
        trials.sort_unstable();
        trials.dedup();
        trials
    }
    /// Fused estimates of one trial, ordered by step
    pub fn estimates(&self, trial: usize) -> Vec<Pose> {
        self.trial_rows(trial).iter().map(|r| r.estimate()).collect()
    }
    /// Odometry-only estimates of one trial, ordered by step
    pub fn odometry(&self, trial: usize) -> Vec<Pose> {
        self.trial_rows(trial).iter().map(|r| r.odometry()).collect()
    }
    fn trial_rows(&self, trial: usize) -> Vec<StepRecord> {
        let mut rows: Vec<StepRecord> = self.steps.iter().filter(|r| r.trial == trial).cloned().collect();
        rows.sort_by_key(|r| r.step);
        rows
    }
    /// Write the result files into `dir`, creating it when needed.
    ///
    /// # Returns
    /// The path of the main result file.
    pub fn to_csv<P: AsRef<Path>>(&self, dir: P) -> io::Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv", self.stem()));
        let mut writer = csv::Writer::from_path(&path)?;
        for record in &self.steps {
            writer.serialize(record)?;
        }
        writer.flush()?;
        if let Some(states) = &self.states {
            let mut writer = csv::Writer::from_path(dir.join(format!("{}-states.csv", self.stem())))?;
            for record in states {
                writer.serialize(record)?;
            }
            writer.flush()?;
        }
        Ok(path)
    }
    /// Read a result written by [`Self::to_csv`].
    ///
    /// Experiment, area and seed are recovered from the file name; the states file is
    /// loaded when it sits next to the main file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| LocalizationError::MalformedResource(format!("{}", path.display())))?;
        let (experiment, area, seed) = parse_stem(stem).ok_or_else(|| {
            LocalizationError::MalformedResource(format!(
                "{} is not named localisation-<experiment>-<area>-<seed>.csv",
                path.display()
            ))
        })?;
        let mut rdr = csv::Reader::from_path(path)?;
        let steps = rdr
            .deserialize()
            .collect::<std::result::Result<Vec<StepRecord>, csv::Error>>()?;
        let states_path = path.with_file_name(format!("{stem}-states.csv"));
        let states = if states_path.exists() {
            let mut rdr = csv::Reader::from_path(&states_path)?;
            Some(
                rdr.deserialize()
                    .collect::<std::result::Result<Vec<StateRecord>, csv::Error>>()?,
            )
        } else {
            None
        };
        Ok(LocalizationResult {
            experiment,
            area,
            seed,
            steps,
            states,
        })
    }
}

/// Split `localisation-{experiment}-{area}-{seed}`; the experiment name may contain dashes.
fn parse_stem(stem: &str) -> Option<(String, String, u64)> {
    let rest = stem.strip_prefix("localisation-")?;
    let (rest, seed) = rest.rsplit_once('-')?;
    let seed = seed.parse().ok()?;
    let (experiment, area) = rest.rsplit_once('-')?;
    Some((experiment.to_string(), area.to_string(), seed))
}
