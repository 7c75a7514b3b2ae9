//! The localizer capability and the experiment run loop.
//!
//! A [`Localizer`] is set up from its resources (descriptor grid and routes), handed an
//! [`ObservationEncoder`] and then driven over every trial with a [`Sensor`] that renders
//! what the camera sees at a pose. Localizers are selected at compile time through
//! [`LocalizerKind`].
//!
//! For every trial the [`AerialPfLocalizer`]:
//!
//! - moves to the first route pose, senses it and starts the visual odometry;
//! - scatters particles uniformly over the working box and records the step-0 estimate;
//! - for each following step senses the next route pose (at a slowly oscillating scale
//!   unless disabled), estimates the frame-to-frame motion, propagates both the
//!   odometry-only pose and the particles, weights the particles with the encoded
//!   observation, resamples when the effective sample size is low and records the estimate.
//!
//! A diverging filter or a frame that cannot be sensed aborts its trial only; the remaining
//! trials still run. Results collected so far are saved even when a fatal error ends the run.
use crate::config::LocalizationConfig;
use crate::error::{LocalizationError, Result};
use crate::geo::{Area, BoundingBox};
use crate::grid::DescriptorGrid;
use crate::odometry::MotionEstimator;
use crate::particle::{AerialParticleFilter, ParticleFilterConfig, body_to_world};
use crate::sim::{LocalizationResult, Routes, StepRecord, load_routes};
use crate::{Pose, wrap_to_2pi};

use image::GrayImage;
use log::{debug, error, info, trace, warn};
use nalgebra::DVector;
use std::f64::consts::TAU;
use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::time::Instant;

/// Renders the downward-looking camera image at a pose.
pub trait Sensor {
    /// # Arguments
    /// * `trial`, `step` - position in the experiment
    /// * `pose` - ground-truth pose of the vehicle
    /// * `scale` - zoom factor of the rendered image (1.0 is nominal altitude)
    fn sense(&mut self, trial: usize, step: usize, pose: &Pose, scale: f64) -> Result<GrayImage>;
}

/// Turns a sensed image into an embedding comparable with the descriptor grid.
pub trait ObservationEncoder {
    fn encode(&mut self, image: &GrayImage) -> Result<DVector<f64>>;
}

pub trait Localizer {
    /// Load the map and routes and prepare the filter.
    fn setup(&mut self) -> Result<()>;
    fn set_model(&mut self, encoder: Box<dyn ObservationEncoder>);
    /// Run all configured trials.
    fn localize(&mut self, sensor: &mut dyn Sensor) -> Result<LocalizationResult>;
}

/// Where a localizer gets its map and routes from.
#[derive(Clone, Debug)]
pub enum Resources {
    Files { grid: PathBuf, routes: PathBuf },
    InMemory { grid: DescriptorGrid, routes: Routes },
}

/// Available localizers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum LocalizerKind {
    #[default]
    AerialParticleFilter,
}
impl LocalizerKind {
    pub fn create(self, config: LocalizationConfig, resources: Resources) -> Box<dyn Localizer> {
        match self {
            LocalizerKind::AerialParticleFilter => Box::new(AerialPfLocalizer::new(config, resources)),
        }
    }
}

/// Scale of the sensed image at `step`: 2^(0.25·sin(2π·step/50)), or 1 when disabled.
pub fn sensing_scale(step: usize, no_scale: bool) -> f64 {
    if no_scale {
        1.0
    } else {
        2f64.powf(0.25 * (TAU * step as f64 / 50.0).sin())
    }
}

/// Particle filter localizer over a descriptor grid.
pub struct AerialPfLocalizer {
    config: LocalizationConfig,
    resources: Option<Resources>,
    routes: Routes,
    filter: Option<AerialParticleFilter>,
    encoder: Option<Box<dyn ObservationEncoder>>,
}
impl Debug for AerialPfLocalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AerialPfLocalizer")
            .field("experiment", &self.config.experiment_name)
            .field("area", &self.config.area_name)
            .field("routes", &self.routes.len())
            .field("filter", &self.filter)
            .field("encoder", &self.encoder.is_some())
            .finish()
    }
}
impl AerialPfLocalizer {
    pub fn new(config: LocalizationConfig, resources: Resources) -> Self {
        AerialPfLocalizer {
            config,
            resources: Some(resources),
            routes: Routes::new(),
            filter: None,
            encoder: None,
        }
    }
    pub fn config(&self) -> &LocalizationConfig {
        &self.config
    }
    pub fn routes(&self) -> &Routes {
        &self.routes
    }
    pub fn filter(&self) -> Option<&AerialParticleFilter> {
        self.filter.as_ref()
    }
    /// Derive the working frame from the area settings, falling back to the grid bounds.
    fn area(&self, grid: &DescriptorGrid) -> Area {
        let name = &self.config.area_name;
        match (self.config.area.total_bbox, self.config.area.working_bbox) {
            (None, _) => Area::with_working_bbox(name, grid.bounds(), grid.bounds()),
            (Some(total), Some(working)) => Area::with_working_bbox(name, total, working),
            (Some(total), None) => Area::new(name, total, self.config.area.edge_strip),
        }
    }
}
impl Localizer for AerialPfLocalizer {
    fn setup(&mut self) -> Result<()> {
        self.config.validate()?;
        let resources = self.resources.take().ok_or(LocalizationError::NotInitialized)?;
        let (grid, routes) = match resources {
            Resources::Files { grid, routes } => (
                DescriptorGrid::from_csv(&grid, self.config.orientation_bins)?,
                load_routes(&routes)?,
            ),
            Resources::InMemory { grid, routes } => (grid, routes),
        };
        if grid.orientation_bins() != self.config.orientation_bins {
            warn!(
                "grid has {} orientation bins, configuration expects {}",
                grid.orientation_bins(),
                self.config.orientation_bins
            );
        }
        if let Some(trials) = &self.config.trials
            && let Some(missing) = trials.iter().find(|t| !routes.contains_key(t))
        {
            return Err(LocalizationError::MissingResource(format!(
                "no route for trial {missing}"
            )));
        }
        let area = self.area(&grid);
        info!(
            "Particle filter experiment '{}' in {}: grid {:?}, {} routes",
            self.config.experiment_name,
            area.name,
            grid.dim(),
            routes.len()
        );
        let filter = AerialParticleFilter::new(
            grid,
            area,
            ParticleFilterConfig::from(&self.config),
            self.config.seed,
        )?;
        self.routes = routes;
        self.filter = Some(filter);
        Ok(())
    }
    fn set_model(&mut self, encoder: Box<dyn ObservationEncoder>) {
        self.encoder = Some(encoder);
    }
    fn localize(&mut self, sensor: &mut dyn Sensor) -> Result<LocalizationResult> {
        let filter = self.filter.as_mut().ok_or(LocalizationError::NotInitialized)?;
        let encoder = self.encoder.as_mut().ok_or(LocalizationError::NotInitialized)?;
        let config = &self.config;
        let mut result = LocalizationResult::new(
            &config.experiment_name,
            &config.area_name,
            config.seed,
            config.save_states,
        );
        let trials: Vec<usize> = config
            .trials
            .clone()
            .unwrap_or_else(|| self.routes.keys().copied().collect());
        let mut failure = None;
        for trial in trials {
            let Some(route) = self.routes.get(&trial) else {
                error!("Trial {} skipped: no route", trial);
                continue;
            };
            let started = Instant::now();
            let mut trial_run = TrialRun {
                trial,
                route,
                config,
                filter: &mut *filter,
                encoder: &mut **encoder,
                sensor: &mut *sensor,
                result: &mut result,
            };
            match trial_run.run() {
                Ok(steps) => info!(
                    "Trial {} with {} steps finished in {:.3} s",
                    trial,
                    steps,
                    started.elapsed().as_secs_f64()
                ),
                Err(err) if err.aborts_trial_only() => {
                    error!("Trial {} aborted: {}", trial, err);
                }
                Err(err) => {
                    error!("Experiment stopped at trial {}: {}", trial, err);
                    failure = Some(err);
                    break;
                }
            }
        }
        if !config.nosave {
            let path = result.to_csv(&config.results_dir)?;
            info!("Results saved to {}", path.display());
        }
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(result)
    }
}

/// Everything one trial needs, borrowed from the localizer.
struct TrialRun<'a> {
    trial: usize,
    route: &'a [Pose],
    config: &'a LocalizationConfig,
    filter: &'a mut AerialParticleFilter,
    encoder: &'a mut dyn ObservationEncoder,
    sensor: &'a mut dyn Sensor,
    result: &'a mut LocalizationResult,
}
impl TrialRun<'_> {
    /// Returns the number of steps run.
    fn run(&mut self) -> Result<usize> {
        let trial = self.trial;
        let start = *self.route.first().ok_or_else(|| {
            LocalizationError::MalformedResource(format!("route of trial {trial} is empty"))
        })?;
        let steps = match self.config.steps {
            Some(steps) if steps > self.route.len() => {
                warn!(
                    "trial {} has {} route poses, running {} steps instead of {}",
                    trial,
                    self.route.len(),
                    self.route.len(),
                    steps
                );
                self.route.len()
            }
            Some(steps) => steps,
            None => self.route.len(),
        };
        let gsd = self.config.ground_sample_distance;

        let frame = self.sensor.sense(trial, 0, &start, 1.0)?;
        let mut odometry = MotionEstimator::new(frame, &self.config.odometry)?;
        let working: BoundingBox = self.filter.area().working_bbox;
        self.filter.set_trial(trial);
        self.filter.initialize(self.config.num_particles, &working);
        let mut vo_pose = start;
        let estimate = self.filter.estimate()?;
        self.record(0, estimate, vo_pose, [0.0; 3]);

        for step in 1..steps {
            let started = Instant::now();
            let truth = self.route[step];
            let scale = sensing_scale(step, self.config.no_scale);
            let frame = self.sensor.sense(trial, step, &truth, scale)?;
            let observation = self.encoder.encode(&frame)?;
            let motion = odometry.estimate(frame)?;
            if let Some(image) = motion.debug_image.as_ref() {
                self.save_debug_image(step, image);
            }
            let dx = motion.translation.x * gsd;
            let dy = motion.translation.y * gsd;
            let dturn = -motion.yaw;

            vo_pose.yaw += dturn;
            let (dlat_m, dlon_m) = body_to_world(dx, dy, vo_pose.yaw);
            let (dlat, dlon) = self.filter.area().meters_to_degrees(dlat_m, dlon_m);
            vo_pose.latitude += dlat;
            vo_pose.longitude += dlon;

            self.filter
                .motion_update(motion.translation.x, motion.translation.y, dturn);
            self.filter.update_weights(&observation)?;
            let ess = self.filter.effective_sample_size();
            if self.filter.resample_if_needed()? {
                trace!("trial {} step {}: resampled at ESS {:.1}", trial, step, ess);
            }
            let estimate = self.filter.estimate()?;
            let error_m = estimate.distance_to(&truth);
            if let Some(best) = self.filter.best_particle() {
                debug!(
                    "Trial: {} Step: {} Error: {:.2} m VO error: {:.2} m ESS: {:.1} N: {} Best: ({:.7}, {:.7}) Time: {:.3} s",
                    trial,
                    step,
                    error_m,
                    vo_pose.distance_to(&truth),
                    ess,
                    self.filter.len(),
                    best.latitude,
                    best.longitude,
                    started.elapsed().as_secs_f64()
                );
            }
            self.record(step, estimate, vo_pose, [dx, dy, dturn]);
        }
        Ok(steps)
    }
    fn record(&mut self, step: usize, estimate: Pose, vo_pose: Pose, motion: [f64; 3]) {
        self.result.steps.push(StepRecord {
            trial: self.trial,
            step,
            latitude: estimate.latitude,
            longitude: estimate.longitude,
            yaw: estimate.yaw,
            vo_latitude: vo_pose.latitude,
            vo_longitude: vo_pose.longitude,
            vo_yaw: wrap_to_2pi(vo_pose.yaw),
            dx: motion[0],
            dy: motion[1],
            dturn: motion[2],
        });
        if self.result.states.is_some() {
            self.result
                .push_states(self.trial, step, &self.filter.particles());
        }
    }
    fn save_debug_image(&self, step: usize, image: &GrayImage) {
        if self.config.nosave {
            return;
        }
        let dir = self
            .config
            .results_dir
            .join("debug")
            .join(format!("trial_{}", self.trial));
        let path = dir.join(format!("step_{step:04}.png"));
        if let Err(e) = std::fs::create_dir_all(&dir).map_err(image::ImageError::IoError).and_then(|_| image.save(&path)) {
            warn!("could not save debug image {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::Array4;

    struct BlankSensor;
    impl Sensor for BlankSensor {
        fn sense(&mut self, _: usize, _: usize, _: &Pose, _: f64) -> Result<GrayImage> {
            Ok(GrayImage::new(64, 64))
        }
    }
    /// Blank frames, except that one step of one trial cannot be sensed
    struct GappySensor {
        trial: usize,
        step: usize,
    }
    impl Sensor for GappySensor {
        fn sense(&mut self, trial: usize, step: usize, _: &Pose, _: f64) -> Result<GrayImage> {
            if (trial, step) == (self.trial, self.step) {
                return Err(LocalizationError::MissingResource(format!(
                    "frame {step} of trial {trial}"
                )));
            }
            Ok(GrayImage::new(64, 64))
        }
    }
    struct ConstantEncoder(DVector<f64>);
    impl ObservationEncoder for ConstantEncoder {
        fn encode(&mut self, _: &GrayImage) -> Result<DVector<f64>> {
            Ok(self.0.clone())
        }
    }

    fn resources(steps: usize) -> Resources {
        let mut data = Array4::<f32>::zeros((4, 4, 8, 2));
        data.index_axis_mut(ndarray::Axis(3), 0).fill(1.0);
        let grid = DescriptorGrid::new(data, BoundingBox::new(51.0, -1.01, 51.01, -1.0)).unwrap();
        let mut routes = Routes::new();
        routes.insert(0, vec![Pose::new(51.005, -1.005, 0.0); steps]);
        routes.insert(3, vec![Pose::new(51.004, -1.004, 1.0); steps]);
        Resources::InMemory { grid, routes }
    }
    fn config() -> LocalizationConfig {
        LocalizationConfig {
            num_particles: 200,
            min_particles: 100,
            particle_noise_m: [1.0, 1.0],
            nosave: true,
            ..Default::default()
        }
    }

    #[test]
    fn scale_oscillates() {
        assert_eq!(sensing_scale(0, false), 1.0);
        assert_approx_eq!(sensing_scale(12, false), 2f64.powf(0.25 * (TAU * 12.0 / 50.0).sin()));
        assert_approx_eq!(sensing_scale(25, false), 1.0, 1e-12);
        assert_eq!(sensing_scale(12, true), 1.0);
    }
    #[test]
    fn localize_requires_setup_and_model() {
        let mut localizer = LocalizerKind::AerialParticleFilter.create(config(), resources(3));
        assert!(matches!(
            localizer.localize(&mut BlankSensor),
            Err(LocalizationError::NotInitialized)
        ));
        localizer.setup().unwrap();
        assert!(matches!(
            localizer.localize(&mut BlankSensor),
            Err(LocalizationError::NotInitialized)
        ));
    }
    #[test]
    fn runs_every_trial_and_step() {
        let mut localizer = AerialPfLocalizer::new(config(), resources(4));
        localizer.setup().unwrap();
        localizer.set_model(Box::new(ConstantEncoder(DVector::from_vec(vec![32.0, 0.0]))));
        let result = localizer.localize(&mut BlankSensor).unwrap();
        assert_eq!(result.trials(), vec![0, 3]);
        assert_eq!(result.steps.len(), 8);
        // blank frames never produce features: zero motion throughout
        let vo = result.odometry(3);
        assert_eq!(vo[3], Pose::new(51.004, -1.004, 1.0));
        assert!(result.steps.iter().all(|r| r.dx == 0.0 && r.dy == 0.0 && r.dturn == 0.0));
        assert!(result.states.is_none());
    }
    #[test]
    fn divergence_aborts_only_that_trial() {
        // an observation at distance 2r from every map descriptor zeroes all weights
        let mut localizer = AerialPfLocalizer::new(config(), resources(3));
        localizer.setup().unwrap();
        localizer.set_model(Box::new(ConstantEncoder(DVector::from_vec(vec![-32.0, 0.0]))));
        let result = localizer.localize(&mut BlankSensor).unwrap();
        // only the step-0 rows of both trials were recorded
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.trials(), vec![0, 3]);
    }
    #[test]
    fn unknown_trial_fails_at_setup() {
        let mut cfg = config();
        cfg.trials = Some(vec![0, 9]);
        let mut localizer = AerialPfLocalizer::new(cfg, resources(3));
        match localizer.setup() {
            Err(LocalizationError::MissingResource(msg)) => assert!(msg.contains("trial 9")),
            other => panic!("expected a missing route, got {other:?}"),
        }
    }
    #[test]
    fn missing_frame_aborts_only_that_trial_and_results_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.nosave = false;
        cfg.results_dir = dir.path().to_path_buf();
        let mut localizer = AerialPfLocalizer::new(cfg, resources(4));
        localizer.setup().unwrap();
        localizer.set_model(Box::new(ConstantEncoder(DVector::from_vec(vec![32.0, 0.0]))));
        let result = localizer
            .localize(&mut GappySensor { trial: 0, step: 2 })
            .unwrap();
        // trial 0 stops before step 2, trial 3 runs to the end
        assert_eq!(result.estimates(0).len(), 2);
        assert_eq!(result.estimates(3).len(), 4);
        let saved = LocalizationResult::from_csv(dir.path().join(format!("{}.csv", result.stem()))).unwrap();
        assert_eq!(saved.steps.len(), 6);
    }
    #[test]
    fn fatal_error_still_saves_finished_trials() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.nosave = false;
        cfg.results_dir = dir.path().to_path_buf();
        let mut localizer = AerialPfLocalizer::new(cfg, resources(3));
        localizer.setup().unwrap();
        // the grid holds 2-D descriptors
        localizer.set_model(Box::new(ConstantEncoder(DVector::from_vec(vec![32.0, 0.0, 0.0]))));
        assert!(matches!(
            localizer.localize(&mut BlankSensor),
            Err(LocalizationError::DimensionMismatch { expected: 2, found: 3 })
        ));
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let saved = LocalizationResult::from_csv(files[0].as_ref().unwrap().path()).unwrap();
        // the step-0 estimate of the first trial precedes the failing weight update
        assert_eq!(saved.trials(), vec![0]);
        assert_eq!(saved.steps.len(), 1);
    }
    #[test]
    fn area_defaults_to_grid_bounds() {
        let localizer = AerialPfLocalizer::new(config(), resources(1));
        let grid = DescriptorGrid::new(
            Array4::<f32>::ones((2, 2, 8, 1)),
            BoundingBox::new(10.0, 20.0, 11.0, 21.0),
        )
        .unwrap();
        let area = localizer.area(&grid);
        assert_eq!(area.working_bbox, grid.bounds());

        let mut cfg = config();
        cfg.area.total_bbox = Some(BoundingBox::new(10.0, 20.0, 11.0, 21.0));
        let localizer = AerialPfLocalizer::new(cfg, resources(1));
        let area = localizer.area(&grid);
        assert_approx_eq!(area.working_bbox.min_lat, 10.05);
    }
}
