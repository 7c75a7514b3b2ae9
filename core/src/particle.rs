//! Monte Carlo localization over a descriptor grid
//!
//! The [`AerialParticleFilter`] approximates the belief over the vehicle pose (latitude,
//! longitude, yaw) with a population of weighted particles. Each step of a run goes
//! through four phases:
//!
//! 1. **Motion update**: every particle is rotated by the measured turn and displaced by
//!    the measured translation expressed in its *own* heading, then perturbed with
//!    Gaussian noise. Particles that leave the working box keep their slot but get zero
//!    weight; they are only removed physically by the next resample.
//! 2. **Observation update**: every particle looks up the map descriptor at its pose by
//!    trilinear interpolation of the [`DescriptorGrid`], scaled to the embedding
//!    hypersphere radius `r`. Its weight is multiplied by the linear likelihood
//!    `(2r - d) / 2r` of the distance `d` to the observed descriptor, then the population
//!    is renormalized. A vanishing weight sum is a fatal divergence.
//! 3. **Resampling**, when the effective sample size `1 / Σ wᵢ²` falls below a fraction of
//!    the population: large populations are first pruned to their heaviest particles, then
//!    systematic resampling draws a new population with uniform weights.
//! 4. **Estimation**: the weighted mean position and the circular mean of the yaw.
//!
//! Particles are stored as four parallel vectors (structure of arrays). All randomness
//! comes from the filter's own seeded [`StdRng`].
use crate::error::{LocalizationError, Result};
use crate::geo::{Area, BoundingBox};
use crate::grid::DescriptorGrid;
use crate::{Pose, wrap_to_2pi};

use log::{trace, warn};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::f64::consts::TAU;
use std::fmt::{self, Debug, Display};

/// A single pose hypothesis.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Heading in radians, [0, 2π)
    pub yaw: f64,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("latitude", &self.latitude)
            .field("longitude", &self.longitude)
            .field("yaw", &self.yaw.to_degrees())
            .field("weight", &self.weight)
            .finish()
    }
}

/// Tuning of the particle filter.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleFilterConfig {
    /// Floor below which pruning never shrinks the population
    pub min_particles: usize,
    /// Fraction of the population kept by pruning
    pub prune_fraction: f64,
    /// Displacement noise standard deviation in meters (latitude, longitude)
    pub particle_noise_m: [f64; 2],
    pub yaw_noise_std: f64,
    /// Resample when ESS < `resample_threshold * N`
    pub resample_threshold: f64,
    /// Radius of the embedding hypersphere
    pub descriptor_radius: f64,
    pub clamp_likelihood: bool,
    /// Meters per pixel of the sensed image
    pub ground_sample_distance: f64,
}
impl Default for ParticleFilterConfig {
    fn default() -> Self {
        ParticleFilterConfig {
            min_particles: 5000,
            prune_fraction: 0.90,
            particle_noise_m: [10.0, 10.0],
            yaw_noise_std: 0.087,
            resample_threshold: 2.0 / 3.0,
            descriptor_radius: 32.0,
            clamp_likelihood: false,
            ground_sample_distance: 0.37,
        }
    }
}
impl From<&crate::config::LocalizationConfig> for ParticleFilterConfig {
    fn from(cfg: &crate::config::LocalizationConfig) -> Self {
        ParticleFilterConfig {
            min_particles: cfg.min_particles,
            prune_fraction: cfg.prune_fraction,
            particle_noise_m: cfg.particle_noise_m,
            yaw_noise_std: cfg.yaw_noise_std,
            resample_threshold: cfg.resample_threshold,
            descriptor_radius: cfg.descriptor_radius,
            clamp_likelihood: cfg.clamp_likelihood,
            ground_sample_distance: cfg.ground_sample_distance,
        }
    }
}

/// Rotate a body-frame displacement (x right, y forward in image terms) by `yaw` into
/// (north, east) meters.
///
/// # Returns
/// `(dlat_m, dlon_m)`
pub fn body_to_world(dx: f64, dy: f64, yaw: f64) -> (f64, f64) {
    let (s, c) = yaw.sin_cos();
    let dlon_m = dx * c + dy * s;
    let dlat_m = -dx * s + dy * c;
    (dlat_m, dlon_m)
}

pub struct AerialParticleFilter {
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub yaw: Vec<f64>,
    pub weight: Vec<f64>,
    config: ParticleFilterConfig,
    area: Area,
    grid: DescriptorGrid,
    lat_noise: Normal<f64>,
    lon_noise: Normal<f64>,
    yaw_noise: Normal<f64>,
    rng: StdRng,
    trial: usize,
    step: usize,
}
impl Debug for AerialParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self.weight.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_weight = self.weight.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        f.debug_struct("AerialParticleFilter")
            .field("num_particles", &self.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("trial", &self.trial)
            .field("step", &self.step)
            .field("area", &self.area.name)
            .field("grid", &self.grid)
            .finish()
    }
}
impl AerialParticleFilter {
    /// Create an empty filter; call [`Self::initialize`] before use.
    ///
    /// # Arguments
    /// * `grid` - the map, owned for the lifetime of the filter
    /// * `area` - working frame used for the bounding-box mask and meter/degree conversion
    /// * `config` - noise, pruning and likelihood settings
    /// * `seed` - seed of the filter's random number generator
    pub fn new(grid: DescriptorGrid, area: Area, config: ParticleFilterConfig, seed: u64) -> Result<Self> {
        let normal = |sigma: f64| {
            Normal::new(0.0, sigma).map_err(|e| LocalizationError::InvalidConfig(format!("noise σ={sigma}: {e}")))
        };
        Ok(AerialParticleFilter {
            latitude: Vec::new(),
            longitude: Vec::new(),
            yaw: Vec::new(),
            weight: Vec::new(),
            lat_noise: normal(config.particle_noise_m[0])?,
            lon_noise: normal(config.particle_noise_m[1])?,
            yaw_noise: normal(config.yaw_noise_std)?,
            config,
            area,
            grid,
            rng: StdRng::seed_from_u64(seed),
            trial: 0,
            step: 0,
        })
    }
    pub fn len(&self) -> usize {
        self.weight.len()
    }
    pub fn is_empty(&self) -> bool {
        self.weight.is_empty()
    }
    pub fn area(&self) -> &Area {
        &self.area
    }
    pub fn grid(&self) -> &DescriptorGrid {
        &self.grid
    }
    pub fn config(&self) -> &ParticleFilterConfig {
        &self.config
    }
    /// Label subsequent diagnostics with a trial index.
    pub fn set_trial(&mut self, trial: usize) {
        self.trial = trial;
    }
    /// Index of the last motion update since [`Self::initialize`]
    pub fn step(&self) -> usize {
        self.step
    }
    /// Draw `n` particles uniformly over `bbox` with uniform heading and weight `1/n`.
    pub fn initialize(&mut self, n: usize, bbox: &BoundingBox) {
        self.latitude = (0..n)
            .map(|_| uniform(&mut self.rng, bbox.min_lat, bbox.max_lat))
            .collect();
        self.longitude = (0..n)
            .map(|_| uniform(&mut self.rng, bbox.min_lon, bbox.max_lon))
            .collect();
        self.yaw = (0..n).map(|_| uniform(&mut self.rng, 0.0, TAU)).collect();
        self.weight = vec![1.0 / n as f64; n];
        self.step = 0;
    }
    /// Propagate every particle by a visual odometry measurement.
    ///
    /// # Arguments
    /// * `dx_px`, `dy_px` - image-plane translation in pixels, scaled to meters by the
    ///   ground sample distance
    /// * `dturn` - heading change in radians
    pub fn motion_update(&mut self, dx_px: f64, dy_px: f64, dturn: f64) {
        let gsd = self.config.ground_sample_distance;
        let (dx, dy) = (dx_px * gsd, dy_px * gsd);
        let working = self.area.working_bbox;
        for i in 0..self.len() {
            self.yaw[i] += dturn;
            let (dlat_m, dlon_m) = body_to_world(dx, dy, self.yaw[i]);
            let dlat_m = dlat_m + self.lat_noise.sample(&mut self.rng);
            let dlon_m = dlon_m + self.lon_noise.sample(&mut self.rng);
            let (dlat, dlon) = self.area.meters_to_degrees(dlat_m, dlon_m);
            self.latitude[i] += dlat;
            self.longitude[i] += dlon;
            self.yaw[i] = wrap_to_2pi(self.yaw[i] + self.yaw_noise.sample(&mut self.rng));
            if !working.contains(self.latitude[i], self.longitude[i]) {
                self.weight[i] = 0.0;
            }
        }
        self.step += 1;
    }
    /// Linear likelihood of every particle given an observed descriptor.
    ///
    /// Returns `(2r - d) / 2r` per particle, where `d` is the Euclidean distance between
    /// the observation and the particle's radius-scaled map descriptor.
    pub fn likelihoods(&self, observation: &DVector<f64>) -> Result<Vec<f64>> {
        let expected = self.grid.descriptor_dim();
        if observation.len() != expected {
            return Err(LocalizationError::DimensionMismatch {
                expected,
                found: observation.len(),
            });
        }
        let radius = self.config.descriptor_radius;
        let mut probs = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            let (y, x, t) = self
                .grid
                .to_grid_coordinates(self.latitude[i], self.longitude[i], self.yaw[i]);
            let predicted = self.grid.sample(y, x, t)? * radius;
            let distance = (predicted - observation).norm();
            probs.push((2.0 * radius - distance) / (2.0 * radius));
        }
        Ok(probs)
    }
    /// Weight the population by an observed descriptor and renormalize.
    ///
    /// # Errors
    /// * [`LocalizationError::Divergence`] when the weight sum is not positive and finite
    /// * [`LocalizationError::DimensionMismatch`] when the observation has the wrong size
    pub fn update_weights(&mut self, observation: &DVector<f64>) -> Result<()> {
        let mut probs = self.likelihoods(observation)?;
        let negative = probs.iter().filter(|p| **p < 0.0).count();
        if negative > 0 {
            if self.config.clamp_likelihood {
                probs.iter_mut().for_each(|p| *p = p.max(0.0));
            } else {
                warn!(
                    "{negative} of {} particles have a negative likelihood at trial {} step {}",
                    self.len(),
                    self.trial,
                    self.step
                );
            }
        }
        for (w, p) in self.weight.iter_mut().zip(probs.iter()) {
            *w *= p;
        }
        self.normalize_weights()
    }
    /// Scale the weights to sum to one.
    pub fn normalize_weights(&mut self) -> Result<()> {
        let sum: f64 = self.weight.iter().sum();
        if !(sum > 0.0) || !sum.is_finite() {
            return Err(LocalizationError::Divergence {
                trial: self.trial,
                step: self.step,
            });
        }
        self.weight.iter_mut().for_each(|w| *w /= sum);
        Ok(())
    }
    /// Effective sample size `1 / Σ wᵢ²`
    pub fn effective_sample_size(&self) -> f64 {
        1.0 / self.weight.iter().map(|w| w * w).sum::<f64>()
    }
    pub fn needs_resample(&self) -> bool {
        self.effective_sample_size() < self.config.resample_threshold * self.len() as f64
    }
    /// Resample when the effective sample size is below the threshold.
    ///
    /// # Returns
    /// Whether a resample took place
    pub fn resample_if_needed(&mut self) -> Result<bool> {
        if self.needs_resample() {
            self.systematic_resample()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
    /// Keep the heaviest `max(prune_fraction * N, min_particles)` particles.
    ///
    /// Populations at or below `min_particles` are left untouched.
    pub fn prune(&mut self) -> Result<()> {
        let n = self.len();
        if n <= self.config.min_particles {
            return Ok(());
        }
        let keep = ((self.config.prune_fraction * n as f64).floor() as usize)
            .max(self.config.min_particles)
            .min(n);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| self.weight[b].total_cmp(&self.weight[a]));
        order.truncate(keep);
        self.select(&order);
        trace!("pruned population from {n} to {keep} particles");
        if !(self.weight.iter().sum::<f64>() > 0.0) {
            return Err(LocalizationError::EmptyPopulation);
        }
        self.normalize_weights()
    }
    /// Prune, then draw a new population with systematic resampling and uniform weights.
    pub fn systematic_resample(&mut self) -> Result<()> {
        if self.is_empty() {
            return Err(LocalizationError::EmptyPopulation);
        }
        self.prune()?;
        let n = self.len();
        let mut cumulative: Vec<f64> = self
            .weight
            .iter()
            .scan(0.0, |acc, w| {
                *acc += w;
                Some(*acc)
            })
            .collect();
        cumulative[n - 1] = 1.0;
        let offset: f64 = self.rng.random::<f64>();
        let mut indices = Vec::with_capacity(n);
        let mut j = 0;
        for i in 0..n {
            let position = (offset + i as f64) / n as f64;
            while j < n - 1 && position >= cumulative[j] {
                j += 1;
            }
            indices.push(j);
        }
        self.select(&indices);
        self.weight = vec![1.0 / n as f64; n];
        trace!("resampled {n} particles at trial {} step {}", self.trial, self.step);
        Ok(())
    }
    /// Weighted mean position and circular mean heading.
    pub fn estimate(&self) -> Result<Pose> {
        let sum: f64 = self.weight.iter().sum();
        if self.is_empty() || !(sum > 0.0) {
            return Err(LocalizationError::EmptyPopulation);
        }
        let mut latitude = 0.0;
        let mut longitude = 0.0;
        let mut sin = 0.0;
        let mut cos = 0.0;
        for i in 0..self.len() {
            let w = self.weight[i];
            latitude += w * self.latitude[i];
            longitude += w * self.longitude[i];
            sin += w * self.yaw[i].sin();
            cos += w * self.yaw[i].cos();
        }
        Ok(Pose::new(latitude / sum, longitude / sum, sin.atan2(cos)))
    }
    /// The heaviest particle.
    pub fn best_particle(&self) -> Option<Particle> {
        (0..self.len())
            .max_by(|&a, &b| self.weight[a].total_cmp(&self.weight[b]))
            .map(|i| self.particle(i))
    }
    pub fn particle(&self, i: usize) -> Particle {
        Particle {
            latitude: self.latitude[i],
            longitude: self.longitude[i],
            yaw: self.yaw[i],
            weight: self.weight[i],
        }
    }
    /// Snapshot of the whole population.
    pub fn particles(&self) -> Vec<Particle> {
        (0..self.len()).map(|i| self.particle(i)).collect()
    }
    /// Replace the population, e.g. to restore a snapshot.
    pub fn set_particles(&mut self, particles: &[Particle]) {
        self.latitude = particles.iter().map(|p| p.latitude).collect();
        self.longitude = particles.iter().map(|p| p.longitude).collect();
        self.yaw = particles.iter().map(|p| p.yaw).collect();
        self.weight = particles.iter().map(|p| p.weight).collect();
    }
    /// Keep the particles at `indices`, in that order.
    fn select(&mut self, indices: &[usize]) {
        self.latitude = indices.iter().map(|&i| self.latitude[i]).collect();
        self.longitude = indices.iter().map(|&i| self.longitude[i]).collect();
        self.yaw = indices.iter().map(|&i| self.yaw[i]).collect();
        self.weight = indices.iter().map(|&i| self.weight[i]).collect();
    }
}

/// `U[low, high)`, or `low` when the range is empty.
fn uniform(rng: &mut StdRng, low: f64, high: f64) -> f64 {
    if high > low {
        rng.random_range(low..high)
    } else {
        low
    }
}
