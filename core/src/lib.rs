//! Vision-based Monte Carlo localization for aerial vehicles
//!
//! This crate estimates the pose (latitude, longitude, heading) of an aerial vehicle flying over
//! a pre-mapped area using nothing but its downward-looking camera. Two sources of information
//! are fused by a particle filter:
//!
//! - **Visual odometry**: consecutive frames are matched with OpenCV's ORB features and a
//!   RANSAC planar homography, which yields the relative translation and heading change.
//! - **Place recognition**: a learned encoder (external to this crate) turns each frame into an
//!   embedding that is compared against a precomputed grid of embeddings covering the area.
//!
//! The map is a 4-D descriptor grid `[rows, columns, heading bins, dimensions]`. Particles look
//! up their expected embedding by trilinear interpolation (circular along the heading axis) and
//! are weighted by how close it is to the observed one.
//!
//! ## Crate overview
//!
//! - [geo]: bounding boxes, great-circle distance, slippy-map tiles and the working frame of an area.
//! - [grid]: the descriptor grid, its CSV format and the trilinear sampler.
//! - [odometry]: the frame-to-frame motion estimator (ORB, Hamming matching, RANSAC homography)
//!   with its sticky fallback.
//! - [particle]: the particle filter (motion update, weighting, resampling, estimation).
//! - [localizer]: the localizer capability, its sensor/encoder collaborators and the run loop.
//! - [sim]: CSV I/O for routes and localization results.
//! - [config]: run configuration (JSON, YAML or TOML).
//! - [error]: the crate error type.
//!
//! ## Conventions
//!
//! Latitudes and longitudes are in degrees, distances in meters, angles in radians. The yaw of a
//! particle is kept in `[0, 2π)`; the estimated yaw is a circular mean in `(-π, π]`. Grid row 0 is
//! the northern edge of the map and column 0 the western edge. Image translations are in pixels
//! and are scaled to meters by the ground sample distance of the sensed image.
//!
//! All randomness of the filter flows through an explicitly seeded [`rand::rngs::StdRng`], and
//! OpenCV's RANSAC draws from its own fixed-seed generator, so a run is reproducible from its seed.
pub mod config;
pub mod error;
pub mod geo;
pub mod grid;
pub mod localizer;
pub mod odometry;
pub mod particle;
pub mod sim;

pub use error::{LocalizationError, Result};

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A planar pose on the map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Heading in radians
    pub yaw: f64,
}
impl Pose {
    pub fn new(latitude: f64, longitude: f64, yaw: f64) -> Self {
        Pose {
            latitude,
            longitude,
            yaw,
        }
    }
    /// Great-circle distance to another pose in meters
    pub fn distance_to(&self, other: &Pose) -> f64 {
        geo::haversine_distance(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.7}°, {:.7}°, {:.1}°)",
            self.latitude,
            self.longitude,
            self.yaw.to_degrees()
        )
    }
}

/// Wrap an angle to the half-open range [0, 2π) radians
///
/// # Arguments
/// * `angle` - The angle to be wrapped
/// # Returns
/// * The wrapped angle; exactly 2π maps to 0.
/// # Example
/// ```rust
/// use aerialmcl::wrap_to_2pi;
/// use std::f64::consts::PI;
/// assert_eq!(wrap_to_2pi(5.0 * PI), PI);
/// assert_eq!(wrap_to_2pi(2.0 * PI), 0.0);
/// ```
pub fn wrap_to_2pi<T>(angle: T) -> T
where
    T: PartialOrd + Copy + std::ops::SubAssign + std::ops::AddAssign + From<f64>,
{
    let mut wrapped: T = angle;
    while wrapped >= T::from(2.0 * std::f64::consts::PI) {
        wrapped -= T::from(2.0 * std::f64::consts::PI);
    }
    while wrapped < T::from(0.0) {
        wrapped += T::from(2.0 * std::f64::consts::PI);
    }
    // a tiny negative angle can round up to exactly 2π
    if wrapped >= T::from(2.0 * std::f64::consts::PI) {
        wrapped = T::from(0.0);
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_wrap_to_2pi() {
        assert_approx_eq!(super::wrap_to_2pi(7.0 * PI), PI);
        assert_approx_eq!(super::wrap_to_2pi(-5.0 * PI), PI);
        assert_eq!(super::wrap_to_2pi(0.0), 0.0);
        assert_eq!(super::wrap_to_2pi(2.0 * PI), 0.0);
        assert_eq!(super::wrap_to_2pi(-PI), PI);
        let tiny = super::wrap_to_2pi(-1e-18);
        assert!((0.0..2.0 * PI).contains(&tiny));
    }
    #[test]
    fn pose_distance() {
        let a = Pose::new(51.5, -0.1, 0.0);
        let b = Pose::new(51.5, -0.1, 1.0);
        assert_approx_eq!(a.distance_to(&b), 0.0);
        let c = Pose::new(51.501, -0.1, 0.0);
        assert_approx_eq!(a.distance_to(&c), 111.19, 0.01);
    }
}
