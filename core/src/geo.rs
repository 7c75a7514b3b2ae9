//! Geodetic glue for localizing over a mapped area
//!
//! The localization engine works on small areas (a few kilometers across) where a flat,
//! axis-aligned latitude/longitude box is an adequate model of the world. This module
//! provides that box ([`BoundingBox`]), the great-circle distance used to express
//! localization error in meters ([`haversine_distance`]), the slippy-map tile conversions
//! used to index aerial imagery ([`deg_to_tile`], [`tile_to_deg`]), and the [`Area`] that
//! ties them together.
//!
//! # Working frame
//! An area has two nested boxes. The *total* box is the full extent of the imagery. The
//! *working* box trims a strip from every edge (5% by default) so that a sensed image
//! centred anywhere inside it is still fully covered by imagery.
//!
//! Metric displacements are converted to degrees with the local arc-length scale of the
//! working box, i.e. the ratio between its angular span and its metric extent along the
//! bottom (longitude) and left (latitude) edges.
use serde::{Deserialize, Serialize};

/// Earth's mean radius in meters
pub const MEAN_RADIUS: f64 = 6371000.0; // meters
/// Default fraction of the total extent removed from each edge to form the working box
pub const DEFAULT_EDGE_STRIP: f64 = 0.05;

/// An axis-aligned latitude/longitude box in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}
impl BoundingBox {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        BoundingBox {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }
    /// Inclusive containment test.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_lat
            && latitude <= self.max_lat
            && longitude >= self.min_lon
            && longitude <= self.max_lon
    }
    /// Longitude span in degrees
    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }
    /// Latitude span in degrees
    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
    /// Shrink the box by `fraction` of its span on every side.
    ///
    /// # Example
    /// ```rust
    /// use aerialmcl::geo::BoundingBox;
    /// let bbox = BoundingBox::new(0.0, 0.0, 1.0, 2.0).shrink(0.1);
    /// assert!((bbox.min_lon - 0.2).abs() < 1e-12);
    /// assert!((bbox.max_lat - 0.9).abs() < 1e-12);
    /// ```
    pub fn shrink(&self, fraction: f64) -> Self {
        let strip_lat = fraction * self.height();
        let strip_lon = fraction * self.width();
        BoundingBox {
            min_lat: self.min_lat + strip_lat,
            min_lon: self.min_lon + strip_lon,
            max_lat: self.max_lat - strip_lat,
            max_lon: self.max_lon - strip_lon,
        }
    }
}

/// Great-circle distance between two points given in degrees.
///
/// # Arguments
/// * `lat1`, `lon1` - first point in degrees
/// * `lat2`, `lon2` - second point in degrees
///
/// # Returns
/// The distance in meters on a sphere of radius [`MEAN_RADIUS`].
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * MEAN_RADIUS * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Slippy-map tile indices (x, y) containing a point at the given zoom level.
pub fn deg_to_tile(latitude: f64, longitude: f64, zoom: u32) -> (i64, i64) {
    let lat_rad = latitude.to_radians();
    let n = 2f64.powi(zoom as i32);
    let x = ((longitude + 180.0) / 360.0 * n).floor() as i64;
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n)
        .floor() as i64;
    (x, y)
}

/// North-west corner (latitude, longitude) in degrees of a slippy-map tile.
pub fn tile_to_deg(x: i64, y: i64, zoom: u32) -> (f64, f64) {
    let n = 2f64.powi(zoom as i32);
    let longitude = x as f64 / n * 360.0 - 180.0;
    let lat_rad = (std::f64::consts::PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan();
    (lat_rad.to_degrees(), longitude)
}

/// A mapped area and its derived working frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Area {
    pub name: String,
    pub total_bbox: BoundingBox,
    pub working_bbox: BoundingBox,
    /// Metric extent of the working box along longitude (meters)
    pub world_size_x_m: f64,
    /// Metric extent of the working box along latitude (meters)
    pub world_size_y_m: f64,
}
impl Area {
    /// Build an area from its total extent, trimming `edge_strip` from every side.
    pub fn new(name: &str, total_bbox: BoundingBox, edge_strip: f64) -> Self {
        Self::with_working_bbox(name, total_bbox, total_bbox.shrink(edge_strip))
    }
    /// Build an area with an explicit working box.
    pub fn with_working_bbox(name: &str, total_bbox: BoundingBox, working_bbox: BoundingBox) -> Self {
        let world_size_x_m = haversine_distance(
            working_bbox.min_lat,
            working_bbox.min_lon,
            working_bbox.min_lat,
            working_bbox.max_lon,
        );
        let world_size_y_m = haversine_distance(
            working_bbox.min_lat,
            working_bbox.min_lon,
            working_bbox.max_lat,
            working_bbox.min_lon,
        );
        Area {
            name: name.to_string(),
            total_bbox,
            working_bbox,
            world_size_x_m,
            world_size_y_m,
        }
    }
    /// Angular span (latitude, longitude) of the working box in degrees
    pub fn arc_length(&self) -> (f64, f64) {
        (self.working_bbox.height(), self.working_bbox.width())
    }
    /// Convert a metric displacement (north, east) into degrees (latitude, longitude).
    pub fn meters_to_degrees(&self, dlat_m: f64, dlon_m: f64) -> (f64, f64) {
        let (arc_lat, arc_lon) = self.arc_length();
        (
            dlat_m * arc_lat / self.world_size_y_m,
            dlon_m * arc_lon / self.world_size_x_m,
        )
    }
}
