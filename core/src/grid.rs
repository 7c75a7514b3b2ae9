//! Precomputed descriptor grid and its trilinear sampler
//!
//! The map used by the localizer is a 4-D array `[H, W, T, D]` of embeddings: `H` rows
//! (north to south), `W` columns (west to east), `T` heading bins evenly spaced over a
//! full turn, and `D` embedding dimensions. Each cell additionally carries the latitude
//! and longitude of its centre, from which the working-frame bounds are derived.
//!
//! Queries are continuous: `y` (row), `x` (column) and `t` (heading in bin units). Rows and
//! columns are clamped at the edges, while the heading axis is circular so that `t = T`
//! is the same query as `t = 0`. The interpolated embedding is always returned with unit
//! L2 norm; a zero-norm result is reported as
//! [`LocalizationError::DegenerateDescriptor`] rather than divided through.
//!
//! ## Grid file format
//!
//! Grids are stored as CSV with one record per (row, column, bin):
//!
//! ```text
//! row,col,latitude,longitude,bin,d0,d1,...,d{D-1}
//! ```
//!
//! Every cell and bin must appear exactly once.
use crate::error::{LocalizationError, Result};
use crate::geo::BoundingBox;

use nalgebra::DVector;
use ndarray::{Array4, s};
use std::fmt::{self, Debug};
use std::io;
use std::path::Path;

/// Number of leading, non-descriptor columns in a grid CSV record
const GRID_META_COLUMNS: usize = 5;

#[derive(Clone)]
pub struct DescriptorGrid {
    data: Array4<f32>,
    /// Working-frame bounds derived from the per-cell coordinates
    bounds: BoundingBox,
}
impl Debug for DescriptorGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, w, t, d) = self.data.dim();
        f.debug_struct("DescriptorGrid")
            .field("rows", &h)
            .field("cols", &w)
            .field("orientation_bins", &t)
            .field("descriptor_dim", &d)
            .field("bounds", &self.bounds)
            .finish()
    }
}
impl DescriptorGrid {
    /// Wrap an existing `[H, W, T, D]` array.
    ///
    /// # Arguments
    /// * `data` - embeddings indexed by (row, column, bin, dimension); row 0 is the northern edge
    /// * `bounds` - latitude/longitude extent spanned by the cell centres
    pub fn new(data: Array4<f32>, bounds: BoundingBox) -> Result<Self> {
        let (h, w, t, d) = data.dim();
        if h == 0 || w == 0 || t == 0 || d == 0 {
            return Err(LocalizationError::MalformedResource(format!(
                "descriptor grid has an empty axis: [{h}, {w}, {t}, {d}]"
            )));
        }
        if !(bounds.max_lat >= bounds.min_lat && bounds.max_lon >= bounds.min_lon) {
            return Err(LocalizationError::MalformedResource(format!(
                "descriptor grid bounds are inverted: {bounds:?}"
            )));
        }
        Ok(DescriptorGrid { data, bounds })
    }
    /// Load a grid from CSV.
    ///
    /// `orientation_bins` is the expected number of heading bins; a file whose bins
    /// disagree is rejected.
    pub fn from_csv<P: AsRef<Path>>(path: P, orientation_bins: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LocalizationError::MissingResource(format!(
                "descriptor grid {}",
                path.display()
            )));
        }
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut cells: Vec<(usize, usize, usize, f64, f64, Vec<f32>)> = Vec::new();
        let mut dim: Option<usize> = None;
        for (line, result) in rdr.records().enumerate() {
            let record = result?;
            if record.len() <= GRID_META_COLUMNS {
                return Err(malformed(path, line, "record has no descriptor columns"));
            }
            let d = record.len() - GRID_META_COLUMNS;
            match dim {
                None => dim = Some(d),
                Some(expected) if expected != d => {
                    return Err(malformed(path, line, "inconsistent descriptor length"));
                }
                _ => {}
            }
            let row: usize = parse_field(&record, 0, path, line)?;
            let col: usize = parse_field(&record, 1, path, line)?;
            let latitude: f64 = parse_field(&record, 2, path, line)?;
            let longitude: f64 = parse_field(&record, 3, path, line)?;
            let bin: usize = parse_field(&record, 4, path, line)?;
            if bin >= orientation_bins {
                return Err(malformed(path, line, "orientation bin out of range"));
            }
            let mut descriptor = Vec::with_capacity(d);
            for i in GRID_META_COLUMNS..record.len() {
                descriptor.push(parse_field::<f32>(&record, i, path, line)?);
            }
            cells.push((row, col, bin, latitude, longitude, descriptor));
        }
        let d = dim.ok_or_else(|| {
            LocalizationError::MalformedResource(format!("{} contains no records", path.display()))
        })?;
        let h = cells.iter().map(|c| c.0).max().unwrap_or(0) + 1;
        let w = cells.iter().map(|c| c.1).max().unwrap_or(0) + 1;
        let expected = h * w * orientation_bins;
        if cells.len() != expected {
            return Err(LocalizationError::MalformedResource(format!(
                "{}: expected {expected} records for a {h}x{w}x{orientation_bins} grid, found {}",
                path.display(),
                cells.len()
            )));
        }
        let mut data = Array4::<f32>::zeros((h, w, orientation_bins, d));
        let mut seen = vec![false; expected];
        let mut bounds = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (row, col, bin, latitude, longitude, descriptor) in cells {
            let index = (row * w + col) * orientation_bins + bin;
            if seen[index] {
                return Err(LocalizationError::MalformedResource(format!(
                    "{}: duplicate record for row {row} col {col} bin {bin}",
                    path.display()
                )));
            }
            seen[index] = true;
            for (k, v) in descriptor.into_iter().enumerate() {
                data[[row, col, bin, k]] = v;
            }
            bounds.min_lat = bounds.min_lat.min(latitude);
            bounds.max_lat = bounds.max_lat.max(latitude);
            bounds.min_lon = bounds.min_lon.min(longitude);
            bounds.max_lon = bounds.max_lon.max(longitude);
        }
        Self::new(data, bounds)
    }
    /// Write the grid to CSV, reconstructing cell centres by linear spacing over the bounds.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let (h, w, t, d) = self.data.dim();
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec![
            "row".to_string(),
            "col".to_string(),
            "latitude".to_string(),
            "longitude".to_string(),
            "bin".to_string(),
        ];
        header.extend((0..d).map(|k| format!("d{k}")));
        writer.write_record(&header)?;
        for row in 0..h {
            let latitude = if h > 1 {
                self.bounds.max_lat - row as f64 * self.bounds.height() / (h - 1) as f64
            } else {
                self.bounds.max_lat
            };
            for col in 0..w {
                let longitude = if w > 1 {
                    self.bounds.min_lon + col as f64 * self.bounds.width() / (w - 1) as f64
                } else {
                    self.bounds.min_lon
                };
                for bin in 0..t {
                    let mut record = vec![
                        row.to_string(),
                        col.to_string(),
                        latitude.to_string(),
                        longitude.to_string(),
                        bin.to_string(),
                    ];
                    record.extend(self.data.slice(s![row, col, bin, ..]).iter().map(|v| v.to_string()));
                    writer.write_record(&record)?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }
    /// Grid shape as (rows, columns, orientation bins, descriptor dimension)
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }
    pub fn descriptor_dim(&self) -> usize {
        self.data.dim().3
    }
    pub fn orientation_bins(&self) -> usize {
        self.data.dim().2
    }
    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }
    /// Map a pose to fractional grid coordinates (y, x, t).
    ///
    /// Row 0 is the northern edge, column 0 the western edge, and `t = yaw * T / 2π`.
    pub fn to_grid_coordinates(&self, latitude: f64, longitude: f64, yaw: f64) -> (f64, f64, f64) {
        let (h, w, t, _) = self.data.dim();
        let lat_span = self.bounds.height();
        let lon_span = self.bounds.width();
        let y = if lat_span > 0.0 {
            (self.bounds.max_lat - latitude) * (h - 1) as f64 / lat_span
        } else {
            0.0
        };
        let x = if lon_span > 0.0 {
            (longitude - self.bounds.min_lon) * (w - 1) as f64 / lon_span
        } else {
            0.0
        };
        (y, x, yaw * t as f64 / std::f64::consts::TAU)
    }
    /// Interpolate a unit-norm descriptor at continuous grid coordinates.
    ///
    /// # Arguments
    /// * `y` - fractional row, clamped to `[0, H-1]` at each corner
    /// * `x` - fractional column, clamped to `[0, W-1]` at each corner
    /// * `t` - fractional heading bin, wrapped modulo `T`
    ///
    /// # Returns
    /// The L2-normalized interpolated descriptor, or
    /// [`LocalizationError::DegenerateDescriptor`] when it has zero (or non-finite) norm.
    pub fn sample(&self, y: f64, x: f64, t: f64) -> Result<DVector<f64>> {
        let (h, w, bins, d) = self.data.dim();
        let (y0, y1, yd) = clamped_corners(y, h);
        let (x0, x1, xd) = clamped_corners(x, w);
        let t_floor = t.floor();
        let td = t - t_floor;
        let t0 = (t_floor as i64).rem_euclid(bins as i64) as usize;
        let t1 = (t0 + 1) % bins;

        let mut out = DVector::<f64>::zeros(d);
        for (yi, wy) in [(y0, 1.0 - yd), (y1, yd)] {
            for (xi, wx) in [(x0, 1.0 - xd), (x1, xd)] {
                for (ti, wt) in [(t0, 1.0 - td), (t1, td)] {
                    let weight = wy * wx * wt;
                    if weight == 0.0 {
                        continue;
                    }
                    let corner = self.data.slice(s![yi, xi, ti, ..]);
                    for (o, v) in out.iter_mut().zip(corner.iter()) {
                        *o += weight * *v as f64;
                    }
                }
            }
        }
        let norm = out.norm();
        if !(norm > 0.0) || !norm.is_finite() {
            return Err(LocalizationError::DegenerateDescriptor { y, x, t });
        }
        Ok(out / norm)
    }
    /// Sample a batch of (y, x, t) queries; identical to calling [`Self::sample`] per query.
    pub fn sample_batch(&self, queries: &[(f64, f64, f64)]) -> Result<Vec<DVector<f64>>> {
        queries.iter().map(|&(y, x, t)| self.sample(y, x, t)).collect()
    }
}

/// Corner indices and blend fraction along a clamped axis of length `n`.
fn clamped_corners(v: f64, n: usize) -> (usize, usize, f64) {
    let floor = v.floor();
    let frac = v - floor;
    let max = (n - 1) as f64;
    let lo = floor.clamp(0.0, max) as usize;
    let hi = (floor + 1.0).clamp(0.0, max) as usize;
    (lo, hi, frac)
}

fn parse_field<T: std::str::FromStr>(
    record: &csv::StringRecord,
    index: usize,
    path: &Path,
    line: usize,
) -> Result<T> {
    record
        .get(index)
        .and_then(|s| s.trim().parse::<T>().ok())
        .ok_or_else(|| malformed(path, line, &format!("unparseable column {index}")))
}

fn malformed(path: &Path, line: usize, msg: &str) -> LocalizationError {
    LocalizationError::MalformedResource(format!("{} record {}: {}", path.display(), line + 1, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::NamedTempFile;

    fn random_grid(h: usize, w: usize, t: usize, d: usize, seed: u64) -> DescriptorGrid {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = Array4::from_shape_fn((h, w, t, d), |_| rng.random_range(-1.0f32..1.0));
        DescriptorGrid::new(data, BoundingBox::new(0.0, 0.0, 1.0, 1.0)).unwrap()
    }

    #[test]
    fn sample_is_unit_norm() {
        let grid = random_grid(6, 5, 8, 16, 7);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let y = rng.random_range(-2.0..8.0);
            let x = rng.random_range(-2.0..7.0);
            let t = rng.random_range(-10.0..20.0);
            let v = grid.sample(y, x, t).unwrap();
            assert_approx_eq!(v.norm(), 1.0, 1e-6);
        }
    }
    #[test]
    fn heading_axis_wraps() {
        let grid = random_grid(4, 4, 8, 8, 3);
        for &(y, x) in &[(0.0, 0.0), (1.3, 2.7), (3.0, 3.0)] {
            let a = grid.sample(y, x, 0.0).unwrap();
            let b = grid.sample(y, x, 8.0).unwrap();
            let c = grid.sample(y, x, -8.0).unwrap();
            for k in 0..8 {
                assert_approx_eq!(a[k], b[k], 1e-12);
                assert_approx_eq!(a[k], c[k], 1e-12);
            }
        }
        // between the last and first bin the blend uses bin T-1 and bin 0
        let mid = grid.sample(1.0, 1.0, 7.5).unwrap();
        let mut expected = DVector::<f64>::zeros(8);
        for k in 0..8 {
            expected[k] = 0.5 * (grid.data[[1, 1, 7, k]] as f64 + grid.data[[1, 1, 0, k]] as f64);
        }
        let expected = &expected / expected.norm();
        for k in 0..8 {
            assert_approx_eq!(mid[k], expected[k], 1e-9);
        }
    }
    #[test]
    fn integer_query_returns_cell() {
        let grid = random_grid(3, 3, 4, 5, 1);
        let v = grid.sample(2.0, 1.0, 3.0).unwrap();
        let cell: Vec<f64> = grid.data.slice(s![2, 1, 3, ..]).iter().map(|v| *v as f64).collect();
        let norm = cell.iter().map(|c| c * c).sum::<f64>().sqrt();
        for k in 0..5 {
            assert_approx_eq!(v[k], cell[k] / norm, 1e-9);
        }
    }
    #[test]
    fn edges_are_clamped() {
        let grid = random_grid(3, 3, 4, 5, 2);
        let inside = grid.sample(2.0, 2.0, 1.0).unwrap();
        let outside = grid.sample(5.0, 9.0, 1.0).unwrap();
        for k in 0..5 {
            assert_approx_eq!(inside[k], outside[k], 1e-12);
        }
    }
    #[test]
    fn zero_descriptor_is_degenerate() {
        let data = Array4::<f32>::zeros((2, 2, 2, 3));
        let grid = DescriptorGrid::new(data, BoundingBox::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert!(matches!(
            grid.sample(0.5, 0.5, 0.5),
            Err(LocalizationError::DegenerateDescriptor { .. })
        ));
    }
    #[test]
    fn batch_matches_single() {
        let grid = random_grid(5, 5, 8, 4, 9);
        let queries = vec![(0.1, 0.2, 0.3), (4.0, 4.0, 7.9), (2.5, 1.5, -0.5)];
        let batch = grid.sample_batch(&queries).unwrap();
        for (q, b) in queries.iter().zip(batch.iter()) {
            assert_eq!(&grid.sample(q.0, q.1, q.2).unwrap(), b);
        }
    }
    #[test]
    fn grid_coordinates_follow_bounds() {
        let grid = random_grid(11, 21, 8, 2, 4);
        let (y, x, t) = grid.to_grid_coordinates(1.0, 0.0, 0.0);
        assert_approx_eq!(y, 0.0);
        assert_approx_eq!(x, 0.0);
        assert_approx_eq!(t, 0.0);
        let (y, x, t) = grid.to_grid_coordinates(0.0, 1.0, std::f64::consts::PI);
        assert_approx_eq!(y, 10.0);
        assert_approx_eq!(x, 20.0);
        assert_approx_eq!(t, 4.0);
    }
    #[test]
    fn csv_roundtrip() {
        let grid = random_grid(3, 4, 2, 3, 5);
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("csv");
        grid.to_csv(&path).unwrap();
        let loaded = DescriptorGrid::from_csv(&path, 2).unwrap();
        assert_eq!(loaded.dim(), (3, 4, 2, 3));
        assert_approx_eq!(loaded.bounds().max_lat, 1.0, 1e-12);
        assert_approx_eq!(loaded.bounds().max_lon, 1.0, 1e-12);
        assert_approx_eq!(loaded.data[[2, 3, 1, 2]] as f64, grid.data[[2, 3, 1, 2]] as f64, 1e-6);
    }
    #[test]
    fn csv_rejects_wrong_bins_and_missing_files() {
        let grid = random_grid(2, 2, 4, 3, 5);
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("csv");
        grid.to_csv(&path).unwrap();
        assert!(matches!(
            DescriptorGrid::from_csv(&path, 2),
            Err(LocalizationError::MalformedResource(_))
        ));
        assert!(matches!(
            DescriptorGrid::from_csv(&path, 8),
            Err(LocalizationError::MalformedResource(_))
        ));
        assert!(matches!(
            DescriptorGrid::from_csv("/nonexistent/grid.csv", 8),
            Err(LocalizationError::MissingResource(_))
        ));
    }
}
