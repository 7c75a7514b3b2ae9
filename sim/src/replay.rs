//! Replay of recorded flights.
//!
//! A recording directory holds one sub-directory per trial:
//!
//! ```text
//! recording/
//!   trial_0/
//!     frame_0000.png
//!     frame_0001.png
//!     ...
//!     descriptors.csv
//!   trial_1/
//!     ...
//! ```
//!
//! `descriptors.csv` has no header and one row of D values per step; it holds the output of the
//! place-recognition encoder for the frame of that step.
use aerialmcl::localizer::{ObservationEncoder, Sensor};
use aerialmcl::{LocalizationError, Pose, Result};

use image::{GrayImage, imageops};
use log::trace;
use nalgebra::DVector;
use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Position of the replay, shared between the sensor and the encoder.
pub type Cursor = Rc<Cell<(usize, usize)>>;

/// Build a sensor/encoder pair reading from the same recording.
pub fn open_recording(root: &Path) -> (ReplaySensor, ReplayEncoder) {
    let cursor: Cursor = Rc::new(Cell::new((0, 0)));
    (
        ReplaySensor {
            root: root.to_path_buf(),
            cursor: Rc::clone(&cursor),
        },
        ReplayEncoder {
            root: root.to_path_buf(),
            cursor,
            descriptors: HashMap::new(),
        },
    )
}

pub fn frame_path(root: &Path, trial: usize, step: usize) -> PathBuf {
    root.join(format!("trial_{trial}"))
        .join(format!("frame_{step:04}.png"))
}

pub fn descriptors_path(root: &Path, trial: usize) -> PathBuf {
    root.join(format!("trial_{trial}")).join("descriptors.csv")
}

/// Zoom into the centre of `image` by `scale` (> 1 zooms in, < 1 zooms out with black borders).
pub fn zoom(image: &GrayImage, scale: f64) -> GrayImage {
    let (w, h) = image.dimensions();
    if (scale - 1.0).abs() < 1e-9 || w == 0 || h == 0 {
        return image.clone();
    }
    let sw = ((w as f64 * scale).round() as u32).max(1);
    let sh = ((h as f64 * scale).round() as u32).max(1);
    let scaled = imageops::resize(image, sw, sh, imageops::FilterType::Triangle);
    let mut out = GrayImage::new(w, h);
    // offset of the scaled image relative to the output frame
    let ox = (w as i64 - sw as i64) / 2;
    let oy = (h as i64 - sh as i64) / 2;
    imageops::replace(&mut out, &scaled, ox, oy);
    out
}

pub struct ReplaySensor {
    root: PathBuf,
    cursor: Cursor,
}
impl Sensor for ReplaySensor {
    fn sense(&mut self, trial: usize, step: usize, pose: &Pose, scale: f64) -> Result<GrayImage> {
        let path = frame_path(&self.root, trial, step);
        if !path.exists() {
            return Err(LocalizationError::MissingResource(format!(
                "frame {}",
                path.display()
            )));
        }
        trace!("sensing {} at {} (scale {:.3})", path.display(), pose, scale);
        let frame = image::open(&path)?.into_luma8();
        self.cursor.set((trial, step));
        Ok(zoom(&frame, scale))
    }
}

pub struct ReplayEncoder {
    root: PathBuf,
    cursor: Cursor,
    descriptors: HashMap<usize, Vec<DVector<f64>>>,
}
impl ReplayEncoder {
    fn load(&self, trial: usize) -> Result<Vec<DVector<f64>>> {
        let path = descriptors_path(&self.root, trial);
        if !path.exists() {
            return Err(LocalizationError::MissingResource(format!(
                "descriptors {}",
                path.display()
            )));
        }
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        let mut rows = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let values = record
                .iter()
                .map(|v| v.trim().parse::<f64>())
                .collect::<std::result::Result<Vec<f64>, _>>()
                .map_err(|e| {
                    LocalizationError::MalformedResource(format!(
                        "{} row {}: {}",
                        path.display(),
                        line,
                        e
                    ))
                })?;
            rows.push(DVector::from_vec(values));
        }
        Ok(rows)
    }
}
impl ObservationEncoder for ReplayEncoder {
    fn encode(&mut self, _image: &GrayImage) -> Result<DVector<f64>> {
        let (trial, step) = self.cursor.get();
        if !self.descriptors.contains_key(&trial) {
            let rows = self.load(trial)?;
            self.descriptors.insert(trial, rows);
        }
        self.descriptors
            .get(&trial)
            .and_then(|rows| rows.get(step))
            .cloned()
            .ok_or_else(|| {
                LocalizationError::MissingResource(format!(
                    "no recorded descriptor for trial {trial} step {step}"
                ))
            })
    }
}
