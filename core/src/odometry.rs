//! Frame-to-frame visual odometry
//!
//! The [`MotionEstimator`] keeps the previous frame, its ORB keypoints and descriptors and the
//! last successful motion estimate. Every call to [`MotionEstimator::estimate`] with a new
//! frame:
//!
//! 1. detects ORB keypoints and descriptors in the new frame;
//! 2. brute-force matches the previous descriptors against the new ones (Hamming, best first);
//! 3. fits a homography mapping previous keypoints onto new ones with RANSAC;
//! 4. reads the translation from the normalized homography's last column and the yaw from
//!    its upper-left rotation block.
//!
//! Whenever a stage does not produce enough support (no features, too few matches, too few
//! inliers) the previous estimate is returned again (a *sticky* fallback) and the failure
//! is reported through [`MotionStatus`]. In every case the new frame and its features replace
//! the stored ones, so the next call compares against this frame.
//!
//! The estimator is a sequential state machine: frames must be fed in capture order, one
//! call at a time.
use crate::config::OdometryConfig;
use crate::error::Result;

use image::{GrayImage, Luma};
use log::warn;
use nalgebra::{Matrix3, Point2, Vector2};
use opencv::calib3d;
use opencv::core::{DMatch, KeyPoint, Mat, NORM_HAMMING, Point2f, Ptr, Vector};
use opencv::features2d::{self, BFMatcher, ORB};
use opencv::prelude::*;

/// Below this rotation-block scale the yaw is reported as zero
const SINGULAR_SCALE: f64 = 1e-6;
/// Size of the ORB patch and of the border where no keypoints are detected
const ORB_PATCH_SIZE: i32 = 31;
/// A homography needs at least this many correspondences
const MIN_HOMOGRAPHY_POINTS: usize = 4;

/// Outcome of a motion estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionStatus {
    /// A fresh estimate supported by this many matches and RANSAC inliers
    Estimated { matches: usize, inliers: usize },
    /// The previous or the new frame had no features
    NoFeatures,
    /// Not enough descriptor matches
    TooFewMatches(usize),
    /// Not enough RANSAC inliers
    TooFewInliers(usize),
}
impl MotionStatus {
    pub fn is_fallback(&self) -> bool {
        !matches!(self, MotionStatus::Estimated { .. })
    }
}

#[derive(Clone, Debug)]
pub struct MotionEstimate {
    /// Heading change between the frames in radians
    pub yaw: f64,
    /// Image translation in pixels
    pub translation: Vector2<f64>,
    pub status: MotionStatus,
    /// Match visualization (or the new frame on fallback) when debug images are enabled
    pub debug_image: Option<GrayImage>,
}

/// State carried between frames.
#[derive(Debug)]
pub struct MotionState {
    pub previous_frame: GrayImage,
    pub previous_keypoints: Vector<KeyPoint>,
    /// One 32-byte ORB descriptor per row
    pub previous_descriptors: Mat,
    pub last_yaw: f64,
    pub last_translation: Vector2<f64>,
}

enum Fit {
    Motion {
        yaw: f64,
        translation: Vector2<f64>,
        matches: usize,
        /// Inlier correspondences, previous frame first
        inliers: Vec<(Point2<f64>, Point2<f64>)>,
    },
    Fallback(MotionStatus),
}

pub struct MotionEstimator {
    orb: Ptr<ORB>,
    matcher: Ptr<BFMatcher>,
    config: OdometryConfig,
    state: MotionState,
}
impl MotionEstimator {
    /// Start a new sequence at `first_frame`; the initial estimate is zero motion.
    pub fn new(first_frame: GrayImage, config: &OdometryConfig) -> Result<Self> {
        let mut orb = ORB::create(
            config.num_features as i32,
            config.scale_factor as f32,
            config.pyramid_levels as i32,
            ORB_PATCH_SIZE,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            ORB_PATCH_SIZE,
            config.fast_threshold as i32,
        )?;
        let matcher = BFMatcher::create(NORM_HAMMING, false)?;
        let (previous_keypoints, previous_descriptors) = detect(&mut orb, &first_frame)?;
        Ok(MotionEstimator {
            orb,
            matcher,
            config: config.clone(),
            state: MotionState {
                previous_frame: first_frame,
                previous_keypoints,
                previous_descriptors,
                last_yaw: 0.0,
                last_translation: Vector2::zeros(),
            },
        })
    }
    pub fn state(&self) -> &MotionState {
        &self.state
    }
    /// Estimate the motion from the stored frame to `frame`, then make `frame` the stored one.
    ///
    /// # Errors
    /// Only OpenCV failures are errors; a lack of support is a fallback [`MotionStatus`].
    pub fn estimate(&mut self, frame: GrayImage) -> Result<MotionEstimate> {
        let (keypoints, descriptors) = detect(&mut self.orb, &frame)?;
        let estimate = match self.fit(&keypoints, &descriptors)? {
            Fit::Motion {
                yaw,
                translation,
                matches,
                inliers,
            } => {
                self.state.last_yaw = yaw;
                self.state.last_translation = translation;
                let debug_image = self
                    .config
                    .debug_images
                    .then(|| draw_matches(&self.state.previous_frame, &frame, &inliers));
                MotionEstimate {
                    yaw,
                    translation,
                    status: MotionStatus::Estimated {
                        matches,
                        inliers: inliers.len(),
                    },
                    debug_image,
                }
            }
            Fit::Fallback(status) => {
                match status {
                    MotionStatus::TooFewMatches(n) => warn!("not enough matched points ({n})"),
                    MotionStatus::TooFewInliers(n) => warn!("not enough points in ransac ({n})"),
                    _ => warn!("no features to match, keeping the previous motion estimate"),
                }
                MotionEstimate {
                    yaw: self.state.last_yaw,
                    translation: self.state.last_translation,
                    status,
                    debug_image: self.config.debug_images.then(|| frame.clone()),
                }
            }
        };
        self.state.previous_frame = frame;
        self.state.previous_keypoints = keypoints;
        self.state.previous_descriptors = descriptors;
        Ok(estimate)
    }
    fn fit(&self, keypoints: &Vector<KeyPoint>, descriptors: &Mat) -> Result<Fit> {
        let previous_keypoints = &self.state.previous_keypoints;
        let previous_descriptors = &self.state.previous_descriptors;
        if previous_keypoints.is_empty()
            || keypoints.is_empty()
            || previous_descriptors.empty()
            || descriptors.empty()
        {
            return Ok(Fit::Fallback(MotionStatus::NoFeatures));
        }
        let mut found = Vector::<DMatch>::new();
        self.matcher
            .train_match(previous_descriptors, descriptors, &mut found, &Mat::default())?;
        let mut matches = found.to_vec();
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        if matches.len() < self.config.min_matches.max(MIN_HOMOGRAPHY_POINTS) {
            return Ok(Fit::Fallback(MotionStatus::TooFewMatches(matches.len())));
        }

        let mut src = Vector::<Point2f>::with_capacity(matches.len());
        let mut dst = Vector::<Point2f>::with_capacity(matches.len());
        for m in &matches {
            src.push(previous_keypoints.get(m.query_idx as usize)?.pt());
            dst.push(keypoints.get(m.train_idx as usize)?.pt());
        }
        let mut mask = Mat::default();
        let homography = calib3d::find_homography_ext(
            &src,
            &dst,
            calib3d::RANSAC,
            self.config.ransac_reprojection_threshold,
            &mut mask,
            self.config.ransac_max_iterations as i32,
            self.config.ransac_confidence,
        )?;
        if homography.empty() || mask.empty() {
            return Ok(Fit::Fallback(MotionStatus::TooFewInliers(0)));
        }
        let inliers: Vec<(Point2<f64>, Point2<f64>)> = mask
            .data_typed::<u8>()?
            .iter()
            .zip(src.iter().zip(dst.iter()))
            .filter(|(keep, _)| **keep != 0)
            .map(|(_, (p, q))| (point(p), point(q)))
            .collect();
        if inliers.len() <= self.config.min_inliers {
            return Ok(Fit::Fallback(MotionStatus::TooFewInliers(inliers.len())));
        }

        let mut h = Matrix3::<f64>::zeros();
        for r in 0..3 {
            for c in 0..3 {
                h[(r, c)] = *homography.at_2d::<f64>(r as i32, c as i32)?;
            }
        }
        if h[(2, 2)].abs() < f64::EPSILON {
            return Ok(Fit::Fallback(MotionStatus::TooFewInliers(inliers.len())));
        }
        let h = h / h[(2, 2)];
        let translation = Vector2::new(h[(0, 2)], h[(1, 2)]);
        let sy = (h[(0, 0)] * h[(0, 0)] + h[(1, 0)] * h[(1, 0)]).sqrt();
        let yaw = if sy < SINGULAR_SCALE {
            0.0
        } else {
            h[(1, 0)].atan2(h[(0, 0)])
        };
        Ok(Fit::Motion {
            yaw,
            translation,
            matches: matches.len(),
            inliers,
        })
    }
}

/// ORB keypoints and descriptors of a grayscale frame.
fn detect(orb: &mut Ptr<ORB>, frame: &GrayImage) -> Result<(Vector<KeyPoint>, Mat)> {
    let mut keypoints = Vector::<KeyPoint>::new();
    let mut descriptors = Mat::default();
    if frame.width() == 0 || frame.height() == 0 {
        return Ok((keypoints, descriptors));
    }
    let image = Mat::new_rows_cols_with_data(
        frame.height() as i32,
        frame.width() as i32,
        frame.as_raw().as_slice(),
    )?;
    orb.detect_and_compute(&image, &Mat::default(), &mut keypoints, &mut descriptors, false)?;
    Ok((keypoints, descriptors))
}

fn point(p: Point2f) -> Point2<f64> {
    Point2::new(p.x as f64, p.y as f64)
}

/// Side-by-side view of two frames with the inlier correspondences drawn as lines.
pub fn draw_matches(
    left: &GrayImage,
    right: &GrayImage,
    correspondences: &[(Point2<f64>, Point2<f64>)],
) -> GrayImage {
    let width = left.width() + right.width();
    let height = left.height().max(right.height());
    let mut canvas = GrayImage::new(width, height);
    image::imageops::replace(&mut canvas, left, 0, 0);
    image::imageops::replace(&mut canvas, right, left.width() as i64, 0);
    let offset = left.width() as f64;
    for (p, q) in correspondences {
        draw_line(&mut canvas, (p.x, p.y), (q.x + offset, q.y));
        draw_cross(&mut canvas, p.x, p.y);
        draw_cross(&mut canvas, q.x + offset, q.y);
    }
    canvas
}

fn put(canvas: &mut GrayImage, x: f64, y: f64) {
    let (x, y) = (x.round(), y.round());
    if x >= 0.0 && y >= 0.0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, Luma([255]));
    }
}

fn draw_line(canvas: &mut GrayImage, from: (f64, f64), to: (f64, f64)) {
    let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).ceil().max(1.0) as usize;
    for i in 0..=steps {
        let s = i as f64 / steps as f64;
        put(canvas, from.0 + s * (to.0 - from.0), from.1 + s * (to.1 - from.1));
    }
}

fn draw_cross(canvas: &mut GrayImage, x: f64, y: f64) {
    for d in -2..=2 {
        put(canvas, x + d as f64, y);
        put(canvas, x, y + d as f64);
    }
}
