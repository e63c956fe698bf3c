//! Landmark geometry: gaze metric normalization and face alignment
//!
//! The gaze metric is the offset of the iris midpoint from the nose tip,
//! divided by the inter-ocular (eye corner) distance, with the vertical axis
//! flipped so that looking up is positive. Dividing by the inter-ocular
//! distance makes the metric independent of translation and of the face's
//! distance to the camera.

use glam::{DAffine2, DVec2};
use serde::{Deserialize, Serialize};

use crate::error::GeometryError;
use crate::tracking::landmarks::{
    LEFT_EYE_CORNER, LEFT_IRIS_CENTER, NOSE_TIP, RIGHT_EYE_CORNER, RIGHT_IRIS_CENTER,
};
use crate::tracking::{CoordinateSpace, FrameSize, LandmarkFrame, LandmarkPoint};

/// Normalized gaze offset for one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazeMetric {
    #[serde(rename = "normX")]
    pub norm_x: f64,
    #[serde(rename = "normY")]
    pub norm_y: f64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: f64,
}

impl GazeMetric {
    /// Multiply both axes by a user sensitivity factor
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            norm_x: self.norm_x * factor,
            norm_y: self.norm_y * factor,
            ..self
        }
    }
}

struct RequiredLandmarks {
    left_iris: DVec2,
    right_iris: DVec2,
    left_corner: DVec2,
    right_corner: DVec2,
    nose: DVec2,
}

fn require(frame: &LandmarkFrame, index: usize, name: &'static str) -> Result<DVec2, GeometryError> {
    frame
        .get(index)
        .map(|p| DVec2::new(p.x, p.y))
        .ok_or(GeometryError::IncompleteLandmarks { index, name })
}

impl RequiredLandmarks {
    fn from_frame(frame: &LandmarkFrame) -> Result<Self, GeometryError> {
        Ok(Self {
            left_iris: require(frame, LEFT_IRIS_CENTER, "left iris center")?,
            right_iris: require(frame, RIGHT_IRIS_CENTER, "right iris center")?,
            left_corner: require(frame, LEFT_EYE_CORNER, "left eye corner")?,
            right_corner: require(frame, RIGHT_EYE_CORNER, "right eye corner")?,
            nose: require(frame, NOSE_TIP, "nose tip")?,
        })
    }
}

/// Compute the gaze metric from raw landmarks.
pub fn gaze_metric(frame: &LandmarkFrame) -> Result<GazeMetric, GeometryError> {
    let lm = RequiredLandmarks::from_frame(frame)?;

    let iris_center = (lm.left_iris + lm.right_iris) * 0.5;
    let relative = DVec2::new(iris_center.x - lm.nose.x, lm.nose.y - iris_center.y);

    let inter_ocular = lm.left_corner.distance(lm.right_corner);
    if !inter_ocular.is_finite() || inter_ocular <= f64::EPSILON {
        return Err(GeometryError::DegenerateGeometry);
    }

    Ok(GazeMetric {
        norm_x: relative.x / inter_ocular,
        norm_y: relative.y / inter_ocular,
        timestamp_ms: frame.captured_at_ms,
    })
}

/// Similarity transform that puts the inter-iris segment at a canonical
/// length, horizontal, centered on the canvas. Works in pixel units.
///
/// Returns `None` when an iris is missing or both irises coincide.
pub fn alignment_transform(
    frame: &LandmarkFrame,
    size: FrameSize,
    desired_inter_iris_ratio: f64,
) -> Option<DAffine2> {
    let to_px = pixel_scale(frame.space, size);
    let left = frame.get(LEFT_IRIS_CENTER)?;
    let right = frame.get(RIGHT_IRIS_CENTER)?;
    let left = DVec2::new(left.x, left.y) * to_px;
    let right = DVec2::new(right.x, right.y) * to_px;

    let delta = right - left;
    let current = delta.length();
    if !current.is_finite() || current <= f64::EPSILON {
        return None;
    }

    let angle = delta.y.atan2(delta.x);
    let scale = desired_inter_iris_ratio * size.width / current;
    let eye_mid = (left + right) * 0.5;
    let canvas_center = DVec2::new(size.width, size.height) * 0.5;

    Some(
        DAffine2::from_scale_angle_translation(DVec2::splat(scale), -angle, canvas_center)
            * DAffine2::from_translation(-eye_mid),
    )
}

fn pixel_scale(space: CoordinateSpace, size: FrameSize) -> DVec2 {
    match space {
        CoordinateSpace::Normalized => DVec2::new(size.width, size.height),
        CoordinateSpace::Pixels => DVec2::ONE,
    }
}

/// Apply the alignment transform to every landmark. The result is in pixels.
pub fn align_frame(frame: &LandmarkFrame, size: FrameSize, transform: &DAffine2) -> LandmarkFrame {
    let to_px = pixel_scale(frame.space, size);
    let points = frame
        .points
        .iter()
        .map(|p| {
            let q = transform.transform_point2(DVec2::new(p.x, p.y) * to_px);
            LandmarkPoint { x: q.x, y: q.y, z: p.z }
        })
        .collect();

    LandmarkFrame::new(points, CoordinateSpace::Pixels, frame.captured_at_ms)
}

/// Landmark-to-metric stage with an optional face-alignment pre-pass
#[derive(Debug, Clone)]
pub struct GeometryNormalizer {
    alignment: bool,
    desired_inter_iris_ratio: f64,
}

impl GeometryNormalizer {
    pub fn new(alignment: bool, desired_inter_iris_ratio: f64) -> Self {
        Self {
            alignment,
            desired_inter_iris_ratio,
        }
    }

    pub fn set_alignment(&mut self, enabled: bool) {
        self.alignment = enabled;
    }

    pub fn alignment_enabled(&self) -> bool {
        self.alignment
    }

    /// Normalize one frame. With alignment on, the metric is computed on the
    /// aligned landmarks; if alignment is impossible the raw ones are used.
    pub fn normalize(&self, frame: &LandmarkFrame, size: FrameSize) -> Result<GazeMetric, GeometryError> {
        if self.alignment {
            match alignment_transform(frame, size, self.desired_inter_iris_ratio) {
                Some(transform) => return gaze_metric(&align_frame(frame, size, &transform)),
                None => tracing::debug!("Alignment skipped: degenerate iris segment"),
            }
        }
        gaze_metric(frame)
    }
}

impl Default for GeometryNormalizer {
    fn default() -> Self {
        Self::new(false, 0.1)
    }
}
