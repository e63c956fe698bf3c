//! Tracking module
//!
//! Landmark sources for the gaze pipeline. The face-landmark detector itself
//! runs out of process (MediaPipe Face Mesh in a helper script); this module
//! receives its output and exposes it as [`LandmarkFrame`]s.

pub mod mediapipe;
pub mod subprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TrackingError;

/// Face Mesh landmark indices (refined-iris topology, 478 points)
pub mod landmarks {
    pub const LEFT_IRIS_CENTER: usize = 468;
    pub const RIGHT_IRIS_CENTER: usize = 473;
    pub const LEFT_EYE_CORNER: usize = 33;
    pub const RIGHT_EYE_CORNER: usize = 263;
    pub const NOSE_TIP: usize = 4;
}

/// A single landmark position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl LandmarkPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_z(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }
}

/// Units the landmark coordinates are expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSpace {
    /// Relative to the image, in [0, 1]
    #[default]
    Normalized,
    /// Image pixels
    Pixels,
}

/// Landmarks detected on one video frame, ordered by landmark index
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkFrame {
    pub points: Vec<LandmarkPoint>,
    pub space: CoordinateSpace,
    /// Monotonic capture time in milliseconds
    pub captured_at_ms: f64,
}

impl LandmarkFrame {
    pub fn new(points: Vec<LandmarkPoint>, space: CoordinateSpace, captured_at_ms: f64) -> Self {
        Self {
            points,
            space,
            captured_at_ms,
        }
    }

    /// Landmark at `index`, if the detector produced it and it is finite
    pub fn get(&self, index: usize) -> Option<LandmarkPoint> {
        self.points
            .get(index)
            .copied()
            .filter(|p| p.x.is_finite() && p.y.is_finite())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Image dimensions the landmarks were detected on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSize {
    pub width: f64,
    pub height: f64,
}

impl FrameSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Capability interface over the external face-landmark detector.
///
/// Each call waits for the next processed video frame and yields its
/// landmarks, or `None` when no face was found on it.
#[async_trait]
pub trait LandmarkDetector: Send {
    async fn detect(&mut self) -> Result<Option<LandmarkFrame>, TrackingError>;

    /// Dimensions of the frames being processed
    fn frame_size(&self) -> FrameSize;
}
