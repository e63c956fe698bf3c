//! MediaPipe Face Mesh landmark receiver
//!
//! Receives JSON-over-UDP packets from the `scripts/landmark_tracker.py`
//! helper, one packet per processed video frame.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::config::TrackingConfig;
use crate::error::TrackingError;
use crate::tracking::{CoordinateSpace, FrameSize, LandmarkDetector, LandmarkFrame, LandmarkPoint};

/// A single JSON packet from the landmark helper
#[derive(Debug, Clone, Deserialize)]
pub struct MpLandmarkPacket {
    /// Whether a face was detected this frame
    pub face_detected: bool,
    /// Landmarks as `[x, y]` or `[x, y, z]`, normalized to the image
    #[serde(default)]
    pub landmarks: Vec<Vec<f64>>,
    #[serde(default)]
    pub image_width: Option<u32>,
    #[serde(default)]
    pub image_height: Option<u32>,
    /// Capture time reported by the helper (monotonic milliseconds)
    #[serde(default)]
    pub timestamp_ms: Option<f64>,
}

impl MpLandmarkPacket {
    /// Convert to a frame; `None` when no usable face is present
    pub fn into_frame(self, fallback_ts_ms: f64) -> Result<Option<LandmarkFrame>, TrackingError> {
        if !self.face_detected || self.landmarks.is_empty() {
            return Ok(None);
        }

        let mut points = Vec::with_capacity(self.landmarks.len());
        for (i, coords) in self.landmarks.into_iter().enumerate() {
            let point = match coords.as_slice() {
                [x, y] => LandmarkPoint::new(*x, *y),
                [x, y, z] => LandmarkPoint::with_z(*x, *y, *z),
                other => {
                    return Err(TrackingError::Parse(format!(
                        "landmark {} has {} components",
                        i,
                        other.len()
                    )))
                }
            };
            points.push(point);
        }

        Ok(Some(LandmarkFrame::new(
            points,
            CoordinateSpace::Normalized,
            self.timestamp_ms.unwrap_or(fallback_ts_ms),
        )))
    }
}

/// Landmark receiver bound to the helper's UDP destination
pub struct MpLandmarkReceiver {
    config: TrackingConfig,
    socket: Option<UdpSocket>,
    frame_size: FrameSize,
    started_at: Instant,
    buf: Vec<u8>,
}

impl MpLandmarkReceiver {
    /// Create a new receiver (does not bind yet)
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            config: config.clone(),
            socket: None,
            frame_size: FrameSize::new(config.capture_width as f64, config.capture_height as f64),
            started_at: Instant::now(),
            buf: vec![0u8; 65536],
        }
    }

    /// Bind the UDP socket
    pub async fn start(&mut self) -> Result<(), TrackingError> {
        let addr = format!("{}:{}", self.config.listen_address, self.config.port);

        let socket = UdpSocket::bind(&addr).await.map_err(|e| {
            TrackingError::Receiver(format!("Failed to bind to {}: {}", addr, e))
        })?;

        tracing::info!("Landmark receiver listening on {}", addr);
        self.socket = Some(socket);
        self.started_at = Instant::now();

        Ok(())
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    /// Stop the receiver
    pub fn stop(&mut self) {
        self.socket = None;
        tracing::info!("Landmark receiver stopped");
    }
}

#[async_trait]
impl LandmarkDetector for MpLandmarkReceiver {
    async fn detect(&mut self) -> Result<Option<LandmarkFrame>, TrackingError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| TrackingError::Receiver("Receiver not started".to_string()))?;

        let size = socket
            .recv(&mut self.buf)
            .await
            .map_err(|e| TrackingError::Receiver(format!("Receive error: {}", e)))?;

        let packet: MpLandmarkPacket = serde_json::from_slice(&self.buf[..size])
            .map_err(|e| TrackingError::Parse(format!("JSON parse error: {}", e)))?;

        if let (Some(w), Some(h)) = (packet.image_width, packet.image_height) {
            if w > 0 && h > 0 {
                self.frame_size = FrameSize::new(w as f64, h as f64);
            }
        }

        let now_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
        packet.into_frame(now_ms)
    }

    fn frame_size(&self) -> FrameSize {
        self.frame_size
    }
}
