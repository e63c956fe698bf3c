//! Gazelink - Real-time gaze telemetry
//!
//! Turns face-mesh landmarks into a normalized gaze signal and streams it to
//! an analysis backend:
//! - Landmarks arrive from a MediaPipe helper process over UDP
//! - Iris offset is normalized by inter-ocular distance and EMA-smoothed
//! - Samples go out over a self-healing websocket, inference results come back
//! - Results are buffered per session and uploaded over HTTP
//! - A local dashboard serves status, the live probability graph and an SSE feed

pub mod config;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod pipeline;
pub mod session;
pub mod smoothing;
pub mod tracking;
pub mod transport;
pub mod web;

pub use config::Config;
pub use error::{GazelinkError, Result};

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};

use pipeline::PipelineStatus;

/// One inference result as pushed to dashboard subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbabilityUpdate {
    pub probability: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<f64>,
    /// Capture-relative time of the sample this result answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second: Option<f64>,
}

/// Application state shared between the pipeline task and the dashboard
#[derive(Debug)]
pub struct AppState {
    /// Current configuration
    pub config: RwLock<Config>,
    /// Latest pipeline snapshot
    pub status: RwLock<PipelineStatus>,
    /// Latest rendered graph
    pub graph_svg: RwLock<String>,
    /// Channel for probability updates
    pub probability_tx: broadcast::Sender<ProbabilityUpdate>,
    /// Shutdown flag; stays set once raised
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    /// Create a new application state with the given configuration
    pub fn new(config: Config) -> Arc<Self> {
        let (probability_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config: RwLock::new(config),
            status: RwLock::new(PipelineStatus::default()),
            graph_svg: RwLock::new(String::new()),
            probability_tx,
            shutdown_tx,
        })
    }

    /// Replace the pipeline snapshot
    pub async fn set_status(&self, status: PipelineStatus) {
        *self.status.write().await = status;
    }

    pub async fn get_status(&self) -> PipelineStatus {
        self.status.read().await.clone()
    }

    pub async fn set_graph_svg(&self, svg: String) {
        *self.graph_svg.write().await = svg;
    }

    /// Broadcast a probability update
    pub fn publish_probability(&self, update: ProbabilityUpdate) {
        let _ = self.probability_tx.send(update);
    }

    /// Subscribe to probability updates
    pub fn subscribe_probability(&self) -> broadcast::Receiver<ProbabilityUpdate> {
        self.probability_tx.subscribe()
    }

    /// Subscribe to the shutdown flag. A subscriber created after
    /// [`AppState::shutdown`] still sees it.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Resolve once shutdown has been requested, including before the call
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
