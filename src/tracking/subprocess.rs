//! Landmark helper subprocess manager
//!
//! Launches the MediaPipe Face Mesh helper as a child process with automatic
//! cleanup on drop. The helper reads either a camera or a video file.

use tokio::process::{Child, Command};

use crate::config::TrackingConfig;
use crate::error::TrackingError;

/// Manages the landmark tracker helper subprocess
pub struct TrackerSubprocess {
    child: Option<Child>,
    config: TrackingConfig,
}

impl TrackerSubprocess {
    /// Create a new subprocess manager (does not start the process)
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            child: None,
            config: config.clone(),
        }
    }

    /// Command-line arguments passed to the helper script
    pub fn args(&self) -> Vec<String> {
        vec![
            self.config.tracker_script.clone(),
            "--ip".to_string(),
            self.config.listen_address.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
            "--capture".to_string(),
            self.config.source.clone(),
            "--width".to_string(),
            self.config.capture_width.to_string(),
            "--height".to_string(),
            self.config.capture_height.to_string(),
            "--fps".to_string(),
            self.config.capture_fps.to_string(),
        ]
    }

    /// Launch the helper.
    ///
    /// Runs: `python3 <tracker_script> --ip <listen_address> --port <port>
    ///        --capture <source> --width <w> --height <h> --fps <fps>`
    pub fn start(&mut self) -> Result<(), TrackingError> {
        if self.is_running() {
            return Ok(());
        }

        let child = Command::new("python3")
            .args(self.args())
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .map_err(|e| {
                TrackingError::Subprocess(format!(
                    "Failed to launch tracker at '{}': {}",
                    self.config.tracker_script, e
                ))
            })?;

        tracing::info!(
            "Tracker subprocess started (pid: {:?}, source: {}, port: {})",
            child.id(),
            self.config.source,
            self.config.port,
        );

        self.child = Some(child);
        Ok(())
    }

    /// Check if the subprocess is still running (non-blocking)
    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::warn!("Tracker subprocess exited with: {}", status);
                    self.child = None;
                    false
                }
                Err(e) => {
                    tracing::error!("Failed to check tracker subprocess status: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Stop the subprocess by killing it
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::info!("Stopping tracker subprocess (pid: {:?})", child.id());
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}
