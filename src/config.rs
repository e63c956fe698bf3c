//! Configuration parsing and management for Gazelink

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, GazelinkError};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub alignment: AlignmentConfig,
    pub smoothing: SmoothingConfig,
    pub transport: TransportConfig,
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub graph: GraphConfig,
    pub http: HttpConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GazelinkError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::ReadFile(format!("{}: {}", path.as_ref().display(), e))
        })?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, GazelinkError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }

    /// Load configuration from default paths
    pub fn load() -> Result<Self, GazelinkError> {
        let paths = [
            PathBuf::from("gazelink.toml"),
            PathBuf::from("config/gazelink.toml"),
            dirs_path().join("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), GazelinkError> {
        if !(self.smoothing.alpha > 0.0 && self.smoothing.alpha <= 1.0) {
            return Err(invalid("smoothing.alpha", "Alpha must be in (0, 1]"));
        }
        if self.smoothing.history_capacity == 0 {
            return Err(invalid(
                "smoothing.history_capacity",
                "History capacity must be greater than 0",
            ));
        }

        if self.alignment.desired_inter_iris_ratio <= 0.0 {
            return Err(invalid(
                "alignment.desired_inter_iris_ratio",
                "Desired inter-iris ratio must be greater than 0",
            ));
        }

        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            return Err(invalid(
                "transport.url",
                "URL must use the ws:// or wss:// scheme",
            ));
        }

        if self.graph.capacity == 0 {
            return Err(invalid("graph.capacity", "Capacity must be greater than 0"));
        }
        if self.graph.width < 2 || self.graph.height == 0 {
            return Err(invalid(
                "graph.width",
                "Graph must be at least 2 pixels wide and 1 pixel tall",
            ));
        }

        if self.tracking.auto_launch {
            let path = Path::new(&self.tracking.tracker_script);
            if !path.exists() {
                tracing::warn!(
                    "Tracker auto_launch enabled but script not found at: {}",
                    self.tracking.tracker_script
                );
            }
        }

        if self.http.port == 0 {
            return Err(invalid("http.port", "Port must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> GazelinkError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

/// Landmark tracker helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// UDP port the helper sends landmark packets to
    pub port: u16,
    /// Listen address for the UDP socket
    pub listen_address: String,
    /// Launch the tracker helper as a subprocess
    pub auto_launch: bool,
    /// Path to the tracker helper script
    pub tracker_script: String,
    /// Camera index ("0") or path to an uploaded video file
    pub source: String,
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    /// Restart the helper if it exits
    pub auto_restart: bool,
    /// Delay before restarting a crashed helper (seconds)
    pub restart_delay_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            port: 12347,
            listen_address: "127.0.0.1".to_string(),
            auto_launch: true,
            tracker_script: "scripts/landmark_tracker.py".to_string(),
            source: "0".to_string(),
            capture_width: 640,
            capture_height: 480,
            capture_fps: 30,
            auto_restart: true,
            restart_delay_secs: 3,
        }
    }
}

/// Face-alignment pre-pass configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Overridden by the `affine` user setting when settings are fetched
    pub enabled: bool,
    /// Aligned inter-iris length as a fraction of canvas width
    pub desired_inter_iris_ratio: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            desired_inter_iris_ratio: 0.1,
        }
    }
}

/// EMA smoothing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub enabled: bool,
    /// Weight of the newest sample, in (0, 1]. 1.0 disables smoothing.
    pub alpha: f64,
    /// Number of trailing smoothed values kept for diagnostics
    pub history_capacity: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.1,
            history_capacity: 10,
        }
    }
}

/// Telemetry websocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    /// Fixed delay before each reconnect attempt (milliseconds)
    pub reconnect_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9090/ws".to_string(),
            reconnect_delay_ms: 3000,
        }
    }
}

/// Collection backend (HTTP) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Session token, sent as the `token` cookie
    pub auth_token: Option<String>,
    /// Caller identity attached to session creation and settings fetch
    pub user_id: Option<i64>,
    pub request_timeout_secs: u64,
    /// Fetch `/getUserSettings` at startup
    pub fetch_settings: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            user_id: None,
            request_timeout_secs: 10,
            fetch_settings: true,
        }
    }
}

/// How analysis entries get their session id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    /// Session is created before capture; entries are tagged as they complete
    Eager,
    /// Entries carry a placeholder id until the session exists, then get rewritten
    #[default]
    Retro,
}

/// What happens to the buffer after a successful upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep everything (subsequent uploads resend old entries)
    #[default]
    Retain,
    /// Drop the uploaded entries
    ClearOnSuccess,
}

/// Recording session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub name: String,
    pub strategy: BufferStrategy,
    pub retention: RetentionPolicy,
    /// Periodic upload interval in seconds; 0 uploads only when capture stops
    pub upload_interval_secs: u64,
    /// Session end time announced at creation in eager mode
    pub planned_duration_secs: u64,
    pub var_min: f64,
    pub var_max: f64,
    pub acc_min: f64,
    pub acc_max: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "Gaze session".to_string(),
            strategy: BufferStrategy::Retro,
            retention: RetentionPolicy::Retain,
            upload_interval_secs: 0,
            planned_duration_secs: 600,
            var_min: 4.5e-7,
            var_max: 1.3e-4,
            acc_min: 0.3,
            acc_max: 10.0,
        }
    }
}

/// Live probability graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    /// Rolling series length
    pub capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 600,
            height: 250,
            capacity: 100,
        }
    }
}

/// Dashboard HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8088,
            cors_enabled: true,
        }
    }
}

/// Get the platform-specific configuration directory
fn dirs_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        if let Some(config_dir) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(config_dir).join("gazelink");
        }
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".config/gazelink");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join("Library/Application Support/gazelink");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("gazelink");
        }
    }

    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.smoothing.alpha, 0.1);
        assert_eq!(config.smoothing.history_capacity, 10);
        assert_eq!(config.transport.reconnect_delay_ms, 3000);
        assert_eq!(config.graph.capacity, 100);
        assert_eq!(config.session.strategy, BufferStrategy::Retro);
        assert_eq!(config.session.retention, RetentionPolicy::Retain);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.tracking.auto_launch = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_alpha_out_of_range() {
        let mut config = Config::default();
        config.tracking.auto_launch = false;

        config.smoothing.alpha = 0.0;
        assert!(config.validate().is_err());

        config.smoothing.alpha = 1.5;
        assert!(config.validate().is_err());

        config.smoothing.alpha = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        let mut config = Config::default();
        config.tracking.auto_launch = false;
        config.transport.url = "http://localhost:9090/ws".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transport.url"));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [transport]
            url = "wss://example.org/ws"
            reconnect_delay_ms = 500

            [session]
            strategy = "eager"
            retention = "clear_on_success"

            [smoothing]
            alpha = 0.25
        "#;

        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.transport.url, "wss://example.org/ws");
        assert_eq!(config.transport.reconnect_delay_ms, 500);
        assert_eq!(config.session.strategy, BufferStrategy::Eager);
        assert_eq!(config.session.retention, RetentionPolicy::ClearOnSuccess);
        assert_eq!(config.smoothing.alpha, 0.25);
        // untouched sections keep their defaults
        assert_eq!(config.graph.width, 600);
    }
}
