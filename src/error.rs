//! Error types for Gazelink

use thiserror::Error;

/// Main error type for Gazelink
#[derive(Error, Debug)]
pub enum GazelinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFile(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration value: {field} - {message}")]
    InvalidValue { field: String, message: String },
}

/// Landmark-to-metric failures. Both are recoverable: the frame is skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Required landmark {name} (index {index}) is missing")]
    IncompleteLandmarks { index: usize, name: &'static str },

    #[error("Inter-ocular distance is zero")]
    DegenerateGeometry,
}

/// Telemetry transport errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Transport is closed")]
    Closed,
}

/// Session create / upload / settings errors.
///
/// The message carries backend-provided detail when there is any.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session creation failed: {0}")]
    SessionCreateFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Failed to fetch user settings: {0}")]
    SettingsFetch(String),

    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("No session has been created yet")]
    NoSession,

    #[error("Nothing to upload")]
    EmptyBuffer,
}

impl SessionError {
    /// The user-facing message without the error-kind prefix.
    pub fn message(&self) -> String {
        match self {
            Self::SessionCreateFailed(m)
            | Self::UploadFailed(m)
            | Self::SettingsFetch(m)
            | Self::Client(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

/// Landmark source errors (receiver + helper subprocess)
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Landmark receiver error: {0}")]
    Receiver(String),

    #[error("Landmark packet parse error: {0}")]
    Parse(String),

    #[error("Tracker subprocess error: {0}")]
    Subprocess(String),
}

/// Result type alias for Gazelink operations
pub type Result<T> = std::result::Result<T, GazelinkError>;
