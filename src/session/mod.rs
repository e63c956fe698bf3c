//! Recording sessions: buffering analysis entries and persisting them

pub mod buffer;
pub mod client;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use buffer::{AnalysisEntry, SessionBuffer, PLACEHOLDER_SESSION_ID};
pub use client::SessionClient;

use crate::config::SessionConfig;

/// Server-assigned session id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body of `POST /createSession`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRequest {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub var_min: f64,
    pub var_max: f64,
    pub acc_min: f64,
    pub acc_max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl SessionRequest {
    /// Build a request for the given window. Threshold bounds are only sent
    /// when `include_bounds` is set; otherwise they go out as zeros.
    pub fn from_config(
        config: &SessionConfig,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        include_bounds: bool,
    ) -> Self {
        let (var_min, var_max, acc_min, acc_max) = if include_bounds {
            (config.var_min, config.var_max, config.acc_min, config.acc_max)
        } else {
            (0.0, 0.0, 0.0, 0.0)
        };

        Self {
            name: config.name.clone(),
            start_time,
            end_time,
            var_min,
            var_max,
            acc_min,
            acc_max,
            user_id: None,
        }
    }
}

/// Per-user pipeline switches from `GET /getUserSettings`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// Face-alignment pre-pass
    pub affine: bool,
    /// Send threshold bounds with new sessions
    pub min_max: bool,
    /// Live graph
    pub plotting: bool,
    /// Multiplier applied to smoothed metrics
    pub sensitivity: f64,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            affine: false,
            min_max: true,
            plotting: true,
            sensitivity: 1.0,
        }
    }
}
