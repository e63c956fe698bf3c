//! Exponential moving average smoothing for gaze metrics.
//!
//! `smoothed[i] = alpha * raw[i] + (1 - alpha) * smoothed[i - 1]`, seeded with
//! the first raw value. Each axis is filtered independently.

use std::collections::VecDeque;

use crate::error::ConfigError;
use crate::geometry::GazeMetric;

/// Single-channel EMA filter with a bounded trailing history.
///
/// The history is for diagnostics and graphing only; the recurrence uses
/// just the last smoothed value.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    last: Option<f64>,
    history: VecDeque<f64>,
    capacity: usize,
}

impl Ema {
    pub fn new(alpha: f64, capacity: usize) -> Result<Self, ConfigError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "alpha".to_string(),
                message: format!("{} is outside (0, 1]", alpha),
            });
        }
        if capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "history_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            alpha,
            last: None,
            history: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Feed a raw sample and return the smoothed value
    pub fn update(&mut self, raw: f64) -> f64 {
        let smoothed = match self.last {
            Some(prev) => self.alpha * raw + (1.0 - self.alpha) * prev,
            None => raw,
        };
        self.last = Some(smoothed);

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(smoothed);

        smoothed
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Trailing smoothed values, oldest first
    pub fn history(&self) -> &VecDeque<f64> {
        &self.history
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.history.clear();
    }
}

/// A gaze metric after smoothing
pub type SmoothedMetric = GazeMetric;

/// Per-axis smoother for [`GazeMetric`]s
#[derive(Debug, Clone)]
pub struct MetricSmoother {
    x: Ema,
    y: Ema,
}

impl MetricSmoother {
    pub fn new(alpha: f64, capacity: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            x: Ema::new(alpha, capacity)?,
            y: Ema::new(alpha, capacity)?,
        })
    }

    pub fn smooth(&mut self, metric: GazeMetric) -> SmoothedMetric {
        GazeMetric {
            norm_x: self.x.update(metric.norm_x),
            norm_y: self.y.update(metric.norm_y),
            timestamp_ms: metric.timestamp_ms,
        }
    }

    pub fn x(&self) -> &Ema {
        &self.x
    }

    pub fn y(&self) -> &Ema {
        &self.y
    }

    pub fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
    }
}
