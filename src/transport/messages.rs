//! Wire messages exchanged with the analysis backend

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::geometry::GazeMetric;

/// Outbound sample: `{"x": .., "y": .., "second": ..}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub x: f64,
    pub y: f64,
    /// Seconds since capture start, millisecond precision
    pub second: f64,
}

impl TelemetrySample {
    pub fn new(x: f64, y: f64, second: f64) -> Self {
        Self {
            x,
            y,
            second: round_millis(second),
        }
    }

    /// Build a sample from a metric captured `capture_start_ms` after the epoch
    pub fn from_metric(metric: &GazeMetric, capture_start_ms: f64) -> Self {
        let elapsed = ((metric.timestamp_ms - capture_start_ms) / 1000.0).max(0.0);
        Self::new(metric.norm_x, metric.norm_y, elapsed)
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::MalformedMessage(e.to_string()))
    }
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Inbound inference payload. Treated as opaque apart from a few
/// numeric fields the pipeline reads.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    payload: Value,
}

impl InferenceResult {
    /// Parse a text frame. Anything other than a JSON object is rejected.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let payload: Value = serde_json::from_str(text)
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
        Self::from_value(payload)
    }

    pub fn from_value(payload: Value) -> Result<Self, TransportError> {
        if !payload.is_object() {
            return Err(TransportError::MalformedMessage(format!(
                "expected a JSON object, got {}",
                payload
            )));
        }
        Ok(Self { payload })
    }

    /// `probability`, falling back to `prob`
    pub fn probability(&self) -> Option<f64> {
        self.number("probability").or_else(|| self.number("prob"))
    }

    pub fn variance(&self) -> Option<f64> {
        self.number("variance")
    }

    pub fn acceleration(&self) -> Option<f64> {
        self.number("acceleration")
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    fn number(&self, key: &str) -> Option<f64> {
        let value = self.payload.get(key)?;
        let n = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        n.is_finite().then_some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_wire_shape() {
        let sample = TelemetrySample::new(0.125, -0.5, 1.23456);
        let json: Value = serde_json::from_str(&sample.to_json().unwrap()).unwrap();

        assert_eq!(json, serde_json::json!({"x": 0.125, "y": -0.5, "second": 1.235}));
    }

    #[test]
    fn test_sample_from_metric() {
        let metric = GazeMetric {
            norm_x: 0.1,
            norm_y: 0.2,
            timestamp_ms: 3500.4,
        };
        let sample = TelemetrySample::from_metric(&metric, 1000.0);
        assert_eq!(sample.second, 2.5);
        assert_eq!(sample.x, 0.1);
    }

    #[test]
    fn test_parse_backend_result() {
        let r = InferenceResult::parse(r#"{"variance":0.2,"acceleration":0.4,"probability":0.3}"#)
            .unwrap();
        assert_eq!(r.probability(), Some(0.3));
        assert_eq!(r.variance(), Some(0.2));
        assert_eq!(r.acceleration(), Some(0.4));
    }

    #[test]
    fn test_probability_aliases() {
        let r = InferenceResult::parse(r#"{"prob":"0.75"}"#).unwrap();
        assert_eq!(r.probability(), Some(0.75));

        let r = InferenceResult::parse(r#"{"label":"x"}"#).unwrap();
        assert_eq!(r.probability(), None);
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            InferenceResult::parse("{not json"),
            Err(TransportError::MalformedMessage(_))
        ));
        assert!(matches!(
            InferenceResult::parse("0.5"),
            Err(TransportError::MalformedMessage(_))
        ));
    }
}
