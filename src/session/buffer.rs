//! Session-scoped analysis buffer
//!
//! Joins outbound samples with the inference results that answer them and
//! keeps the resulting [`AnalysisEntry`] records in insertion order.

use serde::{Deserialize, Serialize};

use super::SessionId;
use crate::config::{BufferStrategy, RetentionPolicy};
use crate::transport::{InferenceResult, TelemetrySample};

/// Session id carried by entries recorded before the session exists
pub const PLACEHOLDER_SESSION_ID: i64 = 0;

/// The persisted unit, as posted to `/updateSessionAnalysis`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEntry {
    pub session_id: i64,
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub prob: f64,
}

/// Append-only buffer of analysis entries.
///
/// With [`BufferStrategy::Eager`] each sample is tagged with the session id
/// known when it was sent. With [`BufferStrategy::Retro`] everything is
/// tagged with [`PLACEHOLDER_SESSION_ID`] and rewritten by
/// [`SessionBuffer::assign_session`] once the server hands out an id.
///
/// Pairing is "latest sample with the next result". The wire protocol has no
/// correlation id, so this is only sound while the backend answers samples
/// one at a time and in order.
#[derive(Debug, Clone)]
pub struct SessionBuffer {
    strategy: BufferStrategy,
    retention: RetentionPolicy,
    entries: Vec<AnalysisEntry>,
    last_sample: Option<(TelemetrySample, i64)>,
}

impl SessionBuffer {
    pub fn new(strategy: BufferStrategy, retention: RetentionPolicy) -> Self {
        Self {
            strategy,
            retention,
            entries: Vec::new(),
            last_sample: None,
        }
    }

    pub fn strategy(&self) -> BufferStrategy {
        self.strategy
    }

    /// Remember the sample that was just sent. `session` is only used by the
    /// eager strategy.
    pub fn record_sample(&mut self, sample: TelemetrySample, session: Option<SessionId>) {
        let tag = match self.strategy {
            BufferStrategy::Eager => session.map(|s| s.0).unwrap_or(PLACEHOLDER_SESSION_ID),
            BufferStrategy::Retro => PLACEHOLDER_SESSION_ID,
        };
        self.last_sample = Some((sample, tag));
    }

    /// Pair an inference result with the latest sample. Returns the new
    /// entry, or `None` when there is no sample yet or the result carries
    /// no probability.
    pub fn on_inference(&mut self, result: &InferenceResult) -> Option<AnalysisEntry> {
        let Some(prob) = result.probability() else {
            tracing::debug!("Inference result without probability: {}", result.payload());
            return None;
        };
        let Some((sample, session_id)) = self.last_sample else {
            tracing::debug!("Inference result before any sample was sent");
            return None;
        };

        let entry = AnalysisEntry {
            session_id,
            timestamp: sample.second,
            x: sample.x,
            y: sample.y,
            prob,
        };
        self.entries.push(entry);
        Some(entry)
    }

    /// Rewrite the session id of every buffered entry
    pub fn assign_session(&mut self, id: SessionId) {
        for entry in &mut self.entries {
            entry.session_id = id.0;
        }
        if let Some((_, tag)) = self.last_sample.as_mut() {
            *tag = id.0;
        }
        tracing::debug!("Tagged {} entries with session {}", self.entries.len(), id);
    }

    /// Tag entries recorded before the session existed, leaving entries
    /// that already carry a real id alone.
    pub fn tag_placeholders(&mut self, id: SessionId) {
        let mut tagged = 0;
        for entry in &mut self.entries {
            if entry.session_id == PLACEHOLDER_SESSION_ID {
                entry.session_id = id.0;
                tagged += 1;
            }
        }
        if let Some((_, tag)) = self.last_sample.as_mut() {
            if *tag == PLACEHOLDER_SESSION_ID {
                *tag = id.0;
            }
        }
        if tagged > 0 {
            tracing::debug!("Tagged {} placeholder entries with session {}", tagged, id);
        }
    }

    /// Entries still carrying the placeholder id
    pub fn untagged(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.session_id == PLACEHOLDER_SESSION_ID)
            .count()
    }

    pub fn entries(&self) -> &[AnalysisEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply the retention policy after the first `count` entries were
    /// uploaded successfully.
    pub fn mark_uploaded(&mut self, count: usize) {
        match self.retention {
            RetentionPolicy::Retain => {}
            RetentionPolicy::ClearOnSuccess => {
                let count = count.min(self.entries.len());
                self.entries.drain(..count);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_sample = None;
    }
}
