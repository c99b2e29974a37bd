//! Fixed time windows for grouping samples into chunks.
//!
//! A sample belongs to the window `floor(timestamp / duration)`. Samples for
//! the same session and sensor accumulate in an [`ActiveChunk`] until the
//! chunk is sealed.

use crate::sensor::types::{Sample, SensorKind};
use std::collections::BTreeMap;
use std::fmt;

/// Start of the window containing `timestamp`, in milliseconds.
///
/// Uses floor division so timestamps before the epoch land in the window
/// below zero rather than the one at zero.
pub fn window_start(timestamp: i64, duration_ms: i64) -> i64 {
    timestamp.div_euclid(duration_ms) * duration_ms
}

/// Split samples by window, keeping arrival order inside each window.
pub fn group_by_window(samples: Vec<Sample>, duration_ms: i64) -> BTreeMap<i64, Vec<Sample>> {
    let mut groups: BTreeMap<i64, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        groups
            .entry(window_start(sample.timestamp, duration_ms))
            .or_default()
            .push(sample);
    }
    groups
}

/// Identity of an active chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub session_id: String,
    pub sensor_kind: SensorKind,
    pub window_start: i64,
}

impl ChunkKey {
    pub fn new(session_id: impl Into<String>, sensor_kind: SensorKind, window_start: i64) -> Self {
        Self {
            session_id: session_id.into(),
            sensor_kind,
            window_start,
        }
    }

    /// Chunk id for the `seq`-th seal of this key.
    pub fn chunk_id(&self, seq: u32) -> String {
        format!(
            "{}_{}_{}_{}",
            self.session_id, self.sensor_kind, self.window_start, seq
        )
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.session_id, self.sensor_kind, self.window_start
        )
    }
}

/// Samples collected for one chunk that has not been sealed yet.
#[derive(Debug, Clone)]
pub struct ActiveChunk {
    pub key: ChunkKey,
    /// Window end, exclusive
    pub window_end: i64,
    pub samples: Vec<Sample>,
    /// Wall-clock time of the last append
    pub last_write: i64,
}

impl ActiveChunk {
    pub fn new(key: ChunkKey, duration_ms: i64, now: i64) -> Self {
        let window_end = key.window_start + duration_ms;
        Self {
            key,
            window_end,
            samples: Vec::new(),
            last_write: now,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.key.window_start && timestamp < self.window_end
    }

    pub fn append(&mut self, samples: impl IntoIterator<Item = Sample>, now: i64) {
        self.samples.extend(samples);
        self.last_write = now;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the wall clock has moved past the end of the window.
    pub fn has_elapsed(&self, now: i64) -> bool {
        now >= self.window_end
    }

    /// Earliest and latest sample timestamps, if any.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        let start = self.samples.iter().map(|s| s.timestamp).min()?;
        let end = self.samples.iter().map(|s| s.timestamp).max()?;
        Some((start, end))
    }
}
