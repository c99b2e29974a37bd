//! In-memory ingestion path: stream, buffer and batch saver.
//!
//! Everything here absorbs recoverable conditions into counters and events;
//! nothing on the hot path returns an error to the sensor source.

pub mod batch_saver;
pub mod buffer;
pub mod sink;
pub mod stream;

pub use batch_saver::{BatchSaver, FailedBatch, SaveResult, SaverConfig, SaverStats};
pub use buffer::{BufferConfig, BufferError, BufferStats, SampleBuffer};
pub use sink::{BatchSink, SharedSink, SinkError};
pub use stream::{
    SensorStream, StreamConfig, StreamError, StreamEvent, StreamManager, StreamState, StreamStats,
};

use serde::{Deserialize, Serialize};

/// Which samples to discard when a bounded buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Discard the earliest buffered samples to make room.
    #[default]
    Oldest,
    /// Discard incoming samples beyond capacity.
    Newest,
}

/// Append `incoming` to `buffer` without letting it grow past `max`.
/// Returns how many samples were dropped.
pub(crate) fn push_bounded<T>(
    buffer: &mut std::collections::VecDeque<T>,
    incoming: impl IntoIterator<Item = T>,
    max: usize,
    policy: DropPolicy,
) -> u64 {
    let mut dropped = 0u64;
    for item in incoming {
        if buffer.len() < max {
            buffer.push_back(item);
            continue;
        }
        match policy {
            DropPolicy::Oldest => {
                if buffer.pop_front().is_some() {
                    buffer.push_back(item);
                }
                dropped += 1;
            }
            DropPolicy::Newest => dropped += 1,
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_push_bounded_oldest() {
        let mut buffer: VecDeque<u32> = (0..4).collect();
        let dropped = push_bounded(&mut buffer, [10, 11], 4, DropPolicy::Oldest);
        assert_eq!(dropped, 2);
        assert_eq!(buffer, VecDeque::from(vec![2, 3, 10, 11]));
    }

    #[test]
    fn test_push_bounded_newest() {
        let mut buffer: VecDeque<u32> = (0..3).collect();
        let dropped = push_bounded(&mut buffer, [10, 11, 12], 4, DropPolicy::Newest);
        assert_eq!(dropped, 2);
        assert_eq!(buffer, VecDeque::from(vec![0, 1, 2, 10]));
    }

    #[test]
    fn test_push_bounded_zero_capacity() {
        let mut buffer: VecDeque<u32> = VecDeque::new();
        let dropped = push_bounded(&mut buffer, [1, 2], 0, DropPolicy::Oldest);
        assert_eq!(dropped, 2);
        assert!(buffer.is_empty());
    }
}
