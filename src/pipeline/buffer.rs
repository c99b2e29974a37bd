//! Size and time triggered sample buffer.
//!
//! Samples accumulate until `max_size` is reached, the flush interval fires,
//! or [`SampleBuffer::flush`] is called. A failed flush puts the extracted
//! samples back in front of anything that arrived meanwhile, so ordering is
//! kept and nothing is lost unless the drop policy has to make room.

use crate::pipeline::sink::{BatchSink, SharedSink, SinkError};
use crate::pipeline::{push_bounded, DropPolicy};
use crate::sensor::types::{Sample, SensorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub max_size: usize,
    pub flush_interval: Duration,
    pub auto_flush: bool,
    pub drop_policy: DropPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            flush_interval: Duration::from_secs(1),
            auto_flush: true,
            drop_policy: DropPolicy::Oldest,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub total_received: u64,
    pub total_flushed: u64,
    pub current_size: usize,
    pub last_flush_time: Option<DateTime<Utc>>,
    /// Successful flushes only
    pub flush_count: u64,
    pub failed_flushes: u64,
    pub dropped_samples: u64,
}

#[derive(Debug, Clone, Error)]
pub enum BufferError {
    #[error("flush handler failed: {0}")]
    Flush(#[from] SinkError),

    #[error("invalid buffer configuration: {0}")]
    InvalidConfig(&'static str),
}

struct Core {
    samples: VecDeque<Sample>,
    stats: BufferStats,
    running: bool,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    config: Mutex<BufferConfig>,
    core: Mutex<Core>,
    handler: Mutex<Option<SharedSink>>,
    /// Serializes flushes so a failed batch is restored before the next one
    /// is taken.
    flush_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SampleBuffer {
    inner: Arc<Inner>,
}

impl SampleBuffer {
    /// A `max_size` of zero is raised to one.
    pub fn new(mut config: BufferConfig) -> Self {
        if config.max_size == 0 {
            tracing::warn!("sample buffer max size of 0 raised to 1");
            config.max_size = 1;
        }
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                core: Mutex::new(Core {
                    samples: VecDeque::new(),
                    stats: BufferStats::default(),
                    running: false,
                    timer: None,
                }),
                handler: Mutex::new(None),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn set_flush_handler(&self, handler: SharedSink) {
        *lock(&self.inner.handler) = Some(handler);
    }

    /// Add one sample, flushing when the buffer reaches `max_size`.
    ///
    /// Never fails: a failed automatic flush is counted and logged, and the
    /// drop policy keeps the buffer within its maximum.
    pub async fn add(&self, sample: Sample) {
        let config = self.inner.config();
        let full = {
            let mut core = self.inner.core();
            core.stats.total_received += 1;
            let dropped = push_bounded(
                &mut core.samples,
                std::iter::once(sample),
                config.max_size,
                config.drop_policy,
            );
            core.stats.dropped_samples += dropped;
            core.stats.current_size = core.samples.len();
            core.samples.len() >= config.max_size
        };

        if full && self.has_handler() {
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "automatic buffer flush failed");
            }
        }
    }

    /// Add samples one at a time, in order.
    pub async fn add_batch(&self, samples: Vec<Sample>) {
        for sample in samples {
            self.add(sample).await;
        }
    }

    /// Swap out everything buffered and hand it to the flush handler.
    ///
    /// Returns the flushed samples. If the handler fails they are restored at
    /// the front of the buffer and the error is returned.
    pub async fn flush(&self) -> Result<Vec<Sample>, BufferError> {
        let _serial = self.inner.flush_lock.lock().await;

        let batch: Vec<Sample> = {
            let mut core = self.inner.core();
            let batch: Vec<Sample> = core.samples.drain(..).collect();
            core.stats.current_size = 0;
            batch
        };
        if batch.is_empty() {
            return Ok(batch);
        }

        let handler = lock(&self.inner.handler).clone();
        if let Some(handler) = handler {
            if let Err(e) = handler.write(batch.clone()).await {
                self.restore(batch);
                return Err(e.into());
            }
        }

        let mut core = self.inner.core();
        core.stats.total_flushed += batch.len() as u64;
        core.stats.flush_count += 1;
        core.stats.last_flush_time = Some(Utc::now());
        Ok(batch)
    }

    /// Discard everything buffered. Returns how many samples were removed.
    pub fn clear(&self) -> usize {
        let mut core = self.inner.core();
        let cleared = core.samples.len();
        core.samples.clear();
        core.stats.current_size = 0;
        cleared
    }

    /// Enable the interval timer when `auto_flush` is set.
    pub fn start(&self) {
        let config = self.inner.config();
        let mut core = self.inner.core();
        if core.running {
            return;
        }
        core.running = true;
        if config.auto_flush && !config.flush_interval.is_zero() {
            core.timer = Some(tokio::spawn(run_timer(
                Arc::downgrade(&self.inner),
                config.flush_interval,
            )));
        }
    }

    /// Halt the timer and perform a final flush.
    pub async fn stop(&self) -> Result<Vec<Sample>, BufferError> {
        let timer = {
            let mut core = self.inner.core();
            core.running = false;
            core.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.flush().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.core().running
    }

    pub fn len(&self) -> usize {
        self.inner.core().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.core().stats.clone()
    }

    pub fn reset_stats(&self) {
        let mut core = self.inner.core();
        let current_size = core.samples.len();
        core.stats = BufferStats {
            current_size,
            ..BufferStats::default()
        };
    }

    pub fn set_max_size(&self, max_size: usize) -> Result<(), BufferError> {
        if max_size == 0 {
            return Err(BufferError::InvalidConfig("max size must be positive"));
        }
        lock(&self.inner.config).max_size = max_size;
        Ok(())
    }

    pub fn by_sensor_kind(&self, kind: SensorKind) -> Vec<Sample> {
        self.inner
            .core()
            .samples
            .iter()
            .filter(|s| s.sensor_kind == kind)
            .cloned()
            .collect()
    }

    pub fn counts_by_sensor_kind(&self) -> HashMap<SensorKind, usize> {
        let mut counts = HashMap::new();
        for sample in self.inner.core().samples.iter() {
            *counts.entry(sample.sensor_kind).or_insert(0) += 1;
        }
        counts
    }

    /// Buffered samples with `start <= timestamp <= end`.
    pub fn filter_by_time_range(&self, start: i64, end: i64) -> Vec<Sample> {
        self.inner
            .core()
            .samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect()
    }

    fn has_handler(&self) -> bool {
        lock(&self.inner.handler).is_some()
    }

    fn restore(&self, batch: Vec<Sample>) {
        let config = self.inner.config();
        let mut core = self.inner.core();
        let arrived: Vec<Sample> = core.samples.drain(..).collect();
        core.samples.extend(batch);
        core.samples.extend(arrived);

        let excess = core.samples.len().saturating_sub(config.max_size);
        if excess > 0 {
            match config.drop_policy {
                DropPolicy::Oldest => {
                    core.samples.drain(..excess);
                }
                DropPolicy::Newest => {
                    let keep = config.max_size;
                    core.samples.truncate(keep);
                }
            }
            core.stats.dropped_samples += excess as u64;
        }
        core.stats.current_size = core.samples.len();
        core.stats.failed_flushes += 1;
    }
}

/// Feeding a buffer never fails; flush problems stay inside the buffer.
#[async_trait]
impl BatchSink for SampleBuffer {
    async fn write(&self, samples: Vec<Sample>) -> Result<(), SinkError> {
        self.add_batch(samples).await;
        Ok(())
    }
}

impl Inner {
    fn config(&self) -> BufferConfig {
        lock(&self.config).clone()
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }
}

async fn run_timer(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let buffer = SampleBuffer { inner };
        if buffer.is_empty() || !buffer.has_handler() {
            continue;
        }
        if let Err(e) = buffer.flush().await {
            tracing::warn!(error = %e, "interval buffer flush failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::fake::CollectingSink;

    fn sample(ts: i64) -> Sample {
        Sample::scalar(SensorKind::Pressure, ts, 1000.0)
    }

    fn buffer_with(max_size: usize, sink: Arc<CollectingSink>) -> SampleBuffer {
        let buffer = SampleBuffer::new(BufferConfig {
            max_size,
            ..BufferConfig::default()
        });
        buffer.set_flush_handler(sink);
        buffer
    }

    #[tokio::test]
    async fn test_size_triggered_flushes() {
        let sink = CollectingSink::new();
        let buffer = buffer_with(2, sink.clone());

        for ts in 0..5 {
            buffer.add(sample(ts)).await;
        }

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 2));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.stats().flush_count, 2);

        let rest = buffer.flush().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp, 4);
    }

    #[tokio::test]
    async fn test_failed_flush_restores_in_order() {
        let sink = CollectingSink::new();
        let buffer = buffer_with(10, sink.clone());
        buffer.add_batch((0..3).map(sample).collect()).await;

        sink.fail_next(SinkError::Transient("disk busy".into()));
        let result = buffer.flush().await;
        assert!(matches!(result, Err(BufferError::Flush(_))));

        buffer.add(sample(3)).await;
        let ts: Vec<i64> = buffer
            .filter_by_time_range(0, 100)
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(ts, vec![0, 1, 2, 3]);

        let stats = buffer.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.flush_count, 0);
    }

    #[tokio::test]
    async fn test_failing_handler_never_exceeds_max() {
        let sink = CollectingSink::new();
        let buffer = buffer_with(3, sink.clone());
        for _ in 0..4 {
            sink.fail_next(SinkError::Transient("offline".into()));
        }

        for ts in 0..6 {
            buffer.add(sample(ts)).await;
            assert!(buffer.len() <= 3);
        }

        let stats = buffer.stats();
        assert_eq!(stats.failed_flushes, 4);
        assert_eq!(stats.dropped_samples, 3);
        let kept: Vec<i64> = buffer
            .by_sensor_kind(SensorKind::Pressure)
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush_and_final_flush_on_stop() {
        let sink = CollectingSink::new();
        let buffer = SampleBuffer::new(BufferConfig {
            max_size: 100,
            flush_interval: Duration::from_millis(500),
            ..BufferConfig::default()
        });
        buffer.set_flush_handler(sink.clone());
        buffer.start();

        buffer.add(sample(1)).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sink.total(), 1);

        buffer.add(sample(2)).await;
        let last = buffer.stop().await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(sink.total(), 2);
        assert!(!buffer.is_running());
    }

    #[tokio::test]
    async fn test_zero_max_size_still_delivers() {
        let sink = CollectingSink::new();
        let buffer = buffer_with(0, sink.clone());

        for ts in 0..3 {
            buffer.add(sample(ts)).await;
        }

        assert_eq!(sink.total(), 3);
        assert_eq!(buffer.stats().dropped_samples, 0);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_counts_by_sensor_kind() {
        let buffer = SampleBuffer::new(BufferConfig::default());
        buffer.add(sample(1)).await;
        buffer
            .add(Sample::axis(SensorKind::Gyroscope, 2, 0.0, 0.0, 0.0))
            .await;
        buffer.add(sample(3)).await;

        let counts = buffer.counts_by_sensor_kind();
        assert_eq!(counts[&SensorKind::Pressure], 2);
        assert_eq!(counts[&SensorKind::Gyroscope], 1);
        assert_eq!(buffer.clear(), 3);
        assert!(buffer.is_empty());
        assert!(buffer.set_max_size(0).is_err());
    }
}
