//! Per-sensor stream with backpressure.
//!
//! A [`SensorStream`] subscribes to one sensor kind on a [`SensorSource`],
//! buffers incoming batches up to `max_buffer_size` and hands buffered slices
//! to a consumer from a single worker task, so consumer calls never overlap
//! and arrival order is preserved. Each slice runs under
//! `max_processing_time`; a slice that exceeds it is dropped and counted.

use crate::events::{Event, EventKind, ListenerId, Listeners};
use crate::pipeline::sink::{SharedSink, SinkError};
use crate::pipeline::{push_bounded, DropPolicy};
use crate::sensor::source::{SensorError, SensorSource};
use crate::sensor::types::{Batch, Sample, SamplingRate, SensorKind};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Configuration and public types
// ============================================================================

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub sensor_kind: SensorKind,
    pub rate: SamplingRate,
    /// Samples per batch requested from the source
    pub batch_size: usize,
    /// Buffered-but-unprocessed samples allowed before dropping
    pub max_buffer_size: usize,
    pub max_processing_time: Duration,
    pub drop_policy: DropPolicy,
    /// Width of the sliding window behind `samples_per_second`
    pub rate_window: Duration,
    /// Emit `stats_update` events at this interval when set
    pub stats_interval: Option<Duration>,
}

impl StreamConfig {
    pub fn new(sensor_kind: SensorKind) -> Self {
        Self {
            sensor_kind,
            rate: SamplingRate::default(),
            batch_size: 50,
            max_buffer_size: 1000,
            max_processing_time: Duration::from_millis(100),
            drop_policy: DropPolicy::Oldest,
            rate_window: Duration::from_secs(5),
            stats_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Active,
    Paused,
    Stopping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub total_samples: u64,
    pub samples_per_second: f64,
    pub dropped_samples: u64,
    /// Buffered samples relative to `max_buffer_size`, 0 to 1
    pub buffer_utilization: f64,
    pub processing_errors: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("stream for {kind} cannot {operation} while {state:?}")]
    InvalidState {
        kind: SensorKind,
        operation: &'static str,
        state: StreamState,
    },

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("processing {samples} {kind} samples took longer than {budget:?}")]
    ProcessingTimeout {
        kind: SensorKind,
        samples: usize,
        budget: Duration,
    },

    #[error("consumer failed for {kind}: {source}")]
    Consumer { kind: SensorKind, source: SinkError },
}

/// Payload of events emitted by a stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StateChange {
        sensor_kind: SensorKind,
        from: StreamState,
        to: StreamState,
    },
    Error {
        sensor_kind: SensorKind,
        message: String,
    },
    StatsUpdate {
        sensor_kind: SensorKind,
        stats: StreamStats,
    },
}

impl StreamEvent {
    fn kind(&self) -> EventKind {
        match self {
            StreamEvent::StateChange { .. } => EventKind::StateChange,
            StreamEvent::Error { .. } => EventKind::Error,
            StreamEvent::StatsUpdate { .. } => EventKind::StatsUpdate,
        }
    }
}

pub type StreamErrorHandler = Arc<dyn Fn(&StreamError) + Send + Sync>;

// ============================================================================
// Stream
// ============================================================================

struct Core {
    state: StreamState,
    buffer: VecDeque<Sample>,
    stats: StreamStats,
    arrivals: VecDeque<(Instant, usize)>,
    in_flight: bool,
    subscription: Option<ListenerId>,
    error_handler: Option<StreamErrorHandler>,
    worker: Option<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: StreamConfig,
    source: Arc<dyn SensorSource>,
    core: Mutex<Core>,
    wake: Notify,
    drained: Notify,
    listeners: Listeners<Event<StreamEvent>>,
}

/// Cheap-clone handle to one sensor's stream.
#[derive(Clone)]
pub struct SensorStream {
    inner: Arc<Inner>,
}

impl SensorStream {
    pub fn new(config: StreamConfig, source: Arc<dyn SensorSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                core: Mutex::new(Core {
                    state: StreamState::Idle,
                    buffer: VecDeque::new(),
                    stats: StreamStats::default(),
                    arrivals: VecDeque::new(),
                    in_flight: false,
                    subscription: None,
                    error_handler: None,
                    worker: None,
                    stats_task: None,
                }),
                wake: Notify::new(),
                drained: Notify::new(),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn sensor_kind(&self) -> SensorKind {
        self.inner.config.sensor_kind
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Subscribe to the source, start the sensor and begin forwarding
    /// buffered samples to `consumer`.
    ///
    /// If the sensor fails to start the subscription is rolled back and the
    /// stream stays idle.
    pub async fn start(
        &self,
        consumer: SharedSink,
        error_handler: Option<StreamErrorHandler>,
    ) -> Result<(), StreamError> {
        let kind = self.sensor_kind();
        {
            let mut core = self.inner.lock();
            if core.state != StreamState::Idle {
                return Err(StreamError::InvalidState {
                    kind,
                    operation: "start",
                    state: core.state,
                });
            }
            core.buffer.clear();
            core.arrivals.clear();
            core.error_handler = error_handler;
            core.state = StreamState::Active;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.source.subscribe(
            kind,
            Arc::new(move |batch: &Batch| {
                if let Some(inner) = weak.upgrade() {
                    inner.ingest(batch);
                }
            }),
        );

        let config = &self.inner.config;
        if let Err(e) = self
            .inner
            .source
            .start(kind, config.rate, config.batch_size)
            .await
        {
            self.inner.source.unsubscribe(kind, subscription);
            let mut core = self.inner.lock();
            core.state = StreamState::Idle;
            core.error_handler = None;
            return Err(e.into());
        }

        let worker = tokio::spawn(run_worker(self.inner.clone(), consumer));
        let stats_task = config
            .stats_interval
            .map(|interval| tokio::spawn(run_stats_ticker(Arc::downgrade(&self.inner), interval)));
        {
            let mut core = self.inner.lock();
            core.subscription = Some(subscription);
            core.worker = Some(worker);
            core.stats_task = stats_task;
        }

        tracing::debug!(sensor = %kind, "stream started");
        self.inner.emit_state(StreamState::Idle, StreamState::Active);
        Ok(())
    }

    /// Stop forwarding to the consumer. Subscription and buffering continue.
    pub fn pause(&self) -> Result<(), StreamError> {
        self.inner
            .transition("pause", StreamState::Active, StreamState::Paused)
    }

    /// Resume forwarding and drain whatever accumulated while paused.
    pub fn resume(&self) -> Result<(), StreamError> {
        self.inner
            .transition("resume", StreamState::Paused, StreamState::Active)?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Unsubscribe, stop the sensor and process everything still buffered
    /// before returning. Stopping an idle stream is a no-op.
    pub async fn stop(&self) {
        let kind = self.sensor_kind();
        let (previous, subscription, worker, stats_task) = {
            let mut core = self.inner.lock();
            if matches!(core.state, StreamState::Idle | StreamState::Stopping) {
                return;
            }
            let previous = core.state;
            core.state = StreamState::Stopping;
            (
                previous,
                core.subscription.take(),
                core.worker.take(),
                core.stats_task.take(),
            )
        };
        self.inner.emit_state(previous, StreamState::Stopping);

        if let Some(id) = subscription {
            self.inner.source.unsubscribe(kind, id);
        }
        if let Err(e) = self.inner.source.stop(kind).await {
            tracing::warn!(sensor = %kind, error = %e, "sensor stop failed");
        }
        if let Some(task) = stats_task {
            task.abort();
        }

        self.inner.wake.notify_one();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(sensor = %kind, error = %e, "stream worker ended abnormally");
            }
        }

        {
            let mut core = self.inner.lock();
            core.state = StreamState::Idle;
            core.error_handler = None;
            core.stats.buffer_utilization = 0.0;
        }
        tracing::debug!(sensor = %kind, "stream stopped");
        self.inner.emit_state(StreamState::Stopping, StreamState::Idle);
    }

    /// Wait until everything buffered has been handed to the consumer.
    /// Returns immediately unless the stream is active.
    pub async fn flush(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let core = self.inner.lock();
                if core.state != StreamState::Active || (core.buffer.is_empty() && !core.in_flight)
                {
                    return;
                }
            }
            self.inner.wake.notify_one();
            drained.await;
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.inner.snapshot_stats()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event<StreamEvent>) + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ingest(&self, batch: &Batch) {
        let max = self.config.max_buffer_size;
        let dropped = {
            let mut core = self.lock();
            if !matches!(core.state, StreamState::Active | StreamState::Paused) {
                return;
            }
            let count = batch.count();
            core.stats.total_samples += count as u64;
            let now = Instant::now();
            core.arrivals.push_back((now, count));
            prune_arrivals(&mut core.arrivals, self.config.rate_window, now);

            let dropped = push_bounded(
                &mut core.buffer,
                batch.samples.iter().cloned(),
                max,
                self.config.drop_policy,
            );
            core.stats.dropped_samples += dropped;
            core.stats.buffer_utilization = utilization(core.buffer.len(), max);
            if core.state == StreamState::Active {
                self.wake.notify_one();
            }
            dropped
        };

        if dropped > 0 {
            tracing::warn!(
                sensor = %self.config.sensor_kind,
                dropped,
                "stream buffer overflow"
            );
        }
    }

    fn next_step(&self) -> WorkerStep {
        let mut core = self.lock();
        let draining = core.state == StreamState::Stopping;
        if (core.state == StreamState::Active || draining) && !core.buffer.is_empty() {
            let slice: Vec<Sample> = core.buffer.drain(..).collect();
            core.stats.buffer_utilization = 0.0;
            core.in_flight = true;
            return WorkerStep::Process(slice);
        }
        core.in_flight = false;
        self.drained.notify_waiters();
        if draining || core.state == StreamState::Idle {
            WorkerStep::Exit
        } else {
            WorkerStep::Wait
        }
    }

    async fn process(&self, consumer: &SharedSink, slice: Vec<Sample>) {
        let kind = self.config.sensor_kind;
        let budget = self.config.max_processing_time;
        let samples = slice.len();

        let error = match tokio::time::timeout(budget, consumer.write(slice)).await {
            Ok(Ok(())) => return,
            Ok(Err(source)) => {
                self.lock().stats.processing_errors += 1;
                StreamError::Consumer { kind, source }
            }
            Err(_) => {
                let mut core = self.lock();
                core.stats.processing_errors += 1;
                core.stats.timeouts += 1;
                StreamError::ProcessingTimeout {
                    kind,
                    samples,
                    budget,
                }
            }
        };

        tracing::error!(sensor = %kind, error = %error, "stream processing failed");
        let handler = self.lock().error_handler.clone();
        if let Some(handler) = handler {
            handler(&error);
        }
        self.emit(StreamEvent::Error {
            sensor_kind: kind,
            message: error.to_string(),
        });
    }

    fn transition(
        &self,
        operation: &'static str,
        from: StreamState,
        to: StreamState,
    ) -> Result<(), StreamError> {
        {
            let mut core = self.lock();
            if core.state != from {
                return Err(StreamError::InvalidState {
                    kind: self.config.sensor_kind,
                    operation,
                    state: core.state,
                });
            }
            core.state = to;
        }
        self.emit_state(from, to);
        Ok(())
    }

    fn snapshot_stats(&self) -> StreamStats {
        let window = self.config.rate_window;
        let mut core = self.lock();
        prune_arrivals(&mut core.arrivals, window, Instant::now());
        let recent: usize = core.arrivals.iter().map(|(_, count)| count).sum();
        core.stats.samples_per_second = recent as f64 / window.as_secs_f64().max(f64::EPSILON);
        core.stats.clone()
    }

    fn emit_state(&self, from: StreamState, to: StreamState) {
        self.emit(StreamEvent::StateChange {
            sensor_kind: self.config.sensor_kind,
            from,
            to,
        });
    }

    fn emit(&self, payload: StreamEvent) {
        self.listeners.emit(&Event::new(payload.kind(), payload));
    }
}

enum WorkerStep {
    Process(Vec<Sample>),
    Wait,
    Exit,
}

/// Drop arrivals older than the rate window.
fn prune_arrivals(arrivals: &mut VecDeque<(Instant, usize)>, window: Duration, now: Instant) {
    while let Some((at, _)) = arrivals.front() {
        if now.duration_since(*at) > window {
            arrivals.pop_front();
        } else {
            break;
        }
    }
}

async fn run_worker(inner: Arc<Inner>, consumer: SharedSink) {
    loop {
        match inner.next_step() {
            WorkerStep::Process(slice) => inner.process(&consumer, slice).await,
            WorkerStep::Wait => inner.wake.notified().await,
            WorkerStep::Exit => return,
        }
    }
}

async fn run_stats_ticker(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let stats = inner.snapshot_stats();
        inner.emit(StreamEvent::StatsUpdate {
            sensor_kind: inner.config.sensor_kind,
            stats,
        });
    }
}

fn utilization(len: usize, max: usize) -> f64 {
    if max == 0 {
        1.0
    } else {
        (len as f64 / max as f64).min(1.0)
    }
}

// ============================================================================
// Stream manager
// ============================================================================

/// Owns one stream per sensor kind.
#[derive(Clone)]
pub struct StreamManager {
    source: Arc<dyn SensorSource>,
    streams: Arc<Mutex<HashMap<SensorKind, SensorStream>>>,
}

impl StreamManager {
    pub fn new(source: Arc<dyn SensorSource>) -> Self {
        Self {
            source,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the stream for `config.sensor_kind`, creating it if needed.
    /// An existing stream keeps its original configuration.
    pub fn get_or_create(&self, config: StreamConfig) -> SensorStream {
        self.streams()
            .entry(config.sensor_kind)
            .or_insert_with(|| SensorStream::new(config, self.source.clone()))
            .clone()
    }

    pub fn get(&self, kind: SensorKind) -> Option<SensorStream> {
        self.streams().get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<SensorKind> {
        let mut kinds: Vec<SensorKind> = self.streams().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Streams currently active or paused.
    pub fn running(&self) -> Vec<SensorStream> {
        self.all()
            .into_iter()
            .filter(|s| matches!(s.state(), StreamState::Active | StreamState::Paused))
            .collect()
    }

    /// Pause every active stream concurrently. Returns the per-stream errors.
    pub async fn pause_all(&self) -> Vec<StreamError> {
        let streams = self.running();
        let results = join_all(streams.iter().map(|s| async move { s.pause() })).await;
        results.into_iter().filter_map(Result::err).collect()
    }

    pub async fn resume_all(&self) -> Vec<StreamError> {
        let streams = self.running();
        let results = join_all(streams.iter().map(|s| async move { s.resume() })).await;
        results.into_iter().filter_map(Result::err).collect()
    }

    /// Stop every stream concurrently; each drains before its stop resolves.
    pub async fn stop_all(&self) {
        let streams = self.all();
        join_all(streams.iter().map(|s| s.stop())).await;
    }

    pub async fn flush_all(&self) {
        let streams = self.all();
        join_all(streams.iter().map(|s| s.flush())).await;
    }

    pub fn stats_all(&self) -> HashMap<SensorKind, StreamStats> {
        self.all()
            .into_iter()
            .map(|s| (s.sensor_kind(), s.stats()))
            .collect()
    }

    /// Stop and forget every stream.
    pub async fn clear(&self) {
        self.stop_all().await;
        self.streams().clear();
    }

    fn all(&self) -> Vec<SensorStream> {
        self.streams().values().cloned().collect()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<SensorKind, SensorStream>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::fake::CollectingSink;
    use crate::sensor::manual::ManualSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn accel(ts: i64) -> Sample {
        Sample::axis(SensorKind::Accelerometer, ts, 0.0, 0.0, 9.8)
    }

    fn batch(range: std::ops::Range<i64>) -> Batch {
        Batch::new(SensorKind::Accelerometer, range.map(accel).collect())
    }

    fn timestamps(batches: &[Vec<Sample>]) -> Vec<i64> {
        batches.iter().flatten().map(|s| s.timestamp).collect()
    }

    #[tokio::test]
    async fn test_forwards_in_arrival_order() {
        let source = Arc::new(ManualSource::new());
        let sink = CollectingSink::new();
        let stream = SensorStream::new(StreamConfig::new(SensorKind::Accelerometer), source.clone());

        stream.start(sink.clone(), None).await.unwrap();
        assert!(source.is_running(SensorKind::Accelerometer));

        source.emit(batch(0..3));
        source.emit(batch(3..6));
        stream.stop().await;

        assert_eq!(timestamps(&sink.batches()), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(stream.stats().total_samples, 6);
        assert_eq!(stream.state(), StreamState::Idle);
        assert_eq!(source.subscriber_count(SensorKind::Accelerometer), 0);
        assert!(!source.is_running(SensorKind::Accelerometer));
    }

    #[tokio::test]
    async fn test_oldest_policy_drops_earliest_buffered() {
        let source = Arc::new(ManualSource::new());
        let sink = CollectingSink::new();
        let mut config = StreamConfig::new(SensorKind::Accelerometer);
        config.max_buffer_size = 5;
        let stream = SensorStream::new(config, source.clone());

        stream.start(sink.clone(), None).await.unwrap();
        stream.pause().unwrap();

        source.emit(batch(0..5));
        source.emit(batch(5..8));

        let stats = stream.stats();
        assert_eq!(stats.dropped_samples, 3);
        assert_eq!(stats.buffer_utilization, 1.0);
        assert!(sink.batches().is_empty());

        stream.resume().unwrap();
        stream.stop().await;
        assert_eq!(timestamps(&sink.batches()), vec![3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_newest_policy_drops_incoming() {
        let source = Arc::new(ManualSource::new());
        let sink = CollectingSink::new();
        let mut config = StreamConfig::new(SensorKind::Accelerometer);
        config.max_buffer_size = 4;
        config.drop_policy = DropPolicy::Newest;
        let stream = SensorStream::new(config, source.clone());

        stream.start(sink.clone(), None).await.unwrap();
        stream.pause().unwrap();
        source.emit(batch(0..3));
        source.emit(batch(3..6));
        assert_eq!(stream.stats().dropped_samples, 2);

        stream.stop().await;
        assert_eq!(timestamps(&sink.batches()), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_drops_slice_and_continues() {
        let source = Arc::new(ManualSource::new());
        let sink = CollectingSink::new();
        let mut config = StreamConfig::new(SensorKind::Accelerometer);
        config.max_processing_time = Duration::from_millis(50);
        let stream = SensorStream::new(config, source.clone());

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let handler: StreamErrorHandler = Arc::new(move |e| {
            assert!(matches!(e, StreamError::ProcessingTimeout { samples: 2, .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        stream.start(sink.clone(), Some(handler)).await.unwrap();
        sink.set_delay(Duration::from_millis(200));
        source.emit(batch(0..2));
        stream.flush().await;

        *sink.delay.lock().unwrap() = None;
        source.emit(batch(2..4));
        stream.flush().await;

        let stats = stream.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.processing_errors, 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), StreamState::Active);
        assert_eq!(timestamps(&sink.batches()), vec![2, 3]);
        stream.stop().await;
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        let source = Arc::new(ManualSource::new());
        source.set_unavailable(SensorKind::Accelerometer);
        let stream = SensorStream::new(StreamConfig::new(SensorKind::Accelerometer), source.clone());

        let result = stream.start(CollectingSink::new(), None).await;
        assert!(matches!(result, Err(StreamError::Sensor(_))));
        assert_eq!(stream.state(), StreamState::Idle);
        assert_eq!(source.subscriber_count(SensorKind::Accelerometer), 0);
    }

    #[tokio::test]
    async fn test_pause_requires_active() {
        let source = Arc::new(ManualSource::new());
        let stream = SensorStream::new(StreamConfig::new(SensorKind::Gyroscope), source);
        assert!(matches!(
            stream.pause(),
            Err(StreamError::InvalidState { state: StreamState::Idle, .. })
        ));
        assert!(stream.resume().is_err());
    }

    #[tokio::test]
    async fn test_state_events_emitted() {
        let source = Arc::new(ManualSource::new());
        let stream = SensorStream::new(StreamConfig::new(SensorKind::Gyroscope), source);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        stream.add_listener(move |event| {
            if let StreamEvent::StateChange { to, .. } = &event.payload {
                log.lock().unwrap().push(*to);
            }
        });

        stream.start(CollectingSink::new(), None).await.unwrap();
        stream.pause().unwrap();
        stream.stop().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                StreamState::Active,
                StreamState::Paused,
                StreamState::Stopping,
                StreamState::Idle
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_per_second_uses_window() {
        let source = Arc::new(ManualSource::new());
        let mut config = StreamConfig::new(SensorKind::Accelerometer);
        config.rate_window = Duration::from_secs(2);
        let stream = SensorStream::new(config, source.clone());
        stream.start(CollectingSink::new(), None).await.unwrap();

        source.emit(batch(0..10));
        tokio::time::advance(Duration::from_secs(3)).await;
        source.emit(batch(10..14));

        assert_eq!(stream.stats().samples_per_second, 2.0);
        stream.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrival_log_bounded_without_stats_calls() {
        let source = Arc::new(ManualSource::new());
        let mut config = StreamConfig::new(SensorKind::Accelerometer);
        config.rate_window = Duration::from_secs(1);
        let stream = SensorStream::new(config, source.clone());
        stream.start(CollectingSink::new(), None).await.unwrap();

        for i in 0..1_000 {
            stream.inner.ingest(&batch(i..i + 1));
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        let retained = stream.inner.lock().arrivals.len();
        assert!(retained <= 11, "arrival log kept {retained} entries");
        stream.stop().await;
    }

    #[tokio::test]
    async fn test_manager_stops_all() {
        let source = Arc::new(ManualSource::new());
        let manager = StreamManager::new(source.clone());
        let sink = CollectingSink::new();

        for kind in [SensorKind::Accelerometer, SensorKind::Gyroscope] {
            manager
                .get_or_create(StreamConfig::new(kind))
                .start(sink.clone(), None)
                .await
                .unwrap();
        }
        assert_eq!(manager.running().len(), 2);
        assert!(manager.pause_all().await.is_empty());
        assert!(manager.resume_all().await.is_empty());

        manager.stop_all().await;
        assert!(manager.running().is_empty());
        assert_eq!(
            manager.kinds(),
            vec![SensorKind::Accelerometer, SensorKind::Gyroscope]
        );
    }
}
