//! Session-level recording state machine.
//!
//! A session wires one stream per sensor into a shared pipeline:
//!
//! ```text
//! streams -> SessionSink -> drain task -> SampleBuffer -> BatchSaver -> ChunkPersistence
//! ```
//!
//! The session sink only annotates samples and hands them to a bounded
//! channel, so the stream's processing budget covers the hand-off and not
//! disk I/O. A full channel pushes back into the stream as a slow consumer.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::events::{Event, EventKind, ListenerId, Listeners};
use crate::pipeline::batch_saver::{BatchSaver, SaveErrorHandler, SaverConfig};
use crate::pipeline::buffer::{BufferConfig, SampleBuffer};
use crate::pipeline::sink::{BatchSink, SharedSink, SinkError};
use crate::pipeline::stream::{StreamConfig, StreamError, StreamErrorHandler, StreamManager};
use crate::pipeline::DropPolicy;
use crate::recording::collaborators::{
    AudioErrorHandler, AudioOptions, AudioProducer, AudioStats, BackgroundPermit,
    CollaboratorError, LoggingPlatform, NoAudio, NotificationSpec, WakeHold,
};
use crate::recording::state::{ActiveSession, RecordingMode, RecordingState};
use crate::sensor::source::SensorSource;
use crate::sensor::types::{Sample, SamplingRate, SensorKind};
use crate::storage::chunk::{ChunkPersistence, WriteResult};
use crate::storage::error::{ChunkError, StoreError};
use crate::storage::models::{priority, EntityType, NewSyncEntry, SessionRecord};
use crate::storage::store::MetadataStore;

// ============================================================================
// Configuration, errors and events
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub mode: RecordingMode,
    pub sensors: Vec<SensorKind>,
    pub rate: SamplingRate,
    pub batch_size: usize,
    pub max_buffer_size: usize,
    pub max_processing_time: Duration,
    pub drop_policy: DropPolicy,
    pub buffer: BufferConfig,
    pub saver: SaverConfig,
    pub audio: AudioOptions,
    /// Hold the device awake while recording
    pub wake_hold: bool,
    /// Ask to keep recording in the background
    pub background_permit: bool,
    /// Batches queued between streams and the buffer
    pub channel_capacity: usize,
}

impl RecordingConfig {
    pub fn new(mode: RecordingMode, sensors: Vec<SensorKind>) -> Self {
        Self {
            mode,
            sensors,
            rate: SamplingRate::default(),
            batch_size: 50,
            max_buffer_size: 1000,
            max_processing_time: Duration::from_millis(100),
            drop_policy: DropPolicy::Oldest,
            buffer: BufferConfig::default(),
            saver: SaverConfig::default(),
            audio: AudioOptions::default(),
            wake_hold: true,
            background_permit: true,
            channel_capacity: 64,
        }
    }

    fn stream_config(&self, kind: SensorKind) -> StreamConfig {
        StreamConfig {
            rate: self.rate,
            batch_size: self.batch_size,
            max_buffer_size: self.max_buffer_size,
            max_processing_time: self.max_processing_time,
            drop_policy: self.drop_policy,
            ..StreamConfig::new(kind)
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("cannot {operation} recording while {state}")]
    InvalidState {
        operation: &'static str,
        state: RecordingState,
    },

    #[error("no producer started: {0}")]
    NoProducer(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorTotals {
    pub total_samples: u64,
    pub total_dropped: u64,
    pub processing_errors: u64,
    pub sensors_active: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStats {
    pub session_id: String,
    pub mode: RecordingMode,
    pub state: RecordingState,
    /// Recording time excluding pauses
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensors: Option<SensorTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioStats>,
    pub buffered_samples: usize,
    pub pending_batches: usize,
    pub abandoned_batches: u64,
}

/// Result of a completed `stop`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub duration_ms: i64,
    pub sample_count: u64,
    pub chunk_count: u64,
    /// Chunks that could not be sealed at stop and stay active
    pub unsealed_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordingEvent {
    StateChange {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        from: RecordingState,
        to: RecordingState,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Component that failed, e.g. `sensor:gyroscope` or `audio`
        origin: String,
        message: String,
    },
    StatsUpdate {
        stats: RecordingStats,
    },
}

impl RecordingEvent {
    fn kind(&self) -> EventKind {
        match self {
            RecordingEvent::StateChange { .. } => EventKind::StateChange,
            RecordingEvent::Error { .. } => EventKind::Error,
            RecordingEvent::StatsUpdate { .. } => EventKind::StatsUpdate,
        }
    }
}

// ============================================================================
// Session pipeline
// ============================================================================

/// Consumer shared by every stream of a session.
struct SessionSink {
    session_id: String,
    start_timestamp: i64,
    tx: Mutex<Option<mpsc::Sender<Vec<Sample>>>>,
}

impl SessionSink {
    fn close(&self) {
        lock(&self.tx).take();
    }
}

#[async_trait]
impl BatchSink for SessionSink {
    async fn write(&self, samples: Vec<Sample>) -> Result<(), SinkError> {
        let tx = lock(&self.tx).clone().ok_or(SinkError::Closed)?;
        let annotated = samples
            .iter()
            .map(|s| s.in_session(&self.session_id, self.start_timestamp))
            .collect();
        tx.send(annotated).await.map_err(|_| SinkError::Closed)
    }
}

struct SessionPipeline {
    sink: Arc<SessionSink>,
    buffer: SampleBuffer,
    saver: BatchSaver,
    drain: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    state: RecordingState,
    session: Option<ActiveSession>,
    pipeline: Option<SessionPipeline>,
}

struct Inner {
    streams: StreamManager,
    persistence: ChunkPersistence,
    store: MetadataStore,
    audio: Arc<dyn AudioProducer>,
    wake: Arc<dyn WakeHold>,
    permit: Arc<dyn BackgroundPermit>,
    clock: SharedClock,
    shared: Mutex<Shared>,
    /// Serializes start/pause/resume/stop
    op_lock: tokio::sync::Mutex<()>,
    listeners: Listeners<Event<RecordingEvent>>,
}

/// Cheap-clone handle to the recording orchestrator.
#[derive(Clone)]
pub struct RecordingOrchestrator {
    inner: Arc<Inner>,
}

pub struct RecordingOrchestratorBuilder {
    source: Arc<dyn SensorSource>,
    persistence: ChunkPersistence,
    clock: SharedClock,
    audio: Arc<dyn AudioProducer>,
    wake: Arc<dyn WakeHold>,
    permit: Arc<dyn BackgroundPermit>,
}

impl RecordingOrchestratorBuilder {
    pub fn audio(mut self, audio: Arc<dyn AudioProducer>) -> Self {
        self.audio = audio;
        self
    }

    pub fn wake_hold(mut self, wake: Arc<dyn WakeHold>) -> Self {
        self.wake = wake;
        self
    }

    pub fn background_permit(mut self, permit: Arc<dyn BackgroundPermit>) -> Self {
        self.permit = permit;
        self
    }

    pub fn build(self) -> RecordingOrchestrator {
        RecordingOrchestrator {
            inner: Arc::new(Inner {
                streams: StreamManager::new(self.source),
                store: self.persistence.store().clone(),
                persistence: self.persistence,
                audio: self.audio,
                wake: self.wake,
                permit: self.permit,
                clock: self.clock,
                shared: Mutex::new(Shared::default()),
                op_lock: tokio::sync::Mutex::new(()),
                listeners: Listeners::new(),
            }),
        }
    }
}

impl RecordingOrchestrator {
    /// Builder with no audio and logging-only platform services.
    pub fn builder(
        source: Arc<dyn SensorSource>,
        persistence: ChunkPersistence,
        clock: SharedClock,
    ) -> RecordingOrchestratorBuilder {
        let platform = Arc::new(LoggingPlatform);
        RecordingOrchestratorBuilder {
            source,
            persistence,
            clock,
            audio: Arc::new(NoAudio),
            wake: platform.clone(),
            permit: platform,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.inner.shared().state
    }

    pub fn current_session(&self) -> Option<ActiveSession> {
        self.inner.shared().session.clone()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event<RecordingEvent>) + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Start a new session and return its id.
    ///
    /// Sensors that fail to start are reported as error events and skipped.
    /// Start fails, leaving the orchestrator in `Error`, only when no
    /// producer came up at all.
    pub async fn start(&self, config: RecordingConfig) -> Result<String, RecordingError> {
        let _op = self.inner.op_lock.lock().await;
        let state = self.state();
        if !matches!(state, RecordingState::Idle | RecordingState::Error) {
            return Err(RecordingError::InvalidState {
                operation: "start",
                state,
            });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let start_timestamp = self.inner.clock.now_ms();
        {
            let mut shared = self.inner.shared();
            shared.session = Some(ActiveSession::new(
                session_id.clone(),
                config.mode,
                start_timestamp,
            ));
        }
        self.inner.set_state(RecordingState::Starting);

        let record = SessionRecord {
            session_id: session_id.clone(),
            mode: config.mode,
            state: RecordingState::Starting,
            start_timestamp,
            end_timestamp: None,
            enabled_sensors: config.sensors.clone(),
            sample_count: 0,
            chunk_count: 0,
        };
        if let Err(err) = self.inner.store.insert_session(record, start_timestamp).await {
            self.inner.fail_start(&session_id, "store", &err.to_string());
            return Err(err.into());
        }

        let pipeline = self.inner.build_pipeline(&session_id, start_timestamp, &config);
        let sink: SharedSink = pipeline.sink.clone();

        let (sensors, audio_active) = tokio::join!(
            self.inner.start_sensors(&session_id, &config, sink),
            self.inner.start_audio(&session_id, &config),
        );

        if sensors.is_empty() && !audio_active {
            pipeline.sink.close();
            Inner::drain_pipeline(pipeline).await;
            self.inner.streams.clear().await;
            let message = format!("mode {} with sensors {:?}", config.mode, config.sensors);
            self.inner.fail_start(&session_id, "recording", "no producer started");
            if let Err(err) = self
                .inner
                .store
                .update_session_state(&session_id, RecordingState::Error, None, start_timestamp)
                .await
            {
                tracing::warn!(session_id = %session_id, "failed to mark session failed: {err}");
            }
            return Err(RecordingError::NoProducer(message));
        }

        let now = self.inner.clock.now_ms();
        let persisted = async {
            self.inner
                .store
                .update_session_sensors(&session_id, sensors.clone(), now)
                .await?;
            self.inner
                .store
                .update_session_state(&session_id, RecordingState::Recording, None, now)
                .await
        };
        if let Err(err) = persisted.await {
            tracing::warn!(session_id = %session_id, "failed to update session row: {err}");
        }

        if config.wake_hold {
            if let Err(err) = self.inner.wake.activate(&session_id).await {
                tracing::warn!(session_id = %session_id, "failed to activate wake hold: {err}");
            }
        }
        if config.background_permit {
            let spec = NotificationSpec::recording(&session_id);
            if let Err(err) = self.inner.permit.start(&session_id, &spec).await {
                tracing::warn!(session_id = %session_id, "failed to start background permit: {err}");
            }
        }

        {
            let mut shared = self.inner.shared();
            if let Some(session) = shared.session.as_mut() {
                session.sensors = sensors.clone();
                session.audio_active = audio_active;
            }
            shared.pipeline = Some(pipeline);
        }
        self.inner.set_state(RecordingState::Recording);

        tracing::info!(
            session_id = %session_id,
            mode = %config.mode,
            sensors = sensors.len(),
            audio = audio_active,
            "recording started"
        );
        Ok(session_id)
    }

    // ========================================================================
    // Pause / resume
    // ========================================================================

    pub async fn pause(&self) -> Result<(), RecordingError> {
        let _op = self.inner.op_lock.lock().await;
        let state = self.state();
        if state != RecordingState::Recording {
            return Err(RecordingError::InvalidState {
                operation: "pause",
                state,
            });
        }
        let (session_id, audio_active) = self.inner.session_flags();

        let (stream_errors, audio_result) = tokio::join!(self.inner.streams.pause_all(), async {
            if audio_active {
                self.inner.audio.pause().await
            } else {
                Ok(())
            }
        });
        self.inner
            .report_producer_errors(&session_id, stream_errors, audio_result.err());

        if let Err(err) = self.inner.wake.deactivate(&session_id).await {
            tracing::warn!(session_id = %session_id, "failed to release wake hold: {err}");
        }

        let now = self.inner.clock.now_ms();
        if let Some(session) = self.inner.shared().session.as_mut() {
            session.mark_paused(now);
        }
        self.inner.persist_state(&session_id, RecordingState::Paused).await;
        self.inner.set_state(RecordingState::Paused);
        tracing::info!(session_id = %session_id, "recording paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), RecordingError> {
        let _op = self.inner.op_lock.lock().await;
        let state = self.state();
        if state != RecordingState::Paused {
            return Err(RecordingError::InvalidState {
                operation: "resume",
                state,
            });
        }
        let (session_id, audio_active) = self.inner.session_flags();

        let (stream_errors, audio_result) = tokio::join!(self.inner.streams.resume_all(), async {
            if audio_active {
                self.inner.audio.resume().await
            } else {
                Ok(())
            }
        });
        self.inner
            .report_producer_errors(&session_id, stream_errors, audio_result.err());

        if let Err(err) = self.inner.wake.activate(&session_id).await {
            tracing::warn!(session_id = %session_id, "failed to reacquire wake hold: {err}");
        }

        let now = self.inner.clock.now_ms();
        if let Some(session) = self.inner.shared().session.as_mut() {
            session.mark_resumed(now);
        }
        self.inner.persist_state(&session_id, RecordingState::Recording).await;
        self.inner.set_state(RecordingState::Recording);
        tracing::info!(session_id = %session_id, "recording resumed");
        Ok(())
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Stop producers, seal the session's chunks and queue the session for
    /// sync. Returns to `Idle` on success and to `Error` if the final store
    /// updates fail.
    pub async fn stop(&self) -> Result<SessionSummary, RecordingError> {
        let _op = self.inner.op_lock.lock().await;
        let state = self.state();
        if !state.is_active() {
            return Err(RecordingError::InvalidState {
                operation: "stop",
                state,
            });
        }
        self.inner.set_state(RecordingState::Stopping);

        let (session, pipeline) = {
            let mut shared = self.inner.shared();
            (shared.session.clone(), shared.pipeline.take())
        };
        let Some(session) = session else {
            self.inner.set_state(RecordingState::Error);
            return Err(RecordingError::NoProducer("no active session".into()));
        };
        let session_id = session.session_id.clone();

        let (_, audio_result) = tokio::join!(self.inner.streams.stop_all(), async {
            if session.audio_active {
                self.inner.audio.stop().await
            } else {
                Ok(())
            }
        });
        if let Err(err) = audio_result {
            self.inner.emit_error(Some(&session_id), "audio", &err.to_string());
        }

        if let Some(pipeline) = pipeline {
            pipeline.sink.close();
            Inner::drain_pipeline(pipeline).await;
        }

        let finished = self.inner.finish_session(&session).await;

        self.inner.set_state(match finished {
            Ok(_) => RecordingState::Stopped,
            Err(_) => RecordingState::Error,
        });
        if let Some(stats) = self.statistics() {
            self.inner.emit(RecordingEvent::StatsUpdate { stats });
        }

        if let Err(err) = self.inner.wake.deactivate(&session_id).await {
            tracing::warn!(session_id = %session_id, "failed to release wake hold: {err}");
        }
        if let Err(err) = self.inner.permit.stop().await {
            tracing::warn!(session_id = %session_id, "failed to stop background permit: {err}");
        }
        self.inner.streams.clear().await;

        match finished {
            Ok(summary) => {
                self.inner.shared().session = None;
                self.inner.set_state(RecordingState::Idle);
                tracing::info!(
                    session_id = %session_id,
                    chunks = summary.chunk_count,
                    samples = summary.sample_count,
                    "recording stopped"
                );
                Ok(summary)
            }
            Err(err) => {
                self.inner.emit_error(Some(&session_id), "recording", &err.to_string());
                self.inner.shared().session = None;
                Err(err)
            }
        }
    }

    /// Snapshot of the current session, if any.
    pub fn statistics(&self) -> Option<RecordingStats> {
        let (state, session, buffered, pending, abandoned) = {
            let shared = self.inner.shared();
            let session = shared.session.clone()?;
            let (buffered, pending, abandoned) = match &shared.pipeline {
                Some(p) => (
                    p.buffer.len(),
                    p.saver.failed_batch_count(),
                    p.saver.stats().abandoned_batches,
                ),
                None => (0, 0, 0),
            };
            (shared.state, session, buffered, pending, abandoned)
        };

        let sensors = session.mode.uses_sensors().then(|| {
            let all = self.inner.streams.stats_all();
            SensorTotals {
                total_samples: all.values().map(|s| s.total_samples).sum(),
                total_dropped: all.values().map(|s| s.dropped_samples).sum(),
                processing_errors: all.values().map(|s| s.processing_errors).sum(),
                sensors_active: session.sensors.len(),
            }
        });
        let audio = session.audio_active.then(|| self.inner.audio.stats());

        Some(RecordingStats {
            session_id: session.session_id.clone(),
            mode: session.mode,
            state,
            duration_ms: session.active_ms(self.inner.clock.now_ms()),
            sensors,
            audio,
            buffered_samples: buffered,
            pending_batches: pending,
            abandoned_batches: abandoned,
        })
    }

    /// Stop any active session, force-release platform services and drop
    /// all listeners.
    pub async fn cleanup(&self) {
        if self.state().is_active() {
            if let Err(err) = self.stop().await {
                tracing::error!("stop during cleanup failed: {err}");
            }
        }
        if let Err(err) = self.inner.wake.force_release().await {
            tracing::warn!("failed to force release wake hold: {err}");
        }
        if let Err(err) = self.inner.permit.stop().await {
            tracing::warn!("failed to stop background permit: {err}");
        }
        self.inner.listeners.clear();

        let leftover = {
            let mut shared = self.inner.shared();
            shared.session = None;
            shared.pipeline.take()
        };
        if let Some(pipeline) = leftover {
            pipeline.sink.close();
            Inner::drain_pipeline(pipeline).await;
        }
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn session_flags(&self) -> (String, bool) {
        let shared = self.shared();
        shared
            .session
            .as_ref()
            .map(|s| (s.session_id.clone(), s.audio_active))
            .unwrap_or_default()
    }

    fn emit(&self, payload: RecordingEvent) {
        self.listeners.emit(&Event::new(payload.kind(), payload));
    }

    fn emit_error(&self, session_id: Option<&str>, origin: &str, message: &str) {
        tracing::error!(origin, "recording error: {message}");
        self.emit(RecordingEvent::Error {
            session_id: session_id.map(str::to_string),
            origin: origin.to_string(),
            message: message.to_string(),
        });
    }

    /// Move to `to` if the state machine allows it.
    fn set_state(&self, to: RecordingState) {
        let (from, session_id) = {
            let mut shared = self.shared();
            let from = shared.state;
            if from == to {
                return;
            }
            if !from.can_transition_to(to) {
                tracing::error!(%from, %to, "rejected recording state transition");
                return;
            }
            shared.state = to;
            (from, shared.session.as_ref().map(|s| s.session_id.clone()))
        };
        self.emit(RecordingEvent::StateChange {
            session_id,
            from,
            to,
        });
    }

    fn fail_start(&self, session_id: &str, origin: &str, message: &str) {
        self.set_state(RecordingState::Error);
        self.emit_error(Some(session_id), origin, message);
        self.shared().session = None;
    }

    async fn persist_state(&self, session_id: &str, state: RecordingState) {
        let now = self.clock.now_ms();
        if let Err(err) = self
            .store
            .update_session_state(session_id, state, None, now)
            .await
        {
            tracing::warn!(session_id, "failed to persist session state: {err}");
        }
    }

    fn report_producer_errors(
        &self,
        session_id: &str,
        stream_errors: Vec<StreamError>,
        audio_error: Option<CollaboratorError>,
    ) {
        for err in stream_errors {
            self.emit_error(Some(session_id), "sensor", &err.to_string());
        }
        if let Some(err) = audio_error {
            self.emit_error(Some(session_id), "audio", &err.to_string());
        }
    }

    fn build_pipeline(
        self: &Arc<Self>,
        session_id: &str,
        start_timestamp: i64,
        config: &RecordingConfig,
    ) -> SessionPipeline {
        let weak = Arc::downgrade(self);
        let sid = session_id.to_string();
        let on_save_error: SaveErrorHandler = Arc::new(move |err: &SinkError, samples: &[Sample]| {
            if let Some(inner) = weak.upgrade() {
                inner.emit_error(
                    Some(&sid),
                    "persistence",
                    &format!("{} samples not saved: {err}", samples.len()),
                );
            }
        });

        let saver = BatchSaver::new(Arc::new(self.persistence.clone()), config.saver.clone())
            .with_error_handler(on_save_error);
        let buffer = SampleBuffer::new(config.buffer.clone());
        buffer.set_flush_handler(Arc::new(saver.clone()));
        buffer.start();

        let (tx, mut rx) = mpsc::channel::<Vec<Sample>>(config.channel_capacity.max(1));
        let drain_buffer = buffer.clone();
        let drain = tokio::spawn(async move {
            while let Some(samples) = rx.recv().await {
                drain_buffer.add_batch(samples).await;
            }
        });

        SessionPipeline {
            sink: Arc::new(SessionSink {
                session_id: session_id.to_string(),
                start_timestamp,
                tx: Mutex::new(Some(tx)),
            }),
            buffer,
            saver,
            drain,
        }
    }

    /// Wait for queued batches to reach the buffer, flush it and replay any
    /// failed saves once.
    async fn drain_pipeline(pipeline: SessionPipeline) {
        if let Err(err) = pipeline.drain.await {
            tracing::error!("session drain task ended abnormally: {err}");
        }
        if let Err(err) = pipeline.buffer.stop().await {
            tracing::warn!("final buffer flush failed: {err}");
        }
        if pipeline.saver.failed_batch_count() > 0 {
            let result = pipeline.saver.retry_failed_batches().await;
            if !result.success {
                tracing::warn!(
                    failed = result.failed_count,
                    "batches still unsaved after retry"
                );
            }
        }
    }

    async fn start_sensors(
        self: &Arc<Self>,
        session_id: &str,
        config: &RecordingConfig,
        sink: SharedSink,
    ) -> Vec<SensorKind> {
        if !config.mode.uses_sensors() {
            return Vec::new();
        }

        let mut started = Vec::new();
        for &kind in &config.sensors {
            let stream = self.streams.get_or_create(config.stream_config(kind));
            let weak = Arc::downgrade(self);
            let sid = session_id.to_string();
            let on_error: StreamErrorHandler = Arc::new(move |err: &StreamError| {
                if let Some(inner) = weak.upgrade() {
                    inner.emit_error(Some(&sid), &format!("sensor:{kind}"), &err.to_string());
                }
            });

            match stream.start(sink.clone(), Some(on_error)).await {
                Ok(()) => started.push(kind),
                Err(err) => {
                    self.emit_error(Some(session_id), &format!("sensor:{kind}"), &err.to_string());
                }
            }
        }
        started
    }

    async fn start_audio(self: &Arc<Self>, session_id: &str, config: &RecordingConfig) -> bool {
        if !config.mode.uses_audio() {
            return false;
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        let sid = session_id.to_string();
        let on_error: AudioErrorHandler = Arc::new(move |message: String| {
            if let Some(inner) = weak.upgrade() {
                inner.emit_error(Some(&sid), "audio", &message);
            }
        });

        match self.audio.start(session_id, &config.audio, on_error).await {
            Ok(()) => true,
            Err(err) => {
                self.emit_error(Some(session_id), "audio", &err.to_string());
                false
            }
        }
    }

    /// Seal open chunks, close the session row and queue it for upload.
    async fn finish_session(
        &self,
        session: &ActiveSession,
    ) -> Result<SessionSummary, RecordingError> {
        let session_id = &session.session_id;
        let results = self.persistence.flush_session(session_id).await?;
        let mut unsealed = 0;
        for result in &results {
            if let WriteResult::Failed { key, error } = result {
                unsealed += 1;
                self.emit_error(
                    Some(session_id),
                    "persistence",
                    &format!("chunk {key} not sealed: {error}"),
                );
            }
        }

        let now = self.clock.now_ms();
        self.store
            .update_session_state(session_id, RecordingState::Stopped, Some(now), now)
            .await?;
        self.store
            .enqueue(
                NewSyncEntry::upload(EntityType::Session, session_id.clone(), priority::NORMAL),
                now,
            )
            .await?;

        let record = self.store.session(session_id).await?;
        Ok(SessionSummary {
            session_id: session_id.clone(),
            duration_ms: session.active_ms(now),
            sample_count: record.as_ref().map_or(0, |r| r.sample_count),
            chunk_count: record.as_ref().map_or(0, |r| r.chunk_count),
            unsealed_chunks: unsealed,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
