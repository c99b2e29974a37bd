//! Long-lived pipeline components, created once at startup.
//!
//! [`AppContext`] owns the metadata store, chunk persistence, both
//! orchestrators and the stats ledger, and wires the ledger to their events.
//! Tear it down with [`AppContext::shutdown`] so active chunks are sealed.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::clock::{system_clock, SharedClock};
use crate::config::{Config, ConfigError};
use crate::recording::collaborators::AudioProducer;
use crate::recording::orchestrator::{
    RecordingError, RecordingEvent, RecordingOrchestrator, SessionSummary,
};
use crate::sensor::source::SensorSource;
use crate::stats::ledger::{SharedStatsLedger, StatsLedger};
use crate::storage::chunk::{ChunkPersistence, PurgeReport};
use crate::storage::error::{ChunkError, StoreError};
use crate::storage::store::MetadataStore;
use crate::sync::client::{generate_device_id, HttpClient, SyncApi, TransportError};
use crate::sync::device::{DeviceStatus, FixedDeviceStatus};
use crate::sync::orchestrator::{SyncEvent, SyncOrchestrator};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Recording(#[from] RecordingError),
}

pub struct AppContextBuilder {
    config: Config,
    source: Arc<dyn SensorSource>,
    clock: SharedClock,
    http: Option<Arc<dyn HttpClient>>,
    device: Arc<dyn DeviceStatus>,
    audio: Option<Arc<dyn AudioProducer>>,
}

impl AppContextBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// HTTP client for sync. Without one, the configured gateway is used
    /// when the `gateway` feature is enabled.
    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn device(mut self, device: Arc<dyn DeviceStatus>) -> Self {
        self.device = device;
        self
    }

    pub fn audio(mut self, audio: Arc<dyn AudioProducer>) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Open the store and start the chunk writer. Must run inside a tokio
    /// runtime.
    pub fn build(self) -> Result<AppContext, ContextError> {
        let config = self.config;
        config.validate()?;
        config.ensure_directories()?;

        let store = MetadataStore::open(config.database_path())?;
        let persistence =
            ChunkPersistence::open(config.chunk_config(), store.clone(), self.clock.clone())?;

        let mut recording =
            RecordingOrchestrator::builder(self.source, persistence.clone(), self.clock.clone());
        if let Some(audio) = self.audio {
            recording = recording.audio(audio);
        }
        let recording = recording.build();

        let ledger: SharedStatsLedger = Arc::new(StatsLedger::with_persistence(config.stats_path()));
        {
            let ledger = ledger.clone();
            recording.add_listener(move |event| {
                if let RecordingEvent::StatsUpdate { stats } = &event.payload {
                    ledger.record_session(stats);
                }
            });
        }

        let http = match self.http {
            Some(http) => Some(http),
            None => default_http(&config)?,
        };
        let sync = http.map(|http| {
            let device_id = config
                .device_id
                .clone()
                .unwrap_or_else(generate_device_id);
            let sync = SyncOrchestrator::new(
                persistence.clone(),
                SyncApi::new(http, device_id),
                self.device.clone(),
                self.clock.clone(),
                config.sync.clone(),
            );
            let ledger = ledger.clone();
            sync.add_listener(move |event| {
                if let SyncEvent::Complete { report } = &event.payload {
                    ledger.record_sync(report);
                }
            });
            sync
        });

        tracing::info!(
            data = %config.data_path.display(),
            sync = sync.is_some(),
            "pipeline context ready"
        );
        Ok(AppContext {
            config,
            clock: self.clock,
            store,
            persistence,
            recording,
            sync,
            ledger,
        })
    }
}

#[cfg(feature = "gateway")]
fn default_http(config: &Config) -> Result<Option<Arc<dyn HttpClient>>, ContextError> {
    use crate::sync::gateway::GatewayClient;

    match &config.gateway {
        Some(gateway) => {
            let client: Arc<dyn HttpClient> = Arc::new(GatewayClient::new(gateway.clone())?);
            Ok(Some(client))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "gateway"))]
fn default_http(config: &Config) -> Result<Option<Arc<dyn HttpClient>>, ContextError> {
    if config.gateway.is_some() {
        tracing::warn!("gateway configured but built without the `gateway` feature");
    }
    Ok(None)
}

pub struct AppContext {
    pub config: Config,
    pub clock: SharedClock,
    pub store: MetadataStore,
    pub persistence: ChunkPersistence,
    pub recording: RecordingOrchestrator,
    /// Present when an HTTP client is available
    pub sync: Option<SyncOrchestrator>,
    pub ledger: SharedStatsLedger,
}

impl AppContext {
    /// Builder with the system clock and a device that reports itself as
    /// online and on mains power.
    pub fn builder(config: Config, source: Arc<dyn SensorSource>) -> AppContextBuilder {
        AppContextBuilder {
            config,
            source,
            clock: system_clock(),
            http: None,
            device: Arc::new(FixedDeviceStatus::default()),
            audio: None,
        }
    }

    /// Stop the current session and fold its chunks into the ledger.
    pub async fn stop_recording(&self) -> Result<SessionSummary, ContextError> {
        let summary = self.recording.stop().await?;
        let chunks = self.store.chunks_for_session(&summary.session_id).await?;
        self.ledger.record_chunks(&chunks);
        if let Err(err) = self.ledger.save() {
            tracing::warn!("failed to save pipeline stats: {err}");
        }
        Ok(summary)
    }

    /// Periodic background sync, if enabled and a sync server is available.
    pub fn start_auto_sync(&self) -> Option<JoinHandle<()>> {
        if !self.config.auto_sync {
            return None;
        }
        let sync = self.sync.as_ref()?;
        tracing::info!(interval_ms = self.config.sync_interval.as_millis() as u64, "auto sync enabled");
        Some(sync.spawn_periodic(self.config.sync_interval))
    }

    /// Delete synced chunks older than the configured retention.
    pub async fn purge(&self) -> Result<PurgeReport, ContextError> {
        let retention = self.config.chunks.retention.as_millis() as i64;
        let cutoff = self.clock.now_ms() - retention;
        let report = self.persistence.purge_synced(cutoff).await?;
        tracing::info!(chunks = report.chunks, bytes = report.bytes, "purged synced chunks");
        Ok(report)
    }

    /// Stop recording, seal every active chunk and save the ledger.
    pub async fn shutdown(self) -> Result<(), ContextError> {
        if self.recording.state().is_active() {
            if let Err(err) = self.stop_recording().await {
                tracing::error!("failed to stop recording on shutdown: {err}");
            }
        }
        self.recording.cleanup().await;

        let results = self.persistence.shutdown().await?;
        let failed = results.iter().filter(|r| r.is_failure()).count();
        if failed > 0 {
            tracing::warn!(failed, "some chunks could not be sealed on shutdown");
        }

        if let Err(err) = self.ledger.save() {
            tracing::warn!("failed to save pipeline stats: {err}");
        }
        tracing::info!("pipeline context shut down");
        Ok(())
    }
}
