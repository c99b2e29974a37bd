//! Sync queue draining and server delta pulls.
//!
//! A run checks device constraints, pushes eligible queue entries in windows
//! of `max_concurrent`, then pulls server changes page by page starting from
//! the stored cursor. Only one run is active at a time; a second caller gets
//! [`SyncOutcome::AlreadyRunning`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::events::{Event, EventKind, ListenerId, Listeners};
use crate::pipeline::batch_saver::backoff_delay;
use crate::storage::chunk::ChunkPersistence;
use crate::storage::error::{ChunkError, StoreError};
use crate::storage::models::{
    EntityType, NewSyncEntry, QueueCounts, RemoteItem, SyncQueueEntry,
};
use crate::storage::store::MetadataStore;
use crate::sync::client::{SyncApi, TransportError};
use crate::sync::device::{DeviceStatus, NetworkState};
use crate::sync::protocol::{ItemStatus, PullRequest, PushRequest, SyncItem, SyncItemType};

// ============================================================================
// Options, errors and events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Uploads in flight at once
    pub max_concurrent: usize,
    /// First retry delay; doubles per failed attempt
    #[serde(with = "crate::config::duration_ms")]
    pub base_backoff: Duration,
    /// Defer on metered connections
    pub prefer_unmetered: bool,
    pub pause_on_low_battery: bool,
    /// Battery level (0 to 1) below which a discharging device defers
    pub low_battery_threshold: f32,
    /// Queue entries read per run
    pub batch_limit: usize,
    pub pull_enabled: bool,
    pub pull_page_size: u32,
    pub max_pull_pages: usize,
    pub pull_types: Option<Vec<String>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            base_backoff: Duration::from_secs(5),
            prefer_unmetered: false,
            pause_on_low_battery: true,
            low_battery_threshold: 0.2,
            batch_limit: 100,
            pull_enabled: true,
            pull_page_size: 100,
            max_pull_pages: 10,
            pull_types: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    Offline,
    Metered,
    LowBattery,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Failures that used up the retry budget or cannot be retried
    pub parked: usize,
    pub pulled: usize,
    pub pull_pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_error: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    Deferred { reason: DeferReason },
    AlreadyRunning,
}

/// Snapshot returned by [`SyncOrchestrator::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOverview {
    pub state: SyncState,
    pub is_syncing: bool,
    pub last_sync_at: Option<i64>,
    pub cursor: Option<i64>,
    pub queue: QueueCounts,
    pub network: NetworkState,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("{0} not found")]
    MissingEntity(String),

    #[error("server reported failure: {0}")]
    Rejected(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(err) => err.is_retryable(),
            SyncError::Chunk(err) => err.is_retryable(),
            SyncError::Store(StoreError::Database(_)) | SyncError::Store(StoreError::Io(_)) => {
                true
            }
            SyncError::Store(_) => false,
            SyncError::MissingEntity(_) => false,
            // the server may accept the item on a later attempt
            SyncError::Rejected(_) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StateChange {
        from: SyncState,
        to: SyncState,
    },
    Progress {
        current: usize,
        total: usize,
    },
    Complete {
        report: SyncReport,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
    },
}

impl SyncEvent {
    fn kind(&self) -> EventKind {
        match self {
            SyncEvent::StateChange { .. } => EventKind::StateChange,
            SyncEvent::Progress { .. } => EventKind::Progress,
            SyncEvent::Complete { .. } => EventKind::Complete,
            SyncEvent::Error { .. } => EventKind::Error,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Inner {
    persistence: ChunkPersistence,
    store: MetadataStore,
    api: SyncApi,
    device: Arc<dyn DeviceStatus>,
    clock: SharedClock,
    options: Mutex<SyncOptions>,
    state: Mutex<SyncState>,
    /// Last state reported through `on_network_change`
    network: Mutex<Option<NetworkState>>,
    running: AtomicBool,
    listeners: Listeners<Event<SyncEvent>>,
}

/// Cheap-clone handle to the sync orchestrator.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum EntryResult {
    Synced,
    Retrying,
    Parked,
}

impl SyncOrchestrator {
    pub fn new(
        persistence: ChunkPersistence,
        api: SyncApi,
        device: Arc<dyn DeviceStatus>,
        clock: SharedClock,
        options: SyncOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: persistence.store().clone(),
                persistence,
                api,
                device,
                clock,
                options: Mutex::new(options),
                state: Mutex::new(SyncState::Idle),
                network: Mutex::new(None),
                running: AtomicBool::new(false),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        *lock(&self.inner.state)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> SyncOptions {
        lock(&self.inner.options).clone()
    }

    /// Replace the options used by subsequent runs.
    pub fn configure(&self, options: SyncOptions) {
        *lock(&self.inner.options) = options;
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event<SyncEvent>) + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Queue an entity for upload.
    pub async fn add_to_queue(&self, entry: NewSyncEntry) -> Result<i64, SyncError> {
        let id = self.inner.store.enqueue(entry, self.inner.clock.now_ms()).await?;
        Ok(id)
    }

    pub async fn status(&self) -> Result<SyncOverview, SyncError> {
        let store = &self.inner.store;
        Ok(SyncOverview {
            state: self.state(),
            is_syncing: self.is_syncing(),
            last_sync_at: store.last_sync_at().await?,
            cursor: store.cursor().await?,
            queue: store.queue_counts().await?,
            network: self.inner.current_network(),
        })
    }

    /// Reset failed and parked entries, then sync.
    pub async fn retry_failed_items(&self) -> Result<SyncOutcome, SyncError> {
        let reset = self.inner.store.retry_failed().await?;
        tracing::info!(entries = reset, "failed sync entries reset");
        self.start_sync().await
    }

    /// Run one sync pass now.
    pub async fn start_sync(&self) -> Result<SyncOutcome, SyncError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync already running");
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let _guard = RunGuard(&self.inner.running);

        let options = self.options();
        if let Some(reason) = self.inner.check_constraints(&options) {
            tracing::info!(?reason, "sync deferred");
            return Ok(SyncOutcome::Deferred { reason });
        }

        self.inner.set_state(SyncState::Syncing);
        match self.inner.run(&options).await {
            Ok(report) => {
                self.inner.set_state(SyncState::Idle);
                tracing::info!(
                    synced = report.synced,
                    failed = report.failed,
                    pulled = report.pulled,
                    "sync complete"
                );
                self.inner.emit(SyncEvent::Complete {
                    report: report.clone(),
                });
                Ok(SyncOutcome::Completed(report))
            }
            Err(err) => {
                tracing::error!("sync failed: {err}");
                self.inner.emit(SyncEvent::Error {
                    message: err.to_string(),
                    entity_id: None,
                });
                self.inner.set_state(SyncState::Error);
                Err(err)
            }
        }
    }

    /// Sync for timers and connectivity triggers: errors are logged, not
    /// returned.
    pub async fn background_sync(&self) -> Option<SyncOutcome> {
        match self.start_sync().await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::warn!("background sync failed: {err}");
                None
            }
        }
    }

    /// Record a connectivity change. Coming back online starts a background
    /// sync when the constraints allow it; returns whether one was started.
    pub fn on_network_change(&self, network: NetworkState) -> bool {
        let previous = lock(&self.inner.network).replace(network);
        let was_connected = previous
            .unwrap_or_else(|| self.inner.device.network())
            .connected;
        if was_connected || !network.connected {
            return false;
        }

        let options = self.options();
        if let Some(reason) = self.inner.check_constraints(&options) {
            tracing::info!(?reason, "back online, sync deferred");
            return false;
        }

        tracing::info!(kind = ?network.kind, "back online, starting sync");
        let this = self.clone();
        tokio::spawn(async move {
            this.background_sync().await;
        });
        true
    }

    /// Feed connectivity updates from a watch channel into
    /// [`on_network_change`](Self::on_network_change).
    pub fn observe_network(&self, mut rx: watch::Receiver<NetworkState>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            this.on_network_change(initial);
            while rx.changed().await.is_ok() {
                let network = *rx.borrow_and_update();
                this.on_network_change(network);
            }
        })
    }

    /// Run a background sync every `interval`.
    pub fn spawn_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.background_sync().await;
            }
        })
    }
}

impl Inner {
    fn current_network(&self) -> NetworkState {
        let reported = *lock(&self.network);
        reported.unwrap_or_else(|| self.device.network())
    }

    fn check_constraints(&self, options: &SyncOptions) -> Option<DeferReason> {
        let network = self.current_network();
        if !network.connected {
            return Some(DeferReason::Offline);
        }
        if options.prefer_unmetered && network.metered {
            return Some(DeferReason::Metered);
        }
        let battery = self.device.battery();
        if options.pause_on_low_battery
            && !battery.charging
            && battery.level < options.low_battery_threshold
        {
            return Some(DeferReason::LowBattery);
        }
        None
    }

    async fn run(&self, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        let started = self.clock.now_ms();
        let recovered = self.store.recover_in_progress().await?;
        if recovered > 0 {
            tracing::info!(entries = recovered, "recovered interrupted sync entries");
        }

        let mut report = SyncReport::default();
        let entries = self.store.eligible_entries(started, options.batch_limit).await?;
        let total = entries.len();
        report.attempted = total;

        let mut current = 0;
        for window in entries.chunks(options.max_concurrent.max(1)) {
            let results = join_all(window.iter().map(|entry| self.process_entry(entry, options))).await;
            for result in results {
                match result? {
                    EntryResult::Synced => report.synced += 1,
                    EntryResult::Retrying => report.failed += 1,
                    EntryResult::Parked => {
                        report.failed += 1;
                        report.parked += 1;
                    }
                }
            }
            current += window.len();
            self.emit(SyncEvent::Progress { current, total });
        }

        if options.pull_enabled {
            if let Err(err) = self.pull(options, &mut report).await {
                tracing::warn!("pull failed: {err}");
                self.emit(SyncEvent::Error {
                    message: err.to_string(),
                    entity_id: None,
                });
                report.pull_error = Some(err.to_string());
            }
        }

        let finished = self.clock.now_ms();
        self.store.set_last_sync_at(finished).await?;
        report.duration_ms = finished - started;
        Ok(report)
    }

    /// Push one entry and record the outcome. Store errors while recording
    /// the outcome abort the run.
    async fn process_entry(
        &self,
        entry: &SyncQueueEntry,
        options: &SyncOptions,
    ) -> Result<EntryResult, SyncError> {
        self.store.mark_in_progress(entry.id, self.clock.now_ms()).await?;

        match self.upload(entry).await {
            Ok(()) => {
                self.store.complete_entry(entry).await?;
                tracing::debug!(entity = %entry.entity_id, "entry synced");
                Ok(EntryResult::Synced)
            }
            Err(err) => {
                let now = self.clock.now_ms();
                let attempts = entry.retry_count + 1;
                let park = !err.is_retryable();
                let exhausted = park || attempts >= entry.max_retries;
                let next_retry_at = (!exhausted).then(|| {
                    now + backoff_delay(options.base_backoff, attempts).as_millis() as i64
                });

                tracing::warn!(
                    entity = %entry.entity_id,
                    attempts,
                    park,
                    "sync entry failed: {err}"
                );
                self.store
                    .fail_entry(entry.id, err.to_string(), now, next_retry_at, park)
                    .await?;
                self.emit(SyncEvent::Error {
                    message: err.to_string(),
                    entity_id: Some(entry.entity_id.clone()),
                });
                Ok(if exhausted {
                    EntryResult::Parked
                } else {
                    EntryResult::Retrying
                })
            }
        }
    }

    async fn upload(&self, entry: &SyncQueueEntry) -> Result<(), SyncError> {
        let data = self.payload(entry).await?;
        let now = self.clock.now_ms();
        let item = SyncItem {
            id: entry.id.to_string(),
            item_type: SyncItemType::from(entry.entity_type),
            local_id: entry.entity_id.clone(),
            server_id: None,
            status: ItemStatus::InProgress,
            priority: entry.priority,
            created_at: entry.created_at,
            updated_at: now,
            data,
            error: None,
        };

        let response = self
            .api
            .push(PushRequest {
                items: vec![item],
                batch_id: Some(uuid::Uuid::new_v4().to_string()),
                device_id: None,
            })
            .await?;

        match response.result_for(&entry.entity_id) {
            Some(result) if result.status == ItemStatus::Failed => Err(SyncError::Rejected(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "item failed".to_string()),
            )),
            Some(_) => Ok(()),
            None if response.failed > 0 => Err(SyncError::Rejected(format!(
                "batch {} reported {} failed",
                response.batch_id, response.failed
            ))),
            None => Ok(()),
        }
    }

    async fn payload(&self, entry: &SyncQueueEntry) -> Result<Option<serde_json::Value>, SyncError> {
        match entry.entity_type {
            EntityType::SensorDataChunk => {
                let meta = self
                    .store
                    .chunk(&entry.entity_id)
                    .await?
                    .ok_or_else(|| SyncError::MissingEntity(format!("chunk {}", entry.entity_id)))?;
                let samples = self.persistence.read_chunk_file(&entry.entity_id).await?;
                Ok(Some(serde_json::json!({
                    "chunk": meta,
                    "samples": samples,
                })))
            }
            EntityType::Session => {
                let session = self
                    .store
                    .session(&entry.entity_id)
                    .await?
                    .ok_or_else(|| {
                        SyncError::MissingEntity(format!("session {}", entry.entity_id))
                    })?;
                let data = serde_json::to_value(session).map_err(StoreError::from)?;
                Ok(Some(data))
            }
            // audio files and metadata blobs are uploaded by reference
            EntityType::Audio | EntityType::Metadata => Ok(None),
        }
    }

    async fn pull(&self, options: &SyncOptions, report: &mut SyncReport) -> Result<(), SyncError> {
        while report.pull_pages < options.max_pull_pages {
            let cursor = self.store.cursor().await?;
            let response = self
                .api
                .pull(PullRequest {
                    last_sync_timestamp: cursor,
                    types: options.pull_types.clone(),
                    limit: Some(options.pull_page_size),
                })
                .await?;
            report.pull_pages += 1;

            let next_cursor = response.next_cursor();
            let has_more = response.has_more;
            let items: Vec<RemoteItem> = response.items.into_iter().map(Into::into).collect();
            report.pulled += self.store.apply_pull_page(items, next_cursor).await?;

            // a page that does not move the cursor would repeat forever
            if !has_more || next_cursor.is_none() || next_cursor == cursor {
                break;
            }
        }
        Ok(())
    }

    fn set_state(&self, to: SyncState) {
        let from = std::mem::replace(&mut *lock(&self.state), to);
        if from != to {
            self.emit(SyncEvent::StateChange { from, to });
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.listeners.emit(&Event::new(event.kind(), event));
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
    use crate::clock::{Clock, ManualClock};
    use crate::recording::state::{RecordingMode, RecordingState};
    use crate::sensor::types::{Sample, SensorKind};
    use crate::storage::chunk::ChunkConfig;
    use crate::storage::models::{priority, SessionRecord, SyncStatus};
    use crate::sync::client::fake::ScriptedHttp;
    use crate::sync::client::HttpClient;
    use crate::sync::device::{BatteryState, FixedDeviceStatus};
    use crate::sync::protocol::{PULL_PATH, PUSH_PATH};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        store: MetadataStore,
        persistence: ChunkPersistence,
        device: Arc<FixedDeviceStatus>,
        http: Arc<ScriptedHttp>,
        sync: SyncOrchestrator,
    }

    fn ok_push(body: &Value) -> Value {
        let local_id = body["items"][0]["localId"].clone();
        json!({
            "batchId": body["batchId"],
            "synced": 1,
            "failed": 0,
            "results": [{ "localId": local_id, "serverId": "srv", "status": "completed" }]
        })
    }

    fn empty_pull() -> Value {
        json!({ "items": [], "hasMore": false })
    }

    fn harness<F>(handler: F) -> Harness
    where
        F: Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MetadataStore::open_in_memory().unwrap();
        let mut config = ChunkConfig::new(dir.path().join("chunks"));
        config.sweep_interval = None;
        let persistence = ChunkPersistence::open(config, store.clone(), clock.clone()).unwrap();
        let device = Arc::new(FixedDeviceStatus::default());
        let http = Arc::new(ScriptedHttp::new(handler));
        let options = SyncOptions {
            base_backoff: Duration::from_millis(1_000),
            ..SyncOptions::default()
        };
        let sync = SyncOrchestrator::new(
            persistence.clone(),
            SyncApi::new(http.clone(), "device-1"),
            device.clone(),
            clock.clone(),
            options,
        );
        Harness {
            _dir: dir,
            clock,
            store,
            persistence,
            device,
            http,
            sync,
        }
    }

    async fn seal_chunk(h: &Harness, session: &str) -> String {
        let samples = vec![
            Sample::axis(SensorKind::Accelerometer, 1_000, 0.0, 0.0, 9.8).in_session(session, 0),
            Sample::axis(SensorKind::Accelerometer, 1_020, 0.0, 0.1, 9.8).in_session(session, 0),
        ];
        // The window is long past on the harness clock, so the write itself
        // may already seal the chunk.
        let mut results = h
            .persistence
            .write_samples(session, SensorKind::Accelerometer, samples)
            .await
            .unwrap();
        results.extend(h.persistence.flush_session(session).await.unwrap());
        results
            .iter()
            .find_map(|r| r.sealed())
            .expect("chunk sealed")
            .chunk_id
            .clone()
    }

    #[tokio::test]
    async fn test_sync_pushes_chunks_and_marks_synced() {
        let h = harness(|path, body| match path {
            PUSH_PATH => Ok(ok_push(body)),
            _ => Ok(empty_pull()),
        });
        let chunk_id = seal_chunk(&h, "s1").await;

        let outcome = h.sync.start_sync().await.unwrap();
        let SyncOutcome::Completed(report) = outcome else {
            panic!("expected completed run, got {outcome:?}");
        };
        assert_eq!((report.attempted, report.synced, report.failed), (1, 1, 0));

        assert!(h.store.chunk(&chunk_id).await.unwrap().unwrap().synced);
        assert!(h.store.entries(None).await.unwrap().is_empty());
        assert_eq!(h.store.last_sync_at().await.unwrap(), Some(1_000_000));

        let pushes = h.http.requests_to(PUSH_PATH);
        assert_eq!(pushes[0]["deviceId"], "device-1");
        assert_eq!(pushes[0]["items"][0]["type"], "sensor_data");
        assert_eq!(pushes[0]["items"][0]["data"]["samples"].as_array().unwrap().len(), 2);
        assert_eq!(h.sync.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_offline_defers_without_touching_queue() {
        let h = harness(|_, _| panic!("no request expected"));
        seal_chunk(&h, "s1").await;
        h.device.set_network(NetworkState::offline());

        let outcome = h.sync.start_sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Deferred {
                reason: DeferReason::Offline
            }
        );
        let entries = h.store.entries(None).await.unwrap();
        assert_eq!(entries[0].status, SyncStatus::Pending);
        assert_eq!(entries[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_metered_and_low_battery_constraints() {
        let h = harness(|_, _| Ok(empty_pull()));
        h.device.set_network(NetworkState::cellular());
        h.sync.configure(SyncOptions {
            prefer_unmetered: true,
            ..h.sync.options()
        });
        assert_eq!(
            h.sync.start_sync().await.unwrap(),
            SyncOutcome::Deferred {
                reason: DeferReason::Metered
            }
        );

        h.device.set_network(NetworkState::wifi());
        h.device.set_battery(BatteryState {
            level: 0.1,
            charging: false,
        });
        assert_eq!(
            h.sync.start_sync().await.unwrap(),
            SyncOutcome::Deferred {
                reason: DeferReason::LowBattery
            }
        );

        h.device.set_battery(BatteryState {
            level: 0.1,
            charging: true,
        });
        assert!(matches!(
            h.sync.start_sync().await.unwrap(),
            SyncOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_backoff() {
        let h = harness(|path, _| match path {
            PUSH_PATH => Err(TransportError::Http {
                status: 503,
                message: "unavailable".into(),
            }),
            _ => Ok(empty_pull()),
        });
        seal_chunk(&h, "s1").await;

        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!((report.failed, report.parked), (1, 0));

        let entry = &h.store.entries(None).await.unwrap()[0];
        assert_eq!(entry.status, SyncStatus::Failed);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.next_retry_at, Some(1_001_000));
        assert!(entry.error_message.as_deref().unwrap().contains("503"));

        // not eligible until the backoff elapses
        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(report.attempted, 0);

        h.clock.advance(1_000);
        h.sync.start_sync().await.unwrap();
        let entry = &h.store.entries(None).await.unwrap()[0];
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.next_retry_at, Some(1_001_000 + 2_000));

        // third failure uses up max_retries
        h.clock.advance(2_000);
        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!((report.failed, report.parked), (1, 1));
        let entry = &h.store.entries(None).await.unwrap()[0];
        assert_eq!(entry.retry_count, 3);
        assert!(entry.is_parked());
        assert_eq!(entry.next_retry_at, None);
        assert_eq!(h.store.queue_counts().await.unwrap().parked, 1);

        h.clock.advance(3_600_000);
        let eligible = h.store.eligible_entries(h.clock.now_ms(), 100).await.unwrap();
        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_parks_immediately() {
        let h = harness(|path, _| match path {
            PUSH_PATH => Err(TransportError::Http {
                status: 422,
                message: "bad payload".into(),
            }),
            _ => Ok(empty_pull()),
        });
        seal_chunk(&h, "s1").await;

        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(report.parked, 1);
        let counts = h.store.queue_counts().await.unwrap();
        assert_eq!((counts.failed, counts.parked), (1, 1));

        h.clock.advance(3_600_000);
        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_retry_failed_items_requeues_parked() {
        let fail = Arc::new(AtomicBool::new(true));
        let flag = fail.clone();
        let h = harness(move |path, body| match path {
            PUSH_PATH if flag.load(Ordering::SeqCst) => Err(TransportError::Http {
                status: 400,
                message: "rejected".into(),
            }),
            PUSH_PATH => Ok(ok_push(body)),
            _ => Ok(empty_pull()),
        });
        let chunk_id = seal_chunk(&h, "s1").await;
        h.sync.start_sync().await.unwrap();
        assert_eq!(h.store.queue_counts().await.unwrap().parked, 1);

        fail.store(false, Ordering::SeqCst);
        let SyncOutcome::Completed(report) = h.sync.retry_failed_items().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(report.synced, 1);
        assert!(h.store.chunk(&chunk_id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn test_priority_order_and_bounded_windows() {
        let h = harness(|path, body| match path {
            PUSH_PATH => Ok(ok_push(body)),
            _ => Ok(empty_pull()),
        });
        for (id, prio) in [
            ("low", priority::LOW),
            ("urgent", priority::URGENT),
            ("normal", priority::NORMAL),
            ("high", priority::HIGH),
        ] {
            h.sync
                .add_to_queue(NewSyncEntry::upload(EntityType::Metadata, id, prio))
                .await
                .unwrap();
        }
        h.sync.configure(SyncOptions {
            max_concurrent: 2,
            ..h.sync.options()
        });

        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        h.sync.add_listener(move |event| {
            if let SyncEvent::Progress { current, total } = &event.payload {
                lock(&seen).push((*current, *total));
            }
        });

        h.sync.start_sync().await.unwrap();
        assert_eq!(*lock(&progress), vec![(2, 4), (4, 4)]);

        let order: Vec<String> = h
            .http
            .requests_to(PUSH_PATH)
            .iter()
            .map(|body| body["items"][0]["localId"].as_str().unwrap().to_string())
            .collect();
        // windows run concurrently, so only the window split is ordered
        let mut first: Vec<&str> = order[..2].iter().map(String::as_str).collect();
        first.sort();
        assert_eq!(first, vec!["high", "urgent"]);
    }

    /// Holds every push open for a while and records the peak number of
    /// requests in flight.
    #[derive(Default)]
    struct SlowHttp {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HttpClient for SlowHttp {
        async fn get(&self, _path: &str) -> Result<Value, TransportError> {
            Ok(empty_pull())
        }

        async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
            if path != PUSH_PATH {
                return Ok(empty_pull());
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ok_push(&body))
        }

        async fn patch(&self, _path: &str, body: Value) -> Result<Value, TransportError> {
            Ok(body)
        }

        async fn delete(&self, _path: &str) -> Result<Value, TransportError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_uploads_never_exceed_max_concurrent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MetadataStore::open_in_memory().unwrap();
        let mut config = ChunkConfig::new(dir.path().join("chunks"));
        config.sweep_interval = None;
        let persistence = ChunkPersistence::open(config, store.clone(), clock.clone()).unwrap();
        let http = Arc::new(SlowHttp::default());
        let sync = SyncOrchestrator::new(
            persistence,
            SyncApi::new(http.clone(), "device-1"),
            Arc::new(FixedDeviceStatus::default()),
            clock,
            SyncOptions {
                max_concurrent: 3,
                ..SyncOptions::default()
            },
        );
        for i in 0..10 {
            sync.add_to_queue(NewSyncEntry::upload(
                EntityType::Metadata,
                format!("m{i}"),
                priority::NORMAL,
            ))
            .await
            .unwrap();
        }

        let SyncOutcome::Completed(report) = sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(report.synced, 10);
        let peak = http.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in-flight uploads was {peak}");
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn test_session_entry_sends_record() {
        let h = harness(|path, body| match path {
            PUSH_PATH => Ok(ok_push(body)),
            _ => Ok(empty_pull()),
        });
        h.store
            .insert_session(
                SessionRecord {
                    session_id: "s9".into(),
                    mode: RecordingMode::SensorOnly,
                    state: RecordingState::Stopped,
                    start_timestamp: 10,
                    end_timestamp: Some(20),
                    enabled_sensors: vec![SensorKind::Gyroscope],
                    sample_count: 0,
                    chunk_count: 0,
                },
                20,
            )
            .await
            .unwrap();
        h.sync
            .add_to_queue(NewSyncEntry::upload(EntityType::Session, "s9", priority::NORMAL))
            .await
            .unwrap();

        h.sync.start_sync().await.unwrap();
        let push = &h.http.requests_to(PUSH_PATH)[0];
        assert_eq!(push["items"][0]["type"], "session");
        assert_eq!(push["items"][0]["data"]["sessionId"], "s9");
    }

    #[tokio::test]
    async fn test_missing_chunk_is_parked() {
        let h = harness(|_, _| Ok(empty_pull()));
        h.sync
            .add_to_queue(NewSyncEntry::upload(
                EntityType::SensorDataChunk,
                "gone",
                priority::NORMAL,
            ))
            .await
            .unwrap();

        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(report.parked, 1);
        assert!(h.http.requests_to(PUSH_PATH).is_empty());
    }

    #[tokio::test]
    async fn test_pull_pages_advance_cursor() {
        let pages = Arc::new(AtomicUsize::new(0));
        let counter = pages.clone();
        let h = harness(move |path, body| {
            assert_eq!(path, PULL_PATH);
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    assert!(body.get("lastSyncTimestamp").is_none());
                    Ok(json!({
                        "items": [{ "id": "r1", "type": "session", "data": {"v": 1}, "updatedAt": 100 }],
                        "hasMore": true,
                        "nextTimestamp": 100
                    }))
                }
                _ => {
                    assert_eq!(body["lastSyncTimestamp"], 100);
                    Ok(json!({
                        "success": true,
                        "data": {
                            "items": [{ "id": "r2", "type": "session", "data": {"v": 2}, "updatedAt": 150 }],
                            "hasMore": false
                        }
                    }))
                }
            }
        });

        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!((report.pull_pages, report.pulled), (2, 2));
        assert_eq!(h.store.cursor().await.unwrap(), Some(150));
        assert!(h.store.remote_item("r2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_cursor() {
        let h = harness(|_, _| Err(TransportError::Timeout));

        let SyncOutcome::Completed(report) = h.sync.start_sync().await.unwrap() else {
            panic!("expected completed run");
        };
        assert!(report.pull_error.is_some());
        assert_eq!(h.store.cursor().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_start_reports_already_running() {
        let h = harness(|_, _| Ok(empty_pull()));
        h.sync.inner.running.store(true, Ordering::SeqCst);
        assert_eq!(
            h.sync.start_sync().await.unwrap(),
            SyncOutcome::AlreadyRunning
        );
    }

    #[tokio::test]
    async fn test_reconnect_triggers_sync_only_when_allowed() {
        let h = harness(|_, _| Ok(empty_pull()));
        h.device.set_network(NetworkState::offline());

        assert!(!h.sync.on_network_change(NetworkState::offline()));
        h.sync.configure(SyncOptions {
            prefer_unmetered: true,
            ..h.sync.options()
        });
        assert!(!h.sync.on_network_change(NetworkState::cellular()));

        h.sync.on_network_change(NetworkState::offline());
        assert!(h.sync.on_network_change(NetworkState::wifi()));
        // already online: no new trigger
        assert!(!h.sync.on_network_change(NetworkState::wifi()));
    }

    #[tokio::test]
    async fn test_interrupted_entries_are_recovered() {
        let h = harness(|path, body| match path {
            PUSH_PATH => Ok(ok_push(body)),
            _ => Ok(empty_pull()),
        });
        let chunk_id = seal_chunk(&h, "s1").await;
        let entry = h.store.entries(None).await.unwrap().remove(0);
        h.store.mark_in_progress(entry.id, 0).await.unwrap();

        h.sync.start_sync().await.unwrap();
        assert!(h.store.chunk(&chunk_id).await.unwrap().unwrap().synced);
    }
}
