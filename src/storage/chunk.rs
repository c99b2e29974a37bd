//! Chunked sample persistence.
//!
//! Samples are grouped per `(session, sensor, window)` into active chunks held
//! in memory. A chunk is sealed when its window has elapsed or it reaches the
//! sample cap: the samples are written atomically as a JSON lines file, then
//! the chunk row and its sync queue entry are committed together.
//!
//! Every mutation goes through a single actor task, so writes for one stream
//! reach disk in arrival order and two seals never race on the same chunk.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::pipeline::sink::{BatchSink, SinkError};
use crate::sensor::types::{Sample, SensorKind};
use crate::storage::error::ChunkError;
use crate::storage::jsonl;
use crate::storage::models::{priority, ChunkMeta, EntityType, NewSyncEntry};
use crate::storage::store::MetadataStore;
use crate::storage::window::{group_by_window, window_start, ActiveChunk, ChunkKey};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Directory holding chunk files
    pub dir: PathBuf,
    /// Window length
    pub chunk_duration: Duration,
    /// Seal a chunk early once it holds this many samples
    pub max_samples_per_chunk: usize,
    /// How often elapsed windows are swept; `None` disables the ticker
    pub sweep_interval: Option<Duration>,
    /// Priority of the queue entry created for each sealed chunk
    pub sync_priority: i32,
    pub max_retries: u32,
    /// Command channel depth
    pub channel_capacity: usize,
}

impl ChunkConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            chunk_duration: Duration::from_secs(60),
            max_samples_per_chunk: 12_000,
            sweep_interval: Some(Duration::from_secs(5)),
            sync_priority: priority::NORMAL,
            max_retries: 3,
            channel_capacity: 256,
        }
    }

    fn duration_ms(&self) -> i64 {
        (self.chunk_duration.as_millis() as i64).max(1)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome for one window touched by a write.
#[derive(Debug)]
pub enum WriteResult {
    /// Samples were appended to an active chunk.
    Buffered { key: ChunkKey, count: usize },
    /// A chunk was sealed and queued for sync.
    Sealed(ChunkMeta),
    /// Sealing failed; the samples stay in the active chunk.
    Failed { key: ChunkKey, error: ChunkError },
}

impl WriteResult {
    pub fn sealed(&self) -> Option<&ChunkMeta> {
        match self {
            WriteResult::Sealed(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, WriteResult::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStats {
    pub active_chunks: usize,
    pub buffered_samples: usize,
    pub chunks_sealed: u64,
    pub samples_persisted: u64,
    pub bytes_written: u64,
    pub failed_seals: u64,
    pub chunks_deleted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub chunks: usize,
    pub bytes: u64,
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Write {
        session_id: String,
        sensor_kind: SensorKind,
        samples: Vec<Sample>,
        reply: oneshot::Sender<Vec<WriteResult>>,
    },
    FlushChunk {
        key: ChunkKey,
        reply: oneshot::Sender<Result<Option<ChunkMeta>, ChunkError>>,
    },
    FlushAll {
        reply: oneshot::Sender<Vec<WriteResult>>,
    },
    FlushSession {
        session_id: String,
        reply: oneshot::Sender<Vec<WriteResult>>,
    },
    Sweep {
        reply: Option<oneshot::Sender<Vec<WriteResult>>>,
    },
    Delete {
        chunk_id: String,
        reply: oneshot::Sender<Result<(), ChunkError>>,
    },
    Purge {
        cutoff: i64,
        reply: oneshot::Sender<Result<PurgeReport, ChunkError>>,
    },
    Stats {
        reply: oneshot::Sender<PersistenceStats>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<WriteResult>>,
    },
}

// ============================================================================
// Handle
// ============================================================================

struct PersistenceInner {
    tx: mpsc::Sender<Command>,
    store: MetadataStore,
    dir: PathBuf,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PersistenceInner {
    fn drop(&mut self) {
        let mut sweeper = match self.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}

/// Cheap-clone handle to the chunk writer.
#[derive(Clone)]
pub struct ChunkPersistence {
    inner: Arc<PersistenceInner>,
}

impl ChunkPersistence {
    /// Create the chunk directory, remove leftover temp files from an
    /// interrupted seal and start the writer. Must run inside a tokio runtime.
    pub fn open(
        config: ChunkConfig,
        store: MetadataStore,
        clock: SharedClock,
    ) -> Result<Self, ChunkError> {
        std::fs::create_dir_all(&config.dir).map_err(|e| ChunkError::file(&config.dir, e))?;
        remove_stale_temp_files(&config.dir);

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let dir = config.dir.clone();
        let sweep_interval = config.sweep_interval;

        let actor = ChunkActor {
            config,
            store: store.clone(),
            clock,
            active: HashMap::new(),
            seqs: HashMap::new(),
            stats: PersistenceStats::default(),
        };
        tokio::spawn(actor.run(rx));

        let sweeper = sweep_interval.map(|interval| spawn_sweeper(tx.clone(), interval));

        tracing::info!(dir = %dir.display(), "chunk persistence started");
        Ok(Self {
            inner: Arc::new(PersistenceInner {
                tx,
                store,
                dir,
                sweeper: Mutex::new(sweeper),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn store(&self) -> &MetadataStore {
        &self.inner.store
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChunkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ChunkError::WriterClosed)?;
        reply_rx.await.map_err(|_| ChunkError::WriterClosed)
    }

    /// Append samples of one sensor to their window chunks, sealing any that
    /// fill up or whose window has passed.
    pub async fn write_samples(
        &self,
        session_id: &str,
        sensor_kind: SensorKind,
        samples: Vec<Sample>,
    ) -> Result<Vec<WriteResult>, ChunkError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let session_id = session_id.to_string();
        self.request(|reply| Command::Write {
            session_id,
            sensor_kind,
            samples,
            reply,
        })
        .await
    }

    /// Seal one chunk now. `Ok(None)` if it had nothing buffered.
    pub async fn flush_chunk(&self, key: ChunkKey) -> Result<Option<ChunkMeta>, ChunkError> {
        self.request(|reply| Command::FlushChunk { key, reply })
            .await?
    }

    pub async fn flush_all(&self) -> Result<Vec<WriteResult>, ChunkError> {
        self.request(|reply| Command::FlushAll { reply }).await
    }

    /// Seal every active chunk of a session. Waits for writes queued before it.
    pub async fn flush_session(&self, session_id: &str) -> Result<Vec<WriteResult>, ChunkError> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::FlushSession { session_id, reply })
            .await
    }

    /// Seal chunks whose window has elapsed.
    pub async fn sweep(&self) -> Result<Vec<WriteResult>, ChunkError> {
        self.request(|reply| Command::Sweep { reply: Some(reply) })
            .await
    }

    pub async fn chunks_for_session(&self, session_id: &str) -> Result<Vec<ChunkMeta>, ChunkError> {
        Ok(self.inner.store.chunks_for_session(session_id).await?)
    }

    pub async fn read_chunk_file(&self, chunk_id: &str) -> Result<Vec<Sample>, ChunkError> {
        let meta = self
            .inner
            .store
            .chunk(chunk_id)
            .await?
            .ok_or_else(|| ChunkError::NotFound(chunk_id.to_string()))?;
        jsonl::read(&meta.file_path).await
    }

    /// Remove a sealed chunk's file, row and queue entries.
    pub async fn delete_chunk(&self, chunk_id: &str) -> Result<(), ChunkError> {
        let chunk_id = chunk_id.to_string();
        self.request(|reply| Command::Delete { chunk_id, reply })
            .await?
    }

    /// Delete synced chunks created before `cutoff`.
    pub async fn purge_synced(&self, cutoff: i64) -> Result<PurgeReport, ChunkError> {
        self.request(|reply| Command::Purge { cutoff, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<PersistenceStats, ChunkError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the sweeper, seal everything still active and stop the writer.
    pub async fn shutdown(&self) -> Result<Vec<WriteResult>, ChunkError> {
        {
            let mut sweeper = match self.inner.sweeper.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Samples reaching persistence must carry their session id; they are routed
/// to chunks by session and sensor, keeping arrival order within each sensor.
#[async_trait]
impl BatchSink for ChunkPersistence {
    async fn write(&self, samples: Vec<Sample>) -> Result<(), SinkError> {
        let mut groups: BTreeMap<(String, SensorKind), Vec<Sample>> = BTreeMap::new();
        for sample in samples {
            let Some(session_id) = sample.session_id.clone() else {
                return Err(SinkError::Rejected(format!(
                    "{} sample at {} has no session",
                    sample.sensor_kind, sample.timestamp
                )));
            };
            groups
                .entry((session_id, sample.sensor_kind))
                .or_default()
                .push(sample);
        }

        for ((session_id, kind), samples) in groups {
            let results = self
                .write_samples(&session_id, kind, samples)
                .await
                .map_err(|err| match err {
                    ChunkError::WriterClosed => SinkError::Closed,
                    other => SinkError::Transient(other.to_string()),
                })?;
            for result in results {
                if let WriteResult::Failed { key, error } = result {
                    // samples stay in the active chunk; the next seal retries
                    tracing::warn!(chunk = %key, "chunk seal failed: {error}");
                }
            }
        }
        Ok(())
    }
}

fn spawn_sweeper(tx: mpsc::Sender<Command>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(Command::Sweep { reply: None }).await.is_err() {
                break;
            }
        }
    })
}

fn remove_stale_temp_files(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), "failed to scan chunk directory: {err}");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("temp_") && name.ends_with(jsonl::EXTENSION) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => tracing::info!(file = %name, "removed interrupted chunk file"),
                Err(err) => tracing::warn!(file = %name, "failed to remove temp file: {err}"),
            }
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct ChunkActor {
    config: ChunkConfig,
    store: MetadataStore,
    clock: SharedClock,
    active: HashMap<ChunkKey, ActiveChunk>,
    /// Next seal number per key
    seqs: HashMap<ChunkKey, u32>,
    stats: PersistenceStats,
}

impl ChunkActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::debug!("chunk writer started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Write {
                    session_id,
                    sensor_kind,
                    samples,
                    reply,
                } => {
                    let results = self.write(session_id, sensor_kind, samples).await;
                    let _ = reply.send(results);
                }
                Command::FlushChunk { key, reply } => {
                    let _ = reply.send(self.seal(&key).await);
                }
                Command::FlushAll { reply } => {
                    let results = self.seal_where(|_| true).await;
                    let _ = reply.send(results);
                }
                Command::FlushSession { session_id, reply } => {
                    let results = self.seal_where(|key| key.session_id == session_id).await;
                    let _ = reply.send(results);
                }
                Command::Sweep { reply } => {
                    let now = self.clock.now_ms();
                    let elapsed: Vec<ChunkKey> = self
                        .active
                        .values()
                        .filter(|chunk| chunk.has_elapsed(now))
                        .map(|chunk| chunk.key.clone())
                        .collect();
                    let results = self.seal_keys(elapsed).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(results);
                    }
                }
                Command::Delete { chunk_id, reply } => {
                    let _ = reply.send(self.delete(&chunk_id).await);
                }
                Command::Purge { cutoff, reply } => {
                    let _ = reply.send(self.purge(cutoff).await);
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown { reply } => {
                    let results = self.seal_where(|_| true).await;
                    let _ = reply.send(results);
                    break;
                }
            }
        }

        if !self.active.is_empty() {
            let results = self.seal_where(|_| true).await;
            let failed = results.iter().filter(|r| r.is_failure()).count();
            if failed > 0 {
                tracing::error!(failed, "chunks left unsealed at writer exit");
            }
        }
        tracing::debug!("chunk writer stopped");
    }

    async fn write(
        &mut self,
        session_id: String,
        sensor_kind: SensorKind,
        samples: Vec<Sample>,
    ) -> Vec<WriteResult> {
        let duration_ms = self.config.duration_ms();
        let cap = self.config.max_samples_per_chunk.max(1);
        let mut results = Vec::new();

        for (window, mut group) in group_by_window(samples, duration_ms) {
            let key = ChunkKey::new(session_id.clone(), sensor_kind, window);

            while !group.is_empty() {
                let now = self.clock.now_ms();
                let chunk = self
                    .active
                    .entry(key.clone())
                    .or_insert_with(|| ActiveChunk::new(key.clone(), duration_ms, now));

                let room = cap.saturating_sub(chunk.sample_count());
                let take = room.min(group.len());
                let rest = group.split_off(take);
                let count = group.len();
                chunk.append(std::mem::replace(&mut group, rest), now);

                if chunk.sample_count() < cap {
                    results.push(WriteResult::Buffered {
                        key: key.clone(),
                        count,
                    });
                    continue;
                }

                match self.seal(&key).await {
                    Ok(Some(meta)) => results.push(WriteResult::Sealed(meta)),
                    Ok(None) => {}
                    Err(error) => {
                        // keep the overflow with the unsealed chunk rather than lose it
                        let leftover = std::mem::take(&mut group);
                        if let Some(chunk) = self.active.get_mut(&key) {
                            chunk.append(leftover, now);
                        }
                        results.push(WriteResult::Failed {
                            key: key.clone(),
                            error,
                        });
                    }
                }
            }
        }

        // older windows of this stream are done once the clock has moved past them
        let now = self.clock.now_ms();
        let current = window_start(now, duration_ms);
        let finished: Vec<ChunkKey> = self
            .active
            .values()
            .filter(|chunk| {
                chunk.key.session_id == session_id
                    && chunk.key.sensor_kind == sensor_kind
                    && chunk.key.window_start < current
                    && chunk.has_elapsed(now)
            })
            .map(|chunk| chunk.key.clone())
            .collect();
        results.extend(self.seal_keys(finished).await);

        results
    }

    async fn seal_where(&mut self, filter: impl Fn(&ChunkKey) -> bool) -> Vec<WriteResult> {
        let keys: Vec<ChunkKey> = self.active.keys().filter(|k| filter(k)).cloned().collect();
        self.seal_keys(keys).await
    }

    async fn seal_keys(&mut self, mut keys: Vec<ChunkKey>) -> Vec<WriteResult> {
        keys.sort();
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            match self.seal(&key).await {
                Ok(Some(meta)) => results.push(WriteResult::Sealed(meta)),
                Ok(None) => {}
                Err(error) => results.push(WriteResult::Failed { key, error }),
            }
        }
        results
    }

    /// Seal one active chunk. On failure nothing is left on disk or in the
    /// store and the chunk stays active.
    async fn seal(&mut self, key: &ChunkKey) -> Result<Option<ChunkMeta>, ChunkError> {
        let Some(chunk) = self.active.get(key) else {
            return Ok(None);
        };
        if chunk.is_empty() {
            self.active.remove(key);
            return Ok(None);
        }

        let result = self.persist(key).await;
        match &result {
            Ok(meta) => {
                self.active.remove(key);
                self.stats.chunks_sealed += 1;
                self.stats.samples_persisted += meta.sample_count;
                self.stats.bytes_written += meta.file_size_bytes;
                tracing::debug!(
                    chunk_id = %meta.chunk_id,
                    samples = meta.sample_count,
                    bytes = meta.file_size_bytes,
                    "chunk sealed"
                );
            }
            Err(err) => {
                self.stats.failed_seals += 1;
                tracing::error!(chunk = %key, "failed to seal chunk: {err}");
            }
        }
        result.map(Some)
    }

    async fn persist(&mut self, key: &ChunkKey) -> Result<ChunkMeta, ChunkError> {
        let chunk = self
            .active
            .get(key)
            .ok_or_else(|| ChunkError::NotFound(key.to_string()))?;
        let (start_time, end_time) = chunk
            .time_range()
            .ok_or_else(|| ChunkError::NotFound(key.to_string()))?;
        let sample_count = chunk.sample_count() as u64;
        let bytes = jsonl::encode(&chunk.samples)?;

        let mut seq = self.seqs.get(key).copied().unwrap_or(0);
        while jsonl::chunk_path(&self.config.dir, &key.chunk_id(seq)).exists() {
            seq += 1;
        }
        let chunk_id = key.chunk_id(seq);

        let (file_path, file_size_bytes) =
            jsonl::write_atomic(&self.config.dir, &chunk_id, &bytes).await?;

        let now = self.clock.now_ms();
        let meta = ChunkMeta {
            chunk_id: chunk_id.clone(),
            session_id: key.session_id.clone(),
            sensor_kind: key.sensor_kind,
            start_time,
            end_time,
            sample_count,
            file_path: file_path.clone(),
            file_size_bytes,
            synced: false,
            created_at: now,
        };
        let entry = NewSyncEntry::upload(
            EntityType::SensorDataChunk,
            chunk_id,
            self.config.sync_priority,
        )
        .with_max_retries(self.config.max_retries);

        if let Err(err) = self.store.commit_chunk(meta.clone(), entry, now).await {
            jsonl::remove_if_present(&file_path).await;
            return Err(err.into());
        }

        self.seqs.insert(key.clone(), seq + 1);
        Ok(meta)
    }

    async fn delete(&mut self, chunk_id: &str) -> Result<(), ChunkError> {
        let meta = self
            .store
            .chunk(chunk_id)
            .await?
            .ok_or_else(|| ChunkError::NotFound(chunk_id.to_string()))?;
        self.remove_sealed(&meta).await?;
        Ok(())
    }

    async fn purge(&mut self, cutoff: i64) -> Result<PurgeReport, ChunkError> {
        let mut report = PurgeReport::default();
        for meta in self.store.synced_chunks_before(cutoff).await? {
            self.remove_sealed(&meta).await?;
            report.chunks += 1;
            report.bytes += meta.file_size_bytes;
        }
        if report.chunks > 0 {
            tracing::info!(chunks = report.chunks, bytes = report.bytes, "purged synced chunks");
        }
        Ok(report)
    }

    async fn remove_sealed(&mut self, meta: &ChunkMeta) -> Result<(), ChunkError> {
        match tokio::fs::remove_file(&meta.file_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(chunk_id = %meta.chunk_id, "chunk file already missing");
            }
            Err(err) => return Err(ChunkError::file(&meta.file_path, err)),
        }
        self.store.delete_chunk(&meta.chunk_id).await?;
        self.stats.chunks_deleted += 1;
        Ok(())
    }

    fn snapshot(&self) -> PersistenceStats {
        PersistenceStats {
            active_chunks: self.active.len(),
            buffered_samples: self.active.values().map(ActiveChunk::sample_count).sum(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::models::SyncStatus;

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        store: MetadataStore,
        persistence: ChunkPersistence,
    }

    fn harness(cap: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = MetadataStore::open_in_memory().unwrap();
        let mut config = ChunkConfig::new(dir.path().join("chunks"));
        config.max_samples_per_chunk = cap;
        config.sweep_interval = None;
        let persistence = ChunkPersistence::open(config, store.clone(), clock.clone()).unwrap();
        Harness {
            _dir: dir,
            clock,
            store,
            persistence,
        }
    }

    fn accel(ts: i64) -> Sample {
        Sample::axis(SensorKind::Accelerometer, ts, 0.0, 0.0, 9.8).in_session("s1", 0)
    }

    #[tokio::test]
    async fn test_samples_land_in_their_window() {
        let h = harness(1_000);
        h.persistence
            .write_samples(
                "s1",
                SensorKind::Accelerometer,
                vec![accel(1_000), accel(59_999), accel(60_000)],
            )
            .await
            .unwrap();

        let sealed: Vec<ChunkMeta> = h
            .persistence
            .flush_session("s1")
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.sealed().cloned())
            .collect();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].chunk_id, "s1_accelerometer_0_0");
        assert_eq!(sealed[0].sample_count, 2);
        assert_eq!((sealed[0].start_time, sealed[0].end_time), (1_000, 59_999));
        assert_eq!(sealed[1].chunk_id, "s1_accelerometer_60000_0");

        let read = h.persistence.read_chunk_file(&sealed[0].chunk_id).await.unwrap();
        assert_eq!(read, vec![accel(1_000), accel(59_999)]);

        let entries = h.store.entries(Some(SyncStatus::Pending)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.entity_type == EntityType::SensorDataChunk));
    }

    #[tokio::test]
    async fn test_concurrent_seals_of_one_window_write_once() {
        let h = harness(1_000);
        h.persistence
            .write_samples("s1", SensorKind::Accelerometer, vec![accel(1_000), accel(2_000)])
            .await
            .unwrap();

        let key = ChunkKey::new("s1", SensorKind::Accelerometer, 0);
        let (first, second) = tokio::join!(
            h.persistence.flush_chunk(key.clone()),
            h.persistence.flush_chunk(key)
        );
        let sealed = [first.unwrap(), second.unwrap()];
        assert_eq!(sealed.iter().filter(|m| m.is_some()).count(), 1);

        let files = std::fs::read_dir(h.persistence.dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .count();
        assert_eq!(files, 1);
        let rows = h.persistence.chunks_for_session("s1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_count, 2);
    }

    #[tokio::test]
    async fn test_cap_seals_early_with_new_seq() {
        let h = harness(2);
        let results = h
            .persistence
            .write_samples(
                "s1",
                SensorKind::Accelerometer,
                vec![accel(1), accel(2), accel(3)],
            )
            .await
            .unwrap();
        let sealed: Vec<&ChunkMeta> = results.iter().filter_map(WriteResult::sealed).collect();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].sample_count, 2);

        let stats = h.persistence.stats().await.unwrap();
        assert_eq!(stats.active_chunks, 1);
        assert_eq!(stats.buffered_samples, 1);

        let rest = h.persistence.flush_all().await.unwrap();
        assert_eq!(rest[0].sealed().unwrap().chunk_id, "s1_accelerometer_0_1");
    }

    #[tokio::test]
    async fn test_sweep_seals_elapsed_windows() {
        let h = harness(1_000);
        h.persistence
            .write_samples("s1", SensorKind::Accelerometer, vec![accel(10)])
            .await
            .unwrap();

        h.clock.set(30_000);
        assert!(h.persistence.sweep().await.unwrap().is_empty());

        h.clock.set(60_000);
        let results = h.persistence.sweep().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].sealed().is_some());
        assert_eq!(h.persistence.stats().await.unwrap().active_chunks, 0);
    }

    #[tokio::test]
    async fn test_failed_seal_keeps_chunk_active() {
        let h = harness(1_000);
        h.persistence
            .write_samples("s1", SensorKind::Accelerometer, vec![accel(10)])
            .await
            .unwrap();

        // a chunk row with the same id makes the metadata commit fail
        h.store
            .commit_chunk(
                ChunkMeta {
                    chunk_id: "s1_accelerometer_0_0".into(),
                    session_id: "s1".into(),
                    sensor_kind: SensorKind::Accelerometer,
                    start_time: 0,
                    end_time: 0,
                    sample_count: 0,
                    file_path: PathBuf::from("/nonexistent"),
                    file_size_bytes: 0,
                    synced: false,
                    created_at: 0,
                },
                NewSyncEntry::upload(EntityType::SensorDataChunk, "other", priority::LOW),
                0,
            )
            .await
            .unwrap();

        let results = h.persistence.flush_all().await.unwrap();
        assert!(results[0].is_failure());
        assert!(!jsonl::chunk_path(h.persistence.dir(), "s1_accelerometer_0_0").exists());
        assert!(!jsonl::temp_path(h.persistence.dir(), "s1_accelerometer_0_0").exists());

        let stats = h.persistence.stats().await.unwrap();
        assert_eq!(stats.active_chunks, 1);
        assert_eq!(stats.failed_seals, 1);

        h.store.delete_chunk("s1_accelerometer_0_0").await.unwrap();
        let retried = h.persistence.flush_all().await.unwrap();
        assert_eq!(retried[0].sealed().unwrap().sample_count, 1);
    }

    #[tokio::test]
    async fn test_purge_removes_only_synced() {
        let h = harness(1_000);
        h.persistence
            .write_samples("s1", SensorKind::Accelerometer, vec![accel(10), accel(70_000)])
            .await
            .unwrap();
        let sealed: Vec<ChunkMeta> = h
            .persistence
            .flush_all()
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.sealed().cloned())
            .collect();

        let entry = h
            .store
            .entries(None)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.entity_id == sealed[0].chunk_id)
            .unwrap();
        h.store.complete_entry(&entry).await.unwrap();

        let report = h.persistence.purge_synced(i64::MAX).await.unwrap();
        assert_eq!(report.chunks, 1);
        assert!(!sealed[0].file_path.exists());
        assert!(sealed[1].file_path.exists());
        assert_eq!(h.persistence.chunks_for_session("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_rejects_unassigned_samples() {
        let h = harness(1_000);
        let loose = Sample::axis(SensorKind::Gyroscope, 1, 0.0, 0.0, 0.0);
        let result = h.persistence.write(vec![loose]).await;
        assert!(matches!(result, Err(SinkError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_shutdown_seals_and_closes() {
        let h = harness(1_000);
        h.persistence
            .write_samples("s1", SensorKind::Accelerometer, vec![accel(10)])
            .await
            .unwrap();
        let results = h.persistence.shutdown().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            h.persistence.stats().await,
            Err(ChunkError::WriterClosed)
        ));
    }
}
