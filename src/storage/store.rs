//! SQLite metadata store.
//!
//! One worker thread owns the connection and runs boxed tasks from an mpsc
//! channel in arrival order; callers await the result on a oneshot. Every
//! write therefore happens on a single connection, one task at a time.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::oneshot;

use crate::recording::state::RecordingState;
use crate::storage::error::StoreError;
use crate::storage::migrations::run_migrations;
use crate::storage::models::{
    ChunkMeta, EntityType, NewSyncEntry, QueueCounts, RemoteItem, SessionRecord, SyncQueueEntry,
    SyncStatus,
};

const CURSOR_KEY: &str = "pull_cursor";
const LAST_SYNC_KEY: &str = "last_sync_at";

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                tracing::error!("failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                tracing::error!("failed to join store thread: {join_err:?}");
            }
        }
    }
}

#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<StoreInner>,
    path: Option<Arc<PathBuf>>,
}

impl MetadataStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::spawn(Some(path.clone()))?;
        tracing::info!(path = %path.display(), "metadata store opened");
        Ok(store)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::spawn(None)
    }

    fn spawn(path: Option<PathBuf>) -> Result<Self, StoreError> {
        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StoreError>>();
        let path_for_thread = path.clone();

        let worker = thread::Builder::new()
            .name("sensor-pipeline-db".into())
            .spawn(move || {
                let opened = match &path_for_thread {
                    Some(path) => Connection::open(path),
                    None => Connection::open_in_memory(),
                };
                let mut conn = match opened {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.into()));
                        return;
                    }
                };

                if path_for_thread.is_some() {
                    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                        tracing::error!("failed to enable WAL mode: {err}");
                    }
                }

                if ready_tx.send(run_migrations(&mut conn)).is_err() {
                    tracing::error!("store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }
                tracing::debug!("store thread shutting down");
            })?;

        ready_rx.recv().map_err(|_| StoreError::WorkerGone)??;

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            path: path.map(Arc::new),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Run `task` on the store thread.
    pub async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                tracing::warn!("store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|_| StoreError::ChannelSend)?;
        reply_rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Record a sealed chunk and queue it for upload in one transaction.
    /// Returns the sync queue entry id.
    pub async fn commit_chunk(
        &self,
        meta: ChunkMeta,
        entry: NewSyncEntry,
        now: i64,
    ) -> Result<i64, StoreError> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chunks (chunk_id, session_id, sensor_kind, start_time, end_time,
                     sample_count, file_path, file_size_bytes, synced, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    meta.chunk_id,
                    meta.session_id,
                    meta.sensor_kind.as_str(),
                    meta.start_time,
                    meta.end_time,
                    to_i64(meta.sample_count)?,
                    meta.file_path.to_string_lossy(),
                    to_i64(meta.file_size_bytes)?,
                    meta.synced,
                    meta.created_at,
                ],
            )?;
            let entry_id = upsert_entry(&tx, &entry, now)?;
            tx.execute(
                "UPDATE recording_sessions
                 SET chunk_count = chunk_count + 1, sample_count = sample_count + ?2, updated_at = ?3
                 WHERE session_id = ?1",
                params![meta.session_id, to_i64(meta.sample_count)?, now],
            )?;
            tx.commit()?;
            Ok(entry_id)
        })
        .await
    }

    pub async fn chunk(&self, chunk_id: &str) -> Result<Option<ChunkMeta>, StoreError> {
        let chunk_id = chunk_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?1");
            Ok(conn
                .query_row(&sql, params![chunk_id], chunk_from_row)
                .optional()?)
        })
        .await
    }

    pub async fn chunks_for_session(&self, session_id: &str) -> Result<Vec<ChunkMeta>, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE session_id = ?1
                 ORDER BY start_time ASC, chunk_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![session_id], chunk_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Synced chunks created before `cutoff`, oldest first.
    pub async fn synced_chunks_before(&self, cutoff: i64) -> Result<Vec<ChunkMeta>, StoreError> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE synced = 1 AND created_at < ?1
                 ORDER BY created_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff], chunk_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Remove a chunk row and any queue entries pointing at it.
    pub async fn delete_chunk(&self, chunk_id: &str) -> Result<bool, StoreError> {
        let chunk_id = chunk_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2",
                params![EntityType::SensorDataChunk.as_str(), chunk_id],
            )?;
            let removed = tx.execute("DELETE FROM chunks WHERE chunk_id = ?1", params![chunk_id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    /// `(chunks, unsynced chunks, total bytes)`.
    pub async fn chunk_totals(&self) -> Result<(u64, u64, u64), StoreError> {
        self.execute(|conn| {
            let (count, unsynced, bytes): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(synced = 0), 0), COALESCE(SUM(file_size_bytes), 0)
                 FROM chunks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok((count.max(0) as u64, unsynced.max(0) as u64, bytes.max(0) as u64))
        })
        .await
    }

    // ========================================================================
    // Sync queue
    // ========================================================================

    /// Add an entry, or raise the priority of the existing one for the same
    /// entity and action. Returns the entry id.
    pub async fn enqueue(&self, entry: NewSyncEntry, now: i64) -> Result<i64, StoreError> {
        self.execute(move |conn| Ok(upsert_entry(conn, &entry, now)?))
            .await
    }

    /// Entries automatic sync may process at `now`, highest priority first.
    pub async fn eligible_entries(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<SyncQueueEntry>, StoreError> {
        let limit = to_i64(limit as u64)?;
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue
                 WHERE status = 'pending'
                    OR (status = 'failed' AND retry_count < max_retries
                        AND (next_retry_at IS NULL OR next_retry_at <= ?1))
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![now, limit], entry_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn entry(&self, id: i64) -> Result<Option<SyncQueueEntry>, StoreError> {
        self.execute(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], entry_from_row).optional()?)
        })
        .await
    }

    /// All entries, optionally filtered by status, highest priority first.
    pub async fn entries(
        &self,
        status: Option<SyncStatus>,
    ) -> Result<Vec<SyncQueueEntry>, StoreError> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY priority DESC, created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status.map(|s| s.as_str())], entry_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn mark_in_progress(&self, id: i64, now: i64) -> Result<(), StoreError> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sync_queue SET status = 'in_progress', last_attempt = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Finish an entry: flag its chunk as synced and drop it from the queue.
    pub async fn complete_entry(&self, entry: &SyncQueueEntry) -> Result<(), StoreError> {
        let id = entry.id;
        let entity_type = entry.entity_type;
        let entity_id = entry.entity_id.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            if entity_type == EntityType::SensorDataChunk {
                tx.execute(
                    "UPDATE chunks SET synced = 1 WHERE chunk_id = ?1",
                    params![entity_id],
                )?;
            }
            tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Record a failed attempt. A parked entry has its retry budget used up
    /// so automatic sync skips it.
    pub async fn fail_entry(
        &self,
        id: i64,
        error: String,
        now: i64,
        next_retry_at: Option<i64>,
        park: bool,
    ) -> Result<(), StoreError> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sync_queue SET
                     status = 'failed',
                     retry_count = CASE WHEN ?5 THEN MAX(retry_count + 1, max_retries)
                                        ELSE retry_count + 1 END,
                     error_message = ?2,
                     last_attempt = ?3,
                     next_retry_at = ?4
                 WHERE id = ?1",
                params![id, error, now, next_retry_at, park],
            )?;
            Ok(())
        })
        .await
    }

    /// Reset every failed entry, parked ones included, to pending.
    pub async fn retry_failed(&self) -> Result<usize, StoreError> {
        self.execute(|conn| {
            Ok(conn.execute(
                "UPDATE sync_queue SET status = 'pending', retry_count = 0,
                     next_retry_at = NULL, error_message = NULL
                 WHERE status = 'failed'",
                [],
            )?)
        })
        .await
    }

    /// Put entries left in progress by an interrupted run back to pending.
    pub async fn recover_in_progress(&self) -> Result<usize, StoreError> {
        self.execute(|conn| {
            Ok(conn.execute(
                "UPDATE sync_queue SET status = 'pending' WHERE status = 'in_progress'",
                [],
            )?)
        })
        .await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, StoreError> {
        self.execute(|conn| {
            let mut counts = QueueCounts::default();
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(retry_count >= max_retries), 0)
                 FROM sync_queue GROUP BY status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (status, count, exhausted) = row?;
                let count = count.max(0) as u64;
                match SyncStatus::from_str(&status).map_err(StoreError::InvalidData)? {
                    SyncStatus::Pending => counts.pending = count,
                    SyncStatus::InProgress => counts.in_progress = count,
                    SyncStatus::Completed => counts.completed = count,
                    SyncStatus::Failed => {
                        counts.failed = count;
                        counts.parked = exhausted.max(0) as u64;
                    }
                }
            }
            Ok(counts)
        })
        .await
    }

    // ========================================================================
    // Recording sessions
    // ========================================================================

    pub async fn insert_session(&self, record: SessionRecord, now: i64) -> Result<(), StoreError> {
        self.execute(move |conn| {
            let sensors = serde_json::to_string(&record.enabled_sensors)?;
            conn.execute(
                "INSERT INTO recording_sessions (session_id, mode, state, start_timestamp,
                     end_timestamp, enabled_sensors, sample_count, chunk_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    record.session_id,
                    record.mode.as_str(),
                    record.state.as_str(),
                    record.start_timestamp,
                    record.end_timestamp,
                    sensors,
                    to_i64(record.sample_count)?,
                    to_i64(record.chunk_count)?,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_session_state(
        &self,
        session_id: &str,
        state: RecordingState,
        end_timestamp: Option<i64>,
        now: i64,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let updated = conn.execute(
                "UPDATE recording_sessions
                 SET state = ?2, end_timestamp = COALESCE(?3, end_timestamp), updated_at = ?4
                 WHERE session_id = ?1",
                params![session_id, state.as_str(), end_timestamp, now],
            )?;
            if updated == 0 {
                return Err(StoreError::InvalidData(format!(
                    "recording session '{session_id}' does not exist"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Replace the sensor list once the orchestrator knows which started.
    pub async fn update_session_sensors(
        &self,
        session_id: &str,
        sensors: Vec<crate::sensor::types::SensorKind>,
        now: i64,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sensors = serde_json::to_string(&sensors)?;
            conn.execute(
                "UPDATE recording_sessions SET enabled_sensors = ?2, updated_at = ?3
                 WHERE session_id = ?1",
                params![session_id, sensors, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM recording_sessions WHERE session_id = ?1");
            Ok(conn
                .query_row(&sql, params![session_id], session_from_row)
                .optional()?)
        })
        .await
    }

    /// Most recent sessions first.
    pub async fn sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
        let limit = to_i64(limit as u64)?;
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM recording_sessions
                 ORDER BY start_timestamp DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit], session_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    // ========================================================================
    // Pull state
    // ========================================================================

    pub async fn cursor(&self) -> Result<Option<i64>, StoreError> {
        self.state_value(CURSOR_KEY).await
    }

    pub async fn last_sync_at(&self) -> Result<Option<i64>, StoreError> {
        self.state_value(LAST_SYNC_KEY).await
    }

    pub async fn set_last_sync_at(&self, at: i64) -> Result<(), StoreError> {
        self.execute(move |conn| {
            set_state(conn, LAST_SYNC_KEY, at)?;
            Ok(())
        })
        .await
    }

    /// Apply one pulled page with last-write-wins on `updated_at`, then move
    /// the cursor, in a single transaction. Returns how many items changed.
    pub async fn apply_pull_page(
        &self,
        items: Vec<RemoteItem>,
        next_cursor: Option<i64>,
    ) -> Result<usize, StoreError> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut applied = 0;
            for item in &items {
                applied += tx.execute(
                    "INSERT INTO remote_items (id, item_type, data, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                         item_type = excluded.item_type,
                         data = excluded.data,
                         updated_at = excluded.updated_at
                     WHERE excluded.updated_at > remote_items.updated_at",
                    params![
                        item.id,
                        item.item_type,
                        serde_json::to_string(&item.data)?,
                        item.updated_at
                    ],
                )?;
            }
            if let Some(cursor) = next_cursor {
                // never move backwards
                let current = get_state(&tx, CURSOR_KEY)?;
                if current.map_or(true, |c| cursor > c) {
                    set_state(&tx, CURSOR_KEY, cursor)?;
                }
            }
            tx.commit()?;
            Ok(applied)
        })
        .await
    }

    pub async fn remote_item(&self, id: &str) -> Result<Option<RemoteItem>, StoreError> {
        let id = id.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, item_type, data, updated_at FROM remote_items WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(id, item_type, data, updated_at)| {
                Ok(RemoteItem {
                    id,
                    item_type,
                    data: serde_json::from_str(&data)?,
                    updated_at,
                })
            })
            .transpose()
        })
        .await
    }

    async fn state_value(&self, key: &'static str) -> Result<Option<i64>, StoreError> {
        self.execute(move |conn| get_state(conn, key)).await
    }
}

// ============================================================================
// Row helpers
// ============================================================================

const CHUNK_COLUMNS: &str = "chunk_id, session_id, sensor_kind, start_time, end_time, \
     sample_count, file_path, file_size_bytes, synced, created_at";

const ENTRY_COLUMNS: &str = "id, entity_type, entity_id, action, priority, status, retry_count, \
     max_retries, last_attempt, next_retry_at, error_message, created_at";

const SESSION_COLUMNS: &str = "session_id, mode, state, start_timestamp, end_timestamp, \
     enabled_sensors, sample_count, chunk_count";

fn upsert_entry(conn: &Connection, entry: &NewSyncEntry, now: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO sync_queue (entity_type, entity_id, action, priority, status,
             retry_count, max_retries, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)
         ON CONFLICT(entity_type, entity_id, action)
             DO UPDATE SET priority = MAX(sync_queue.priority, excluded.priority)
         RETURNING id",
        params![
            entry.entity_type.as_str(),
            entry.entity_id,
            entry.action.as_str(),
            entry.priority,
            entry.max_retries,
            now,
        ],
        |row| row.get(0),
    )
}

fn get_state(conn: &Connection, key: &str) -> Result<Option<i64>, StoreError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| StoreError::InvalidData(format!("{key} is not a number: {v}")))
        })
        .transpose()
}

fn set_state(conn: &Connection, key: &str, value: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value.to_string()],
    )?;
    Ok(())
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn non_negative(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e))
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkMeta> {
    Ok(ChunkMeta {
        chunk_id: row.get(0)?,
        session_id: row.get(1)?,
        sensor_kind: parse_col(row, 2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        sample_count: non_negative(row, 5)?,
        file_path: PathBuf::from(row.get::<_, String>(6)?),
        file_size_bytes: non_negative(row, 7)?,
        synced: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    Ok(SyncQueueEntry {
        id: row.get(0)?,
        entity_type: parse_col(row, 1)?,
        entity_id: row.get(2)?,
        action: parse_col(row, 3)?,
        priority: row.get(4)?,
        status: parse_col(row, 5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        last_attempt: row.get(8)?,
        next_retry_at: row.get(9)?,
        error_message: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let sensors: String = row.get(5)?;
    let enabled_sensors = serde_json::from_str(&sensors)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(SessionRecord {
        session_id: row.get(0)?,
        mode: parse_col(row, 1)?,
        state: parse_col(row, 2)?,
        start_timestamp: row.get(3)?,
        end_timestamp: row.get(4)?,
        enabled_sensors,
        sample_count: non_negative(row, 6)?,
        chunk_count: non_negative(row, 7)?,
    })
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("value {value} exceeds SQLite INTEGER range")))
}
