//! Cumulative pipeline counters.
//!
//! Counts what the pipeline has recorded and delivered across runs. Only
//! totals are kept, never sample values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::recording::orchestrator::RecordingStats;
use crate::sensor::types::SensorKind;
use crate::storage::models::ChunkMeta;
use crate::sync::orchestrator::SyncReport;

#[derive(Debug)]
pub struct StatsLedger {
    /// Samples delivered by sensor streams
    samples_ingested: AtomicU64,
    /// Samples discarded by backpressure
    samples_dropped: AtomicU64,
    sessions_recorded: AtomicU64,
    chunks_sealed: AtomicU64,
    bytes_written: AtomicU64,
    items_synced: AtomicU64,
    items_failed: AtomicU64,
    /// Persisted samples per sensor
    per_sensor: Mutex<BTreeMap<SensorKind, u64>>,
    started_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl StatsLedger {
    pub fn new() -> Self {
        Self {
            samples_ingested: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            sessions_recorded: AtomicU64::new(0),
            chunks_sealed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            items_synced: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            per_sensor: Mutex::new(BTreeMap::new()),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a ledger backed by a JSON file, picking up earlier totals.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut ledger = Self::new();
        ledger.persist_path = Some(path);

        if let Err(e) = ledger.load() {
            tracing::warn!("could not load previous pipeline stats: {e}");
        }

        ledger
    }

    /// Fold in the final stats of a stopped session.
    pub fn record_session(&self, stats: &RecordingStats) {
        self.sessions_recorded.fetch_add(1, Ordering::Relaxed);
        if let Some(sensors) = &stats.sensors {
            self.samples_ingested
                .fetch_add(sensors.total_samples, Ordering::Relaxed);
            self.samples_dropped
                .fetch_add(sensors.total_dropped, Ordering::Relaxed);
        }
    }

    pub fn record_chunks(&self, chunks: &[ChunkMeta]) {
        let mut per_sensor = self.per_sensor();
        for chunk in chunks {
            self.chunks_sealed.fetch_add(1, Ordering::Relaxed);
            self.bytes_written
                .fetch_add(chunk.file_size_bytes, Ordering::Relaxed);
            *per_sensor.entry(chunk.sensor_kind).or_insert(0) += chunk.sample_count;
        }
    }

    pub fn record_sync(&self, report: &SyncReport) {
        self.items_synced
            .fetch_add(report.synced as u64, Ordering::Relaxed);
        self.items_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            sessions_recorded: self.sessions_recorded.load(Ordering::Relaxed),
            chunks_sealed: self.chunks_sealed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            items_synced: self.items_synced.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            samples_per_sensor: self.per_sensor().clone(),
            started_at: self.started_at,
        }
    }

    /// Summary for the `status` command.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "Pipeline Statistics:\n\
             - Sessions recorded: {}\n\
             - Samples ingested: {}\n\
             - Samples dropped: {}\n\
             - Chunks sealed: {}\n\
             - Bytes written: {}\n\
             - Items synced: {}\n\
             - Sync failures: {}",
            stats.sessions_recorded,
            stats.samples_ingested,
            stats.samples_dropped,
            stats.chunks_sealed,
            stats.bytes_written,
            stats.items_synced,
            stats.items_failed,
        );
        if !stats.samples_per_sensor.is_empty() {
            out.push_str("\n\nPersisted samples by sensor:");
            for (kind, count) in &stats.samples_per_sensor {
                out.push_str(&format!("\n - {kind}: {count}"));
            }
        }
        out
    }

    /// Save totals to disk. No-op without a persistence path.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedLedger {
                samples_ingested: stats.samples_ingested,
                samples_dropped: stats.samples_dropped,
                sessions_recorded: stats.sessions_recorded,
                chunks_sealed: stats.chunks_sealed,
                bytes_written: stats.bytes_written,
                items_synced: stats.items_synced,
                items_failed: stats.items_failed,
                samples_per_sensor: stats.samples_per_sensor,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedLedger =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.samples_ingested
                    .store(persisted.samples_ingested, Ordering::Relaxed);
                self.samples_dropped
                    .store(persisted.samples_dropped, Ordering::Relaxed);
                self.sessions_recorded
                    .store(persisted.sessions_recorded, Ordering::Relaxed);
                self.chunks_sealed
                    .store(persisted.chunks_sealed, Ordering::Relaxed);
                self.bytes_written
                    .store(persisted.bytes_written, Ordering::Relaxed);
                self.items_synced
                    .store(persisted.items_synced, Ordering::Relaxed);
                self.items_failed
                    .store(persisted.items_failed, Ordering::Relaxed);
                *self.per_sensor() = persisted.samples_per_sensor;
            }
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.samples_ingested.store(0, Ordering::Relaxed);
        self.samples_dropped.store(0, Ordering::Relaxed);
        self.sessions_recorded.store(0, Ordering::Relaxed);
        self.chunks_sealed.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.items_synced.store(0, Ordering::Relaxed);
        self.items_failed.store(0, Ordering::Relaxed);
        self.per_sensor().clear();
    }

    fn per_sensor(&self) -> std::sync::MutexGuard<'_, BTreeMap<SensorKind, u64>> {
        match self.per_sensor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for StatsLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of ledger totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub samples_ingested: u64,
    pub samples_dropped: u64,
    pub sessions_recorded: u64,
    pub chunks_sealed: u64,
    pub bytes_written: u64,
    pub items_synced: u64,
    pub items_failed: u64,
    pub samples_per_sensor: BTreeMap<SensorKind, u64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedLedger {
    samples_ingested: u64,
    samples_dropped: u64,
    sessions_recorded: u64,
    chunks_sealed: u64,
    bytes_written: u64,
    items_synced: u64,
    items_failed: u64,
    #[serde(default)]
    samples_per_sensor: BTreeMap<SensorKind, u64>,
    last_updated: DateTime<Utc>,
}

pub type SharedStatsLedger = Arc<StatsLedger>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::orchestrator::SensorTotals;
    use crate::recording::state::{RecordingMode, RecordingState};

    fn chunk(kind: SensorKind, samples: u64, bytes: u64) -> ChunkMeta {
        ChunkMeta {
            chunk_id: format!("s1_{kind}_0_0"),
            session_id: "s1".into(),
            sensor_kind: kind,
            start_time: 0,
            end_time: 10,
            sample_count: samples,
            file_path: PathBuf::from("/tmp/x.jsonl"),
            file_size_bytes: bytes,
            synced: false,
            created_at: 0,
        }
    }

    fn session_stats(total: u64, dropped: u64) -> RecordingStats {
        RecordingStats {
            session_id: "s1".into(),
            mode: RecordingMode::SensorOnly,
            state: RecordingState::Stopped,
            duration_ms: 1_000,
            sensors: Some(SensorTotals {
                total_samples: total,
                total_dropped: dropped,
                processing_errors: 0,
                sensors_active: 1,
            }),
            audio: None,
            buffered_samples: 0,
            pending_batches: 0,
            abandoned_batches: 0,
        }
    }

    #[test]
    fn test_ledger_counting() {
        let ledger = StatsLedger::new();
        ledger.record_session(&session_stats(120, 4));
        ledger.record_chunks(&[
            chunk(SensorKind::Accelerometer, 60, 3_000),
            chunk(SensorKind::Gyroscope, 56, 2_800),
            chunk(SensorKind::Accelerometer, 4, 200),
        ]);
        ledger.record_sync(&SyncReport {
            synced: 2,
            failed: 1,
            ..SyncReport::default()
        });

        let stats = ledger.stats();
        assert_eq!(stats.sessions_recorded, 1);
        assert_eq!((stats.samples_ingested, stats.samples_dropped), (120, 4));
        assert_eq!((stats.chunks_sealed, stats.bytes_written), (3, 6_000));
        assert_eq!((stats.items_synced, stats.items_failed), (2, 1));
        assert_eq!(stats.samples_per_sensor[&SensorKind::Accelerometer], 64);
    }

    #[test]
    fn test_ledger_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats").join("ledger.json");

        let ledger = StatsLedger::with_persistence(path.clone());
        ledger.record_chunks(&[chunk(SensorKind::Pressure, 10, 400)]);
        ledger.save().unwrap();

        let reopened = StatsLedger::with_persistence(path);
        let stats = reopened.stats();
        assert_eq!(stats.chunks_sealed, 1);
        assert_eq!(stats.samples_per_sensor[&SensorKind::Pressure], 10);
    }

    #[test]
    fn test_ledger_reset_and_summary() {
        let ledger = StatsLedger::new();
        ledger.record_chunks(&[chunk(SensorKind::Gyroscope, 5, 100)]);
        assert!(ledger.summary().contains("gyroscope: 5"));

        ledger.reset();
        let stats = ledger.stats();
        assert_eq!(stats.chunks_sealed, 0);
        assert!(stats.samples_per_sensor.is_empty());
        assert!(ledger.summary().contains("Chunks sealed: 0"));
    }
}
