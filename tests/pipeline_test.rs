//! End-to-end tests: record a session, seal its chunks and sync them.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sensor_pipeline::sensor::{Batch, ManualSource, Sample, SensorKind};
use sensor_pipeline::sync::protocol::{PULL_PATH, PUSH_PATH};
use sensor_pipeline::sync::{HttpClient, SyncOutcome, TransportError};
use sensor_pipeline::{AppContext, Config, RecordingState};

/// In-process sync server: accepts every push unless told to be offline.
#[derive(Default)]
struct TestServer {
    offline: AtomicBool,
    pushed: Mutex<Vec<Value>>,
}

impl TestServer {
    fn respond(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Network("connection refused".into()));
        }
        match path {
            PUSH_PATH => {
                let results: Vec<Value> = body["items"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(|item| {
                        json!({
                            "localId": item["localId"],
                            "serverId": format!("srv-{}", item["localId"].as_str().unwrap_or_default()),
                            "status": "completed",
                        })
                    })
                    .collect();
                let synced = results.len();
                self.pushed.lock().unwrap().push(body);
                Ok(json!({
                    "success": true,
                    "data": {
                        "batchId": "batch-1",
                        "synced": synced,
                        "failed": 0,
                        "results": results,
                    }
                }))
            }
            PULL_PATH => Ok(json!({ "items": [], "hasMore": false })),
            other => Err(TransportError::Http {
                status: 404,
                message: format!("no route for {other}"),
            }),
        }
    }

    fn pushed_types(&self) -> Vec<String> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .flat_map(|body| body["items"].as_array().cloned().unwrap_or_default())
            .filter_map(|item| item["type"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl HttpClient for TestServer {
    async fn get(&self, path: &str) -> Result<Value, TransportError> {
        self.respond(path, Value::Null)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.respond(path, body)
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.respond(path, body)
    }

    async fn delete(&self, path: &str) -> Result<Value, TransportError> {
        self.respond(path, Value::Null)
    }
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_path = dir.to_path_buf();
    config.device_id = Some("pipeline-test-0000".into());
    config.recording.sensors = vec![SensorKind::Accelerometer, SensorKind::Gyroscope];
    config.recording.flush_interval = Duration::from_millis(20);
    config.chunks.sweep_interval = None;
    config.auto_sync = false;
    config
}

fn batch(kind: SensorKind, start: i64, count: i64) -> Batch {
    let samples = (0..count)
        .map(|i| Sample::axis(kind, start + i * 20, 0.1, 0.2, 9.8))
        .collect();
    Batch::new(kind, samples)
}

#[tokio::test]
async fn test_record_seal_and_sync() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualSource::new());
    let server = Arc::new(TestServer::default());
    let ctx = AppContext::builder(test_config(dir.path()), source.clone())
        .http(server.clone())
        .build()
        .unwrap();
    let sync = ctx.sync.clone().expect("sync available with an http client");

    let settings = ctx.config.recording.clone();
    let session_id = ctx.recording.start(settings.recording_config()).await.unwrap();
    assert_eq!(ctx.recording.state(), RecordingState::Recording);

    let now = chrono::Utc::now().timestamp_millis();
    assert!(source.emit(batch(SensorKind::Accelerometer, now, 25)));
    assert!(source.emit(batch(SensorKind::Gyroscope, now, 15)));

    let summary = ctx.stop_recording().await.unwrap();
    assert_eq!(summary.session_id, session_id);
    assert_eq!(summary.sample_count, 40);
    assert_eq!(summary.unsealed_chunks, 0);
    assert!(summary.chunk_count >= 2);

    let chunks = ctx.store.chunks_for_session(&session_id).await.unwrap();
    assert_eq!(chunks.len() as u64, summary.chunk_count);
    for chunk in &chunks {
        assert!(chunk.file_path.exists(), "sealed chunk file missing");
        assert!(!chunk.synced);
    }

    let SyncOutcome::Completed(report) = sync.start_sync().await.unwrap() else {
        panic!("expected a completed sync run");
    };
    assert_eq!(report.synced, chunks.len() + 1);
    assert_eq!(report.failed, 0);

    let types = server.pushed_types();
    assert_eq!(types.iter().filter(|t| *t == "sensor_data").count(), chunks.len());
    assert_eq!(types.iter().filter(|t| *t == "session").count(), 1);

    let (_, unsynced, _) = ctx.store.chunk_totals().await.unwrap();
    assert_eq!(unsynced, 0);
    assert!(ctx.store.last_sync_at().await.unwrap().is_some());

    let stats = ctx.ledger.stats();
    assert_eq!(stats.sessions_recorded, 1);
    assert_eq!(stats.samples_ingested, 40);
    assert_eq!(stats.items_synced, chunks.len() as u64 + 1);

    ctx.shutdown().await.unwrap();
    assert!(dir.path().join("stats.json").exists());
}

#[tokio::test]
async fn test_offline_upload_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualSource::new());
    let server = Arc::new(TestServer::default());
    server.offline.store(true, Ordering::SeqCst);
    let ctx = AppContext::builder(test_config(dir.path()), source.clone())
        .http(server.clone())
        .build()
        .unwrap();
    let sync = ctx.sync.clone().unwrap();

    let settings = ctx.config.recording.clone();
    ctx.recording.start(settings.recording_config()).await.unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    assert!(source.emit(batch(SensorKind::Accelerometer, now, 10)));
    ctx.stop_recording().await.unwrap();

    let SyncOutcome::Completed(report) = sync.start_sync().await.unwrap() else {
        panic!("expected a completed sync run");
    };
    assert_eq!(report.synced, 0);
    assert!(report.failed > 0);
    assert!(report.pull_error.is_some());

    let counts = ctx.store.queue_counts().await.unwrap();
    assert_eq!(counts.failed as usize, report.failed);
    assert_eq!(counts.parked, 0);
    let (_, unsynced, _) = ctx.store.chunk_totals().await.unwrap();
    assert!(unsynced > 0);

    server.offline.store(false, Ordering::SeqCst);
    let SyncOutcome::Completed(report) = sync.retry_failed_items().await.unwrap() else {
        panic!("expected a completed retry run");
    };
    assert_eq!(report.failed, 0);
    assert!(report.synced > 0);

    let counts = ctx.store.queue_counts().await.unwrap();
    assert_eq!(counts.pending + counts.failed + counts.in_progress, 0);
    let (_, unsynced, _) = ctx.store.chunk_totals().await.unwrap();
    assert_eq!(unsynced, 0);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_purge_keeps_unsynced_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualSource::new());
    let mut config = test_config(dir.path());
    config.chunks.retention = Duration::ZERO;
    let ctx = AppContext::builder(config, source.clone()).build().unwrap();

    let settings = ctx.config.recording.clone();
    ctx.recording.start(settings.recording_config()).await.unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    assert!(source.emit(batch(SensorKind::Gyroscope, now, 5)));
    ctx.stop_recording().await.unwrap();

    let report = ctx.purge().await.unwrap();
    assert_eq!(report.chunks, 0);
    let (chunks, unsynced, _) = ctx.store.chunk_totals().await.unwrap();
    assert_eq!(chunks, unsynced);
    assert!(chunks > 0);

    ctx.shutdown().await.unwrap();
}
