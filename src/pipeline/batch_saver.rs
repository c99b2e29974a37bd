//! Batch delivery with bounded retry.
//!
//! [`BatchSaver::save_batch`] never returns an error: a failed batch goes to
//! a retry queue and is reported through the error callback.
//! [`BatchSaver::retry_failed_batches`] replays that queue with exponential
//! backoff. Batches that run out of attempts, or whose failure is not
//! retryable, are parked in an abandoned list instead of being dropped.

use crate::pipeline::sink::{BatchSink, SharedSink, SinkError};
use crate::sensor::types::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SaverConfig {
    /// Total delivery attempts per batch, including the first
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of a save or retry pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveResult {
    pub success: bool,
    pub saved_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
}

impl SaveResult {
    fn empty() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaverStats {
    pub total_batches: u64,
    pub total_saved: u64,
    /// Samples currently waiting for retry or abandoned
    pub total_failed: u64,
    pub abandoned_batches: u64,
    pub last_save_time: Option<DateTime<Utc>>,
}

/// A batch waiting in the retry queue or parked for good.
#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub samples: Vec<Sample>,
    pub attempts: u32,
    pub last_error: SinkError,
}

pub type SaveErrorHandler = Arc<dyn Fn(&SinkError, &[Sample]) + Send + Sync>;

#[derive(Default)]
struct State {
    failed: VecDeque<FailedBatch>,
    abandoned: Vec<FailedBatch>,
    stats: SaverStats,
}

#[derive(Clone)]
pub struct BatchSaver {
    sink: SharedSink,
    config: SaverConfig,
    on_error: Option<SaveErrorHandler>,
    state: Arc<Mutex<State>>,
    retry_lock: Arc<tokio::sync::Mutex<()>>,
}

impl BatchSaver {
    pub fn new(sink: SharedSink, config: SaverConfig) -> Self {
        Self {
            sink,
            config,
            on_error: None,
            state: Arc::new(Mutex::new(State::default())),
            retry_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn with_error_handler(mut self, handler: SaveErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub async fn save_batch(&self, batch: Vec<Sample>) -> SaveResult {
        if batch.is_empty() {
            return SaveResult::empty();
        }
        let count = batch.len();
        self.state().stats.total_batches += 1;

        match self.sink.write(batch.clone()).await {
            Ok(()) => {
                self.record_saved(count);
                SaveResult {
                    success: true,
                    saved_count: count,
                    failed_count: 0,
                    errors: Vec::new(),
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.report(&e, &batch);
                {
                    let mut state = self.state();
                    state.stats.total_failed += count as u64;
                }
                self.requeue(FailedBatch {
                    samples: batch,
                    attempts: 1,
                    last_error: e,
                });
                SaveResult {
                    success: false,
                    saved_count: 0,
                    failed_count: count,
                    errors: vec![message],
                }
            }
        }
    }

    /// Replay the retry queue once, waiting `retry_delay * 2^(attempts-1)`
    /// before each attempt.
    pub async fn retry_failed_batches(&self) -> SaveResult {
        let _serial = self.retry_lock.lock().await;
        let pending: Vec<FailedBatch> = self.state().failed.drain(..).collect();
        if pending.is_empty() {
            return SaveResult::empty();
        }

        let mut result = SaveResult::empty();
        for mut entry in pending {
            let count = entry.samples.len();
            let backoff = backoff_delay(self.config.retry_delay, entry.attempts);
            tokio::time::sleep(backoff).await;

            match self.sink.write(entry.samples.clone()).await {
                Ok(()) => {
                    result.saved_count += count;
                    self.record_saved(count);
                    let mut state = self.state();
                    state.stats.total_failed = state.stats.total_failed.saturating_sub(count as u64);
                }
                Err(e) => {
                    result.failed_count += count;
                    result.errors.push(e.to_string());
                    self.report(&e, &entry.samples);
                    entry.attempts += 1;
                    entry.last_error = e;
                    self.requeue(entry);
                }
            }
        }

        result.success = result.errors.is_empty();
        result
    }

    pub fn failed_batch_count(&self) -> usize {
        self.state().failed.len()
    }

    pub fn failed_sample_count(&self) -> usize {
        self.state().failed.iter().map(|b| b.samples.len()).sum()
    }

    /// Batches that will not be retried automatically.
    pub fn abandoned(&self) -> Vec<FailedBatch> {
        self.state().abandoned.clone()
    }

    /// Move abandoned batches back into the retry queue with a fresh
    /// attempt budget.
    pub fn revive_abandoned(&self) -> usize {
        let mut state = self.state();
        let revived: Vec<FailedBatch> = state.abandoned.drain(..).collect();
        let count = revived.len();
        for mut batch in revived {
            batch.attempts = 1;
            state.failed.push_back(batch);
        }
        count
    }

    pub fn clear_failed(&self) {
        let mut state = self.state();
        state.failed.clear();
        state.abandoned.clear();
        state.stats.total_failed = 0;
    }

    pub fn stats(&self) -> SaverStats {
        self.state().stats.clone()
    }

    fn requeue(&self, batch: FailedBatch) {
        let exhausted = batch.attempts >= self.config.retry_attempts;
        if exhausted || !batch.last_error.is_retryable() {
            tracing::error!(
                samples = batch.samples.len(),
                attempts = batch.attempts,
                error = %batch.last_error,
                "batch abandoned"
            );
            let mut state = self.state();
            state.stats.abandoned_batches += 1;
            state.abandoned.push(batch);
        } else {
            self.state().failed.push_back(batch);
        }
    }

    fn record_saved(&self, count: usize) {
        let mut state = self.state();
        state.stats.total_saved += count as u64;
        state.stats.last_save_time = Some(Utc::now());
    }

    fn report(&self, error: &SinkError, samples: &[Sample]) {
        tracing::warn!(samples = samples.len(), error = %error, "batch save failed");
        if let Some(handler) = &self.on_error {
            handler(error, samples);
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Use a saver as a buffer's flush handler: failures stay in its queues.
#[async_trait]
impl BatchSink for BatchSaver {
    async fn write(&self, samples: Vec<Sample>) -> Result<(), SinkError> {
        self.save_batch(samples).await;
        Ok(())
    }
}

/// `base * 2^(attempts-1)`, saturating.
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}
