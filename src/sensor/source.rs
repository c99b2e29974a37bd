//! Sensor source capability interface.
//!
//! The pipeline depends only on [`SensorSource`]. Two adapters ship with the
//! crate: [`ManualSource`](super::manual::ManualSource), a deterministic fake
//! driven by tests, and [`SimulatedSource`](super::simulated::SimulatedSource),
//! which synthesizes waveforms on a timer for the CLI.

use crate::events::{ListenerId, Listeners};
use crate::sensor::types::{Batch, SamplingRate, SensorKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors raised by a sensor source. Fatal to the affected sensor only.
#[derive(Debug, Clone, Error)]
pub enum SensorError {
    #[error("sensor {0} is not available on this device")]
    NotAvailable(SensorKind),

    #[error("sensor {0} is already running")]
    AlreadyRunning(SensorKind),

    #[error("sensor {0} is not running")]
    NotRunning(SensorKind),

    #[error("sensor bridge error: {0}")]
    Bridge(String),
}

/// Callback invoked for every batch the source emits.
pub type BatchHandler = Arc<dyn Fn(&Batch) + Send + Sync>;

/// Native capability emitting timestamped batches per sensor kind.
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Begin sampling `kind`, grouping readings into batches of `batch_size`.
    async fn start(
        &self,
        kind: SensorKind,
        rate: SamplingRate,
        batch_size: usize,
    ) -> Result<(), SensorError>;

    /// Stop sampling `kind`.
    async fn stop(&self, kind: SensorKind) -> Result<(), SensorError>;

    /// Register a batch handler for `kind`.
    fn subscribe(&self, kind: SensorKind, on_batch: BatchHandler) -> ListenerId;

    /// Remove a handler registered with [`subscribe`](Self::subscribe).
    fn unsubscribe(&self, kind: SensorKind, id: ListenerId) -> bool;
}

/// Per-kind subscriber lists shared by the bundled adapters.
#[derive(Default)]
pub struct SubscriberTable {
    lists: Mutex<HashMap<SensorKind, Arc<Listeners<Batch>>>>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: SensorKind, on_batch: BatchHandler) -> ListenerId {
        self.list(kind).add(move |batch| on_batch(batch))
    }

    pub fn unsubscribe(&self, kind: SensorKind, id: ListenerId) -> bool {
        self.list(kind).remove(id)
    }

    /// Deliver a batch to every handler for its kind.
    pub fn dispatch(&self, batch: &Batch) {
        self.list(batch.sensor_kind).emit(batch);
    }

    pub fn subscriber_count(&self, kind: SensorKind) -> usize {
        self.list(kind).len()
    }

    fn list(&self, kind: SensorKind) -> Arc<Listeners<Batch>> {
        let mut lists = match self.lists.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lists
            .entry(kind)
            .or_insert_with(|| Arc::new(Listeners::new()))
            .clone()
    }
}
