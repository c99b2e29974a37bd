//! Deterministic sensor source driven by the caller.
//!
//! Nothing is sampled on its own: tests call [`ManualSource::emit`] to push a
//! batch through every subscriber of a running sensor. Individual kinds can
//! be marked unavailable to exercise start failures.

use crate::events::ListenerId;
use crate::sensor::source::{BatchHandler, SensorError, SensorSource, SubscriberTable};
use crate::sensor::types::{Batch, SamplingRate, SensorKind};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Parameters a sensor was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRequest {
    pub rate: SamplingRate,
    pub batch_size: usize,
}

#[derive(Default)]
pub struct ManualSource {
    subscribers: SubscriberTable,
    running: Mutex<HashMap<SensorKind, StartRequest>>,
    unavailable: Mutex<HashSet<SensorKind>>,
    stop_calls: Mutex<Vec<SensorKind>>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future `start(kind)` calls fail with [`SensorError::NotAvailable`].
    pub fn set_unavailable(&self, kind: SensorKind) {
        lock(&self.unavailable).insert(kind);
    }

    /// Push a batch to subscribers. Returns false, delivering nothing, when
    /// the batch's sensor is not running.
    pub fn emit(&self, batch: Batch) -> bool {
        if !self.is_running(batch.sensor_kind) {
            return false;
        }
        self.subscribers.dispatch(&batch);
        true
    }

    pub fn is_running(&self, kind: SensorKind) -> bool {
        lock(&self.running).contains_key(&kind)
    }

    pub fn start_request(&self, kind: SensorKind) -> Option<StartRequest> {
        lock(&self.running).get(&kind).copied()
    }

    pub fn subscriber_count(&self, kind: SensorKind) -> usize {
        self.subscribers.subscriber_count(kind)
    }

    /// Kinds passed to `stop`, in call order.
    pub fn stop_calls(&self) -> Vec<SensorKind> {
        lock(&self.stop_calls).clone()
    }
}

#[async_trait]
impl SensorSource for ManualSource {
    async fn start(
        &self,
        kind: SensorKind,
        rate: SamplingRate,
        batch_size: usize,
    ) -> Result<(), SensorError> {
        if lock(&self.unavailable).contains(&kind) {
            return Err(SensorError::NotAvailable(kind));
        }
        let mut running = lock(&self.running);
        if running.contains_key(&kind) {
            return Err(SensorError::AlreadyRunning(kind));
        }
        running.insert(kind, StartRequest { rate, batch_size });
        Ok(())
    }

    async fn stop(&self, kind: SensorKind) -> Result<(), SensorError> {
        lock(&self.stop_calls).push(kind);
        match lock(&self.running).remove(&kind) {
            Some(_) => Ok(()),
            None => Err(SensorError::NotRunning(kind)),
        }
    }

    fn subscribe(&self, kind: SensorKind, on_batch: BatchHandler) -> ListenerId {
        self.subscribers.subscribe(kind, on_batch)
    }

    fn unsubscribe(&self, kind: SensorKind, id: ListenerId) -> bool {
        self.subscribers.unsubscribe(kind, id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::types::Sample;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_emit_only_while_running() {
        let source = ManualSource::new();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        source.subscribe(
            SensorKind::Gyroscope,
            Arc::new(move |batch: &Batch| {
                counter.fetch_add(batch.count(), Ordering::SeqCst);
            }),
        );

        let batch = Batch::new(
            SensorKind::Gyroscope,
            vec![Sample::axis(SensorKind::Gyroscope, 1, 0.0, 0.0, 0.0)],
        );
        assert!(!source.emit(batch.clone()));

        source
            .start(SensorKind::Gyroscope, SamplingRate::Game, 10)
            .await
            .unwrap();
        assert!(source.emit(batch));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_sensor_fails_start() {
        let source = ManualSource::new();
        source.set_unavailable(SensorKind::Location);
        let result = source
            .start(SensorKind::Location, SamplingRate::Normal, 1)
            .await;
        assert!(matches!(result, Err(SensorError::NotAvailable(SensorKind::Location))));
    }
}
