//! Synthetic sensor source.
//!
//! Each started sensor gets a tokio task that produces a batch of
//! `batch_size` readings every `batch_size / rate` seconds. Values follow slow
//! sine waves so recorded chunks look plausible when inspected.

use crate::clock::SharedClock;
use crate::events::ListenerId;
use crate::sensor::source::{BatchHandler, SensorError, SensorSource, SubscriberTable};
use crate::sensor::types::{Batch, Sample, SamplePayload, SamplingRate, SensorKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct SimulatedSource {
    clock: SharedClock,
    subscribers: Arc<SubscriberTable>,
    tasks: Mutex<HashMap<SensorKind, JoinHandle<()>>>,
}

impl SimulatedSource {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            subscribers: Arc::new(SubscriberTable::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<SensorKind, JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedSource {
    async fn start(
        &self,
        kind: SensorKind,
        rate: SamplingRate,
        batch_size: usize,
    ) -> Result<(), SensorError> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&kind) {
            return Err(SensorError::AlreadyRunning(kind));
        }

        let batch_size = batch_size.max(1);
        let hz = rate.hz().max(1);
        let step_ms = (1_000 / hz as i64).max(1);
        let period = Duration::from_millis(step_ms as u64 * batch_size as u64);
        let clock = self.clock.clone();
        let subscribers = self.subscribers.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut tick: u64 = 0;
            loop {
                ticker.tick().await;
                let end = clock.now_ms();
                let samples = (0..batch_size)
                    .map(|i| {
                        let offset = (batch_size - 1 - i) as i64 * step_ms;
                        synthesize(kind, end - offset, tick + i as u64)
                    })
                    .collect();
                tick += batch_size as u64;
                subscribers.dispatch(&Batch::new(kind, samples));
            }
        });
        tasks.insert(kind, handle);

        tracing::debug!(sensor = %kind, hz, batch_size, "simulated sensor started");
        Ok(())
    }

    async fn stop(&self, kind: SensorKind) -> Result<(), SensorError> {
        match self.tasks().remove(&kind) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(sensor = %kind, "simulated sensor stopped");
                Ok(())
            }
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

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        for (_, handle) in self.tasks().drain() {
            handle.abort();
        }
    }
}

fn synthesize(kind: SensorKind, timestamp: i64, tick: u64) -> Sample {
    let phase = tick as f64 * 0.05;
    match kind {
        SensorKind::Location => {
            let mut sample = Sample::geo(
                timestamp,
                52.52 + phase.sin() * 1e-4,
                13.405 + phase.cos() * 1e-4,
            );
            if let SamplePayload::Geo { accuracy, .. } = &mut sample.payload {
                *accuracy = Some(5.0);
            }
            sample
        }
        SensorKind::Pressure => Sample::scalar(kind, timestamp, 1013.25 + phase.sin() * 0.3),
        SensorKind::Accelerometer | SensorKind::Gravity => {
            Sample::axis(kind, timestamp, phase.sin() * 0.2, phase.cos() * 0.2, 9.81)
        }
        _ => Sample::axis(
            kind,
            timestamp,
            phase.sin(),
            (phase * 0.5).cos(),
            (phase * 0.25).sin(),
        ),
    }
}
