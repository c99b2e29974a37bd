//! Event envelopes and observer lists.
//!
//! Streams and both orchestrators expose `add_listener`, returning a
//! [`ListenerId`] that removes the listener again. Only the owning component
//! emits; listeners are invoked outside the list lock so a listener may add
//! or remove listeners itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Kind of event delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChange,
    Error,
    StatsUpdate,
    Progress,
    Complete,
}

/// `{kind, payload, timestamp}` envelope emitted by pipeline components.
#[derive(Debug, Clone, Serialize)]
pub struct Event<P> {
    pub kind: EventKind,
    pub payload: P,
    pub timestamp: DateTime<Utc>,
}

impl<P> Event<P> {
    pub fn new(kind: EventKind, payload: P) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Token returned by [`Listeners::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Observer list owned by a single component.
pub struct Listeners<E> {
    entries: Mutex<Vec<(ListenerId, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every listener. A panicking listener is logged
    /// and does not prevent delivery to the others.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!("event listener panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Callback<E>)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
