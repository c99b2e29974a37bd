//! Sensor Pipeline - durable capture of multi-sensor recordings.
//!
//! Samples flow from hardware sensors through backpressured streams into a
//! session buffer, are persisted as time-windowed JSON-lines chunks, and are
//! uploaded by a retrying sync queue once connectivity allows.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Sensor Pipeline                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌─────────┐  │
//! │  │  Sensor    │──▶│  Sensor    │──▶│  Sample    │──▶│  Batch  │  │
//! │  │  Source    │   │  Stream    │   │  Buffer    │   │  Saver  │  │
//! │  └────────────┘   └────────────┘   └────────────┘   └────┬────┘  │
//! │                                                          ▼       │
//! │  ┌────────────┐   ┌────────────┐                  ┌────────────┐ │
//! │  │  Remote    │◀──│   Sync     │◀── sync queue ───│   Chunk    │ │
//! │  │   API      │   │Orchestrator│                  │Persistence │ │
//! │  └────────────┘   └────────────┘                  └────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensor_pipeline::{clock, AppContext, Config, SimulatedSource};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let source = Arc::new(SimulatedSource::new(clock::system_clock()));
//! let ctx = AppContext::builder(config.clone(), source).build()?;
//!
//! let session_id = ctx.recording.start(config.recording.recording_config()).await?;
//! // ...
//! let summary = ctx.stop_recording().await?;
//! assert_eq!(summary.session_id, session_id);
//! ctx.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod events;
pub mod pipeline;
pub mod recording;
pub mod sensor;
pub mod stats;
pub mod storage;
pub mod sync;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use context::{AppContext, ContextError};
pub use events::{Event, EventKind, ListenerId};
pub use recording::{RecordingConfig, RecordingMode, RecordingOrchestrator, RecordingState};
pub use sensor::{Batch, Sample, SensorKind, SensorSource, SimulatedSource};
pub use stats::StatsLedger;
pub use storage::{ChunkPersistence, MetadataStore};
pub use sync::{SyncOptions, SyncOrchestrator, SyncOutcome};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
