//! Recording sessions: state machine, orchestrator and the platform
//! collaborators it drives.

pub mod collaborators;
pub mod orchestrator;
pub mod state;

pub use collaborators::{
    AudioOptions, AudioProducer, AudioStats, BackgroundPermit, CollaboratorError,
    LoggingPlatform, NoAudio, NotificationSpec, WakeHold,
};
pub use orchestrator::{
    RecordingConfig, RecordingError, RecordingEvent, RecordingOrchestrator,
    RecordingOrchestratorBuilder, RecordingStats, SensorTotals, SessionSummary,
};
pub use state::{ActiveSession, RecordingMode, RecordingState};
