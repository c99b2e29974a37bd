//! Producers and platform services the recording orchestrator coordinates.
//!
//! The audio producer is a real data source and its failure to start counts
//! against the session. The wake hold and background permit are best-effort:
//! their failures are logged and recording carries on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("{0} is not available on this device")]
    Unavailable(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("{0}")]
    Failed(String),
}

// ============================================================================
// Audio
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOptions {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStats {
    /// Milliseconds recorded
    pub total_duration: i64,
    pub total_chunks: u64,
    pub peak_db_level: f64,
}

/// Called by the audio producer when it fails while recording.
pub type AudioErrorHandler = Arc<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait AudioProducer: Send + Sync {
    async fn start(
        &self,
        session_id: &str,
        options: &AudioOptions,
        on_error: AudioErrorHandler,
    ) -> Result<(), CollaboratorError>;
    async fn stop(&self) -> Result<(), CollaboratorError>;
    async fn pause(&self) -> Result<(), CollaboratorError>;
    async fn resume(&self) -> Result<(), CollaboratorError>;
    fn stats(&self) -> AudioStats;
}

/// Audio producer for hosts without a microphone.
#[derive(Debug, Default)]
pub struct NoAudio;

#[async_trait]
impl AudioProducer for NoAudio {
    async fn start(
        &self,
        _session_id: &str,
        _options: &AudioOptions,
        _on_error: AudioErrorHandler,
    ) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("audio"))
    }

    async fn stop(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn pause(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn stats(&self) -> AudioStats {
        AudioStats::default()
    }
}

// ============================================================================
// Wake hold and background permit
// ============================================================================

/// Keeps the device awake while a session records.
#[async_trait]
pub trait WakeHold: Send + Sync {
    async fn activate(&self, tag: &str) -> Result<(), CollaboratorError>;
    async fn deactivate(&self, tag: &str) -> Result<(), CollaboratorError>;
    async fn force_release(&self) -> Result<(), CollaboratorError>;
}

/// Text shown while recording continues in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub title: String,
    pub body: String,
}

impl NotificationSpec {
    pub fn recording(session_id: &str) -> Self {
        Self {
            title: "Recording".to_string(),
            body: format!("Session {session_id} is recording sensor data"),
        }
    }
}

/// Lets recording continue while the app is in the background.
#[async_trait]
pub trait BackgroundPermit: Send + Sync {
    async fn start(&self, id: &str, spec: &NotificationSpec) -> Result<(), CollaboratorError>;
    async fn stop(&self) -> Result<(), CollaboratorError>;
    async fn update_notification(&self, spec: &NotificationSpec) -> Result<(), CollaboratorError>;
}

/// Desktop stand-in: a headless process has nothing to hold, so both
/// services only log what they were asked to do.
#[derive(Debug, Default)]
pub struct LoggingPlatform;

#[async_trait]
impl WakeHold for LoggingPlatform {
    async fn activate(&self, tag: &str) -> Result<(), CollaboratorError> {
        tracing::debug!(tag, "wake hold activated");
        Ok(())
    }

    async fn deactivate(&self, tag: &str) -> Result<(), CollaboratorError> {
        tracing::debug!(tag, "wake hold released");
        Ok(())
    }

    async fn force_release(&self) -> Result<(), CollaboratorError> {
        tracing::debug!("wake hold force released");
        Ok(())
    }
}

#[async_trait]
impl BackgroundPermit for LoggingPlatform {
    async fn start(&self, id: &str, spec: &NotificationSpec) -> Result<(), CollaboratorError> {
        tracing::debug!(id, title = %spec.title, "background permit started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), CollaboratorError> {
        tracing::debug!("background permit stopped");
        Ok(())
    }

    async fn update_notification(&self, spec: &NotificationSpec) -> Result<(), CollaboratorError> {
        tracing::debug!(body = %spec.body, "background notification updated");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records every call; can be told to fail `start`/`activate`.
    #[derive(Default)]
    pub struct Recorder {
        pub calls: Mutex<Vec<String>>,
        pub fail_start: Mutex<bool>,
        pub on_error: Mutex<Option<AudioErrorHandler>>,
    }

    impl Recorder {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let recorder = Self::default();
            *recorder.fail_start.lock().unwrap() = true;
            Arc::new(recorder)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Simulate the producer failing mid-recording.
        pub fn raise(&self, message: &str) {
            let handler = self.on_error.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(message.to_string());
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn start_result(&self, what: &'static str) -> Result<(), CollaboratorError> {
            if *self.fail_start.lock().unwrap() {
                Err(CollaboratorError::Unavailable(what))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl AudioProducer for Recorder {
        async fn start(
            &self,
            session_id: &str,
            _options: &AudioOptions,
            on_error: AudioErrorHandler,
        ) -> Result<(), CollaboratorError> {
            self.record(format!("audio.start:{session_id}"));
            self.start_result("audio")?;
            *self.on_error.lock().unwrap() = Some(on_error);
            Ok(())
        }

        async fn stop(&self) -> Result<(), CollaboratorError> {
            self.record("audio.stop");
            Ok(())
        }

        async fn pause(&self) -> Result<(), CollaboratorError> {
            self.record("audio.pause");
            Ok(())
        }

        async fn resume(&self) -> Result<(), CollaboratorError> {
            self.record("audio.resume");
            Ok(())
        }

        fn stats(&self) -> AudioStats {
            AudioStats {
                total_duration: 1_000,
                total_chunks: 1,
                peak_db_level: -12.0,
            }
        }
    }

    #[async_trait]
    impl WakeHold for Recorder {
        async fn activate(&self, tag: &str) -> Result<(), CollaboratorError> {
            self.record(format!("wake.activate:{tag}"));
            self.start_result("wake hold")
        }

        async fn deactivate(&self, tag: &str) -> Result<(), CollaboratorError> {
            self.record(format!("wake.deactivate:{tag}"));
            Ok(())
        }

        async fn force_release(&self) -> Result<(), CollaboratorError> {
            self.record("wake.force_release");
            Ok(())
        }
    }

    #[async_trait]
    impl BackgroundPermit for Recorder {
        async fn start(&self, id: &str, _spec: &NotificationSpec) -> Result<(), CollaboratorError> {
            self.record(format!("permit.start:{id}"));
            self.start_result("background permit")
        }

        async fn stop(&self) -> Result<(), CollaboratorError> {
            self.record("permit.stop");
            Ok(())
        }

        async fn update_notification(
            &self,
            _spec: &NotificationSpec,
        ) -> Result<(), CollaboratorError> {
            self.record("permit.update");
            Ok(())
        }
    }
}
