use crate::sensor::types::SensorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Starting,
    Recording,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl Default for RecordingState {
    fn default() -> Self {
        RecordingState::Idle
    }
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Starting => "starting",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Stopping => "stopping",
            RecordingState::Stopped => "stopped",
            RecordingState::Error => "error",
        }
    }

    /// Whether a producer is live (recording or paused).
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }

    /// Allowed edges of the session state machine. Any state may move to
    /// `Error`; `Error` recovers only through a fresh start.
    pub fn can_transition_to(&self, next: RecordingState) -> bool {
        use RecordingState::*;
        match (self, next) {
            (_, Error) => true,
            (Idle | Error, Starting) => true,
            (Starting, Recording) => true,
            (Recording, Paused) | (Paused, Recording) => true,
            (Recording | Paused, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(RecordingState::Idle),
            "starting" => Ok(RecordingState::Starting),
            "recording" => Ok(RecordingState::Recording),
            "paused" => Ok(RecordingState::Paused),
            "stopping" => Ok(RecordingState::Stopping),
            "stopped" => Ok(RecordingState::Stopped),
            "error" => Ok(RecordingState::Error),
            other => Err(format!("unknown recording state '{other}'")),
        }
    }
}

/// Which producers a session runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    SensorOnly,
    AudioOnly,
    SensorAndAudio,
}

impl Default for RecordingMode {
    fn default() -> Self {
        RecordingMode::SensorOnly
    }
}

impl RecordingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingMode::SensorOnly => "sensor_only",
            RecordingMode::AudioOnly => "audio_only",
            RecordingMode::SensorAndAudio => "sensor_and_audio",
        }
    }

    pub fn uses_sensors(&self) -> bool {
        matches!(self, RecordingMode::SensorOnly | RecordingMode::SensorAndAudio)
    }

    pub fn uses_audio(&self) -> bool {
        matches!(self, RecordingMode::AudioOnly | RecordingMode::SensorAndAudio)
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "sensor_only" | "sensors" => Ok(RecordingMode::SensorOnly),
            "audio_only" | "audio" => Ok(RecordingMode::AudioOnly),
            "sensor_and_audio" | "both" => Ok(RecordingMode::SensorAndAudio),
            other => Err(format!("unknown recording mode '{other}'")),
        }
    }
}

/// The session currently owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub mode: RecordingMode,
    /// Shared start timestamp every sample offset is measured from
    pub start_timestamp: i64,
    /// Sensors that actually started
    pub sensors: Vec<SensorKind>,
    pub audio_active: bool,
    pub paused_at: Option<i64>,
    /// Milliseconds spent paused so far
    pub paused_ms: i64,
}

impl ActiveSession {
    pub fn new(session_id: String, mode: RecordingMode, start_timestamp: i64) -> Self {
        Self {
            session_id,
            mode,
            start_timestamp,
            sensors: Vec::new(),
            audio_active: false,
            paused_at: None,
            paused_ms: 0,
        }
    }

    pub fn mark_paused(&mut self, now: i64) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn mark_resumed(&mut self, now: i64) {
        if let Some(at) = self.paused_at.take() {
            self.paused_ms += (now - at).max(0);
        }
    }

    /// Recording time excluding pauses.
    pub fn active_ms(&self, now: i64) -> i64 {
        let paused_now = self.paused_at.map_or(0, |at| (now - at).max(0));
        (now - self.start_timestamp - self.paused_ms - paused_now).max(0)
    }
}
