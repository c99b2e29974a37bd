//! Sample and batch types flowing through the pipeline.
//!
//! A [`Sample`] is a single timestamped reading from one sensor. Samples are
//! immutable once produced; annotating a sample with its recording session
//! produces a new value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hardware sensor kinds the pipeline knows how to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Gravity,
    LinearAcceleration,
    RotationVector,
    Pressure,
    Location,
}

impl SensorKind {
    /// All kinds, in a stable order.
    pub const ALL: [SensorKind; 8] = [
        SensorKind::Accelerometer,
        SensorKind::Gyroscope,
        SensorKind::Magnetometer,
        SensorKind::Gravity,
        SensorKind::LinearAcceleration,
        SensorKind::RotationVector,
        SensorKind::Pressure,
        SensorKind::Location,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Accelerometer => "accelerometer",
            SensorKind::Gyroscope => "gyroscope",
            SensorKind::Magnetometer => "magnetometer",
            SensorKind::Gravity => "gravity",
            SensorKind::LinearAcceleration => "linear_acceleration",
            SensorKind::RotationVector => "rotation_vector",
            SensorKind::Pressure => "pressure",
            SensorKind::Location => "location",
        }
    }

    /// Whether readings of this kind carry three axis values.
    pub fn is_inertial(&self) -> bool {
        !matches!(self, SensorKind::Pressure | SensorKind::Location)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        SensorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown sensor kind '{s}'"))
    }
}

/// Sampling rate requested from the sensor source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingRate {
    /// ~200Hz
    Fastest,
    /// ~50Hz
    Game,
    /// ~16Hz
    Ui,
    /// ~5Hz
    Normal,
}

impl SamplingRate {
    /// Approximate rate in samples per second.
    pub fn hz(&self) -> u32 {
        match self {
            SamplingRate::Fastest => 200,
            SamplingRate::Game => 50,
            SamplingRate::Ui => 16,
            SamplingRate::Normal => 5,
        }
    }
}

impl Default for SamplingRate {
    fn default() -> Self {
        SamplingRate::Game
    }
}

/// Reading values; the shape depends on the sensor kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SamplePayload {
    /// Three-axis reading (inertial and magnetic sensors).
    Axis { x: f64, y: f64, z: f64 },
    /// Positional fix.
    Geo {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        altitude: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
    },
    /// Single-value reading (pressure, light, ...).
    Scalar { value: f64 },
}

/// One timestamped reading from one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub sensor_kind: SensorKind,
    /// Wall-clock time of the reading, milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Offset from the recording session start, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_offset_ms: Option<i64>,
    pub payload: SamplePayload,
}

impl Sample {
    /// Create a three-axis sample.
    pub fn axis(sensor_kind: SensorKind, timestamp: i64, x: f64, y: f64, z: f64) -> Self {
        Self {
            sensor_kind,
            timestamp,
            session_id: None,
            session_offset_ms: None,
            payload: SamplePayload::Axis { x, y, z },
        }
    }

    /// Create a positional sample with only latitude and longitude set.
    pub fn geo(timestamp: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            sensor_kind: SensorKind::Location,
            timestamp,
            session_id: None,
            session_offset_ms: None,
            payload: SamplePayload::Geo {
                latitude,
                longitude,
                altitude: None,
                accuracy: None,
                speed: None,
                heading: None,
            },
        }
    }

    /// Create a single-value sample.
    pub fn scalar(sensor_kind: SensorKind, timestamp: i64, value: f64) -> Self {
        Self {
            sensor_kind,
            timestamp,
            session_id: None,
            session_offset_ms: None,
            payload: SamplePayload::Scalar { value },
        }
    }

    /// Return a copy bound to a recording session.
    ///
    /// An offset already present is kept, so re-annotating is idempotent.
    pub fn in_session(&self, session_id: &str, session_start: i64) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            session_offset_ms: self
                .session_offset_ms
                .or(Some(self.timestamp - session_start)),
            ..self.clone()
        }
    }
}

/// Samples from one sensor, delivered together by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub sensor_kind: SensorKind,
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn new(sensor_kind: SensorKind, samples: Vec<Sample>) -> Self {
        Self {
            sensor_kind,
            samples,
        }
    }

    /// Number of samples in the batch.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
