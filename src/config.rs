//! Configuration for the sensor pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::batch_saver::SaverConfig;
use crate::pipeline::buffer::BufferConfig;
use crate::pipeline::DropPolicy;
use crate::recording::collaborators::AudioOptions;
use crate::recording::orchestrator::RecordingConfig;
use crate::recording::state::RecordingMode;
use crate::sensor::types::{SamplingRate, SensorKind};
use crate::storage::chunk::ChunkConfig;
use crate::sync::gateway::GatewayConfig;
use crate::sync::orchestrator::SyncOptions;

const APP_DIR: &str = "sensor-pipeline";

/// Main configuration, stored as pretty JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the database, chunk files and stats
    pub data_path: PathBuf,

    /// Device id attached to pushed batches; generated on first use
    pub device_id: Option<String>,

    pub recording: RecordingSettings,

    pub chunks: ChunkSettings,

    pub sync: SyncOptions,

    /// Sync automatically while recording
    pub auto_sync: bool,

    /// Period of automatic sync
    #[serde(with = "duration_ms")]
    pub sync_interval: Duration,

    /// Sync server; sync commands are unavailable without one
    pub gateway: Option<GatewayConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            data_path: data_dir,
            device_id: None,
            recording: RecordingSettings::default(),
            chunks: ChunkSettings::default(),
            sync: SyncOptions::default(),
            auto_sync: true,
            sync_interval: Duration::from_secs(300),
            gateway: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does
    /// not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_path.join("pipeline.db")
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.data_path.join("chunks")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        std::fs::create_dir_all(self.chunk_dir())?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rec = &self.recording;
        if rec.mode.uses_sensors() && rec.sensors.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "mode {} needs at least one sensor",
                rec.mode
            )));
        }
        if rec.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if rec.max_buffer_size < rec.batch_size {
            return Err(ConfigError::Invalid(format!(
                "max_buffer_size ({}) is smaller than batch_size ({})",
                rec.max_buffer_size, rec.batch_size
            )));
        }
        if rec.buffer_size == 0 || rec.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "buffer_size and retry_attempts must be positive".into(),
            ));
        }
        if self.chunks.chunk_duration.is_zero() || self.chunks.max_samples_per_chunk == 0 {
            return Err(ConfigError::Invalid(
                "chunk_duration and max_samples_per_chunk must be positive".into(),
            ));
        }
        if self.sync.max_concurrent == 0 {
            return Err(ConfigError::Invalid("sync.max_concurrent must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.sync.low_battery_threshold) {
            return Err(ConfigError::Invalid(
                "sync.low_battery_threshold must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            chunk_duration: self.chunks.chunk_duration,
            max_samples_per_chunk: self.chunks.max_samples_per_chunk,
            sweep_interval: self.chunks.sweep_interval,
            max_retries: self.chunks.max_retries,
            ..ChunkConfig::new(self.chunk_dir())
        }
    }
}

/// Recording defaults used by `record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub mode: RecordingMode,
    pub sensors: Vec<SensorKind>,
    pub rate: SamplingRate,
    pub batch_size: usize,
    /// Per-stream backpressure bound
    pub max_buffer_size: usize,
    #[serde(with = "duration_ms")]
    pub max_processing_time: Duration,
    pub drop_policy: DropPolicy,
    /// Session buffer flush threshold
    pub buffer_size: usize,
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    pub retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    pub audio: AudioOptions,
    pub wake_hold: bool,
    pub background_permit: bool,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        let base = RecordingConfig::new(RecordingMode::SensorOnly, Vec::new());
        Self {
            mode: base.mode,
            sensors: vec![
                SensorKind::Accelerometer,
                SensorKind::Gyroscope,
                SensorKind::Magnetometer,
            ],
            rate: base.rate,
            batch_size: base.batch_size,
            max_buffer_size: base.max_buffer_size,
            max_processing_time: base.max_processing_time,
            drop_policy: base.drop_policy,
            buffer_size: base.buffer.max_size,
            flush_interval: base.buffer.flush_interval,
            retry_attempts: base.saver.retry_attempts,
            retry_delay: base.saver.retry_delay,
            audio: base.audio,
            wake_hold: base.wake_hold,
            background_permit: base.background_permit,
        }
    }
}

impl RecordingSettings {
    pub fn recording_config(&self) -> RecordingConfig {
        RecordingConfig {
            rate: self.rate,
            batch_size: self.batch_size,
            max_buffer_size: self.max_buffer_size,
            max_processing_time: self.max_processing_time,
            drop_policy: self.drop_policy,
            buffer: BufferConfig {
                max_size: self.buffer_size,
                flush_interval: self.flush_interval,
                auto_flush: true,
                drop_policy: self.drop_policy,
            },
            saver: SaverConfig {
                retry_attempts: self.retry_attempts,
                retry_delay: self.retry_delay,
            },
            audio: self.audio.clone(),
            wake_hold: self.wake_hold,
            background_permit: self.background_permit,
            ..RecordingConfig::new(self.mode, self.sensors.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    #[serde(with = "duration_ms")]
    pub chunk_duration: Duration,
    pub max_samples_per_chunk: usize,
    #[serde(with = "option_duration_ms")]
    pub sweep_interval: Option<Duration>,
    /// Upload attempts per chunk before it is parked
    pub max_retries: u32,
    /// Synced chunks older than this are removed by `purge`
    #[serde(with = "duration_ms")]
    pub retention: Duration,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        let base = ChunkConfig::new(PathBuf::new());
        Self {
            chunk_duration: base.chunk_duration,
            max_samples_per_chunk: base.max_samples_per_chunk,
            sweep_interval: base.sweep_interval,
            max_retries: base.max_retries,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Parse a sensor list from a comma-separated string. `all` selects every
/// known sensor.
pub fn parse_sensors(s: &str) -> Result<Vec<SensorKind>, ConfigError> {
    let mut sensors = Vec::new();
    for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if name.eq_ignore_ascii_case("all") {
            return Ok(SensorKind::ALL.to_vec());
        }
        let kind: SensorKind = name.parse().map_err(ConfigError::Invalid)?;
        if !sensors.contains(&kind) {
            sensors.push(kind);
        }
    }
    Ok(sensors)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(serde_json::Error),

    #[error("Serialize error: {0}")]
    Serialize(serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Optional Duration as milliseconds; `null` disables.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_list_parsing() {
        let sensors = parse_sensors("accelerometer, gyroscope,accelerometer").unwrap();
        assert_eq!(sensors, vec![SensorKind::Accelerometer, SensorKind::Gyroscope]);

        let sensors = parse_sensors("linear-acceleration").unwrap();
        assert_eq!(sensors, vec![SensorKind::LinearAcceleration]);

        assert_eq!(parse_sensors("all").unwrap().len(), SensorKind::ALL.len());
        assert!(parse_sensors("thermometer").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chunks.chunk_duration, Duration::from_secs(60));
        assert_eq!(config.sync.max_concurrent, 3);
        assert_eq!(config.recording.sensors.len(), 3);
        assert!(config.gateway.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_round_trip_uses_milliseconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.data_path = dir.path().join("data");
        config.chunks.sweep_interval = None;
        config.gateway = Some(GatewayConfig::new("http://localhost:8080").with_token("t"));
        config.save_to(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["chunks"]["chunk_duration"], 60_000);
        assert!(raw["chunks"]["sweep_interval"].is_null());

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "auto_sync": false, "sync": { "max_concurrent": 5 } }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(!config.auto_sync);
        assert_eq!(config.sync.max_concurrent, 5);
        assert_eq!(config.sync.pull_page_size, 100);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.recording.sensors.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.recording.mode = RecordingMode::AudioOnly;
        config.validate().unwrap();

        config.sync.low_battery_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recording_config_mapping() {
        let mut settings = RecordingSettings::default();
        settings.buffer_size = 250;
        settings.retry_attempts = 5;
        let config = settings.recording_config();
        assert_eq!(config.buffer.max_size, 250);
        assert_eq!(config.saver.retry_attempts, 5);
        assert_eq!(config.sensors, settings.sensors);
    }
}
