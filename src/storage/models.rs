//! Rows held by the metadata store.

use crate::recording::state::{RecordingMode, RecordingState};
use crate::sensor::types::SensorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Metadata of a sealed chunk file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub session_id: String,
    pub sensor_kind: SensorKind,
    /// Earliest sample timestamp (ms)
    pub start_time: i64,
    /// Latest sample timestamp (ms)
    pub end_time: i64,
    pub sample_count: u64,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub synced: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// What a sync queue entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    SensorDataChunk,
    Session,
    Audio,
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Upload,
    Update,
    Delete,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

string_enum!(SyncStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

string_enum!(EntityType {
    SensorDataChunk => "sensor_data_chunk",
    Session => "session",
    Audio => "audio",
    Metadata => "metadata",
});

string_enum!(SyncAction {
    Upload => "upload",
    Update => "update",
    Delete => "delete",
});

/// Sync priority levels; higher runs first.
pub mod priority {
    pub const LOW: i32 = 0;
    pub const NORMAL: i32 = 1;
    pub const HIGH: i32 = 2;
    pub const URGENT: i32 = 3;
}

/// Request to put an entity on the sync queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: SyncAction,
    pub priority: i32,
    pub max_retries: u32,
}

impl NewSyncEntry {
    pub fn upload(entity_type: EntityType, entity_id: impl Into<String>, priority: i32) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            action: SyncAction::Upload,
            priority,
            max_retries: 3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: SyncAction,
    pub priority: i32,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_attempt: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl SyncQueueEntry {
    /// Whether automatic sync will pick this entry up at `now`.
    pub fn is_eligible(&self, now: i64) -> bool {
        match self.status {
            SyncStatus::Pending => true,
            SyncStatus::Failed => {
                self.retry_count < self.max_retries
                    && self.next_retry_at.map_or(true, |at| at <= now)
            }
            SyncStatus::InProgress | SyncStatus::Completed => false,
        }
    }

    /// Failed for good; only a manual retry brings it back.
    pub fn is_parked(&self) -> bool {
        self.status == SyncStatus::Failed && self.retry_count >= self.max_retries
    }
}

/// Queue size by status. `parked` is a subset of `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub parked: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Persisted recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub mode: RecordingMode,
    pub state: RecordingState,
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
    pub enabled_sensors: Vec<SensorKind>,
    pub sample_count: u64,
    pub chunk_count: u64,
}

/// Item pulled from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub item_type: String,
    pub data: serde_json::Value,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: SyncStatus, retry_count: u32, next_retry_at: Option<i64>) -> SyncQueueEntry {
        SyncQueueEntry {
            id: 1,
            entity_type: EntityType::SensorDataChunk,
            entity_id: "c".into(),
            action: SyncAction::Upload,
            priority: priority::NORMAL,
            status,
            retry_count,
            max_retries: 3,
            last_attempt: None,
            next_retry_at,
            error_message: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_eligibility() {
        assert!(entry(SyncStatus::Pending, 0, None).is_eligible(0));
        assert!(!entry(SyncStatus::InProgress, 0, None).is_eligible(0));
        assert!(!entry(SyncStatus::Failed, 1, Some(100)).is_eligible(50));
        assert!(entry(SyncStatus::Failed, 1, Some(100)).is_eligible(100));

        let parked = entry(SyncStatus::Failed, 3, None);
        assert!(!parked.is_eligible(i64::MAX));
        assert!(parked.is_parked());
    }

    #[test]
    fn test_string_round_trip() {
        assert_eq!(EntityType::SensorDataChunk.as_str(), "sensor_data_chunk");
        assert_eq!("in_progress".parse::<SyncStatus>(), Ok(SyncStatus::InProgress));
        assert!("sideways".parse::<SyncAction>().is_err());
    }
}
