//! Wire types for `/sync/push` and `/sync/pull`.
//!
//! All bodies are camelCase JSON. Responses may arrive bare or wrapped in the
//! `{success, data, error}` envelope; [`decode_response`] accepts both.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::models::{EntityType, RemoteItem};
use crate::sync::client::TransportError;

pub const PUSH_PATH: &str = "/sync/push";
pub const PULL_PATH: &str = "/sync/pull";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemType {
    Session,
    SensorData,
    Audio,
    Metadata,
}

impl From<EntityType> for SyncItemType {
    fn from(entity: EntityType) -> Self {
        match entity {
            EntityType::SensorDataChunk => SyncItemType::SensorData,
            EntityType::Session => SyncItemType::Session,
            EntityType::Audio => SyncItemType::Audio,
            EntityType::Metadata => SyncItemType::Metadata,
        }
    }
}

/// Per-item status reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: SyncItemType,
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub status: ItemStatus,
    pub priority: i32,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub items: Vec<SyncItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub local_id: String,
    #[serde(default)]
    pub server_id: Option<String>,
    pub status: ItemStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub batch_id: String,
    pub synced: u32,
    pub failed: u32,
    #[serde(default)]
    pub results: Vec<PushResult>,
}

impl PushResponse {
    pub fn result_for(&self, local_id: &str) -> Option<&PushResult> {
        self.results.iter().find(|r| r.local_id == local_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub data: serde_json::Value,
    pub updated_at: i64,
}

impl From<PulledItem> for RemoteItem {
    fn from(item: PulledItem) -> Self {
        RemoteItem {
            id: item.id,
            item_type: item.item_type,
            data: item.data,
            updated_at: item.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub items: Vec<PulledItem>,
    pub has_more: bool,
    #[serde(default)]
    pub next_timestamp: Option<i64>,
}

impl PullResponse {
    /// Cursor to store after applying this page: the server's
    /// `nextTimestamp`, else the newest `updatedAt` seen.
    pub fn next_cursor(&self) -> Option<i64> {
        self.next_timestamp
            .or_else(|| self.items.iter().map(|i| i.updated_at).max())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<EnvelopeError>,
}

#[derive(Debug, Clone, Deserialize)]
struct EnvelopeError {
    code: String,
    message: String,
}

/// Decode a response body, unwrapping the API envelope when present.
pub fn decode_response<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, TransportError> {
    let is_envelope = value
        .as_object()
        .is_some_and(|obj| obj.contains_key("success"));

    let payload = if is_envelope {
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| TransportError::Decode(e.to_string()))?;
        if !envelope.success {
            let (code, message) = match envelope.error {
                Some(err) => (err.code, err.message),
                None => (
                    "unknown".to_string(),
                    envelope.message.unwrap_or_else(|| "request failed".to_string()),
                ),
            };
            return Err(TransportError::Api { code, message });
        }
        envelope
            .data
            .ok_or_else(|| TransportError::Decode("envelope has no data".to_string()))?
    } else {
        value
    };

    serde_json::from_value(payload).map_err(|e| TransportError::Decode(e.to_string()))
}
