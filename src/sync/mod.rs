//! Upload of queued entities and reconciliation of server changes.

pub mod client;
pub mod device;
pub mod gateway;
pub mod orchestrator;
pub mod protocol;

pub use client::{generate_device_id, HttpClient, SyncApi, TransportError};
pub use device::{BatteryState, DeviceStatus, FixedDeviceStatus, NetworkKind, NetworkState};
#[cfg(feature = "gateway")]
pub use gateway::GatewayClient;
pub use gateway::GatewayConfig;
pub use orchestrator::{
    DeferReason, SyncError, SyncEvent, SyncOptions, SyncOrchestrator, SyncOutcome, SyncOverview,
    SyncReport, SyncState,
};
pub use protocol::{PullRequest, PullResponse, PushRequest, PushResponse, SyncItem, SyncItemType};
