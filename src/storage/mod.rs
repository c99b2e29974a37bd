//! Durable storage: chunk files on disk plus an SQLite metadata store holding
//! chunk rows, the sync queue, recording sessions and pull state.

pub mod chunk;
pub mod error;
pub mod jsonl;
pub mod migrations;
pub mod models;
pub mod store;
pub mod window;

pub use chunk::{ChunkConfig, ChunkPersistence, PersistenceStats, PurgeReport, WriteResult};
pub use error::{ChunkError, StoreError};
pub use models::{
    priority, ChunkMeta, EntityType, NewSyncEntry, QueueCounts, RemoteItem, SessionRecord,
    SyncAction, SyncQueueEntry, SyncStatus,
};
pub use store::MetadataStore;
pub use window::{ActiveChunk, ChunkKey};
