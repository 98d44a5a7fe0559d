//! Persistence collaborator for note sessions.
//!
//! ```text
//! ┌─────────────┐  edits (ordered)  ┌──────────────┐
//! │ SyncServer  │ ────────────────► │ NoteStore    │
//! │ (sessions)  │  content on leave │ memory/rocks │
//! └──────┬──────┘ ────────────────► └──────┬───────┘
//!        │                                 │
//!        │ first join / get_content        │
//!        ◄─────────────────────────────────┘
//! ```
//!
//! The store is consulted when a session is created, when a client asks for
//! a snapshot while the session has no unpersisted edits, and when the last
//! participant leaves. Every applied edit is appended to an operation log.

pub mod memory;
#[cfg(feature = "rocks")]
pub mod rocks;

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::edit::{EditKind, EditOperation};
use crate::protocol::CollabError;
use crate::server::ServerConfig;

pub use memory::MemoryStore;
#[cfg(feature = "rocks")]
pub use rocks::{NoteMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// The configured backend is not compiled in.
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Storage(e.to_string())
    }
}

/// One applied edit in a note's operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Session sequence number the server stamped on the edit.
    pub seq: u64,
    pub user_id: String,
    pub username: String,
    pub kind: EditKind,
    pub position: usize,
    pub content: Option<String>,
    pub length: Option<usize>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl OperationRecord {
    pub fn new(seq: u64, user_id: &str, username: &str, op: &EditOperation) -> Self {
        Self {
            seq,
            user_id: user_id.to_string(),
            username: username.to_string(),
            kind: op.kind(),
            position: op.position(),
            content: op.content().map(str::to_owned),
            length: op.length(),
            timestamp: now_millis(),
        }
    }

    pub fn operation(&self) -> EditOperation {
        EditOperation::from_parts(self.kind, self.position, self.content.clone(), self.length)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Note persistence used by the session server.
pub trait NoteStore: Send + Sync {
    /// Stored content of a note, `None` if it was never saved.
    fn load_content(&self, note_id: &str) -> Result<Option<String>, StoreError>;

    fn save_content(&self, note_id: &str, content: &str) -> Result<(), StoreError>;

    fn append_operation(&self, note_id: &str, record: &OperationRecord) -> Result<(), StoreError>;

    /// Operation log of a note in append order.
    fn operations(&self, note_id: &str) -> Result<Vec<OperationRecord>, StoreError>;

    /// Highest sequence number ever logged, 0 for a new note. Survives
    /// [`compact_operations`](Self::compact_operations).
    fn last_seq(&self, note_id: &str) -> Result<u64, StoreError> {
        Ok(self.operations(note_id)?.iter().map(|r| r.seq).max().unwrap_or(0))
    }

    /// Called once content covering every edit up to `up_to_seq` has been
    /// saved. Stores that keep a durable history leave the log alone.
    fn compact_operations(&self, _note_id: &str, _up_to_seq: u64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Pick the store for a server: RocksDB when a storage path is configured,
/// memory otherwise.
pub fn open_store(config: &ServerConfig) -> Result<Arc<dyn NoteStore>, StoreError> {
    match &config.storage_path {
        None => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocks")]
        Some(path) => {
            log::info!("Opening note store at {}", path.display());
            Ok(Arc::new(RocksStore::open(StoreConfig::new(path))?))
        }
        #[cfg(not(feature = "rocks"))]
        Some(path) => Err(StoreError::Unavailable(format!(
            "cannot open {}: built without the `rocks` feature",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_rebuilds_operation() {
        let op = EditOperation::replace(3, "xy", 2);
        let record = OperationRecord::new(7, "u1", "Ann", &op);
        assert_eq!(record.seq, 7);
        assert_eq!(record.kind, EditKind::Replace);
        assert_eq!(record.operation(), op);
        assert!(record.timestamp > 0);
    }

    #[test]
    fn test_open_store_defaults_to_memory() {
        let store = open_store(&ServerConfig::default()).unwrap();
        assert_eq!(store.load_content("missing").unwrap(), None);
    }

    #[cfg(not(feature = "rocks"))]
    #[test]
    fn test_open_store_without_rocks_feature() {
        let config = ServerConfig {
            storage_path: Some("/tmp/syncpad-unused".into()),
            ..ServerConfig::default()
        };
        assert!(matches!(open_store(&config), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_store_error_maps_to_collab_error() {
        let err: CollabError = StoreError::Database("boom".into()).into();
        assert_eq!(err, CollabError::Storage("Database error: boom".into()));
    }
}
