//! Durable document storage.
//!
//! ```text
//! ┌─────────────────────────┐   write(id, patch)   ┌──────────────────────────────┐
//! │ PersistenceCoordinator  │ ───────────────────► │ dyn DocumentStore            │
//! └─────────────────────────┘                      ├──────────────┬───────────────┤
//!                                                  │ MemoryStore  │ RocksStore    │
//!                                                  │ (HashMap)    │ CF documents  │
//!                                                  │              │ CF metadata   │
//!                                                  └──────────────┴───────────────┘
//! ```
//!
//! One record per document, keyed by id. Writes for the same id are
//! serialized inside the store and the last one to complete wins: there is
//! no version check and no merge.

pub mod memory;
pub mod rocks;

use std::sync::Arc;
use thiserror::Error;

use crate::document::{Document, DocumentId, DocumentPatch, NewDocument, OwnerId};

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend failure (RocksDB error, poisoned lock)
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentId),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Storage contract used by the persistence coordinator.
pub trait DocumentStore: Send + Sync {
    /// Insert a new document. Requires owner id and owner name.
    fn create(&self, new: NewDocument) -> Result<Document, StoreError>;

    fn read(&self, id: DocumentId) -> Result<Document, StoreError>;

    /// Apply `patch` and stamp `updated_at`, even when no field changes.
    fn write(&self, id: DocumentId, patch: DocumentPatch) -> Result<Document, StoreError>;

    /// Documents created by `owner`, newest first.
    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Document>, StoreError>;
}

pub type SharedStore = Arc<dyn DocumentStore>;

/// Newest `created_at` first; id breaks ties so the order is stable.
pub(crate) fn sort_newest_first(docs: &mut [Document]) {
    docs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
