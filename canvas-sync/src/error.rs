//! Error taxonomy surfaced to callers of the sync core.
//!
//! `SyncError` is `Clone + Serialize` so the same value can be kept in a
//! session's state, emitted to the UI and carried in `Error` frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::DocumentId;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SyncError {
    /// The id does not resolve to a stored document
    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    /// The store write did not complete; local edits stay dirty
    #[error("Document not saved: {0}")]
    PersistFailure(String),

    /// Publish or subscribe could not reach the pub/sub backend
    #[error("Sync channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Creation request rejected (missing owner, duplicate id)
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(id),
            StoreError::AlreadyExists(id) => {
                SyncError::InvalidDocument(format!("document {id} already exists"))
            }
            StoreError::InvalidDocument(reason) => SyncError::InvalidDocument(reason),
            other => SyncError::PersistFailure(other.to_string()),
        }
    }
}
