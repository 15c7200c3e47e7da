//! Binary request/notification protocol between `SyncClient` and `SyncServer`.
//!
//! Every WebSocket binary frame carries one bincode-encoded `SyncMessage`:
//! ```text
//! ┌──────────┬────────────┬─────────────┬────────────┬──────────┐
//! │ msg_type │ session_id │ doc_id      │ request_id │ payload  │
//! │ 1 byte   │ string     │ 0 / 16 bytes│ varint     │ variable │
//! └──────────┴────────────┴─────────────┴────────────┴──────────┘
//! ```
//!
//! Requests carry a client-chosen `request_id`; the reply (`Snapshot`,
//! `Subscribed`, `Saved` or `Error`) echoes it. `Change` frames are
//! unsolicited and use `request_id = 0`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{ChangeNotification, Document, DocumentId, NewDocument, SessionId};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Bootstrap read of a document
    Open = 1,
    /// Reply to `Open` / `Create` with a `Document`
    Snapshot = 2,
    /// Create a document from a `NewDocument`
    Create = 3,
    /// Start forwarding change notifications of `doc_id`
    Subscribe = 4,
    Subscribed = 5,
    Unsubscribe = 6,
    /// Persist a `SaveRequest`
    Save = 7,
    /// Save acknowledgement with the stored `Document`
    Saved = 8,
    /// Forwarded `ChangeNotification`
    Change = 9,
    /// Request failed with a `SyncError`
    Error = 10,
    Ping = 11,
    Pong = 12,
}

/// Payload of a `Save` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Session that sent the frame; the server uses its own id on replies
    pub session_id: SessionId,
    pub doc_id: Option<DocumentId>,
    /// Correlates a reply with its request; 0 when unsolicited
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(
        msg_type: MessageType,
        session_id: SessionId,
        doc_id: Option<DocumentId>,
        request_id: u64,
    ) -> Self {
        Self {
            msg_type,
            session_id,
            doc_id,
            request_id,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(mut self, value: &T) -> Result<Self, ProtocolError> {
        self.payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(self)
    }

    pub fn open(session_id: SessionId, doc_id: DocumentId, request_id: u64) -> Self {
        Self::new(MessageType::Open, session_id, Some(doc_id), request_id)
    }

    pub fn snapshot(
        session_id: SessionId,
        request_id: u64,
        document: &Document,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Snapshot, session_id, Some(document.id), request_id)
            .with_payload(document)
    }

    pub fn create(
        session_id: SessionId,
        request_id: u64,
        new: &NewDocument,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Create, session_id, new.id, request_id).with_payload(new)
    }

    pub fn subscribe(session_id: SessionId, doc_id: DocumentId, request_id: u64) -> Self {
        Self::new(MessageType::Subscribe, session_id, Some(doc_id), request_id)
    }

    pub fn subscribed(session_id: SessionId, doc_id: DocumentId, request_id: u64) -> Self {
        Self::new(MessageType::Subscribed, session_id, Some(doc_id), request_id)
    }

    pub fn unsubscribe(session_id: SessionId, doc_id: DocumentId) -> Self {
        Self::new(MessageType::Unsubscribe, session_id, Some(doc_id), 0)
    }

    pub fn save(
        session_id: SessionId,
        doc_id: DocumentId,
        request_id: u64,
        request: &SaveRequest,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Save, session_id, Some(doc_id), request_id).with_payload(request)
    }

    pub fn saved(
        session_id: SessionId,
        request_id: u64,
        document: &Document,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Saved, session_id, Some(document.id), request_id)
            .with_payload(document)
    }

    pub fn change(
        session_id: SessionId,
        notification: &ChangeNotification,
    ) -> Result<Self, ProtocolError> {
        Self::new(
            MessageType::Change,
            session_id,
            Some(notification.document_id),
            0,
        )
        .with_payload(notification)
    }

    pub fn error(
        session_id: SessionId,
        doc_id: Option<DocumentId>,
        request_id: u64,
        error: &SyncError,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Error, session_id, doc_id, request_id).with_payload(error)
    }

    pub fn ping(session_id: SessionId, request_id: u64) -> Self {
        Self::new(MessageType::Ping, session_id, None, request_id)
    }

    pub fn pong(session_id: SessionId, request_id: u64) -> Self {
        Self::new(MessageType::Pong, session_id, None, request_id)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// `doc_id`, required for document-scoped frames.
    pub fn require_doc_id(&self) -> Result<DocumentId, ProtocolError> {
        self.doc_id.ok_or(ProtocolError::MissingDocumentId)
    }

    /// Document carried by `Snapshot` and `Saved`.
    pub fn document(&self) -> Result<Document, ProtocolError> {
        self.payload_of(&[MessageType::Snapshot, MessageType::Saved])
    }

    pub fn new_document(&self) -> Result<NewDocument, ProtocolError> {
        self.payload_of(&[MessageType::Create])
    }

    pub fn save_request(&self) -> Result<SaveRequest, ProtocolError> {
        self.payload_of(&[MessageType::Save])
    }

    pub fn change_notification(&self) -> Result<ChangeNotification, ProtocolError> {
        self.payload_of(&[MessageType::Change])
    }

    pub fn sync_error(&self) -> Result<SyncError, ProtocolError> {
        self.payload_of(&[MessageType::Error])
    }

    fn payload_of<T: DeserializeOwned>(&self, expected: &[MessageType]) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Unexpected message type {0:?}")]
    InvalidMessageType(MessageType),

    #[error("Frame is missing a document id")]
    MissingDocumentId,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}
