//! # canvas-sync: Shared canvas documents with debounced last-write-wins saves
//!
//! Every session editing a document keeps a local copy, persists it after a
//! quiet period and receives the saves of every other session through a
//! per-document change channel. The last save to reach the store wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   edits   ┌───────────┐  save   ┌────────────────────────┐
//! │ EditSession │ ────────► │ Debouncer │ ──────► │ DocumentBackend        │
//! │ (per user)  │           └───────────┘         │  PersistenceCoordinator│
//! └──────▲──────┘                                 │  or SyncClient (ws)    │
//!        │ Reconciler                             └───────────┬────────────┘
//!        │                                                    │ write, then publish
//! ┌──────┴──────────────────┐                     ┌───────────▼────────────┐
//! │ Subscription<Change..>  │ ◄────────────────── │ SyncChannel + Store    │
//! └─────────────────────────┘     fan-out         └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Document records, identities, change notifications
//! - [`storage`]: `DocumentStore` trait with in-memory and RocksDB stores
//! - [`channel`]: Typed per-document publish/subscribe
//! - [`coordinator`]: Write-then-publish save path
//! - [`session`] / [`debounce`] / [`reconciler`]: Client-side editing state
//! - [`protocol`] / [`server`] / [`client`]: Binary WebSocket transport

pub mod backend;
pub mod channel;
pub mod client;
pub mod coordinator;
pub mod debounce;
pub mod document;
pub mod error;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use backend::{DocumentBackend, SharedBackend};
pub use channel::{ChannelStats, Subscription, SyncChannel, Topic};
pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use coordinator::{CoordinatorStats, PersistenceCoordinator};
pub use document::{
    ChangeNotification, Document, DocumentId, DocumentPatch, Identity, NewDocument, OwnerId,
    SessionId,
};
pub use error::SyncError;
pub use protocol::{MessageType, ProtocolError, SaveRequest, SyncMessage};
pub use reconciler::{SessionSnapshot, SyncStatus};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{EditSession, SessionConfig, SessionEvent};
pub use storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
