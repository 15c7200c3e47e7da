//! The seam between editing sessions and whatever persists documents.
//!
//! `PersistenceCoordinator` implements it in-process; `SyncClient`
//! implements it over a WebSocket connection. Sessions only see this trait.

use async_trait::async_trait;
use std::sync::Arc;

use crate::channel::Subscription;
use crate::document::{ChangeNotification, Document, DocumentId, NewDocument, SessionId};
use crate::error::SyncError;

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Bootstrap read before editing and subscribing.
    async fn open(&self, id: DocumentId) -> Result<Document, SyncError>;

    async fn create(&self, new: NewDocument) -> Result<Document, SyncError>;

    /// Persist title and content, then notify subscribers with `origin`.
    async fn save(
        &self,
        id: DocumentId,
        title: String,
        content: String,
        origin: &SessionId,
    ) -> Result<Document, SyncError>;

    /// Change notifications for `id` from now on.
    async fn subscribe(&self, id: DocumentId)
        -> Result<Subscription<ChangeNotification>, SyncError>;

    async fn unsubscribe(&self, subscription: Subscription<ChangeNotification>);
}

pub type SharedBackend = Arc<dyn DocumentBackend>;
