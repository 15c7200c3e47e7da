//! Server-side save path: write the store, then announce the change.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::DocumentBackend;
use crate::channel::{Subscription, SyncChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::document::{
    ChangeNotification, Document, DocumentId, DocumentPatch, NewDocument, OwnerId, SessionId,
};
use crate::error::SyncError;
use crate::storage::{MemoryStore, SharedStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub saves: u64,
    pub failed_saves: u64,
    /// Saves whose write succeeded but whose notification was not published
    pub publish_failures: u64,
}

#[derive(Default)]
struct AtomicCoordinatorStats {
    saves: AtomicU64,
    failed_saves: AtomicU64,
    publish_failures: AtomicU64,
}

pub struct PersistenceCoordinator {
    store: SharedStore,
    channel: Arc<SyncChannel<ChangeNotification>>,
    stats: AtomicCoordinatorStats,
}

impl PersistenceCoordinator {
    pub fn new(store: SharedStore, channel: Arc<SyncChannel<ChangeNotification>>) -> Self {
        Self {
            store,
            channel,
            stats: AtomicCoordinatorStats::default(),
        }
    }

    /// Coordinator over a fresh `MemoryStore` and channel.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SyncChannel::new(DEFAULT_CHANNEL_CAPACITY)),
        )
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn channel(&self) -> &Arc<SyncChannel<ChangeNotification>> {
        &self.channel
    }

    pub async fn create(&self, new: NewDocument) -> Result<Document, SyncError> {
        let doc = self.store.create(new)?;
        log::info!("Document {} created by {}", doc.id, doc.owner_id);
        Ok(doc)
    }

    pub async fn open(&self, id: DocumentId) -> Result<Document, SyncError> {
        Ok(self.store.read(id)?)
    }

    pub async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Document>, SyncError> {
        Ok(self.store.list_by_owner(owner)?)
    }

    /// Persist `title`/`content` and publish the change with `origin`.
    ///
    /// A failed write publishes nothing. A failed publish is logged and
    /// counted but does not undo the write: the save still succeeds.
    pub async fn save(
        &self,
        id: DocumentId,
        title: String,
        content: String,
        origin: &SessionId,
    ) -> Result<Document, SyncError> {
        let doc = match self.store.write(id, DocumentPatch::full(title, content)) {
            Ok(doc) => doc,
            Err(e) => {
                self.stats.failed_saves.fetch_add(1, Ordering::Relaxed);
                if !matches!(e, StoreError::NotFound(_)) {
                    log::error!("Save of {id} from {origin} failed: {e}");
                }
                return Err(e.into());
            }
        };
        self.stats.saves.fetch_add(1, Ordering::Relaxed);

        let notification = ChangeNotification::new(&doc, origin.clone());
        match self
            .channel
            .publish(&ChangeNotification::topic(id), notification)
            .await
        {
            Ok(reached) => log::debug!("Saved {id} from {origin}, notified {reached} subscribers"),
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Saved {id} but change notification was not published: {e}");
            }
        }

        Ok(doc)
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            saves: self.stats.saves.load(Ordering::Relaxed),
            failed_saves: self.stats.failed_saves.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DocumentBackend for PersistenceCoordinator {
    async fn open(&self, id: DocumentId) -> Result<Document, SyncError> {
        PersistenceCoordinator::open(self, id).await
    }

    async fn create(&self, new: NewDocument) -> Result<Document, SyncError> {
        PersistenceCoordinator::create(self, new).await
    }

    async fn save(
        &self,
        id: DocumentId,
        title: String,
        content: String,
        origin: &SessionId,
    ) -> Result<Document, SyncError> {
        PersistenceCoordinator::save(self, id, title, content, origin).await
    }

    async fn subscribe(
        &self,
        id: DocumentId,
    ) -> Result<Subscription<ChangeNotification>, SyncError> {
        self.channel.subscribe(&ChangeNotification::topic(id)).await
    }

    async fn unsubscribe(&self, subscription: Subscription<ChangeNotification>) {
        self.channel.unsubscribe(subscription).await;
    }
}
