//! In-process document store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::document::{now_millis, Document, DocumentId, DocumentPatch, NewDocument, OwnerId};

use super::{sort_newest_first, DocumentStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<DocumentId, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".to_string())
}

impl DocumentStore for MemoryStore {
    fn create(&self, new: NewDocument) -> Result<Document, StoreError> {
        new.validate().map_err(StoreError::InvalidDocument)?;
        let doc = new.into_document(now_millis());

        let mut docs = self.docs.write().map_err(poisoned)?;
        if docs.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        docs.insert(doc.id, doc.clone());
        Ok(doc)
    }

    fn read(&self, id: DocumentId) -> Result<Document, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        docs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn write(&self, id: DocumentId, patch: DocumentPatch) -> Result<Document, StoreError> {
        // The write lock serializes concurrent writers; whoever takes it last wins.
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        patch.apply(doc, now_millis());
        Ok(doc.clone())
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Document>, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut owned: Vec<Document> = docs
            .values()
            .filter(|doc| &doc.owner_id == owner)
            .cloned()
            .collect();
        sort_newest_first(&mut owned);
        Ok(owned)
    }
}
