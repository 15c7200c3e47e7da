//! Document model shared by the store, the coordinator and editing sessions.
//!
//! The sync layer never looks inside `content`: it is whatever string the
//! editor widget produced (rich text, HTML, markdown).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::channel::Topic;

/// Title given to documents created without one.
pub const DEFAULT_TITLE: &str = "Untitled Canvas";

/// Namespace of the change-notification topics on the sync channel.
pub const CANVAS_NAMESPACE: &str = "canvas";

/// Opaque document identifier, immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of one open client session. Used as the `origin_id` of saves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh, random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the user that created a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is editing, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_id: SessionId,
    pub user_id: OwnerId,
    pub display_name: String,
}

impl Identity {
    /// Identity for a new session of the given user.
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            session_id: SessionId::generate(),
            user_id: OwnerId::new(user_id),
            display_name: display_name.into(),
        }
    }

    /// Identity with an explicit session id (for testing).
    pub fn with_session(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: SessionId::new(session_id),
            user_id: OwnerId::new(user_id),
            display_name: display_name.into(),
        }
    }
}

/// The durable record of one canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    pub owner_id: OwnerId,
    pub owner_name: String,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    /// Milliseconds since the Unix epoch, never earlier than `created_at`
    pub updated_at: u64,
}

/// Creation request for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    /// Caller-chosen id; a fresh one is generated when `None`
    pub id: Option<DocumentId>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub owner_id: OwnerId,
    pub owner_name: String,
}

impl NewDocument {
    pub fn new(owner_id: impl Into<String>, owner_name: impl Into<String>) -> Self {
        Self {
            id: None,
            title: None,
            content: None,
            owner_id: OwnerId::new(owner_id),
            owner_name: owner_name.into(),
        }
    }

    /// A document owned by the user behind `identity`.
    pub fn owned_by(identity: &Identity) -> Self {
        Self {
            id: None,
            title: None,
            content: None,
            owner_id: identity.user_id.clone(),
            owner_name: identity.display_name.clone(),
        }
    }

    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Owner id and owner name are the only required fields.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.owner_id.as_str().trim().is_empty() {
            return Err("owner id is required".to_string());
        }
        if self.owner_name.trim().is_empty() {
            return Err("owner name is required".to_string());
        }
        Ok(())
    }

    pub(crate) fn into_document(self, now: u64) -> Document {
        Document {
            id: self.id.unwrap_or_default(),
            title: self.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            content: self.content.unwrap_or_default(),
            owner_id: self.owner_id,
            owner_name: self.owner_name,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied by `DocumentStore::write`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl DocumentPatch {
    /// Replace both title and content.
    pub fn full(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: Some(content.into()),
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: None,
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            title: None,
            content: Some(content.into()),
        }
    }

    /// Apply to `doc`. `updated_at` moves even when nothing else changes.
    ///
    /// Every write strictly advances `updated_at`, also when two writes land
    /// in the same millisecond or the clock stepped back, so it orders the
    /// writes of one document.
    pub(crate) fn apply(self, doc: &mut Document, now: u64) {
        if let Some(title) = self.title {
            doc.title = title;
        }
        if let Some(content) = self.content {
            doc.content = content;
        }
        doc.updated_at = now
            .max(doc.created_at)
            .max(doc.updated_at.saturating_add(1));
    }
}

/// Fan-out message published after every successful persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub document_id: DocumentId,
    pub title: String,
    pub content: String,
    /// Session whose save produced this change
    pub origin_id: SessionId,
    /// `updated_at` of the write being announced
    pub updated_at: u64,
}

impl ChangeNotification {
    pub fn new(document: &Document, origin_id: SessionId) -> Self {
        Self {
            document_id: document.id,
            title: document.title.clone(),
            content: document.content.clone(),
            origin_id,
            updated_at: document.updated_at,
        }
    }

    /// The channel topic carrying changes of `document_id`.
    pub fn topic(document_id: DocumentId) -> Topic<ChangeNotification> {
        Topic::new(CANVAS_NAMESPACE, document_id)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_defaults() {
        let doc = NewDocument::new("user-1", "Ada").into_document(1_000);
        assert_eq!(doc.title, DEFAULT_TITLE);
        assert_eq!(doc.content, "");
        assert_eq!(doc.created_at, 1_000);
        assert_eq!(doc.updated_at, 1_000);
    }

    #[test]
    fn test_new_document_keeps_explicit_id() {
        let id = DocumentId::new();
        let doc = NewDocument::new("user-1", "Ada").with_id(id).into_document(1);
        assert_eq!(doc.id, id);
    }

    #[test]
    fn test_validate_requires_owner() {
        assert!(NewDocument::new("", "Ada").validate().is_err());
        assert!(NewDocument::new("user-1", "  ").validate().is_err());
        assert!(NewDocument::new("user-1", "Ada").validate().is_ok());
    }

    #[test]
    fn test_patch_touches_updated_at_without_changes() {
        let mut doc = NewDocument::new("u", "n").with_title("T").into_document(100);
        DocumentPatch::default().apply(&mut doc, 250);
        assert_eq!(doc.title, "T");
        assert_eq!(doc.updated_at, 250);
    }

    #[test]
    fn test_patch_never_moves_before_creation() {
        let mut doc = NewDocument::new("u", "n").into_document(500);
        DocumentPatch::content("body").apply(&mut doc, 10);
        assert_eq!(doc.content, "body");
        assert!(doc.updated_at >= doc.created_at);
    }

    #[test]
    fn test_writes_in_same_millisecond_are_ordered() {
        let mut doc = NewDocument::new("u", "n").into_document(100);
        DocumentPatch::content("first").apply(&mut doc, 200);
        let first = doc.updated_at;
        DocumentPatch::content("second").apply(&mut doc, 200);
        assert!(doc.updated_at > first);

        let mut notes = vec![ChangeNotification::new(&doc, SessionId::new("s"))];
        DocumentPatch::content("third").apply(&mut doc, 150);
        notes.push(ChangeNotification::new(&doc, SessionId::new("s")));
        assert!(notes[1].updated_at > notes[0].updated_at);
    }

    #[test]
    fn test_partial_patch_leaves_other_field() {
        let mut doc = NewDocument::new("u", "n")
            .with_title("Old")
            .with_content("keep")
            .into_document(1);
        DocumentPatch::title("New").apply(&mut doc, 2);
        assert_eq!(doc.title, "New");
        assert_eq!(doc.content, "keep");
    }

    #[test]
    fn test_document_id_parse_display() {
        let id = DocumentId::new();
        let parsed: DocumentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<DocumentId>().is_err());
    }

    #[test]
    fn test_identity_sessions_are_distinct() {
        let a = Identity::new("user-1", "Ada");
        let b = Identity::new("user-1", "Ada");
        assert_eq!(a.user_id, b.user_id);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn test_notification_topic_per_document() {
        let a = DocumentId::new();
        let b = DocumentId::new();
        assert_eq!(ChangeNotification::topic(a), ChangeNotification::topic(a));
        assert_ne!(ChangeNotification::topic(a), ChangeNotification::topic(b));
    }
}
