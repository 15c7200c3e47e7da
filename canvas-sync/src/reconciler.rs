//! Per-session local state and how remote changes are folded into it.
//!
//! ```text
//!            edit                 timer fires            ack, no newer edit
//!   Clean ─────────► Dirty ───────────────────► Saving ─────────────────────► Clean
//!                    ▲   │ edit                   │
//!                    │   └──────┘                 │ edit during save
//!                    └────────────────────────────┘ or save failed
//! ```
//!
//! Remote notifications are applied in every state. A session with a
//! pending edit will later overwrite what it just applied: this is the
//! last-write-wins model, not a merge.
//!
//! Every write carries the store's `updated_at`, which strictly increases
//! per document. The session remembers the newest one it shows, so a late
//! save ack or a late notification never replaces a newer stored value.

use tokio::task::JoinHandle;

use crate::document::{ChangeNotification, Document, DocumentId, SessionId};
use crate::error::SyncError;

/// What the UI shows next to the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Local view matches what this session last saw stored
    Clean,
    /// Local edits not yet persisted
    Dirty,
    /// A persist is in flight and no newer edit exists
    Saving,
}

/// The edit captured for the next persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEdit {
    pub title: String,
    pub content: String,
    /// Value of `edit_seq` when captured
    pub seq: u64,
}

/// Read-only view of a session for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub title: String,
    pub content: String,
    pub status: SyncStatus,
    pub last_error: Option<SyncError>,
    /// Set once a remote session's edit has been applied
    pub last_remote_origin: Option<SessionId>,
}

#[derive(Debug)]
pub struct SessionState {
    pub last_known_title: String,
    pub last_known_content: String,
    /// Store `updated_at` of the write the local view was last taken from
    pub last_known_updated_at: u64,
    pub dirty: bool,
    pub saving: bool,
    pub(crate) pending_timer: Option<JoinHandle<()>>,
    pub(crate) pending_edit: Option<LocalEdit>,
    pub(crate) edit_seq: u64,
    pub last_error: Option<SyncError>,
    pub last_remote_origin: Option<SessionId>,
}

impl SessionState {
    /// Clean state seeded from the bootstrap read.
    pub fn from_document(doc: &Document) -> Self {
        Self {
            last_known_title: doc.title.clone(),
            last_known_content: doc.content.clone(),
            last_known_updated_at: doc.updated_at,
            dirty: false,
            saving: false,
            pending_timer: None,
            pending_edit: None,
            edit_seq: 0,
            last_error: None,
            last_remote_origin: None,
        }
    }

    pub fn status(&self) -> SyncStatus {
        if self.saving && self.pending_edit.is_none() {
            SyncStatus::Saving
        } else if self.dirty {
            SyncStatus::Dirty
        } else {
            SyncStatus::Clean
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            title: self.last_known_title.clone(),
            content: self.last_known_content.clone(),
            status: self.status(),
            last_error: self.last_error.clone(),
            last_remote_origin: self.last_remote_origin.clone(),
        }
    }

    /// Apply a local edit immediately and capture it for the next persist.
    pub(crate) fn record_local_edit(&mut self, title: String, content: String) -> u64 {
        self.edit_seq += 1;
        self.last_known_title = title.clone();
        self.last_known_content = content.clone();
        self.dirty = true;
        self.pending_edit = Some(LocalEdit {
            title,
            content,
            seq: self.edit_seq,
        });
        self.edit_seq
    }

    /// Take the pending edit and mark the session as saving.
    pub(crate) fn begin_save(&mut self) -> Option<LocalEdit> {
        let edit = self.pending_edit.take()?;
        self.saving = true;
        Some(edit)
    }

    /// Settle a successful persist of `edit`. Returns true if the session
    /// is clean again (no edit arrived while the save was in flight).
    ///
    /// The acknowledged document is shown only when it is newer than any
    /// remote change applied meanwhile; otherwise that later write is the
    /// stored value and stays on screen.
    pub(crate) fn complete_save(&mut self, edit: &LocalEdit, stored: &Document) -> bool {
        self.saving = false;
        self.last_error = None;
        if self.edit_seq != edit.seq {
            self.last_known_updated_at = self.last_known_updated_at.max(stored.updated_at);
            return false;
        }
        self.dirty = false;
        if stored.updated_at > self.last_known_updated_at {
            self.last_known_title = stored.title.clone();
            self.last_known_content = stored.content.clone();
            self.last_known_updated_at = stored.updated_at;
        }
        true
    }

    /// Settle a failed persist: stay dirty and keep the edit for a retry,
    /// unless a newer edit has already replaced it.
    pub(crate) fn fail_save(&mut self, edit: LocalEdit, error: SyncError) {
        self.saving = false;
        self.dirty = true;
        if self.pending_edit.is_none() {
            self.pending_edit = Some(edit);
        }
        self.last_error = Some(error);
    }

    /// Adopt a freshly read document when no local edit is outstanding.
    pub(crate) fn adopt(&mut self, doc: &Document) -> bool {
        if self.dirty || self.saving {
            return false;
        }
        self.last_known_title = doc.title.clone();
        self.last_known_content = doc.content.clone();
        self.last_known_updated_at = doc.updated_at;
        true
    }
}

/// Outcome of folding one notification into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Produced by this session's own save
    IgnoredEcho,
    /// Belongs to another document
    IgnoredForeign,
    /// Announces a write older than what the session already shows
    IgnoredStale,
    /// Local view replaced; `while_pending` when local edits were outstanding
    Applied { while_pending: bool },
}

/// Applies incoming change notifications for one session and document.
#[derive(Debug, Clone)]
pub struct Reconciler {
    session_id: SessionId,
    document_id: DocumentId,
}

impl Reconciler {
    pub fn new(session_id: SessionId, document_id: DocumentId) -> Self {
        Self {
            session_id,
            document_id,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_self_echo(&self, notification: &ChangeNotification) -> bool {
        notification.origin_id == self.session_id
    }

    pub fn reconcile(
        &self,
        state: &mut SessionState,
        notification: &ChangeNotification,
    ) -> Reconciliation {
        if notification.document_id != self.document_id {
            return Reconciliation::IgnoredForeign;
        }
        if self.is_self_echo(notification) {
            return Reconciliation::IgnoredEcho;
        }
        if notification.updated_at <= state.last_known_updated_at {
            return Reconciliation::IgnoredStale;
        }

        // Dirty/saving flags are left alone: the pending save still goes out
        let while_pending = state.dirty || state.saving;
        state.last_known_title = notification.title.clone();
        state.last_known_content = notification.content.clone();
        state.last_known_updated_at = notification.updated_at;
        state.last_remote_origin = Some(notification.origin_id.clone());
        Reconciliation::Applied { while_pending }
    }
}
