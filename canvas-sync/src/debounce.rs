//! Coalesces bursts of local edits into one persist after a quiet period.
//!
//! Each edit aborts the sleeping timer and spawns a new one, so only the
//! last edit of a burst reaches the backend. Once a timer wakes it removes
//! its own handle before saving; from then on it cannot be aborted and an
//! in-flight save always runs to completion.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::backend::SharedBackend;
use crate::document::{Document, DocumentId, SessionId};
use crate::error::SyncError;
use crate::reconciler::{SessionState, SyncStatus};
use crate::session::{self, SessionEvent};

pub struct Debouncer {
    inner: Arc<DebounceInner>,
}

struct DebounceInner {
    backend: SharedBackend,
    document_id: DocumentId,
    origin: SessionId,
    delay: Duration,
    state: Arc<Mutex<SessionState>>,
    /// One save at a time per session
    save_lock: Mutex<()>,
    events: mpsc::Sender<SessionEvent>,
}

impl Debouncer {
    pub(crate) fn new(
        backend: SharedBackend,
        document_id: DocumentId,
        origin: SessionId,
        delay: Duration,
        state: Arc<Mutex<SessionState>>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                backend,
                document_id,
                origin,
                delay,
                state,
                save_lock: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Apply the edit locally and (re)start the quiet-period timer.
    pub async fn on_local_edit(&self, title: String, content: String) {
        let mut state = self.inner.state.lock().await;
        let before = state.status();
        let seq = state.record_local_edit(title, content);

        if let Some(timer) = state.pending_timer.take() {
            timer.abort();
        }
        let inner = self.inner.clone();
        state.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.delay).await;
            inner.fire(seq).await;
        }));
        let status = state.status();
        drop(state);

        if status != before {
            self.inner.emit(SessionEvent::StatusChanged(status));
        }
    }

    /// Cancel a sleeping timer and persist the pending edit now.
    ///
    /// Waits for an in-flight save first. Returns `Ok(None)` when there
    /// was nothing left to persist.
    pub async fn flush(&self) -> Result<Option<Document>, SyncError> {
        self.cancel().await;
        self.inner.persist().await
    }

    /// Cancel a sleeping timer without saving.
    pub async fn cancel(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.pending_timer.take() {
            timer.abort();
        }
    }
}

impl DebounceInner {
    async fn fire(&self, seq: u64) {
        {
            let mut state = self.state.lock().await;
            // A newer edit owns the timer slot now
            if state.edit_seq != seq {
                return;
            }
            state.pending_timer = None;
        }

        if let Err(e) = self.persist().await {
            log::debug!("Debounced save of {} failed: {e}", self.document_id);
        }
    }

    async fn persist(&self) -> Result<Option<Document>, SyncError> {
        let _guard = self.save_lock.lock().await;

        let edit = {
            let mut state = self.state.lock().await;
            match state.begin_save() {
                Some(edit) => edit,
                None => return Ok(None),
            }
        };
        self.emit(SessionEvent::StatusChanged(SyncStatus::Saving));

        let result = self
            .backend
            .save(
                self.document_id,
                edit.title.clone(),
                edit.content.clone(),
                &self.origin,
            )
            .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(doc) => {
                state.complete_save(&edit, &doc);
                let status = state.status();
                drop(state);

                log::debug!("Session {} saved {}", self.origin, self.document_id);
                self.emit(SessionEvent::Saved(doc.clone()));
                self.emit(SessionEvent::StatusChanged(status));
                Ok(Some(doc))
            }
            Err(e) => {
                state.fail_save(edit, e.clone());
                let status = state.status();
                drop(state);

                log::warn!(
                    "Session {} could not save {}: {e}",
                    self.origin,
                    self.document_id
                );
                self.emit(SessionEvent::SaveFailed(e.clone()));
                self.emit(SessionEvent::StatusChanged(status));
                Err(e)
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        session::emit(&self.events, event);
    }
}
