//! One open document in one client session.
//!
//! `EditSession::open` performs the bootstrap read, subscribes to the
//! document's change topic and starts a listener task that folds remote
//! changes into the local state. Local edits go through the debouncer.
//! `close` flushes outstanding edits before the subscription is torn down.
//! A session dropped without `close` still stops its listener, which hands
//! the subscription back to the backend on its way out.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::backend::SharedBackend;
use crate::channel::Subscription;
use crate::debounce::Debouncer;
use crate::document::{ChangeNotification, Document, DocumentId, Identity, SessionId};
use crate::error::SyncError;
use crate::reconciler::{Reconciler, Reconciliation, SessionSnapshot, SessionState, SyncStatus};

/// Quiet period before a burst of edits is persisted.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Events buffered for the UI before new ones are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub debounce: Duration,
    /// Bound of the event queue; events past it are dropped
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            debounce,
            ..Self::default()
        }
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// UI-facing notifications from a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SyncStatus),
    /// "Last updated by another session"
    RemoteApplied { origin: SessionId },
    /// "Not saved"; the edit stays pending until the next edit or retry
    SaveFailed(SyncError),
    Saved(Document),
    /// The change stream ended (channel closed or connection lost)
    SubscriptionLost,
}

/// Queue an event for the UI. Events are advisory: when the queue is full
/// or nobody took the receiver, the event is dropped.
pub(crate) fn emit(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        log::debug!("Session event queue full, dropping {event:?}");
    }
}

pub struct EditSession {
    identity: Identity,
    document_id: DocumentId,
    backend: SharedBackend,
    state: Arc<Mutex<SessionState>>,
    debouncer: Debouncer,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    listener: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl EditSession {
    /// Bootstrap-read `document_id`, subscribe to its changes and start
    /// listening.
    pub async fn open(
        backend: SharedBackend,
        identity: Identity,
        document_id: DocumentId,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let doc = backend.open(document_id).await?;
        let subscription = backend.subscribe(document_id).await?;

        let state = Arc::new(Mutex::new(SessionState::from_document(&doc)));
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));

        let debouncer = Debouncer::new(
            backend.clone(),
            document_id,
            identity.session_id.clone(),
            config.debounce,
            state.clone(),
            events.clone(),
        );

        let reconciler = Reconciler::new(identity.session_id.clone(), document_id);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(listen(
            backend.clone(),
            subscription,
            reconciler,
            state.clone(),
            events,
            shutdown_rx,
        ));

        log::info!(
            "Session {} ({}) opened {document_id}",
            identity.session_id,
            identity.display_name
        );

        Ok(Self {
            identity,
            document_id,
            backend,
            state,
            debouncer,
            event_rx: Some(event_rx),
            listener: Some((shutdown_tx, handle)),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn session_id(&self) -> &SessionId {
        &self.identity.session_id
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Called by the editor on every change. Returns once the local state
    /// reflects the edit; persisting happens after the quiet period.
    pub async fn on_local_edit(&self, title: impl Into<String>, content: impl Into<String>) {
        self.debouncer.on_local_edit(title.into(), content.into()).await;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn status(&self) -> SyncStatus {
        self.state.lock().await.status()
    }

    /// Persist the pending edit now instead of waiting for the timer.
    pub async fn flush(&self) -> Result<Option<Document>, SyncError> {
        self.debouncer.flush().await
    }

    /// Explicit retry after a failed save.
    pub async fn retry(&self) -> Result<Option<Document>, SyncError> {
        self.flush().await
    }

    /// Re-read the document. Adopted only when nothing local is pending,
    /// since missed notifications are never replayed.
    pub async fn refresh(&self) -> Result<Document, SyncError> {
        let doc = self.backend.open(self.document_id).await?;
        let adopted = self.state.lock().await.adopt(&doc);
        if adopted {
            log::debug!("Session {} refreshed {}", self.session_id(), self.document_id);
        }
        Ok(doc)
    }

    /// Flush pending edits, then stop listening and unsubscribe.
    ///
    /// Teardown happens even if the flush fails; the flush error is returned.
    pub async fn close(mut self) -> Result<(), SyncError> {
        let flushed = self.debouncer.flush().await;

        if let Some((shutdown, handle)) = self.listener.take() {
            let _ = shutdown.send(());
            // The listener unsubscribes before it exits
            if let Err(e) = handle.await {
                log::warn!("Session listener for {} failed: {e}", self.document_id);
            }
        }

        log::info!("Session {} closed {}", self.session_id(), self.document_id);
        flushed.map(|_| ())
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        // Not closed: the listener still unsubscribes on its way out
        if let Some((shutdown, _)) = self.listener.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn listen(
    backend: SharedBackend,
    mut subscription: Subscription<ChangeNotification>,
    reconciler: Reconciler,
    state: Arc<Mutex<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            _ = &mut shutdown => break,
            next = subscription.recv() => next,
        };

        let Some(notification) = next else {
            log::warn!(
                "Change stream for session {} ended",
                reconciler.session_id()
            );
            emit(&events, SessionEvent::SubscriptionLost);
            return;
        };

        let outcome = {
            let mut state = state.lock().await;
            reconciler.reconcile(&mut state, &notification)
        };
        match outcome {
            Reconciliation::Applied { while_pending } => {
                if while_pending {
                    log::debug!(
                        "Session {} applied remote change from {} over unsaved edits",
                        reconciler.session_id(),
                        notification.origin_id
                    );
                }
                emit(
                    &events,
                    SessionEvent::RemoteApplied {
                        origin: notification.origin_id.clone(),
                    },
                );
            }
            Reconciliation::IgnoredStale => log::debug!(
                "Session {} skipped an out-of-date change from {}",
                reconciler.session_id(),
                notification.origin_id
            ),
            Reconciliation::IgnoredEcho | Reconciliation::IgnoredForeign => {}
        }
    }
    backend.unsubscribe(subscription).await;
}
