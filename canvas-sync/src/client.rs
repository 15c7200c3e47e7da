//! WebSocket client implementing `DocumentBackend` against a `SyncServer`.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Request/reply correlation by `request_id`
//! - A client-local `SyncChannel` that relays `Change` frames to the
//!   sessions of this process
//!
//! There is no offline queue and no automatic reconnect. While disconnected
//! every request fails; after reconnecting, sessions call `refresh` since
//! changes missed in between are not replayed.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::backend::DocumentBackend;
use crate::channel::{Subscription, SyncChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::document::{ChangeNotification, Document, DocumentId, NewDocument, SessionId};
use crate::error::SyncError;
use crate::protocol::{MessageType, ProtocolError, SaveRequest, SyncMessage};

/// How long a request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    /// Connection lost; pending requests failed and relayed subscriptions ended
    Disconnected,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>>;
type LinkSlot = Arc<RwLock<Option<Arc<Link>>>>;

/// One live connection. Every connect builds a fresh one, so nothing a
/// dropped connection leaves behind reaches the next.
struct Link {
    id: u64,
    /// Queue of the WebSocket writer task; the socket closes once every
    /// clone is gone
    outgoing: mpsc::Sender<Vec<u8>>,
    /// Requests sent on this connection awaiting their reply
    pending: PendingReplies,
    /// Closed when the connection drops, which ends its subscriptions
    relay: Arc<SyncChannel<ChangeNotification>>,
}

impl Link {
    /// Fail waiting requests and end relayed subscriptions.
    async fn shut_down(&self) {
        // Dropping the senders fails every waiting request
        self.pending.lock().await.clear();
        self.relay.close().await;
    }
}

/// Take link `id` out of `slot` unless a newer connection replaced it.
async fn release_link(
    slot: &RwLock<Option<Arc<Link>>>,
    state: &RwLock<ConnectionState>,
    id: u64,
) -> Option<Arc<Link>> {
    let mut current = slot.write().await;
    if current.as_ref().map(|link| link.id) != Some(id) {
        return None;
    }
    *state.write().await = ConnectionState::Disconnected;
    current.take()
}

/// The sync client. Share it behind an `Arc`; every method takes `&self`.
pub struct SyncClient {
    /// Sender id for frames not tied to a session
    client_id: SessionId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// The current connection, if any
    link: LinkSlot,
    next_link_id: AtomicU64,
    /// One connect attempt at a time
    connect_lock: Mutex<()>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl SyncClient {
    /// Create a client for `server_url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            client_id: SessionId::generate(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            link: Arc::new(RwLock::new(None)),
            next_link_id: AtomicU64::new(1),
            connect_lock: Mutex::new(()),
            next_request_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Connect to the server. A no-op while a connection is up.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        let _connecting = self.connect_lock.lock().await;
        if self.link.read().await.is_some() {
            return Ok(());
        }
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Could not connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(DEFAULT_CHANNEL_CAPACITY);
        let link = Arc::new(Link {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            outgoing: out_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            relay: Arc::new(SyncChannel::new(DEFAULT_CHANNEL_CAPACITY)),
        });
        {
            let mut slot = self.link.write().await;
            *slot = Some(link.clone());
            *self.state.write().await = ConnectionState::Connected;
        }
        log::info!("Connected to {}", self.server_url);
        let _ = self.event_tx.send(ClientEvent::Connected);

        // Writer task: forward outgoing queue to the socket, close when it ends
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: complete requests, relay changes. It keeps no sender
        // of the outgoing queue, so dropping the link closes the socket.
        let link_id = link.id;
        let pending = link.pending.clone();
        let relay = link.relay.clone();
        drop(link);
        let slot = self.link.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let url = self.server_url.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) => Self::route(msg, &pending, &relay).await,
                        Err(e) => log::warn!("Undecodable frame from {url}: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::error!("WebSocket error from {url}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Already torn down by `disconnect` otherwise
            if let Some(link) = release_link(&slot, &state, link_id).await {
                link.shut_down().await;
                log::info!("Disconnected from {url}");
                let _ = event_tx.send(ClientEvent::Disconnected);
            }
        });

        Ok(())
    }

    /// Close the connection. Pending requests fail and relayed
    /// subscriptions end; `connect` may be called again afterwards.
    pub async fn disconnect(&self) {
        let link = {
            let mut slot = self.link.write().await;
            let Some(link) = slot.take() else {
                return;
            };
            *self.state.write().await = ConnectionState::Disconnected;
            link
        };
        link.shut_down().await;
        // The writer task sends a close frame once its queue is dropped
        drop(link);
        log::info!("Disconnected from {}", self.server_url);
        let _ = self.event_tx.send(ClientEvent::Disconnected);
    }

    async fn route(
        msg: SyncMessage,
        pending: &PendingReplies,
        relay: &SyncChannel<ChangeNotification>,
    ) {
        match msg.msg_type {
            MessageType::Change => match msg.change_notification() {
                Ok(notification) => {
                    let topic = ChangeNotification::topic(notification.document_id);
                    if let Err(e) = relay.publish(&topic, notification).await {
                        log::debug!("Change not relayed: {e}");
                    }
                }
                Err(e) => log::warn!("Malformed change frame: {e}"),
            },
            MessageType::Snapshot
            | MessageType::Saved
            | MessageType::Subscribed
            | MessageType::Error
            | MessageType::Pong => {
                let waiter = pending.lock().await.remove(&msg.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => log::debug!("Reply for unknown request {}", msg.request_id),
                }
            }
            other => log::debug!("Unhandled message type: {other:?}"),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn current_link(&self) -> Option<Arc<Link>> {
        self.link.read().await.clone()
    }

    async fn send_frame(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self
            .current_link()
            .await
            .map(|link| link.outgoing.clone())
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send `msg` and wait for the frame carrying its `request_id`.
    ///
    /// The reply is awaited on the connection the request went out on.
    async fn request(&self, msg: SyncMessage) -> Result<SyncMessage, ProtocolError> {
        let encoded = msg.encode()?;
        let (outgoing, pending) = match self.current_link().await {
            Some(link) => (link.outgoing.clone(), link.pending.clone()),
            None => return Err(ProtocolError::ConnectionClosed),
        };

        let request_id = msg.request_id;
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(request_id, tx);

        let sent = outgoing.send(encoded).await;
        drop(outgoing);
        if sent.is_err() {
            pending.lock().await.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Round-trip a ping through the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let reply = self
            .request(SyncMessage::ping(self.client_id.clone(), self.next_request_id()))
            .await?;
        if reply.msg_type != MessageType::Pong {
            return Err(ProtocolError::InvalidMessageType(reply.msg_type));
        }
        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> &SessionId {
        &self.client_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Unwrap a reply of the `expected` type, surfacing server-side errors.
fn expect_reply(reply: SyncMessage, expected: MessageType) -> Result<SyncMessage, SyncError> {
    if reply.msg_type == MessageType::Error {
        return Err(reply.sync_error()?);
    }
    if reply.msg_type != expected {
        return Err(ProtocolError::InvalidMessageType(reply.msg_type).into());
    }
    Ok(reply)
}

/// Transport failures on document requests.
fn persist_failure(e: ProtocolError) -> SyncError {
    match e {
        ProtocolError::ConnectionClosed | ProtocolError::Timeout => {
            SyncError::PersistFailure(format!("sync server unreachable: {e}"))
        }
        other => SyncError::Protocol(other),
    }
}

/// Transport failures on subscribe.
fn channel_unavailable(e: ProtocolError) -> SyncError {
    match e {
        ProtocolError::ConnectionClosed | ProtocolError::Timeout => {
            SyncError::ChannelUnavailable(format!("sync server unreachable: {e}"))
        }
        other => SyncError::Protocol(other),
    }
}

#[async_trait]
impl DocumentBackend for SyncClient {
    async fn open(&self, id: DocumentId) -> Result<Document, SyncError> {
        let msg = SyncMessage::open(self.client_id.clone(), id, self.next_request_id());
        let reply = self.request(msg).await.map_err(persist_failure)?;
        Ok(expect_reply(reply, MessageType::Snapshot)?.document()?)
    }

    async fn create(&self, new: NewDocument) -> Result<Document, SyncError> {
        let msg = SyncMessage::create(self.client_id.clone(), self.next_request_id(), &new)?;
        let reply = self.request(msg).await.map_err(persist_failure)?;
        Ok(expect_reply(reply, MessageType::Snapshot)?.document()?)
    }

    async fn save(
        &self,
        id: DocumentId,
        title: String,
        content: String,
        origin: &SessionId,
    ) -> Result<Document, SyncError> {
        let request = SaveRequest { title, content };
        let msg = SyncMessage::save(origin.clone(), id, self.next_request_id(), &request)?;
        let reply = self.request(msg).await.map_err(persist_failure)?;
        Ok(expect_reply(reply, MessageType::Saved)?.document()?)
    }

    async fn subscribe(
        &self,
        id: DocumentId,
    ) -> Result<Subscription<ChangeNotification>, SyncError> {
        let relay = match self.current_link().await {
            Some(link) => link.relay.clone(),
            None => return Err(channel_unavailable(ProtocolError::ConnectionClosed)),
        };
        // Listen locally first so nothing relayed after `Subscribed` is missed
        let subscription = relay.subscribe(&ChangeNotification::topic(id)).await?;

        let msg = SyncMessage::subscribe(self.client_id.clone(), id, self.next_request_id());
        let confirmed = match self.request(msg).await {
            Ok(reply) => expect_reply(reply, MessageType::Subscribed).map(|_| ()),
            Err(e) => Err(channel_unavailable(e)),
        };
        if let Err(e) = confirmed {
            relay.unsubscribe(subscription).await;
            return Err(e);
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: Subscription<ChangeNotification>) {
        let id = subscription.topic().document_id();
        // A dropped connection already closed its relay
        let Some(link) = self.current_link().await else {
            return;
        };
        let last_local = link.relay.unsubscribe(subscription).await;
        drop(link);

        // Other sessions of this process may still watch the document
        if last_local {
            let msg = SyncMessage::unsubscribe(self.client_id.clone(), id);
            if let Err(e) = self.send_frame(&msg).await {
                log::debug!("Unsubscribe of {id} not sent: {e}");
            }
        }
    }
}
