//! WebSocket front end for the persistence coordinator.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── DocumentStore (memory / RocksDB)
//!            ├── Connection task ─────┤
//! Client B ──┘     │        ▲         └── SyncChannel<ChangeNotification>
//!                  │        │                      │
//!                  │        └── forward task ◄─────┘ (one per subscribed doc)
//!                  ▼
//!           Open / Create / Save / Subscribe replies
//! ```
//!
//! One task per connection. Replies are written directly; change
//! notifications of subscribed documents arrive through an outgoing queue
//! fed by per-document forward tasks. Every notification is forwarded,
//! including the ones caused by this connection's own saves.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{SyncChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::coordinator::PersistenceCoordinator;
use crate::document::{ChangeNotification, DocumentId, SessionId};
use crate::error::SyncError;
use crate::protocol::{MessageType, SyncMessage};
use crate::storage::{MemoryStore, RocksStore, SharedStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-subscriber buffer of the sync channel and per-connection outgoing queue
    pub channel_capacity: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Change notifications written to sockets
    pub forwarded_changes: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<PersistenceCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the configured store and build the server around it.
    pub fn open(config: ServerConfig) -> Result<Self, SyncError> {
        let store: SharedStore = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path.clone()))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Server over an existing store.
    pub fn with_store(config: ServerConfig, store: SharedStore) -> Self {
        let channel = Arc::new(SyncChannel::new(config.channel_capacity));
        Self {
            coordinator: Arc::new(PersistenceCoordinator::new(store, channel)),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let queue_capacity = self.config.channel_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, coordinator, stats, queue_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<PersistenceCoordinator>,
        stats: Arc<RwLock<ServerStats>>,
        queue_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(queue_capacity.max(1));
        let mut conn = Connection::new(addr, coordinator, out_tx);

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let request = match SyncMessage::decode(&data) {
                                Ok(request) => request,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            if let Some(reply) = conn.dispatch(request).await {
                                let encoded = match reply.encode() {
                                    Ok(encoded) => encoded,
                                    Err(e) => {
                                        log::error!("Failed to encode reply for {addr}: {e}");
                                        continue;
                                    }
                                };
                                if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                                    break Err(e.into());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                Some(change) = out_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Binary(change.into())).await {
                        break Err(e.into());
                    }
                    stats.write().await.forwarded_changes += 1;
                }
            }
        };

        conn.teardown().await;
        stats.write().await.active_connections -= 1;
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }
}

/// Per-connection request handling and subscription bookkeeping.
struct Connection {
    addr: SocketAddr,
    coordinator: Arc<PersistenceCoordinator>,
    /// Sender id stamped on replies and forwarded changes
    server_id: SessionId,
    out_tx: mpsc::Sender<Vec<u8>>,
    forwards: HashMap<DocumentId, JoinHandle<()>>,
}

impl Connection {
    fn new(
        addr: SocketAddr,
        coordinator: Arc<PersistenceCoordinator>,
        out_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            addr,
            coordinator,
            server_id: SessionId::new("server"),
            out_tx,
            forwards: HashMap::new(),
        }
    }

    /// Handle one request; `None` when the frame needs no reply.
    async fn dispatch(&mut self, msg: SyncMessage) -> Option<SyncMessage> {
        let request_id = msg.request_id;
        let doc_id = msg.doc_id;
        match self.handle(msg).await {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("Request {request_id} from {} failed: {e}", self.addr);
                match SyncMessage::error(self.server_id.clone(), doc_id, request_id, &e) {
                    Ok(reply) => Some(reply),
                    Err(encode_err) => {
                        log::error!("Failed to build error reply: {encode_err}");
                        None
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: SyncMessage) -> Result<Option<SyncMessage>, SyncError> {
        let server_id = self.server_id.clone();
        let reply = match msg.msg_type {
            MessageType::Open => {
                let doc = self.coordinator.open(msg.require_doc_id()?).await?;
                SyncMessage::snapshot(server_id, msg.request_id, &doc)?
            }
            MessageType::Create => {
                let doc = self.coordinator.create(msg.new_document()?).await?;
                SyncMessage::snapshot(server_id, msg.request_id, &doc)?
            }
            MessageType::Save => {
                let doc_id = msg.require_doc_id()?;
                let request = msg.save_request()?;
                let doc = self
                    .coordinator
                    .save(doc_id, request.title, request.content, &msg.session_id)
                    .await?;
                SyncMessage::saved(server_id, msg.request_id, &doc)?
            }
            MessageType::Subscribe => {
                let doc_id = msg.require_doc_id()?;
                self.subscribe(doc_id).await?;
                SyncMessage::subscribed(server_id, doc_id, msg.request_id)
            }
            MessageType::Unsubscribe => {
                self.unsubscribe(msg.require_doc_id()?).await;
                return Ok(None);
            }
            MessageType::Ping => SyncMessage::pong(server_id, msg.request_id),
            other => {
                log::debug!("Unhandled message type from {}: {other:?}", self.addr);
                return Ok(None);
            }
        };
        Ok(Some(reply))
    }

    /// Start forwarding changes of `doc_id`. Idempotent per connection.
    async fn subscribe(&mut self, doc_id: DocumentId) -> Result<(), SyncError> {
        if self.forwards.contains_key(&doc_id) {
            return Ok(());
        }

        let mut subscription = self
            .coordinator
            .channel()
            .subscribe(&ChangeNotification::topic(doc_id))
            .await?;
        let out_tx = self.out_tx.clone();
        let server_id = self.server_id.clone();
        let addr = self.addr;

        let handle = tokio::spawn(async move {
            while let Some(notification) = subscription.recv().await {
                let frame = match SyncMessage::change(server_id.clone(), &notification)
                    .and_then(|msg| msg.encode())
                {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Dropping change of {doc_id} for {addr}: {e}");
                        continue;
                    }
                };
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        self.forwards.insert(doc_id, handle);
        log::info!("{} subscribed to {doc_id}", self.addr);
        Ok(())
    }

    async fn unsubscribe(&mut self, doc_id: DocumentId) {
        if let Some(handle) = self.forwards.remove(&doc_id) {
            handle.abort();
            // Wait for the task to drop its receiver before releasing the topic
            let _ = handle.await;
            self.coordinator
                .channel()
                .release(&ChangeNotification::topic(doc_id))
                .await;
            log::info!("{} unsubscribed from {doc_id}", self.addr);
        }
    }

    async fn teardown(&mut self) {
        let docs: Vec<DocumentId> = self.forwards.keys().copied().collect();
        for doc_id in docs {
            self.unsubscribe(doc_id).await;
        }
    }
}
