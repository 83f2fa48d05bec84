//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws (base64 text frames)
//!             ├──► TokenGate ──► connection task ──► SyncRelay ──► DocumentPersistence
//! Client B ──┘                        ▲                  │                │
//!                                     │                  │                ▼
//!                                     │                  │          UpdateLogStore
//!                                     │                  ▼          (RocksDB / memory)
//!                                ConnectionHub ◄──── Broadcaster
//!                                (outbound channels)     ▲
//!                                                        │
//!                                              ConnectionRegistry
//! ```
//!
//! Each admitted connection is bound to the document id it presented during
//! the handshake and receives a fresh uuid as its connection id.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{Admission, TokenGate};
use crate::broadcast::ConnectionHub;
use crate::persistence::{DocumentPersistence, PersistenceConfig, DEFAULT_TRIM_THRESHOLD};
use crate::protocol::{from_transport, to_transport};
use crate::registry::{ConnectionRegistry, TableConnectionRegistry};
use crate::relay::{RelayRequest, SyncRelay};
use crate::storage::{
    KvBackend, MemoryTable, RocksDb, StoreConfig, StoreError, UpdateLogStore, CF_CONNECTIONS,
    CF_DOCUMENTS, DEFAULT_MAX_BATCH_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared secret clients must present; `None` rejects every connection
    pub auth_token: Option<String>,
    /// RocksDB directory (None = in-memory tables)
    pub storage_path: Option<PathBuf>,
    /// Log length that triggers compaction on load
    pub trim_threshold: usize,
    /// Keys per bulk delete
    pub max_batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_token: None,
            storage_path: None,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub protocol_errors: u64,
}

/// State shared by every connection task.
struct Shared {
    gate: TokenGate,
    relay: SyncRelay,
    hub: ConnectionHub,
    registry: Arc<dyn ConnectionRegistry>,
    stats: RwLock<ServerStats>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    registry: TableConnectionRegistry,
    /// Keeps the database open for the server's lifetime.
    db: Option<RocksDb>,
}

impl SyncServer {
    /// Build the server and open its storage. Must be called inside a
    /// tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let (documents, connections, db): (Arc<dyn KvBackend>, Arc<dyn KvBackend>, _) =
            match &config.storage_path {
                Some(path) => {
                    let db = RocksDb::open(StoreConfig {
                        path: path.clone(),
                        max_batch_size: config.max_batch_size,
                        ..StoreConfig::default()
                    })?;
                    (
                        Arc::new(db.table(CF_DOCUMENTS)?),
                        Arc::new(db.table(CF_CONNECTIONS)?),
                        Some(db),
                    )
                }
                None => (
                    Arc::new(MemoryTable::with_batch_size(config.max_batch_size)),
                    Arc::new(MemoryTable::with_batch_size(config.max_batch_size)),
                    None,
                ),
            };

        let persistence = DocumentPersistence::new(
            UpdateLogStore::new(documents),
            PersistenceConfig::with_trim_threshold(config.trim_threshold),
        );
        let registry = TableConnectionRegistry::new(connections);
        let hub = ConnectionHub::new();
        let relay = SyncRelay::new(persistence, Arc::new(registry.clone()), Arc::new(hub.clone()));

        let gate = TokenGate::new(config.auth_token.clone());
        if !gate.is_configured() {
            log::warn!("No auth token configured; every connection will be rejected");
        }

        Ok(Self {
            shared: Arc::new(Shared {
                gate,
                relay,
                hub,
                registry: Arc::new(registry.clone()),
                stats: RwLock::new(ServerStats::default()),
            }),
            registry,
            db,
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn relay(&self) -> &SyncRelay {
        &self.shared.relay
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.shared.hub
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        match self.registry.clear().await {
            Ok(0) => {}
            Ok(n) => log::info!("Dropped {n} stale connection registrations"),
            Err(e) => log::warn!("Failed to clear connection registry: {e}"),
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut admitted: Option<Admission> = None;
    let gate = &shared.gate;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let header = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok());
        let admission = gate
            .admit(header)
            .map_err(|e| reject(StatusCode::UNAUTHORIZED, e.to_string()))?;
        let selected = HeaderValue::from_str(&admission.document_id)
            .map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?;
        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, selected);
        admitted = Some(admission);
        Ok(response)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            shared.stats.write().await.rejected_connections += 1;
            log::info!("Rejected connection from {addr}: {e}");
            return Ok(());
        }
    };
    let Some(Admission { document_id }) = admitted else {
        return Ok(());
    };

    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut outbound = shared.hub.register(&connection_id).await;
    if let Err(e) = shared.registry.put(&document_id, &connection_id).await {
        log::warn!("Failed to register {connection_id} on '{document_id}': {e}");
    }
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("Connection {connection_id} from {addr} joined '{document_id}'");

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => match from_transport(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Dropping message from {connection_id}: {e}");
                            shared.stats.write().await.protocol_errors += 1;
                            continue;
                        }
                    },
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {connection_id}: {e}");
                        break;
                    }
                };

                let request = RelayRequest {
                    document_id: document_id.clone(),
                    sender_connection_id: connection_id.clone(),
                    frame,
                };
                let result = shared.relay.handle(&request).await;
                let mut s = shared.stats.write().await;
                s.total_frames += 1;
                if let Err(e) = result {
                    s.protocol_errors += 1;
                    log::warn!("Protocol error from {connection_id}: {e}");
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_sender.send(Message::text(to_transport(&frame))).await {
                    log::warn!("Send to {connection_id} failed: {e}");
                    break;
                }
            }
        }
    }

    shared.hub.unregister(&connection_id).await;
    if let Err(e) = shared.registry.delete(&document_id, &connection_id).await {
        log::warn!("Failed to unregister {connection_id} from '{document_id}': {e}");
    }
    shared.stats.write().await.active_connections -= 1;
    log::info!("Connection {connection_id} left '{document_id}'");
    Ok(())
}
