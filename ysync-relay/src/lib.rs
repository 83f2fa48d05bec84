//! # ysync-relay - CRDT update log persistence and sync relay
//!
//! Persists streams of Yjs update blobs per document and relays them in
//! real time between the WebSocket connections of the same document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  base64 frames  ┌─────────────┐   store/load   ┌─────────────────────┐
//! │ Client      │ ◄─────────────► │ SyncServer  │ ─────────────► │ DocumentPersistence │
//! │ (Yjs doc)   │    WebSocket    │ + SyncRelay │                │ (FIFO queue)        │
//! └─────────────┘                 └──────┬──────┘                └──────────┬──────────┘
//!                                        │ fan-out                          │
//!                                        ▼                                  ▼
//!                                 ┌─────────────┐                  ┌────────────────┐
//!                                 │ Broadcaster │                  │ UpdateLogStore │
//!                                 │ (hub)       │                  │ (KvBackend)    │
//!                                 └─────────────┘                  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: key schema, value codecs, RocksDB and in-memory tables
//! - [`crdt`]: merge / diff / state vector via `yrs`
//! - [`persistence`]: clock allocation, compaction, state-vector cache
//! - [`protocol`]: sync and awareness frame codec
//! - [`awareness`]: ephemeral awareness state
//! - [`relay`]: per-frame relay handler
//! - [`broadcast`]: delivery and fan-out
//! - [`registry`]: document → connection registry
//! - [`auth`]: token gate
//! - [`server`]: WebSocket server

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod crdt;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

/// Per-document log sequence number.
pub type Clock = u64;

// Re-exports for convenience
pub use auth::{Admission, AuthError, TokenGate};
pub use awareness::{AwarenessChanges, AwarenessEntry, AwarenessState};
pub use broadcast::{BroadcastReport, Broadcaster, ConnectionHub, DeliveryError, HubStats};
pub use crdt::{CrdtError, MergedDocument};
pub use persistence::{DocumentPersistence, PersistenceConfig, PersistenceError};
pub use protocol::{Frame, MessageKind, ProtocolError, SyncKind};
pub use registry::{ConnectionRegistry, TableConnectionRegistry};
pub use relay::{RelayRequest, RelayResponse, SyncRelay};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    KvBackend, MemoryTable, MetaValue, RocksDb, RocksTable, ScanOrder, StoreConfig, StoreError,
    UpdateLogStore,
};
