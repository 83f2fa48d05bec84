//! Persistent storage layer for document update logs.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────┐   ops    ┌────────────────┐
//! │ DocumentPersistence │ ───────► │ UpdateLogStore │
//! │ (per-instance queue)│          │ (key schema)   │
//! └─────────────────────┘          └───────┬────────┘
//!                                          │ KvBackend
//!                              ┌───────────┴───────────┐
//!                              ▼                       ▼
//!                       ┌─────────────┐         ┌─────────────┐
//!                       │ RocksTable  │         │ MemoryTable │
//!                       │ (one CF)    │         │ (BTreeMap)  │
//!                       └─────────────┘         └─────────────┘
//! ```
//!
//! Column families: `documents` holds updates, state vectors, meta and clock
//! counters; `connections` holds the connection registry.

pub mod backend;
pub mod codec;
pub mod keys;
pub mod memory;
pub mod rocks;
pub mod update_log;

pub use backend::{KvBackend, KvPair, ScanOrder, StoreError, DEFAULT_MAX_BATCH_SIZE};
pub use codec::{MetaValue, StateVectorRecord};
pub use memory::{MemoryTable, TableStats};
pub use rocks::{RocksDb, RocksTable, StoreConfig, CF_CONNECTIONS, CF_DOCUMENTS};
pub use update_log::UpdateLogStore;
