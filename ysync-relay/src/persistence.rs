//! Document persistence: clock allocation, compaction and state-vector caching.
//!
//! Every operation on one [`DocumentPersistence`] goes through a single FIFO
//! queue drained by a dedicated tokio task, so a compaction never interleaves
//! with a store issued through the same handle. Handles are cheap clones of
//! the queue sender and share that ordering.
//!
//! The queue is per instance, not a distributed lock. Two instances over the
//! same backing table can race on one document; clock allocation stays
//! correct because it is an atomic counter increment, and compaction only
//! deletes the clock range it actually merged.
//!
//! A queued operation that fails is logged and resolves to `None`. The
//! worker keeps draining the queue afterwards.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};

use crate::crdt::{self, CrdtError, MergedDocument};
use crate::storage::{MetaValue, StoreError, UpdateLogStore};
use crate::Clock;

/// Default number of log entries above which a load compacts the document.
pub const DEFAULT_TRIM_THRESHOLD: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("crdt error: {0}")]
    Crdt(#[from] CrdtError),
}

/// Persistence tuning.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Compact when a document's log holds more than this many updates
    pub trim_threshold: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
        }
    }
}

impl PersistenceConfig {
    pub fn with_trim_threshold(trim_threshold: usize) -> Self {
        Self { trim_threshold }
    }
}

type Reply<T> = oneshot::Sender<Option<T>>;

enum Action {
    StoreUpdate { doc: String, update: Vec<u8>, reply: Reply<Clock> },
    GetDocument { doc: String, reply: Reply<MergedDocument> },
    Compact { doc: String, reply: Reply<MergedDocument> },
    GetStateVector { doc: String, reply: Reply<Vec<u8>> },
    GetDiff { doc: String, peer_vector: Vec<u8>, reply: Reply<Vec<u8>> },
    ClearDocument { doc: String, reply: Reply<usize> },
    PutMeta { doc: String, key: String, value: MetaValue, reply: Reply<()> },
    GetMeta { doc: String, key: String, reply: Reply<Option<MetaValue>> },
    GetMetas { doc: String, reply: Reply<BTreeMap<String, MetaValue>> },
    DeleteMeta { doc: String, key: String, reply: Reply<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::StoreUpdate { .. } => "store_update",
            Action::GetDocument { .. } => "get_document",
            Action::Compact { .. } => "compact",
            Action::GetStateVector { .. } => "get_state_vector",
            Action::GetDiff { .. } => "get_diff",
            Action::ClearDocument { .. } => "clear_document",
            Action::PutMeta { .. } => "put_meta",
            Action::GetMeta { .. } => "get_meta",
            Action::GetMetas { .. } => "get_metas",
            Action::DeleteMeta { .. } => "delete_meta",
            Action::Shutdown { .. } => "shutdown",
        }
    }
}

/// Handle to a document persistence queue.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct DocumentPersistence {
    tx: mpsc::UnboundedSender<Action>,
    store: UpdateLogStore,
}

impl DocumentPersistence {
    pub fn new(store: UpdateLogStore, config: PersistenceConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            store: store.clone(),
            config,
        };
        tokio::spawn(worker.run(rx));
        Self { tx, store }
    }

    /// The underlying update log, bypassing the queue.
    pub fn store(&self) -> &UpdateLogStore {
        &self.store
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Action) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(build(reply)).is_err() {
            log::warn!("Persistence queue is closed; dropping request");
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Append an update, returning the clock it was stored at.
    pub async fn store_update(&self, doc: &str, update: Vec<u8>) -> Option<Clock> {
        let doc = doc.to_string();
        self.request(|reply| Action::StoreUpdate { doc, update, reply }).await
    }

    /// Merge the document's log, compacting it when over the trim threshold.
    pub async fn get_document(&self, doc: &str) -> Option<MergedDocument> {
        let doc = doc.to_string();
        self.request(|reply| Action::GetDocument { doc, reply }).await
    }

    /// Merge the whole log into a single snapshot update.
    pub async fn compact(&self, doc: &str) -> Option<MergedDocument> {
        let doc = doc.to_string();
        self.request(|reply| Action::Compact { doc, reply }).await
    }

    /// Current encoded state vector, served from cache when fresh.
    pub async fn get_state_vector(&self, doc: &str) -> Option<Vec<u8>> {
        let doc = doc.to_string();
        self.request(|reply| Action::GetStateVector { doc, reply }).await
    }

    /// Update bytes a peer at `peer_vector` is missing. Empty vector means everything.
    pub async fn get_diff(&self, doc: &str, peer_vector: &[u8]) -> Option<Vec<u8>> {
        let doc = doc.to_string();
        let peer_vector = peer_vector.to_vec();
        self.request(|reply| Action::GetDiff { doc, peer_vector, reply }).await
    }

    /// Delete the log, meta entries, state vector and clock of a document.
    pub async fn clear_document(&self, doc: &str) -> Option<usize> {
        let doc = doc.to_string();
        self.request(|reply| Action::ClearDocument { doc, reply }).await
    }

    pub async fn put_meta(&self, doc: &str, key: &str, value: MetaValue) -> Option<()> {
        let (doc, key) = (doc.to_string(), key.to_string());
        self.request(|reply| Action::PutMeta { doc, key, value, reply }).await
    }

    /// `Some(None)` when the key is absent, `None` when the read failed.
    pub async fn get_meta(&self, doc: &str, key: &str) -> Option<Option<MetaValue>> {
        let (doc, key) = (doc.to_string(), key.to_string());
        self.request(|reply| Action::GetMeta { doc, key, reply }).await
    }

    pub async fn get_metas(&self, doc: &str) -> Option<BTreeMap<String, MetaValue>> {
        let doc = doc.to_string();
        self.request(|reply| Action::GetMetas { doc, reply }).await
    }

    pub async fn delete_meta(&self, doc: &str, key: &str) -> Option<()> {
        let (doc, key) = (doc.to_string(), key.to_string());
        self.request(|reply| Action::DeleteMeta { doc, key, reply }).await
    }

    /// Finish everything queued so far, then stop the worker.
    ///
    /// Once this returns the worker has released its store. Later calls on
    /// any clone of this handle resolve to `None`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Action::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Merged log plus what the load did to it.
struct Loaded {
    merged: MergedDocument,
    last_clock: Option<Clock>,
    compacted: bool,
}

struct Worker {
    store: UpdateLogStore,
    config: PersistenceConfig,
}

fn settle<T>(op: &str, doc: &str, result: Result<T, PersistenceError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Persistence {op} failed for '{doc}': {e}");
            None
        }
    }
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Action>) {
        log::debug!("Persistence worker started");
        let mut stopped_by = None;
        while let Some(action) = rx.recv().await {
            log::trace!("Persistence action: {}", action.name());
            match action {
                Action::StoreUpdate { doc, update, reply } => {
                    let res = self.store_update(&doc, &update).await;
                    let _ = reply.send(settle("store_update", &doc, res));
                }
                Action::GetDocument { doc, reply } => {
                    let res = self.load(&doc).await.map(|l| l.merged);
                    let _ = reply.send(settle("get_document", &doc, res));
                }
                Action::Compact { doc, reply } => {
                    let res = self.compact(&doc).await;
                    let _ = reply.send(settle("compact", &doc, res));
                }
                Action::GetStateVector { doc, reply } => {
                    let res = self.state_vector(&doc).await;
                    let _ = reply.send(settle("get_state_vector", &doc, res));
                }
                Action::GetDiff { doc, peer_vector, reply } => {
                    let res = self.diff(&doc, &peer_vector).await;
                    let _ = reply.send(settle("get_diff", &doc, res));
                }
                Action::ClearDocument { doc, reply } => {
                    let res = self.store.delete_document(&doc).await.map_err(Into::into);
                    if let Ok(removed) = &res {
                        log::info!("Cleared document '{doc}' ({removed} records)");
                    }
                    let _ = reply.send(settle("clear_document", &doc, res));
                }
                Action::PutMeta { doc, key, value, reply } => {
                    let res = self.store.put_meta(&doc, &key, &value).await.map_err(Into::into);
                    let _ = reply.send(settle("put_meta", &doc, res));
                }
                Action::GetMeta { doc, key, reply } => {
                    let res = self.store.get_meta(&doc, &key).await.map_err(Into::into);
                    let _ = reply.send(settle("get_meta", &doc, res));
                }
                Action::GetMetas { doc, reply } => {
                    let res = self.store.get_metas(&doc).await.map_err(Into::into);
                    let _ = reply.send(settle("get_metas", &doc, res));
                }
                Action::DeleteMeta { doc, key, reply } => {
                    let res = self.store.delete_meta(&doc, &key).await.map_err(Into::into);
                    let _ = reply.send(settle("delete_meta", &doc, res));
                }
                Action::Shutdown { reply } => {
                    stopped_by = Some(reply);
                    break;
                }
            }
        }

        // Release the backing store before acknowledging shutdown.
        drop(rx);
        drop(self);
        log::debug!("Persistence worker stopped");
        if let Some(reply) = stopped_by {
            let _ = reply.send(());
        }
    }

    async fn store_update(&self, doc: &str, update: &[u8]) -> Result<Clock, PersistenceError> {
        let clock = self.store.next_clock(doc).await?;
        self.store.put_update(doc, clock, update).await?;

        // First update: make the document discoverable before any compaction.
        if clock == 0 {
            match crdt::merge_updates([update]) {
                Ok(merged) => self.store.put_state_vector(doc, &merged.state_vector, clock).await?,
                Err(e) => log::warn!("Skipping initial state vector for '{doc}': {e}"),
            }
        }
        Ok(clock)
    }

    async fn load(&self, doc: &str) -> Result<Loaded, PersistenceError> {
        let updates = self.store.get_updates(doc).await?;
        let merged = crdt::merge_updates(updates.iter().map(|(_, u)| u.as_slice()))?;
        let last_clock = updates.last().map(|(clock, _)| *clock);

        let compacted = match last_clock {
            Some(last) if updates.len() > self.config.trim_threshold => {
                self.write_compaction(doc, &merged, last, updates.len()).await?;
                true
            }
            _ => false,
        };

        Ok(Loaded {
            merged,
            last_clock,
            compacted,
        })
    }

    async fn compact(&self, doc: &str) -> Result<MergedDocument, PersistenceError> {
        let updates = self.store.get_updates(doc).await?;
        let merged = crdt::merge_updates(updates.iter().map(|(_, u)| u.as_slice()))?;
        if updates.len() > 1 {
            if let Some((last, _)) = updates.last() {
                self.write_compaction(doc, &merged, *last, updates.len()).await?;
            }
        }
        Ok(merged)
    }

    /// Snapshot and state vector are written before the merged range is
    /// deleted; a crash in between leaves the log over-complete.
    async fn write_compaction(
        &self,
        doc: &str,
        merged: &MergedDocument,
        last_merged: Clock,
        merged_count: usize,
    ) -> Result<Clock, PersistenceError> {
        let clock = self.store.next_clock(doc).await?;
        self.store.put_update(doc, clock, &merged.update).await?;
        self.store.put_state_vector(doc, &merged.state_vector, clock).await?;
        let removed = self.store.delete_updates_range(doc, 0, last_merged + 1).await?;

        log::info!(
            "Compacted '{doc}': {merged_count} updates -> snapshot at clock {clock} ({removed} removed)"
        );
        Ok(clock)
    }

    async fn state_vector(&self, doc: &str) -> Result<Vec<u8>, PersistenceError> {
        let current = self.store.get_current_clock(doc).await?;
        if let (Some(current), Some(cached)) = (current, self.store.get_state_vector(doc).await?) {
            if cached.watermark == current {
                return Ok(cached.vector);
            }
            log::debug!(
                "State vector for '{doc}' is stale (watermark {}, clock {current})",
                cached.watermark
            );
        }

        let loaded = self.load(doc).await?;
        if !loaded.compacted {
            if let Some(last) = loaded.last_clock {
                self.store
                    .put_state_vector(doc, &loaded.merged.state_vector, last)
                    .await?;
            }
        }
        Ok(loaded.merged.state_vector)
    }

    async fn diff(&self, doc: &str, peer_vector: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        let loaded = self.load(doc).await?;
        Ok(crdt::diff(&loaded.merged.update, peer_vector)?)
    }
}
