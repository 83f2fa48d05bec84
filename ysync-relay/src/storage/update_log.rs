//! Schema-aware update log on top of a [`KvBackend`].
//!
//! Hides the key layout ([`keys`](super::keys)) and value encodings
//! ([`codec`](super::codec)) behind document-level operations. Bulk
//! deletions are chunked to the backend's batch limit and the chunks are
//! issued concurrently; the first failing chunk aborts the whole operation
//! and its error is returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::try_join_all;

use super::backend::{KvBackend, ScanOrder, StoreError};
use super::codec::{decode_update, encode_update, MetaValue, StateVectorRecord};
use super::keys;
use crate::Clock;

/// Document update log over one backing table.
#[derive(Clone)]
pub struct UpdateLogStore {
    backend: Arc<dyn KvBackend>,
}

impl UpdateLogStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Write an update at `clock`. Rewriting a clock replaces its bytes.
    pub async fn put_update(&self, doc_id: &str, clock: Clock, update: &[u8]) -> Result<(), StoreError> {
        let key = keys::update_key(doc_id, clock);
        self.backend.put(&key, &encode_update(update)).await
    }

    /// All updates of a document in ascending clock order.
    pub async fn get_updates(&self, doc_id: &str) -> Result<Vec<(Clock, Vec<u8>)>, StoreError> {
        let (start, end) = keys::all_updates_range(doc_id);
        let pairs = self.backend.scan(&start, &end, ScanOrder::Ascending, None).await?;

        pairs
            .into_iter()
            .map(|(key, value)| {
                let clock = keys::decode_update_clock(&key)
                    .ok_or_else(|| StoreError::Deserialization("malformed update key".into()))?;
                Ok((clock, decode_update(&value)?))
            })
            .collect()
    }

    /// Highest stored clock, `None` when the document has no updates.
    pub async fn get_current_clock(&self, doc_id: &str) -> Result<Option<Clock>, StoreError> {
        let (start, end) = keys::all_updates_range(doc_id);
        let last = self
            .backend
            .scan(&start, &end, ScanOrder::Descending, Some(1))
            .await?;
        Ok(last.first().and_then(|(key, _)| keys::decode_update_clock(key)))
    }

    /// Atomically reserve the next clock for a document (0 for the first).
    pub async fn next_clock(&self, doc_id: &str) -> Result<Clock, StoreError> {
        let allocated = self.backend.increment(&keys::clock_key(doc_id), 1).await?;
        Ok(allocated - 1)
    }

    /// Delete updates with `from <= clock < to`. Returns how many were removed.
    pub async fn delete_updates_range(&self, doc_id: &str, from: Clock, to: Clock) -> Result<usize, StoreError> {
        let (start, end) = keys::update_range(doc_id, from, to);
        let keys = self.backend.scan_keys(&start, &end).await?;
        self.delete_chunked(keys).await
    }

    // ─── State vector ─────────────────────────────────────────────────

    pub async fn put_state_vector(&self, doc_id: &str, vector: &[u8], watermark: Clock) -> Result<(), StoreError> {
        let record = StateVectorRecord {
            watermark,
            vector: vector.to_vec(),
        };
        self.backend
            .put(&keys::state_vector_key(doc_id), &record.encode()?)
            .await
    }

    /// Cached state vector, `None` when never written.
    pub async fn get_state_vector(&self, doc_id: &str) -> Result<Option<StateVectorRecord>, StoreError> {
        match self.backend.get(&keys::state_vector_key(doc_id)).await? {
            Some(bytes) => Ok(Some(StateVectorRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Meta ─────────────────────────────────────────────────────────

    pub async fn put_meta(&self, doc_id: &str, key: &str, value: &MetaValue) -> Result<(), StoreError> {
        self.backend
            .put(&keys::meta_key(doc_id, key), &value.encode()?)
            .await
    }

    pub async fn get_meta(&self, doc_id: &str, key: &str) -> Result<Option<MetaValue>, StoreError> {
        match self.backend.get(&keys::meta_key(doc_id, key)).await? {
            Some(bytes) => Ok(Some(MetaValue::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every meta entry of a document, keyed by meta key.
    pub async fn get_metas(&self, doc_id: &str) -> Result<BTreeMap<String, MetaValue>, StoreError> {
        let (start, end) = keys::meta_range(doc_id);
        let pairs = self.backend.scan(&start, &end, ScanOrder::Ascending, None).await?;

        let mut metas = BTreeMap::new();
        for (key, value) in pairs {
            let meta_key = keys::decode_meta_key(doc_id, &key)
                .ok_or_else(|| StoreError::Deserialization("malformed meta key".into()))?;
            metas.insert(meta_key, MetaValue::decode(&value)?);
        }
        Ok(metas)
    }

    pub async fn delete_meta(&self, doc_id: &str, key: &str) -> Result<(), StoreError> {
        self.backend.delete(&keys::meta_key(doc_id, key)).await
    }

    // ─── Document ─────────────────────────────────────────────────────

    /// Delete every record under the document's namespace.
    pub async fn delete_document(&self, doc_id: &str) -> Result<usize, StoreError> {
        let (start, end) = keys::document_range(doc_id);
        let keys = self.backend.scan_keys(&start, &end).await?;
        self.delete_chunked(keys).await
    }

    async fn delete_chunked(&self, keys: Vec<Vec<u8>>) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let total = keys.len();
        let batch_size = self.backend.max_batch_size().max(1);

        let deletes = keys
            .chunks(batch_size)
            .map(|chunk| self.backend.batch_delete(chunk.to_vec()));
        try_join_all(deletes).await?;

        log::debug!(
            "Deleted {total} records in {} batches",
            total.div_ceil(batch_size)
        );
        Ok(total)
    }
}
