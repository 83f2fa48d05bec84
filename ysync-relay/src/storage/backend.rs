//! Backing table abstraction.
//!
//! A `KvBackend` is one partitioned, sorted key-value table. Everything the
//! update log needs from a real database is expressed here:
//!
//! ```text
//! get / put / delete         point operations
//! scan(start, end)           sorted range [start, end), either direction
//! batch_delete(keys)         bulk delete, at most max_batch_size() keys
//! increment(key, by)         atomic counter add (clock allocation)
//! ```
//!
//! Two implementations ship with the crate: [`RocksTable`](super::RocksTable)
//! (one RocksDB column family) and [`MemoryTable`](super::MemoryTable).

use async_trait::async_trait;
use thiserror::Error;

/// Default number of items a backend accepts in one bulk write.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 25;

/// Key/value pair returned from range scans.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend I/O failure
    #[error("database error: {0}")]
    Database(String),
    /// Bulk write exceeded the backend's per-batch item limit
    #[error("batch of {size} items exceeds limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    /// Value could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Stored value could not be decoded
    #[error("deserialization error: {0}")]
    Deserialization(String),
    /// LZ4 block could not be decompressed
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Direction of a range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// One sorted key-value table.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Return pairs with `start <= key < end` in the requested order,
    /// stopping after `limit` items when given.
    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<KvPair>, StoreError>;

    /// Delete up to [`max_batch_size`](Self::max_batch_size) keys in one call.
    async fn batch_delete(&self, keys: Vec<Vec<u8>>) -> Result<(), StoreError>;

    /// Atomically add `by` to the big-endian u64 counter stored at `key`
    /// (absent counts as zero) and return the new value.
    async fn increment(&self, key: &[u8], by: u64) -> Result<u64, StoreError>;

    /// Per-call item limit for [`batch_delete`](Self::batch_delete).
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }

    /// Keys only, ascending.
    async fn scan_keys(&self, start: &[u8], end: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let pairs = self.scan(start, end, ScanOrder::Ascending, None).await?;
        Ok(pairs.into_iter().map(|(key, _)| key).collect())
    }
}

/// Decode a big-endian u64 counter value.
pub(crate) fn decode_counter(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization(format!("counter has {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}
