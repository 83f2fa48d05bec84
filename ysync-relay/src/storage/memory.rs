//! In-memory backing table.
//!
//! Sorted `BTreeMap` behind a tokio `RwLock`. Used when the server runs
//! without a storage path and throughout the test suite. Call counters are
//! tracked with atomics so callers can observe how operations map onto
//! backend requests (e.g. how many bulk deletes a range delete issued).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::backend::{decode_counter, KvBackend, KvPair, ScanOrder, StoreError, DEFAULT_MAX_BATCH_SIZE};

#[derive(Debug, Default)]
struct CallCounters {
    puts: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
    batch_deletes: AtomicU64,
    increments: AtomicU64,
}

/// Snapshot of backend call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub puts: u64,
    pub deletes: u64,
    pub scans: u64,
    pub batch_deletes: u64,
    pub increments: u64,
    pub items: usize,
}

/// A sorted key-value table held in memory.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    items: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    max_batch_size: usize,
    counters: Arc<CallCounters>,
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }

    /// Create a table that accepts at most `max_batch_size` keys per bulk delete.
    pub fn with_batch_size(max_batch_size: usize) -> Self {
        Self {
            items: Arc::new(RwLock::new(BTreeMap::new())),
            max_batch_size: max_batch_size.max(1),
            counters: Arc::new(CallCounters::default()),
        }
    }

    /// Number of stored items.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Call counters plus current item count.
    pub async fn stats(&self) -> TableStats {
        TableStats {
            puts: self.counters.puts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            scans: self.counters.scans.load(Ordering::Relaxed),
            batch_deletes: self.counters.batch_deletes.load(Ordering::Relaxed),
            increments: self.counters.increments.load(Ordering::Relaxed),
            items: self.len().await,
        }
    }
}

#[async_trait]
impl KvBackend for MemoryTable {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.items.write().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<KvPair>, StoreError> {
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        if start >= end {
            return Ok(Vec::new());
        }
        let items = self.items.read().await;
        let range = items.range(start.to_vec()..end.to_vec());
        let limit = limit.unwrap_or(usize::MAX);
        let pairs = match order {
            ScanOrder::Ascending => range
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ScanOrder::Descending => range
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(pairs)
    }

    async fn batch_delete(&self, keys: Vec<Vec<u8>>) -> Result<(), StoreError> {
        if keys.len() > self.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size: keys.len(),
                limit: self.max_batch_size,
            });
        }
        self.counters.batch_deletes.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.write().await;
        for key in &keys {
            items.remove(key);
        }
        Ok(())
    }

    async fn increment(&self, key: &[u8], by: u64) -> Result<u64, StoreError> {
        self.counters.increments.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.write().await;
        let current = match items.get(key) {
            Some(bytes) => decode_counter(bytes)?,
            None => 0,
        };
        let next = current + by;
        items.insert(key.to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let table = MemoryTable::new();
        table.put(b"a", b"1").await.unwrap();
        assert_eq!(table.get(b"a").await.unwrap(), Some(b"1".to_vec()));

        table.delete(b"a").await.unwrap();
        assert_eq!(table.get(b"a").await.unwrap(), None);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_scan_bounds_and_order() {
        let table = MemoryTable::new();
        for k in [b"a1", b"a2", b"a3", b"b1"] {
            table.put(k, k).await.unwrap();
        }

        let asc = table.scan(b"a", b"b", ScanOrder::Ascending, None).await.unwrap();
        let keys: Vec<_> = asc.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a1", b"a2", b"a3"]);

        let last = table.scan(b"a", b"b", ScanOrder::Descending, Some(1)).await.unwrap();
        assert_eq!(last[0].0, b"a3");

        assert!(table.scan(b"b", b"a", ScanOrder::Ascending, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_delete_limit() {
        let table = MemoryTable::with_batch_size(2);
        let keys = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let err = table.batch_delete(keys).await.unwrap_err();
        assert!(matches!(err, StoreError::BatchTooLarge { size: 3, limit: 2 }));
        assert_eq!(table.stats().await.batch_deletes, 0);
    }

    #[tokio::test]
    async fn test_increment_is_atomic() {
        let table = MemoryTable::new();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let t = table.clone();
            handles.push(tokio::spawn(async move { t.increment(b"ctr", 1).await.unwrap() }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
    }
}
