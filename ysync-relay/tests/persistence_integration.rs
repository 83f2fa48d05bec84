//! Persistence integration tests.
//!
//! Verifies against RocksDB in a temp directory:
//! - Clock allocation is gap-free and survives restarts
//! - Compaction equals the merge of the raw log, and leaves one record
//! - A crash between snapshot write and deletion loses nothing
//! - State vectors stay fresh and heal when stale
//! - A failing backend never poisons the queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use ysync_relay::crdt;
use ysync_relay::storage::{
    KvBackend, KvPair, MemoryTable, MetaValue, RocksDb, ScanOrder, StoreConfig, StoreError,
    UpdateLogStore, CF_DOCUMENTS,
};
use ysync_relay::{DocumentPersistence, PersistenceConfig};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// An editor appending to one text; each edit yields one incremental update.
struct Editor {
    doc: Doc,
}

impl Editor {
    fn new(client_id: u64) -> Self {
        Self {
            doc: Doc::with_client_id(client_id),
        }
    }

    fn append(&self, s: &str) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, s);
        }
        self.doc.transact().encode_state_as_update_v1(&before)
    }
}

fn text_of(update: &[u8]) -> String {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
    }
    let txn = doc.transact();
    text.get_string(&txn)
}

fn open(path: &std::path::Path) -> (RocksDb, UpdateLogStore) {
    let db = RocksDb::open(StoreConfig::for_testing(path)).unwrap();
    let table = db.table(CF_DOCUMENTS).unwrap();
    (db, UpdateLogStore::new(Arc::new(table)))
}

fn persistence(store: &UpdateLogStore, threshold: usize) -> DocumentPersistence {
    DocumentPersistence::new(store.clone(), PersistenceConfig::with_trim_threshold(threshold))
}

// ─── Clocks ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sequential_clocks_are_gap_free() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let p = persistence(&store, 500);
    let editor = Editor::new(1);

    let mut clocks = Vec::new();
    for i in 0..40 {
        clocks.push(p.store_update("doc", editor.append(&i.to_string())).await.unwrap());
    }
    assert_eq!(clocks, (0..40).collect::<Vec<u64>>());
    assert_eq!(store.get_current_clock("doc").await.unwrap(), Some(39));
}

#[tokio::test]
async fn test_clock_counter_survives_restart() {
    let dir = tempdir().unwrap();
    let editor = Editor::new(1);
    {
        let (db, store) = open(dir.path());
        let p = persistence(&store, 500);
        for _ in 0..3 {
            p.store_update("doc", editor.append("a")).await.unwrap();
        }
        p.shutdown().await;
        drop(p);
        drop(store);
        db.flush().unwrap();
    }

    let (_db, store) = open(dir.path());
    let p = persistence(&store, 500);
    assert_eq!(p.store_update("doc", editor.append("b")).await, Some(3));
    assert_eq!(text_of(&p.get_document("doc").await.unwrap().update), "aaab");
}

#[tokio::test]
async fn test_concurrent_instances_never_share_a_clock() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let first = persistence(&store, 10_000);
    let second = persistence(&store, 10_000);

    let mut handles = Vec::new();
    for (i, p) in [first, second].into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let editor = Editor::new(i as u64 + 1);
            let mut clocks = Vec::new();
            for _ in 0..25 {
                clocks.push(p.store_update("doc", editor.append("x")).await.unwrap());
            }
            clocks
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (0..50).collect::<Vec<u64>>());
    assert_eq!(store.get_updates("doc").await.unwrap().len(), 50);
}

// ─── Idempotence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_bytes_same_clock_is_idempotent() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let editor = Editor::new(1);
    let update = editor.append("hello");

    store.put_update("once", 0, &update).await.unwrap();
    store.put_update("twice", 0, &update).await.unwrap();
    store.put_update("twice", 0, &update).await.unwrap();

    let p = persistence(&store, 500);
    let once = p.get_document("once").await.unwrap();
    let twice = p.get_document("twice").await.unwrap();
    assert_eq!(once, twice);
    assert_eq!(text_of(&twice.update), "hello");
}

// ─── Compaction ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_compaction_matches_raw_merge() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let p = persistence(&store, 10);
    let alice = Editor::new(1);
    let bob = Editor::new(2);

    let mut raw = Vec::new();
    for i in 0..12 {
        let update = if i % 2 == 0 { alice.append("a") } else { bob.append("b") };
        raw.push(update.clone());
        p.store_update("doc", update).await.unwrap();
    }
    let expected = crdt::merge_updates(raw.iter().map(Vec::as_slice)).unwrap();

    let merged = p.get_document("doc").await.unwrap();
    assert_eq!(merged.state_vector, expected.state_vector);
    assert_eq!(text_of(&merged.update), text_of(&expected.update));

    let remaining = store.get_updates("doc").await.unwrap();
    assert_eq!(remaining.len(), 1);
    let compacted = crdt::merge_updates([remaining[0].1.as_slice()]).unwrap();
    assert_eq!(compacted.state_vector, expected.state_vector);
    assert_eq!(text_of(&compacted.update), text_of(&expected.update));

    // Cache points at the snapshot clock.
    let cached = store.get_state_vector("doc").await.unwrap().unwrap();
    assert_eq!(cached.watermark, remaining[0].0);
}

#[tokio::test]
async fn test_updates_after_compaction_append() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let p = persistence(&store, 500);
    let editor = Editor::new(1);

    for _ in 0..5 {
        p.store_update("doc", editor.append("x")).await.unwrap();
    }
    p.compact("doc").await.unwrap();
    let next = p.store_update("doc", editor.append("y")).await.unwrap();
    assert_eq!(next, 6);
    assert_eq!(text_of(&p.get_document("doc").await.unwrap().update), "xxxxxy");
}

#[tokio::test]
async fn test_crash_before_deletion_leaves_log_over_complete() {
    let dir = tempdir().unwrap();
    let editor = Editor::new(1);
    let expected;
    {
        let (db, store) = open(dir.path());
        let p = persistence(&store, 500);
        for s in ["he", "ll", "o"] {
            p.store_update("doc", editor.append(s)).await.unwrap();
        }
        expected = p.get_document("doc").await.unwrap();
        p.shutdown().await;
        drop(p);

        // Compaction writes snapshot and vector, then "crashes".
        let clock = store.next_clock("doc").await.unwrap();
        store.put_update("doc", clock, &expected.update).await.unwrap();
        store.put_state_vector("doc", &expected.state_vector, clock).await.unwrap();
        drop(store);
        db.flush().unwrap();
    }

    let (_db, store) = open(dir.path());
    assert_eq!(store.get_updates("doc").await.unwrap().len(), 4);

    let p = persistence(&store, 3);
    let recovered = p.get_document("doc").await.unwrap();
    assert_eq!(recovered.state_vector, expected.state_vector);
    assert_eq!(text_of(&recovered.update), "hello");

    // Over the threshold, so that load finished the compaction.
    assert_eq!(store.get_updates("doc").await.unwrap().len(), 1);
    assert_eq!(text_of(&p.get_document("doc").await.unwrap().update), "hello");
}

// ─── State vector ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_vector_fresh_after_every_store() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let p = persistence(&store, 500);
    let editor = Editor::new(7);

    for s in ["a", "b", "c", "d"] {
        p.store_update("doc", editor.append(s)).await.unwrap();
        let expected = editor.doc.transact().state_vector().encode_v1();
        assert_eq!(p.get_state_vector("doc").await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_stale_state_vector_is_recomputed_and_healed() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let p = persistence(&store, 500);
    let editor = Editor::new(3);
    for s in ["one", "two"] {
        p.store_update("doc", editor.append(s)).await.unwrap();
    }

    // Bogus vector one clock behind.
    store
        .put_state_vector("doc", &StateVector::default().encode_v1(), 0)
        .await
        .unwrap();

    let expected = editor.doc.transact().state_vector().encode_v1();
    assert_eq!(p.get_state_vector("doc").await.unwrap(), expected);

    let healed = store.get_state_vector("doc").await.unwrap().unwrap();
    assert_eq!(healed.watermark, 1);
    assert_eq!(healed.vector, expected);
}

// ─── Meta and deletion ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_meta_and_clear_document() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    let p = persistence(&store, 500);
    let editor = Editor::new(1);

    p.store_update("doc", editor.append("text")).await.unwrap();
    p.store_update("keep", editor.append("other")).await.unwrap();
    p.put_meta("doc", "title", MetaValue::from("Notes")).await.unwrap();
    p.put_meta("doc", "size", MetaValue::from(42.0)).await.unwrap();
    p.put_meta("doc", "thumb", MetaValue::from(vec![1u8, 2, 3])).await.unwrap();

    let metas = p.get_metas("doc").await.unwrap();
    assert_eq!(metas.keys().cloned().collect::<Vec<_>>(), vec!["size", "thumb", "title"]);
    assert_eq!(metas["size"], MetaValue::Number(42.0));

    assert!(p.clear_document("doc").await.is_some());
    assert!(store.get_updates("doc").await.unwrap().is_empty());
    assert!(store.get_state_vector("doc").await.unwrap().is_none());
    assert!(p.get_metas("doc").await.unwrap().is_empty());
    assert_eq!(store.get_updates("keep").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_large_range_delete_on_rocksdb() {
    let dir = tempdir().unwrap();
    let (_db, store) = open(dir.path());
    for clock in 0..137 {
        store.put_update("doc", clock, b"u").await.unwrap();
    }
    assert_eq!(store.delete_updates_range("doc", 0, 137).await.unwrap(), 137);
    assert!(store.get_updates("doc").await.unwrap().is_empty());
}

// ─── Failure isolation ───────────────────────────────────────────────────────

/// Memory table whose writes fail while `failing` is set.
struct FlakyTable {
    inner: MemoryTable,
    failing: AtomicBool,
}

impl FlakyTable {
    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Database("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvBackend for FlakyTable {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<KvPair>, StoreError> {
        self.inner.scan(start, end, order, limit).await
    }

    async fn batch_delete(&self, keys: Vec<Vec<u8>>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.batch_delete(keys).await
    }

    async fn increment(&self, key: &[u8], by: u64) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.increment(key, by).await
    }
}

#[tokio::test]
async fn test_failed_entry_does_not_poison_queue() {
    let table = Arc::new(FlakyTable {
        inner: MemoryTable::new(),
        failing: AtomicBool::new(false),
    });
    let p = DocumentPersistence::new(UpdateLogStore::new(table.clone()), PersistenceConfig::default());
    let editor = Editor::new(1);

    assert_eq!(p.store_update("doc", editor.append("a")).await, Some(0));

    table.failing.store(true, Ordering::SeqCst);
    assert_eq!(p.store_update("doc", editor.append("b")).await, None);
    assert!(p.put_meta("doc", "k", MetaValue::from(true)).await.is_none());

    table.failing.store(false, Ordering::SeqCst);
    let other = Editor::new(2);
    assert_eq!(p.store_update("doc", other.append("c")).await, Some(1));

    // The failed update is gone; the log holds what was acknowledged.
    let text = text_of(&p.get_document("doc").await.unwrap().update);
    assert_eq!(text.len(), 2);
    assert!(text.contains('a') && text.contains('c'));
}
