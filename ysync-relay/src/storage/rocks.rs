//! RocksDB-backed tables.
//!
//! Column families:
//! - `documents`:   update log, meta entries, state vectors, clock counters
//! - `connections`: connection registry (document → connection ids)
//!
//! Each column family is exposed as a [`RocksTable`] implementing
//! [`KvBackend`]. Keys are compared bytewise, so the big-endian clock suffix
//! of update keys sorts numerically.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::backend::{decode_counter, KvBackend, KvPair, ScanOrder, StoreError, DEFAULT_MAX_BATCH_SIZE};

/// Column family names.
pub const CF_DOCUMENTS: &str = "documents";
pub const CF_CONNECTIONS: &str = "connections";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CONNECTIONS];

type Db = DBWithThreadMode<SingleThreaded>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// Keys per bulk delete (default: 25)
    pub max_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ysync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// An open RocksDB database with the crate's column families.
#[derive(Clone)]
pub struct RocksDb {
    db: Arc<Db>,
    config: StoreConfig,
    /// Shared by every table handle so counters stay atomic across handles.
    counter_lock: Arc<Mutex<()>>,
}

impl RocksDb {
    /// Open (or create) the database at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened RocksDB at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
            counter_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Update blobs are already LZ4 compressed by the codec.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_CONNECTIONS => {
                // Tiny keys, churns on every connect/disconnect
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Handle to one column family as a [`KvBackend`].
    pub fn table(&self, name: &str) -> Result<RocksTable, StoreError> {
        if self.db.cf_handle(name).is_none() {
            return Err(StoreError::Database(format!("Column family '{name}' not found")));
        }
        Ok(RocksTable {
            db: self.db.clone(),
            cf_name: name.to_string(),
            sync_writes: self.config.sync_writes,
            max_batch_size: self.config.max_batch_size.max(1),
            counter_lock: self.counter_lock.clone(),
        })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

/// One RocksDB column family.
#[derive(Clone)]
pub struct RocksTable {
    db: Arc<Db>,
    cf_name: String,
    sync_writes: bool,
    max_batch_size: usize,
    /// Serializes read-modify-write of counter records.
    counter_lock: Arc<Mutex<()>>,
}

impl RocksTable {
    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(&self.cf_name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{}' not found", self.cf_name)))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        write_opts
    }

    fn scan_forward(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, StoreError> {
        let cf = self.cf()?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));

        let mut pairs = Vec::new();
        for item in iter {
            if pairs.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.as_ref() >= end {
                break;
            }
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }

    fn scan_backward(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, StoreError> {
        let cf = self.cf()?;
        // Positions at the last key <= end; `end` itself is exclusive.
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(end, Direction::Reverse));

        let mut pairs = Vec::new();
        for item in iter {
            if pairs.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.as_ref() >= end {
                continue;
            }
            if key.as_ref() < start {
                break;
            }
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }

    fn increment_blocking(&self, key: &[u8], by: u64) -> Result<u64, StoreError> {
        let cf = self.cf()?;
        let _guard = self
            .counter_lock
            .lock()
            .map_err(|_| StoreError::Database("counter lock poisoned".into()))?;

        let current = match self.db.get_cf(cf, key)? {
            Some(bytes) => decode_counter(&bytes)?,
            None => 0,
        };
        let next = current + by;

        let mut write_opts = self.write_opts();
        // Counter must survive a crash before any record written at its value.
        write_opts.set_sync(true);
        self.db.put_cf_opt(cf, key, next.to_be_bytes(), &write_opts)?;
        Ok(next)
    }
}

#[async_trait]
impl KvBackend for RocksTable {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf()?;
        Ok(self.db.get_cf(cf, key)?)
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.put_cf_opt(cf, key, value, &self.write_opts())?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.delete_cf_opt(cf, key, &self.write_opts())?;
        Ok(())
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<KvPair>, StoreError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let limit = limit.unwrap_or(usize::MAX);
        match order {
            ScanOrder::Ascending => self.scan_forward(start, end, limit),
            ScanOrder::Descending => self.scan_backward(start, end, limit),
        }
    }

    async fn batch_delete(&self, keys: Vec<Vec<u8>>) -> Result<(), StoreError> {
        if keys.len() > self.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size: keys.len(),
                limit: self.max_batch_size,
            });
        }
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete_cf(cf, key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn increment(&self, key: &[u8], by: u64) -> Result<u64, StoreError> {
        let table = self.clone();
        let key = key.to_vec();
        // Synced write under the counter lock: runs on the blocking pool.
        tokio::task::spawn_blocking(move || table.increment_blocking(&key, by))
            .await
            .map_err(|e| StoreError::Database(format!("counter task failed: {e}")))?
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
