//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — Full yrs snapshots (LZ4 compressed)
//! - `deltas`    — Incremental updates (LZ4 compressed, keyed by doc key + seq)
//! - `metadata`  — [`DocumentMetadata`] (bincode)
//!
//! Document ids are arbitrary strings; keys use the first 16 bytes of their
//! blake3 hash so that delta keys have a fixed-size prefix.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DocumentMetadata, DocumentStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

const KEY_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every batch
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowgraph_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    /// Single-threaded mode; callers serialize through `write_lock`.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Read-modify-write of metadata must not interleave.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store and its column families.
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

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
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

        // Values are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small writes, prefix-scanned by document key
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(KEY_LEN));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn doc_key(doc_id: &str) -> [u8; KEY_LEN] {
        let hash = blake3::hash(doc_id.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&hash.as_bytes()[..KEY_LEN]);
        key
    }

    /// Document key (16 bytes) + sequence (8 bytes big-endian).
    fn delta_key(doc_key: &[u8; KEY_LEN], seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(KEY_LEN + 8);
        key.extend_from_slice(doc_key);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn read_metadata(&self, doc_key: &[u8]) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_key)? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delta keys of one document with their sequence numbers.
    fn scan_deltas(&self, doc_key: &[u8; KEY_LEN]) -> Result<Vec<(u64, Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start = Self::delta_key(doc_key, 0);
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != KEY_LEN + 8 || &key[..KEY_LEN] != doc_key {
                break;
            }
            let mut seq = [0u8; 8];
            seq.copy_from_slice(&key[KEY_LEN..]);
            out.push((u64::from_be_bytes(seq), key, value));
        }
        Ok(out)
    }
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

impl DocumentStore for RocksStore {
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, Self::doc_key(doc_id))? {
            Some(compressed) => Ok(Some(decompress(&compressed)?)),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, doc_id: &str, snapshot: &[u8], up_to_seq: u64) -> Result<DocumentMetadata, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let doc_key = Self::doc_key(doc_id);
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut meta = self
            .read_metadata(&doc_key)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));

        let mut batch = WriteBatch::default();
        let mut remaining = 0u64;
        for (seq, key, _) in self.scan_deltas(&doc_key)? {
            if seq <= up_to_seq {
                batch.delete_cf(cf_deltas, key);
            } else {
                remaining += 1;
            }
        }

        meta.snapshot_seq = up_to_seq;
        meta.last_seq = meta.last_seq.max(up_to_seq);
        meta.delta_count = remaining;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.touch();

        batch.put_cf(cf_docs, doc_key, &compressed);
        batch.put_cf(cf_meta, doc_key, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Snapshot of {doc_id}: {} → {} bytes, up to seq {up_to_seq}",
            snapshot.len(),
            compressed.len()
        );
        Ok(meta)
    }

    fn append_deltas(&self, doc_id: &str, deltas: &[(u64, Vec<u8>)]) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let doc_key = Self::doc_key(doc_id);
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .read_metadata(&doc_key)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));

        let mut batch = WriteBatch::default();
        for (seq, delta) in deltas {
            batch.put_cf(cf_deltas, Self::delta_key(&doc_key, *seq), lz4_flex::compress_prepend_size(delta));
            meta.last_seq = meta.last_seq.max(*seq);
        }
        meta.delta_count += deltas.len() as u64;
        meta.touch();
        batch.put_cf(cf_meta, doc_key, meta.encode()?);

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn load_deltas(&self, doc_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let doc_key = Self::doc_key(doc_id);
        let snapshot_seq = self.read_metadata(&doc_key)?.map_or(0, |m| m.snapshot_seq);
        self.scan_deltas(&doc_key)?
            .into_iter()
            .filter(|(seq, _, _)| *seq > snapshot_seq)
            .map(|(seq, _, value)| Ok((seq, decompress(&value)?)))
            .collect()
    }

    fn metadata(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        self.read_metadata(&Self::doc_key(doc_id))
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            ids.push(DocumentMetadata::decode(&value)?.doc_id);
        }
        ids.sort();
        Ok(ids)
    }

    fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let doc_key = Self::doc_key(doc_id);
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, doc_key);
        batch.delete_cf(cf_meta, doc_key);
        for (_, key, _) in self.scan_deltas(&doc_key)? {
            batch.delete_cf(cf_deltas, key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        log::info!("Deleted document {doc_id}");
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, RocksStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open();
        let data = b"workflow snapshot workflow snapshot workflow snapshot".to_vec();

        let meta = store.save_snapshot("room-1", &data, 0).unwrap();
        assert_eq!(meta.doc_id, "room-1");
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert_eq!(store.load_snapshot("room-1").unwrap(), Some(data));
        assert_eq!(store.load_snapshot("missing").unwrap(), None);
    }

    #[test]
    fn test_deltas_in_sequence_order() {
        let (_dir, store) = open();
        store.append_deltas("room-1", &[(2, vec![2]), (1, vec![1])]).unwrap();
        store.append_deltas("room-1", &[(3, vec![3])]).unwrap();

        let deltas = store.load_deltas("room-1").unwrap();
        assert_eq!(deltas, vec![(1, vec![1]), (2, vec![2]), (3, vec![3])]);
        let meta = store.metadata("room-1").unwrap().unwrap();
        assert_eq!(meta.last_seq, 3);
        assert_eq!(meta.next_seq(), 4);
    }

    #[test]
    fn test_snapshot_folds_covered_deltas() {
        let (_dir, store) = open();
        store
            .append_deltas("room-1", &[(1, vec![1]), (2, vec![2]), (3, vec![3])])
            .unwrap();
        let meta = store.save_snapshot("room-1", b"snap", 2).unwrap();
        assert_eq!(meta.delta_count, 1);
        assert_eq!(meta.last_seq, 3);

        assert_eq!(store.load_deltas("room-1").unwrap(), vec![(3, vec![3])]);
        assert_eq!(store.load_updates("room-1").unwrap(), vec![b"snap".to_vec(), vec![3]]);
    }

    #[test]
    fn test_documents_are_isolated() {
        let (_dir, store) = open();
        store.append_deltas("a", &[(1, vec![0xA])]).unwrap();
        store.append_deltas("b", &[(1, vec![0xB])]).unwrap();
        assert_eq!(store.load_deltas("a").unwrap(), vec![(1, vec![0xA])]);
        assert_eq!(store.list_documents().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.delete_document("a").unwrap();
        assert!(store.load_deltas("a").unwrap().is_empty());
        assert!(store.metadata("a").unwrap().is_none());
        assert_eq!(store.list_documents().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot("room", b"state", 0).unwrap();
            store.append_deltas("room", &[(1, vec![9])]).unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_updates("room").unwrap(), vec![b"state".to_vec(), vec![9]]);
    }

    #[test]
    fn test_compression_ratio() {
        let (_dir, store) = open();
        let data: Vec<u8> = b"node:action;".iter().copied().cycle().take(64 * 1024).collect();
        let meta = store.save_snapshot("room", &data, 0).unwrap();
        assert!(meta.compressed_size * 3 < meta.snapshot_size);
    }
}
