//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: canvas content (LZ4 compressed), keyed by the 16 id bytes
//! - `metadata` : title, owner and timestamps (bincode), same key
//!
//! Both records of a document are written in one `WriteBatch` and read
//! back through one snapshot, so a reader never sees a title from one save
//! next to the content of another.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, SnapshotWithThreadMode, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::document::{now_millis, Document, DocumentId, DocumentPatch, NewDocument, OwnerId};

use super::{sort_newest_first, DocumentStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

type Db = DBWithThreadMode<SingleThreaded>;
type Snapshot<'a> = SnapshotWithThreadMode<'a, Db>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Store at `path` with defaults for everything else.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Everything about a document except its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: DocumentId,
    pub title: String,
    pub owner_id: OwnerId,
    pub owner_name: String,
    /// Milliseconds since epoch
    pub created_at: u64,
    /// Milliseconds since epoch
    pub updated_at: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
}

impl DocumentMetadata {
    fn from_document(doc: &Document, compressed_size: usize) -> Self {
        Self {
            doc_id: doc.id,
            title: doc.title.clone(),
            owner_id: doc.owner_id.clone(),
            owner_name: doc.owner_name.clone(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            content_size: doc.content.len() as u64,
            compressed_size: compressed_size as u64,
        }
    }

    fn into_document(self, content: String) -> Document {
        Document {
            id: self.doc_id,
            title: self.title,
            content,
            owner_id: self.owner_id,
            owner_name: self.owner_name,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: Db,
    config: StoreConfig,
    /// Serializes create and read-modify-write cycles
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
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

        let db = Db::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

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
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Content is already LZ4 framed by us
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)) as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load only the metadata record of a document.
    pub fn load_metadata(&self, id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Ids of every stored document.
    pub fn list_ids(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids = Vec::new();
        for meta in self.scan_metadata()? {
            ids.push(meta.doc_id);
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Both records of `id` as of `snapshot`.
    fn load_document(
        &self,
        snapshot: &Snapshot<'_>,
        id: DocumentId,
    ) -> Result<Document, StoreError> {
        let meta = match snapshot.get_cf(self.cf(CF_METADATA)?, id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes)?,
            None => return Err(StoreError::NotFound(id)),
        };
        let content = self.load_content(snapshot, id)?;
        Ok(meta.into_document(content))
    }

    fn load_content(&self, snapshot: &Snapshot<'_>, id: DocumentId) -> Result<String, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = snapshot
            .get_cf(cf, id.as_bytes())?
            .ok_or(StoreError::NotFound(id))?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        String::from_utf8(raw).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    /// Write content and metadata atomically.
    fn put(&self, doc: &Document) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(doc.content.as_bytes());
        let meta = DocumentMetadata::from_document(doc, compressed.len());

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc.id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, doc.id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn scan_metadata(&self) -> Result<Vec<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(DocumentMetadata::decode(&value)?);
        }
        Ok(out)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".to_string()))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn create(&self, new: NewDocument) -> Result<Document, StoreError> {
        new.validate().map_err(StoreError::InvalidDocument)?;
        let doc = new.into_document(now_millis());

        let _guard = self.lock()?;
        let cf = self.cf(CF_METADATA)?;
        if self.db.get_cf(cf, doc.id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        self.put(&doc)?;
        log::debug!("Created document {} for {}", doc.id, doc.owner_id);
        Ok(doc)
    }

    fn read(&self, id: DocumentId) -> Result<Document, StoreError> {
        let snapshot = self.db.snapshot();
        self.load_document(&snapshot, id)
    }

    fn write(&self, id: DocumentId, patch: DocumentPatch) -> Result<Document, StoreError> {
        let _guard = self.lock()?;
        let mut doc = self.read(id)?;
        patch.apply(&mut doc, now_millis());
        self.put(&doc)?;
        Ok(doc)
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Document>, StoreError> {
        let snapshot = self.db.snapshot();
        let mut docs = Vec::new();
        for item in snapshot.iterator_cf(self.cf(CF_METADATA)?, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = DocumentMetadata::decode(&value)?;
            if &meta.owner_id != owner {
                continue;
            }
            let content = self.load_content(&snapshot, meta.doc_id)?;
            docs.push(meta.into_document(content));
        }
        sort_newest_first(&mut docs);
        Ok(docs)
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
    use std::fs;
    use uuid::Uuid;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("canvas_test_rocks_{name}_{}", Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    #[test]
    fn test_store_open_close() {
        let path = temp_db_path("open_close");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert!(store.path().exists());
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_create_read() {
        let path = temp_db_path("create_read");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let doc = store
            .create(
                NewDocument::new("u1", "Ada")
                    .with_title("Roadmap")
                    .with_content("<h1>Q3</h1>"),
            )
            .unwrap();
        let loaded = store.read(doc.id).unwrap();
        assert_eq!(loaded, doc);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_read_not_found() {
        let path = temp_db_path("not_found");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let id = DocumentId::new();
        assert_eq!(store.read(id).unwrap_err(), StoreError::NotFound(id));
        assert!(matches!(
            store.write(id, DocumentPatch::content("x")),
            Err(StoreError::NotFound(_))
        ));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let path = temp_db_path("duplicate");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let id = DocumentId::new();
        store.create(NewDocument::new("u1", "Ada").with_id(id)).unwrap();
        let err = store
            .create(NewDocument::new("u2", "Bob").with_id(id))
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(id));
        assert_eq!(store.read(id).unwrap().owner_name, "Ada");

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_write_updates_metadata() {
        let path = temp_db_path("write");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let doc = store.create(NewDocument::new("u1", "Ada")).unwrap();
        let updated = store
            .write(doc.id, DocumentPatch::full("Plan", "body text"))
            .unwrap();

        let meta = store.load_metadata(doc.id).unwrap();
        assert_eq!(meta.title, "Plan");
        assert_eq!(meta.content_size, "body text".len() as u64);
        assert_eq!(meta.updated_at, updated.updated_at);
        assert!(meta.updated_at >= meta.created_at);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_read_never_mixes_two_writes() {
        let path = temp_db_path("torn");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let doc = store
            .create(NewDocument::new("u1", "Ada").with_title("v0").with_content("v0"))
            .unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 1..=500 {
                    let v = format!("v{i}");
                    store.write(doc.id, DocumentPatch::full(v.clone(), v)).unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..2000 {
                    let read = store.read(doc.id).unwrap();
                    assert_eq!(read.title, read.content);
                    let listed = store.list_by_owner(&OwnerId::new("u1")).unwrap();
                    assert_eq!(listed[0].title, listed[0].content);
                }
            });
        });
        assert_eq!(store.read(doc.id).unwrap().content, "v500");

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_list_by_owner_newest_first() {
        let path = temp_db_path("list");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        for _ in 0..3 {
            store.create(NewDocument::new("u1", "Ada")).unwrap();
        }
        store.create(NewDocument::new("u2", "Bob")).unwrap();

        let listed = store.list_by_owner(&OwnerId::new("u1")).unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(store.list_ids().unwrap().len(), 4);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_content_compression() {
        let path = temp_db_path("compression");
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();

        let body = "<p>lorem ipsum</p>".repeat(5_000);
        let doc = store
            .create(NewDocument::new("u1", "Ada").with_content(body.clone()))
            .unwrap();

        let meta = store.load_metadata(doc.id).unwrap();
        assert_eq!(meta.content_size, body.len() as u64);
        assert!(meta.compressed_size * 2 < meta.content_size);
        assert_eq!(store.read(doc.id).unwrap().content, body);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("canvas_data"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(StoreConfig::at("x").path, PathBuf::from("x"));
    }
}
