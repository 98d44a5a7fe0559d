//! RocksDB-backed note store.
//!
//! Column families:
//! - `notes`: note content (LZ4 compressed, keyed by note id)
//! - `operations`: applied edits (bincode, keyed by `note_id \0 seq`)
//! - `metadata`: note metadata (bincode: sizes, operation count, timestamps)

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{now_millis, NoteStore, OperationRecord, StoreError};

const CF_NOTES: &str = "notes";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_NOTES, CF_OPERATIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("syncpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::default()
        }
    }
}

/// Per-note bookkeeping stored alongside the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub note_id: String,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    pub operation_count: u64,
    /// Highest operation sequence number seen
    pub last_seq: u64,
    /// Milliseconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl NoteMetadata {
    fn new(note_id: &str) -> Self {
        let now = now_millis();
        Self {
            note_id: note_id.to_string(),
            content_size: 0,
            compressed_size: 0,
            operation_count: 0,
            last_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed
            CF_NOTES => opts.set_compression_type(DBCompressionType::None),
            CF_OPERATIONS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }

        opts
    }

    pub fn metadata(&self, note_id: &str) -> Result<Option<NoteMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, note_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of all notes with stored content or operations.
    pub fn list_notes(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    /// Delete a note's content, metadata and operation log.
    pub fn delete_note(&self, note_id: &str) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_NOTES)?, note_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, note_id.as_bytes());

        let prefix = Self::operation_prefix(note_id);
        let iter = self
            .db
            .iterator_cf(cf_ops, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf_ops, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn operation_prefix(note_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(note_id.len() + 1);
        key.extend_from_slice(note_id.as_bytes());
        key.push(0);
        key
    }

    /// `note_id \0 seq(8 bytes BE)`; big-endian keeps the log in seq order.
    fn operation_key(note_id: &str, seq: u64) -> Vec<u8> {
        let mut key = Self::operation_prefix(note_id);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

impl NoteStore for RocksStore {
    fn load_content(&self, note_id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_NOTES)?;
        let Some(compressed) = self.db.get_cf(cf, note_id.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn save_content(&self, note_id: &str, content: &str) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());

        let mut meta = self.metadata(note_id)?.unwrap_or_else(|| NoteMetadata::new(note_id));
        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_NOTES)?, note_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, note_id.as_bytes(), encode(&meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn append_operation(&self, note_id: &str, record: &OperationRecord) -> Result<(), StoreError> {
        let mut meta = self.metadata(note_id)?.unwrap_or_else(|| NoteMetadata::new(note_id));
        meta.operation_count += 1;
        meta.last_seq = meta.last_seq.max(record.seq);
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_OPERATIONS)?,
            Self::operation_key(note_id, record.seq),
            encode(record)?,
        );
        batch.put_cf(self.cf(CF_METADATA)?, note_id.as_bytes(), encode(&meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn operations(&self, note_id: &str) -> Result<Vec<OperationRecord>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = Self::operation_prefix(note_id);

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    fn last_seq(&self, note_id: &str) -> Result<u64, StoreError> {
        Ok(self.metadata(note_id)?.map_or(0, |meta| meta.last_seq))
    }
}
