//! Sled-backed persistent storage backend.
//!
//! This module provides the low-level ordered key-value interface the document engine is
//! built on. Every category of record lives in its own sled tree ("partition"), so document
//! metadata, sequence-keyed bodies, attachment metadata, attachment bytes, local documents and
//! engine counters never collide in key space:
//!
//! - `document-store`: document id -> revision metadata
//! - `by-sequence`: sequence number -> document body for one revision
//! - `attach-store`: digest -> attachment reference set
//! - `attach-binary-store`: digest -> raw attachment bytes
//! - `local-store`: local document id -> local document
//! - `meta-store`: update sequence, document count and instance id
//!
//! Multi-partition writes go through [`Backend::apply`], which commits a whole batch in a
//! single sled transaction.

use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use thiserror::Error;
use tracing::{debug, info};

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A logical key space inside the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    Docs,
    BySeq,
    Attachments,
    Binaries,
    Local,
    Meta,
}

impl Partition {
    pub const ALL: [Partition; 6] = [
        Partition::Docs,
        Partition::BySeq,
        Partition::Attachments,
        Partition::Binaries,
        Partition::Local,
        Partition::Meta,
    ];

    /// Name of the sled tree backing this partition.
    pub fn tree_name(self) -> &'static str {
        match self {
            Partition::Docs => "document-store",
            Partition::BySeq => "by-sequence",
            Partition::Attachments => "attach-store",
            Partition::Binaries => "attach-binary-store",
            Partition::Local => "local-store",
            Partition::Meta => "meta-store",
        }
    }
}

/// Builds a by-sequence key. Big-endian keeps sled's byte order equal to numeric order.
pub fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

/// Parses a by-sequence key written by [`seq_key`].
pub fn parse_seq_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// A single staged mutation: `value == None` deletes the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchOp {
    pub partition: Partition,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl BatchOp {
    pub fn put(partition: Partition, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(partition: Partition, key: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            key: key.into(),
            value: None,
        }
    }
}

/// Options for ordered range iteration. Both bounds are inclusive.
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    pub gte: Option<Vec<u8>>,
    pub lte: Option<Vec<u8>>,
    pub reverse: bool,
    /// 0 means unlimited.
    pub limit: usize,
}

impl ScanOptions {
    fn bounds(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let lower = match &self.gte {
            Some(k) => Bound::Included(k.clone()),
            None => Bound::Unbounded,
        };
        let upper = match &self.lte {
            Some(k) => Bound::Included(k.clone()),
            None => Bound::Unbounded,
        };
        (lower, upper)
    }

    fn is_empty_range(&self) -> bool {
        matches!((&self.gte, &self.lte), (Some(lo), Some(hi)) if lo > hi)
    }
}

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Maximum page cache size in megabytes.
    pub cache_size_mb: u64,

    /// Flush interval in milliseconds. 0 disables background flushing.
    pub flush_interval_ms: u64,

    /// Enable sled's zstd value compression (requires sled's `compression` feature).
    pub compression: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            compression: false,
        }
    }
}

/// The persistent storage backend using sled.
pub struct Backend {
    db: sled::Db,
    docs: sled::Tree,
    by_seq: sled::Tree,
    attachments: sled::Tree,
    binaries: sled::Tree,
    local: sled::Tree,
    meta: sled::Tree,
    config: BackendConfig,
}

impl Backend {
    /// Opens (or creates) the backend and all of its partitions.
    pub fn new(config: BackendConfig) -> BackendResult<Arc<Self>> {
        debug!("Initializing storage backend at {:?}", config.data_dir);

        std::fs::create_dir_all(&config.data_dir)?;

        let flush_every = (config.flush_interval_ms > 0).then_some(config.flush_interval_ms);
        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(flush_every)
            .use_compression(config.compression)
            .open()
            .map_err(|e| BackendError::ConfigError(format!("Failed to open sled database: {}", e)))?;

        let docs = db.open_tree(Partition::Docs.tree_name())?;
        let by_seq = db.open_tree(Partition::BySeq.tree_name())?;
        let attachments = db.open_tree(Partition::Attachments.tree_name())?;
        let binaries = db.open_tree(Partition::Binaries.tree_name())?;
        let local = db.open_tree(Partition::Local.tree_name())?;
        let meta = db.open_tree(Partition::Meta.tree_name())?;

        info!(
            "Storage backend initialized with cache_size={}MB, flush_interval={}ms",
            config.cache_size_mb, config.flush_interval_ms
        );

        Ok(Arc::new(Self {
            db,
            docs,
            by_seq,
            attachments,
            binaries,
            local,
            meta,
            config,
        }))
    }

    fn tree(&self, partition: Partition) -> &sled::Tree {
        match partition {
            Partition::Docs => &self.docs,
            Partition::BySeq => &self.by_seq,
            Partition::Attachments => &self.attachments,
            Partition::Binaries => &self.binaries,
            Partition::Local => &self.local,
            Partition::Meta => &self.meta,
        }
    }

    /// Data directory this backend was opened at.
    pub fn data_dir(&self) -> &std::path::Path {
        &self.config.data_dir
    }

    /// Retrieves a value by key from the given partition.
    pub fn get(&self, partition: Partition, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.tree(partition).get(key)?.map(|v| v.to_vec()))
    }

    /// Stores a single key-value pair outside of any transaction.
    pub fn put(&self, partition: Partition, key: &[u8], value: &[u8]) -> BackendResult<()> {
        self.tree(partition).insert(key, value)?;
        Ok(())
    }

    /// Deletes a single key outside of any transaction.
    pub fn delete(&self, partition: Partition, key: &[u8]) -> BackendResult<()> {
        self.tree(partition).remove(key)?;
        Ok(())
    }

    /// Returns whether a key is present in the partition.
    pub fn contains(&self, partition: Partition, key: &[u8]) -> BackendResult<bool> {
        Ok(self.tree(partition).contains_key(key)?)
    }

    /// Iterates a partition in key order (or reverse order) within the inclusive bounds.
    pub fn iter(
        &self,
        partition: Partition,
        opts: &ScanOptions,
    ) -> Box<dyn Iterator<Item = BackendResult<(Vec<u8>, Vec<u8>)>>> {
        if opts.is_empty_range() {
            return Box::new(std::iter::empty());
        }
        let range = self.tree(partition).range::<Vec<u8>, _>(opts.bounds());
        let items = range.map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(BackendError::from)
        });
        let items: Box<dyn Iterator<Item = _>> = if opts.reverse {
            Box::new(items.rev())
        } else {
            Box::new(items)
        };
        if opts.limit > 0 {
            Box::new(items.take(opts.limit))
        } else {
            items
        }
    }

    /// Collects a range scan into memory.
    pub fn scan(
        &self,
        partition: Partition,
        opts: &ScanOptions,
    ) -> BackendResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.iter(partition, opts).collect()
    }

    /// Number of keys stored in a partition.
    pub fn len(&self, partition: Partition) -> usize {
        self.tree(partition).len()
    }

    /// Applies every operation atomically across all partitions.
    ///
    /// Either all ops become visible or none do; later ops on the same key win.
    pub fn apply(&self, ops: &[BatchOp]) -> BackendResult<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let trees = (
            &self.docs,
            &self.by_seq,
            &self.attachments,
            &self.binaries,
            &self.local,
            &self.meta,
        );

        let result: Result<(), TransactionError<()>> =
            trees.transaction(|(docs, by_seq, attachments, binaries, local, meta)| {
                for op in ops {
                    let tree = match op.partition {
                        Partition::Docs => docs,
                        Partition::BySeq => by_seq,
                        Partition::Attachments => attachments,
                        Partition::Binaries => binaries,
                        Partition::Local => local,
                        Partition::Meta => meta,
                    };
                    match &op.value {
                        Some(value) => {
                            tree.insert(op.key.as_slice(), value.as_slice())?;
                        }
                        None => {
                            tree.remove(op.key.as_slice())?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            });

        match result {
            Ok(()) => {
                debug!(ops = ops.len(), "Applied atomic batch");
                Ok(())
            }
            Err(TransactionError::Storage(e)) => Err(BackendError::SledError(e)),
            Err(TransactionError::Abort(())) => Err(BackendError::TransactionAborted(
                "batch transaction aborted".to_string(),
            )),
        }
    }

    /// Returns the approximate total size of the database in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Clears all data from all partitions.
    pub fn clear_all(&self) -> BackendResult<()> {
        for partition in Partition::ALL {
            self.tree(partition).clear()?;
        }
        info!("Cleared all backend partitions");
        Ok(())
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> Arc<Backend> {
        let config = BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            cache_size_mb: 16,
            flush_interval_ms: 0,
            compression: false,
        };
        Backend::new(config).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir);

        backend.put(Partition::Docs, b"doc1", b"meta").unwrap();
        assert_eq!(
            backend.get(Partition::Docs, b"doc1").unwrap(),
            Some(b"meta".to_vec())
        );

        // Partitions do not share key space
        assert_eq!(backend.get(Partition::Local, b"doc1").unwrap(), None);

        backend.delete(Partition::Docs, b"doc1").unwrap();
        assert_eq!(backend.get(Partition::Docs, b"doc1").unwrap(), None);
    }

    #[test]
    fn test_apply_spans_partitions() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir);
        backend.put(Partition::Binaries, b"old", b"bytes").unwrap();

        backend
            .apply(&[
                BatchOp::put(Partition::BySeq, seq_key(1).to_vec(), b"body".to_vec()),
                BatchOp::put(Partition::Docs, b"doc".to_vec(), b"meta".to_vec()),
                BatchOp::delete(Partition::Binaries, b"old".to_vec()),
            ])
            .unwrap();

        assert!(backend.contains(Partition::BySeq, &seq_key(1)).unwrap());
        assert!(backend.contains(Partition::Docs, b"doc").unwrap());
        assert!(!backend.contains(Partition::Binaries, b"old").unwrap());
    }

    #[test]
    fn test_scan_bounds_reverse_and_limit() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir);

        for seq in 1..=5u64 {
            backend
                .put(Partition::BySeq, &seq_key(seq), seq.to_string().as_bytes())
                .unwrap();
        }

        let forward = backend
            .scan(
                Partition::BySeq,
                &ScanOptions {
                    gte: Some(seq_key(2).to_vec()),
                    lte: Some(seq_key(4).to_vec()),
                    ..Default::default()
                },
            )
            .unwrap();
        let seqs: Vec<u64> = forward
            .iter()
            .filter_map(|(k, _)| parse_seq_key(k))
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);

        let backward = backend
            .scan(
                Partition::BySeq,
                &ScanOptions {
                    reverse: true,
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        let seqs: Vec<u64> = backward
            .iter()
            .filter_map(|(k, _)| parse_seq_key(k))
            .collect();
        assert_eq!(seqs, vec![5, 4]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open(&temp_dir);
        backend.put(Partition::Docs, b"b", b"1").unwrap();

        let rows = backend
            .scan(
                Partition::Docs,
                &ScanOptions {
                    gte: Some(b"c".to_vec()),
                    lte: Some(b"a".to_vec()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_seq_keys_sort_numerically() {
        assert!(seq_key(9) < seq_key(10));
        assert!(seq_key(255) < seq_key(256));
        assert_eq!(parse_seq_key(&seq_key(42)), Some(42));
        assert_eq!(parse_seq_key(b"short"), None);
    }
}
