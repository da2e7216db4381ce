//! Content-addressed attachment storage with reference tracking.
//!
//! Attachments live in two partitions keyed by digest: the reference record
//! ([`AttachmentRefs`], one `"<doc id>@<rev>"` entry per revision that uses the content) and
//! the raw bytes. Identical content uploaded by any number of documents is stored once. The
//! bytes may only be deleted when the reference set becomes empty.
//!
//! Reference updates for one digest are serialized through [`DigestLocks`], because sibling
//! documents in one bulk write can reference the same new digest concurrently.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::storage::{self, Backend, Partition, StorageResult, Transaction};

/// Digest of decoded attachment content: `"md5-"` followed by the lowercase hex md5.
pub fn digest_of(bytes: &[u8]) -> String {
    format!("md5-{}", hex::encode(md5::compute(bytes).0))
}

/// Decodes a base64 transport payload into raw bytes.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}

pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Key identifying one revision's use of an attachment.
pub fn ref_key(doc_id: &str, rev: &str) -> String {
    format!("{}@{}", doc_id, rev)
}

/// Reference record stored per digest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRefs {
    pub refs: BTreeSet<String>,
}

/// Per-digest async locks.
#[derive(Debug, Default)]
pub struct DigestLocks {
    table: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl DigestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder has this digest locked.
    pub async fn acquire(&self, digest: &str) -> OwnedMutexGuard<()> {
        let lock = self.table.entry(digest.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Forgets locks nobody holds or waits on.
    pub fn prune(&self) {
        self.table.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub struct AttachmentStore {
    backend: Arc<Backend>,
    locks: DigestLocks,
}

impl AttachmentStore {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            locks: DigestLocks::new(),
        }
    }

    /// Returns the stored bytes for a digest, or `None` if the digest is unknown.
    /// Known digests without a binary entry are empty attachments.
    pub fn get_attachment(&self, digest: &str) -> StorageResult<Option<Vec<u8>>> {
        if !self.backend.contains(Partition::Attachments, digest.as_bytes())? {
            return Ok(None);
        }
        let bytes = self
            .backend
            .get(Partition::Binaries, digest.as_bytes())?
            .unwrap_or_default();
        Ok(Some(bytes))
    }

    /// Whether any revision references this digest.
    pub fn exists(&self, digest: &str) -> StorageResult<bool> {
        Ok(self.backend.contains(Partition::Attachments, digest.as_bytes())?)
    }

    pub fn refs(&self, txn: &Transaction, digest: &str) -> StorageResult<Option<AttachmentRefs>> {
        match txn.get(&self.backend, Partition::Attachments, digest.as_bytes())? {
            Some(bytes) => Ok(Some(storage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Records that `doc_id@rev` uses `digest`. Returns `true` if the digest was not known
    /// before.
    pub async fn add_ref(
        &self,
        txn: &Mutex<Transaction>,
        doc_id: &str,
        rev: &str,
        digest: &str,
    ) -> StorageResult<bool> {
        let _held = self.locks.acquire(digest).await;

        let mut txn = txn.lock();
        let existing = self.refs(&txn, digest)?;
        let is_new = existing.is_none();
        let mut record = existing.unwrap_or_default();
        record.refs.insert(ref_key(doc_id, rev));
        txn.put(
            Partition::Attachments,
            digest.as_bytes().to_vec(),
            storage::encode(&record)?,
        );
        Ok(is_new)
    }

    /// Adds the reference and, for content not seen before, stages the bytes.
    pub async fn save_attachment(
        &self,
        txn: &Mutex<Transaction>,
        doc_id: &str,
        rev: &str,
        digest: &str,
        bytes: &[u8],
    ) -> StorageResult<()> {
        let is_new = self.add_ref(txn, doc_id, rev, digest).await?;
        if is_new && !bytes.is_empty() {
            debug!(digest = %digest, size = bytes.len(), "Storing new attachment");
            txn.lock().put(
                Partition::Binaries,
                digest.as_bytes().to_vec(),
                bytes.to_vec(),
            );
        }
        Ok(())
    }

    /// Drops the purged reference keys from a digest's record. Orphaned content loses both
    /// its record and its bytes. Returns `true` if the attachment was orphaned.
    pub fn release_refs(
        &self,
        txn: &mut Transaction,
        digest: &str,
        purged: &HashSet<String>,
    ) -> StorageResult<bool> {
        let Some(mut record) = self.refs(txn, digest)? else {
            return Ok(false);
        };
        record.refs.retain(|r| !purged.contains(r));
        if record.refs.is_empty() {
            debug!(digest = %digest, "Removing orphaned attachment");
            txn.delete(Partition::Attachments, digest.as_bytes().to_vec());
            txn.delete(Partition::Binaries, digest.as_bytes().to_vec());
            Ok(true)
        } else {
            txn.put(
                Partition::Attachments,
                digest.as_bytes().to_vec(),
                storage::encode(&record)?,
            );
            Ok(false)
        }
    }

    /// Releases per-digest locks that are no longer in use.
    pub fn prune_locks(&self) {
        self.locks.prune();
    }
}
