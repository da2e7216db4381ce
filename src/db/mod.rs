//! The document database: an MVCC document store over the partitioned sled backend.
//!
//! A [`Database`] handle owns the backend, the attachment store, the operation scheduler and
//! the process-local counters (update sequence and document count). Counters are read back
//! from the meta partition at open time and written in the same atomic batch as every bulk
//! write, so they survive restarts.
//!
//! Every public operation passes through the scheduler: reads share admission, writes
//! (including compaction) run alone. Storage calls made under a guard are synchronous sled
//! calls, so a reader never observes half of a bulk write.

pub mod attachments;
pub mod bulk;
pub mod compaction;
pub mod config;
pub mod document;
pub mod error;
pub mod local;

pub use bulk::BulkOptions;
pub use compaction::{CompactionMode, CompactionSummary, Compactor};
pub use config::{AutoCompaction, DatabaseConfig};
pub use document::{
    is_local_id, parse_doc, AttachmentInfo, DocMetadata, DocResult, ParsedDoc, ParsedWrite,
};
pub use error::{DbError, DbResult};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::attachments::{encode_payload, AttachmentStore};
use crate::changes::ChangesHub;
use crate::revs::{Rev, RevStatus, RevTree};
use crate::scheduler::Scheduler;
use crate::storage::{self, seq_key, Backend, Partition, ScanOptions, StorageError};

pub(crate) const UPDATE_SEQ_KEY: &[u8] = b"_local_last_update_seq";
pub(crate) const DOC_COUNT_KEY: &[u8] = b"_local_doc_count";
pub(crate) const UUID_KEY: &[u8] = b"_local_uuid";

/// Options for reading a single document.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// A specific revision instead of the winner.
    pub rev: Option<String>,
    /// Resolve `rev` to the newest leaf descending from it.
    pub latest: bool,
    /// Add `_conflicts`.
    pub conflicts: bool,
    /// Add `_revisions`.
    pub revs: bool,
    /// Add `_revs_info`.
    pub revs_info: bool,
    /// Inline attachment bodies as base64 instead of stubs.
    pub attachments: bool,
}

/// A document body together with its metadata. Local documents have no metadata.
#[derive(Clone, Debug)]
pub struct FetchedDoc {
    pub doc: Value,
    pub metadata: Option<DocMetadata>,
}

/// Which revisions [`Database::get_open_revs`] should return.
#[derive(Clone, Debug)]
pub enum OpenRevs {
    /// Every leaf.
    All,
    Revs(Vec<String>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum OpenRev {
    Ok(Value),
    Missing(String),
}

#[derive(Clone, Debug, Default)]
pub struct AllDocsOptions {
    pub startkey: Option<String>,
    pub endkey: Option<String>,
    pub key: Option<String>,
    pub keys: Option<Vec<String>>,
    pub descending: bool,
    pub skip: usize,
    pub limit: Option<usize>,
    /// `false` excludes a row whose id equals `endkey`. `None` means inclusive.
    pub inclusive_end: Option<bool>,
    pub include_docs: bool,
    pub conflicts: bool,
    pub attachments: bool,
    /// Include deleted documents as `deleted` rows.
    pub deleted_ok: bool,
    pub update_seq: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RowValue {
    pub rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllDocsRow {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<RowValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllDocsResponse {
    pub total_rows: u64,
    pub offset: usize,
    pub rows: Vec<AllDocsRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_seq: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DbInfo {
    pub db_name: String,
    pub doc_count: u64,
    pub update_seq: u64,
    pub auto_compaction: String,
    pub backend: String,
    pub disk_size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RevsDiff {
    pub missing: Vec<String>,
}

pub(crate) struct DbInner {
    pub(crate) config: DatabaseConfig,
    pub(crate) backend: Arc<Backend>,
    pub(crate) attachments: AttachmentStore,
    pub(crate) scheduler: Scheduler,
    pub(crate) hub: Arc<ChangesHub>,
    pub(crate) update_seq: AtomicU64,
    pub(crate) doc_count: AtomicU64,
    pub(crate) instance_id: String,
}

/// Handle to an open database. Clones share the same underlying instance.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

fn read_counter(backend: &Backend, key: &[u8]) -> DbResult<u64> {
    match backend.get(Partition::Meta, key)? {
        Some(bytes) => storage::parse_seq_key(&bytes)
            .ok_or_else(|| StorageError::Corrupt(format!("counter {:?}", key)).into()),
        None => Ok(0),
    }
}

impl Database {
    /// Opens (or creates) a database with its own change listener registry.
    pub fn open(config: DatabaseConfig) -> DbResult<Self> {
        Self::open_with_hub(config, Arc::new(ChangesHub::new()))
    }

    /// Opens a database whose live change feeds are registered in a shared hub.
    pub fn open_with_hub(config: DatabaseConfig, hub: Arc<ChangesHub>) -> DbResult<Self> {
        config.validate()?;
        let backend = Backend::new(config.backend_config())?;

        let update_seq = read_counter(&backend, UPDATE_SEQ_KEY)?;
        let doc_count = read_counter(&backend, DOC_COUNT_KEY)?;
        let instance_id = match backend.get(Partition::Meta, UUID_KEY)? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| StorageError::Corrupt("instance id".to_string()))?,
            None => {
                let id = Uuid::new_v4().to_string();
                backend.put(Partition::Meta, UUID_KEY, id.as_bytes())?;
                id
            }
        };

        info!(
            name = %config.name,
            update_seq,
            doc_count,
            "Opened database at {:?}",
            config.data_dir
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                attachments: AttachmentStore::new(Arc::clone(&backend)),
                backend,
                scheduler: Scheduler::new(),
                hub,
                update_seq: AtomicU64::new(update_seq),
                doc_count: AtomicU64::new(doc_count),
                instance_id,
                config,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// The persisted instance id, stable across restarts.
    pub async fn id(&self) -> DbResult<String> {
        let _guard = self.inner.scheduler.read().await?;
        Ok(self.inner.instance_id.clone())
    }

    pub async fn info(&self) -> DbResult<DbInfo> {
        let _guard = self.inner.scheduler.read().await?;
        Ok(DbInfo {
            db_name: self.inner.config.name.clone(),
            doc_count: self.inner.doc_count.load(Ordering::SeqCst),
            update_seq: self.inner.update_seq.load(Ordering::SeqCst),
            auto_compaction: self.inner.config.auto_compaction.to_string(),
            backend: "sled".to_string(),
            disk_size: self.inner.backend.size(),
        })
    }

    /// Reads a document: the winner by default, or the revision named in `opts`.
    pub async fn get(&self, id: &str, opts: &GetOptions) -> DbResult<FetchedDoc> {
        if is_local_id(id) {
            let doc = self.get_local(id).await?;
            return Ok(FetchedDoc {
                doc,
                metadata: None,
            });
        }

        let _guard = self.inner.scheduler.read().await?;
        let metadata = self.inner.load_metadata(id)?.ok_or_else(DbError::missing)?;

        let rev = match &opts.rev {
            None => {
                if metadata.deleted {
                    return Err(DbError::deleted());
                }
                metadata.winning_rev.clone()
            }
            Some(rev) => {
                let rev: Rev = rev.parse()?;
                if opts.latest {
                    metadata.rev_tree.latest(&rev).ok_or_else(DbError::missing)?
                } else {
                    rev
                }
            }
        };

        let body = self
            .inner
            .load_revision(&metadata, &rev)?
            .ok_or_else(DbError::missing)?;
        let doc = self.inner.shape_doc(body, &metadata, &rev, opts)?;
        Ok(FetchedDoc {
            doc,
            metadata: Some(metadata),
        })
    }

    /// Reads several revisions of a document at once, including deleted ones.
    pub async fn get_open_revs(&self, id: &str, revs: &OpenRevs) -> DbResult<Vec<OpenRev>> {
        let _guard = self.inner.scheduler.read().await?;
        let metadata = self.inner.load_metadata(id)?.ok_or_else(DbError::missing)?;

        let wanted: Vec<String> = match revs {
            OpenRevs::All => metadata
                .rev_tree
                .leaves()
                .into_iter()
                .map(|leaf| leaf.rev.to_string())
                .collect(),
            OpenRevs::Revs(list) => list.clone(),
        };

        let opts = GetOptions::default();
        let mut out = Vec::with_capacity(wanted.len());
        for rev_str in wanted {
            let body = match rev_str.parse::<Rev>() {
                Ok(rev) => self
                    .inner
                    .load_revision(&metadata, &rev)?
                    .map(|body| (rev, body)),
                Err(_) => None,
            };
            match body {
                Some((rev, body)) => {
                    out.push(OpenRev::Ok(self.inner.shape_doc(body, &metadata, &rev, &opts)?))
                }
                None => out.push(OpenRev::Missing(rev_str)),
            }
        }
        Ok(out)
    }

    /// Reports which of the given revisions this database does not know.
    pub async fn revs_diff(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> DbResult<BTreeMap<String, RevsDiff>> {
        let _guard = self.inner.scheduler.read().await?;
        let mut diff = BTreeMap::new();
        for (id, wanted) in revs {
            let metadata = self.inner.load_metadata(id)?;
            let missing: Vec<String> = wanted
                .iter()
                .filter(|rev| match (&metadata, rev.parse::<Rev>()) {
                    (Some(m), Ok(rev)) => !m.rev_tree.contains(&rev),
                    _ => true,
                })
                .cloned()
                .collect();
            if !missing.is_empty() {
                diff.insert(id.clone(), RevsDiff { missing });
            }
        }
        Ok(diff)
    }

    pub async fn get_revision_tree(&self, id: &str) -> DbResult<RevTree> {
        let _guard = self.inner.scheduler.read().await?;
        self.inner
            .load_metadata(id)?
            .map(|m| m.rev_tree)
            .ok_or_else(DbError::missing)
    }

    /// Lists documents in id order.
    pub async fn all_docs(&self, opts: &AllDocsOptions) -> DbResult<AllDocsResponse> {
        if let Some(keys) = &opts.keys {
            if opts.startkey.is_some() || opts.endkey.is_some() || opts.key.is_some() {
                return Err(DbError::BadArgument(
                    "keys is not compatible with startkey, endkey or key".to_string(),
                ));
            }
            let _guard = self.inner.scheduler.read().await?;
            return self.inner.all_docs_by_keys(keys, opts);
        }

        let _guard = self.inner.scheduler.read().await?;
        self.inner.all_docs_range(opts)
    }

    /// Stops accepting operations, waits for running ones, cancels live feeds and flushes.
    /// A second close fails with `NotOpen`.
    pub async fn close(&self) -> DbResult<()> {
        let guard = self.inner.scheduler.write().await?;
        self.inner.scheduler.close();
        let canceled = self.inner.hub.remove_all(&self.inner.config.name);
        self.inner.backend.flush()?;
        drop(guard);
        info!(name = %self.inner.config.name, canceled, "Closed database");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.scheduler.is_closed()
    }

    /// Closes the database and removes everything it stored.
    pub async fn destroy(&self) -> DbResult<()> {
        match self.close().await {
            Ok(()) | Err(DbError::NotOpen) => {}
            Err(e) => return Err(e),
        }
        self.inner.backend.clear_all()?;
        self.inner.backend.flush()?;
        let dir = self.inner.backend.data_dir().to_path_buf();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| StorageError::Backend(storage::BackendError::IoError(e)))?;
        }
        info!(name = %self.inner.config.name, "Destroyed database");
        Ok(())
    }
}

impl DbInner {
    pub(crate) fn load_metadata(&self, id: &str) -> DbResult<Option<DocMetadata>> {
        match self.backend.get(Partition::Docs, id.as_bytes())? {
            Some(bytes) => Ok(Some(storage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn load_body(&self, seq: u64) -> DbResult<Option<Map<String, Value>>> {
        match self.backend.get(Partition::BySeq, &seq_key(seq))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Body of a specific revision, if it is still stored.
    pub(crate) fn load_revision(
        &self,
        metadata: &DocMetadata,
        rev: &Rev,
    ) -> DbResult<Option<Map<String, Value>>> {
        match metadata.seq_of(rev) {
            Some(seq) => self.load_body(seq),
            None => Ok(None),
        }
    }

    /// Turns a stored body into the document a reader sees.
    pub(crate) fn shape_doc(
        &self,
        mut body: Map<String, Value>,
        metadata: &DocMetadata,
        rev: &Rev,
        opts: &GetOptions,
    ) -> DbResult<Value> {
        body.insert("_id".to_string(), Value::String(metadata.id.clone()));
        body.insert("_rev".to_string(), Value::String(rev.to_string()));

        if opts.conflicts {
            let conflicts = metadata.rev_tree.collect_conflicts();
            if !conflicts.is_empty() {
                body.insert(
                    "_conflicts".to_string(),
                    json!(conflicts.iter().map(Rev::to_string).collect::<Vec<_>>()),
                );
            }
        }

        if opts.revs || opts.revs_info {
            let ancestry = metadata.rev_tree.ancestry(rev);
            if opts.revs {
                let ids: Vec<&str> = ancestry.iter().map(|n| n.hash.as_str()).collect();
                body.insert("_revisions".to_string(), json!({"start": rev.pos, "ids": ids}));
            }
            if opts.revs_info {
                let info: Vec<Value> = ancestry
                    .iter()
                    .map(|n| {
                        let status = match (n.status, n.deleted) {
                            (RevStatus::Available, true) => "deleted",
                            (status, _) => status.as_str(),
                        };
                        json!({"rev": n.rev().to_string(), "status": status})
                    })
                    .collect();
                body.insert("_revs_info".to_string(), Value::Array(info));
            }
        }

        if let Some(Value::Object(atts)) = body.get_mut("_attachments") {
            for att in atts.values_mut() {
                let Value::Object(att) = att else { continue };
                if opts.attachments {
                    let digest = att.get("digest").and_then(Value::as_str).unwrap_or_default();
                    let bytes = self.attachments.get_attachment(digest)?.unwrap_or_default();
                    att.remove("stub");
                    att.remove("length");
                    att.insert("data".to_string(), Value::String(encode_payload(&bytes)));
                } else {
                    att.insert("stub".to_string(), Value::Bool(true));
                }
            }
        }

        Ok(Value::Object(body))
    }

    fn row_for(
        &self,
        metadata: &DocMetadata,
        opts: &AllDocsOptions,
    ) -> DbResult<AllDocsRow> {
        let rev = metadata.winning_rev.to_string();
        if metadata.deleted {
            return Ok(AllDocsRow {
                key: metadata.id.clone(),
                id: Some(metadata.id.clone()),
                value: Some(RowValue {
                    rev,
                    deleted: Some(true),
                }),
                doc: opts.include_docs.then_some(Value::Null),
                error: None,
            });
        }

        let doc = if opts.include_docs {
            let shape = GetOptions {
                conflicts: opts.conflicts,
                attachments: opts.attachments,
                ..Default::default()
            };
            match self.load_revision(metadata, &metadata.winning_rev)? {
                Some(body) => Some(self.shape_doc(body, metadata, &metadata.winning_rev, &shape)?),
                None => Some(Value::Null),
            }
        } else {
            None
        };

        Ok(AllDocsRow {
            key: metadata.id.clone(),
            id: Some(metadata.id.clone()),
            value: Some(RowValue { rev, deleted: None }),
            doc,
            error: None,
        })
    }

    fn all_docs_range(&self, opts: &AllDocsOptions) -> DbResult<AllDocsResponse> {
        let total_rows = self.doc_count.load(Ordering::SeqCst);
        let update_seq = opts
            .update_seq
            .then(|| self.update_seq.load(Ordering::SeqCst));

        let mut scan = ScanOptions::default();
        if let Some(start) = &opts.startkey {
            scan.gte = Some(start.as_bytes().to_vec());
        }
        if let Some(end) = &opts.endkey {
            scan.lte = Some(end.as_bytes().to_vec());
        }
        if let Some(key) = &opts.key {
            scan.gte = Some(key.as_bytes().to_vec());
            scan.lte = Some(key.as_bytes().to_vec());
        }
        if opts.descending {
            scan.reverse = true;
            std::mem::swap(&mut scan.gte, &mut scan.lte);
        }

        let mut rows = Vec::new();
        if opts.limit != Some(0) {
            let mut skip = opts.skip;
            let mut remaining = opts.limit;
            let exclusive_end = opts.inclusive_end == Some(false);

            for item in self.backend.iter(Partition::Docs, &scan) {
                let (_, value) = item?;
                let metadata: DocMetadata = storage::decode(&value)?;
                if !metadata.deleted {
                    if skip > 0 {
                        skip -= 1;
                        continue;
                    }
                    if remaining == Some(0) {
                        break;
                    }
                    if let Some(r) = remaining.as_mut() {
                        *r -= 1;
                    }
                } else if !opts.deleted_ok {
                    continue;
                }
                if exclusive_end && opts.endkey.as_deref() == Some(metadata.id.as_str()) {
                    continue;
                }
                rows.push(self.row_for(&metadata, opts)?);
            }
        }

        debug!(rows = rows.len(), "all_docs scan complete");
        Ok(AllDocsResponse {
            total_rows,
            offset: opts.skip,
            rows,
            update_seq,
        })
    }

    fn all_docs_by_keys(&self, keys: &[String], opts: &AllDocsOptions) -> DbResult<AllDocsResponse> {
        let mut keys: Vec<&String> = keys.iter().collect();
        if opts.descending {
            keys.reverse();
        }
        let keys = keys.into_iter().skip(opts.skip);
        let keys: Vec<&String> = match opts.limit {
            Some(limit) => keys.take(limit).collect(),
            None => keys.collect(),
        };

        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            match self.load_metadata(key)? {
                Some(metadata) => rows.push(self.row_for(&metadata, opts)?),
                None => rows.push(AllDocsRow {
                    key: key.clone(),
                    id: None,
                    value: None,
                    doc: None,
                    error: Some("not_found".to_string()),
                }),
            }
        }

        Ok(AllDocsResponse {
            total_rows: self.doc_count.load(Ordering::SeqCst),
            offset: opts.skip,
            rows,
            update_seq: opts
                .update_seq
                .then(|| self.update_seq.load(Ordering::SeqCst)),
        })
    }
}
