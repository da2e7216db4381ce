//! The bulk-write pipeline.
//!
//! A bulk write runs as a fixed sequence of fallible stages over one transaction buffer:
//!
//! 1. parse and validate every input document (before admission),
//! 2. verify that every attachment stub refers to stored content,
//! 3. fetch the existing metadata of every affected id,
//! 4. write each document in input order, collecting a per-document result,
//! 5. compact stemmed revisions, plus auto-compaction when it runs inline,
//! 6. stage the counters, commit atomically, then advance the in-memory counters and wake
//!    live change feeds.
//!
//! Failures in stages 1 and 2 abort the whole call. Conflicts and other per-document
//! failures in stage 4 only fill that document's result slot. Storage failures are fatal at
//! any stage, and nothing is visible unless the final commit succeeds.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::compaction::compact_revs_in;
use crate::db::config::AutoCompaction;
use crate::db::document::{parse_doc, DocMetadata, DocResult, ParsedDoc, ParsedWrite};
use crate::db::error::{DbError, DbResult};
use crate::db::local::stage_local;
use crate::db::{Database, DbInner, DOC_COUNT_KEY, UPDATE_SEQ_KEY};
use crate::revs::{MergeOutcome, Rev, RevTree};
use crate::storage::{self, seq_key, Partition, Transaction};

#[derive(Clone, Debug)]
pub struct BulkOptions {
    /// `true`: documents propose new child revisions. `false`: documents carry explicit
    /// revisions (replication) and conflicts are stored instead of rejected.
    pub new_edits: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self { new_edits: true }
    }
}

struct BulkWrite<'a> {
    db: &'a DbInner,
    new_edits: bool,
    /// Set for single-document deletes; deleting an already deleted document is an error.
    was_delete: bool,
    txn: Mutex<Transaction>,
    fetched: HashMap<String, DocMetadata>,
    stemmed: Vec<(String, Vec<Rev>)>,
    touched: Vec<String>,
    next_seq: u64,
    doc_count_delta: i64,
}

impl<'a> BulkWrite<'a> {
    fn new(db: &'a DbInner, new_edits: bool, was_delete: bool) -> Self {
        Self {
            db,
            new_edits,
            was_delete,
            txn: Mutex::new(Transaction::new()),
            fetched: HashMap::new(),
            stemmed: Vec::new(),
            touched: Vec::new(),
            next_seq: db.update_seq.load(Ordering::SeqCst),
            doc_count_delta: 0,
        }
    }

    fn verify_stubs(&self, writes: &[ParsedWrite]) -> DbResult<()> {
        for write in writes {
            let ParsedWrite::Doc(doc) = write else { continue };
            for digest in doc.stub_digests() {
                if !self.db.attachments.exists(digest)? {
                    return Err(DbError::MissingAttachmentStub(format!(
                        "unknown stub attachment with digest {}",
                        digest
                    )));
                }
            }
        }
        Ok(())
    }

    fn fetch_existing(&mut self, writes: &[ParsedWrite]) -> DbResult<()> {
        for write in writes {
            let ParsedWrite::Doc(doc) = write else { continue };
            if self.fetched.contains_key(&doc.id) {
                continue;
            }
            if let Some(metadata) = self.db.load_metadata(&doc.id)? {
                self.fetched.insert(doc.id.clone(), metadata);
            }
        }
        Ok(())
    }

    async fn write(&mut self, write: ParsedWrite) -> DbResult<String> {
        match write {
            ParsedWrite::Local(local) => {
                let mut txn = self.txn.lock();
                stage_local(self.db, &mut txn, local)
            }
            ParsedWrite::Doc(doc) => match self.fetched.get(&doc.id).cloned() {
                Some(prev) => self.update_doc(prev, doc).await,
                None => self.insert_doc(doc).await,
            },
        }
    }

    async fn insert_doc(&mut self, doc: ParsedDoc) -> DbResult<String> {
        let mut tree = RevTree::new();
        tree.merge(&doc.path);
        let stemmed = tree.stem(self.db.config.revs_limit);
        let metadata = DocMetadata::from_tree(doc.id.clone(), tree)?;

        if self.was_delete && metadata.deleted {
            return Err(DbError::deleted());
        }
        // A new document that names a parent revision has nothing to build on.
        if self.new_edits && doc.root_is_missing() {
            return Err(DbError::RevisionConflict);
        }

        let delta = if metadata.deleted { 0 } else { 1 };
        let new_rev_deleted = metadata.deleted;
        self.write_doc(doc, metadata, new_rev_deleted, delta, stemmed)
            .await
    }

    async fn update_doc(&mut self, prev: DocMetadata, mut doc: ParsedDoc) -> DbResult<String> {
        if !self.new_edits && prev.rev_tree.contains(&doc.rev) {
            return Ok(doc.rev.to_string());
        }

        let previously_deleted = prev.deleted;
        if self.was_delete && previously_deleted {
            return Err(DbError::deleted());
        }
        if previously_deleted && !doc.deleted && self.new_edits && doc.rev.pos == 1 {
            doc.rebase(&prev.winning_rev)?;
        }

        let mut tree = prev.rev_tree.clone();
        let outcome = tree.merge(&doc.path);
        let in_conflict = self.new_edits
            && ((previously_deleted && doc.deleted && outcome != MergeOutcome::NewLeaf)
                || (!previously_deleted && outcome != MergeOutcome::NewLeaf)
                || (previously_deleted && !doc.deleted && outcome == MergeOutcome::NewBranch));
        if in_conflict {
            debug!(doc_id = %doc.id, rev = %doc.rev, ?outcome, "Revision conflict");
            return Err(DbError::RevisionConflict);
        }

        let stemmed = tree.stem(self.db.config.revs_limit);
        let mut metadata = prev;
        metadata.rev_tree = tree;
        metadata.refresh()?;

        let delta = match (previously_deleted, metadata.deleted) {
            (true, false) => 1,
            (false, true) => -1,
            _ => 0,
        };
        let new_rev_deleted = metadata.rev_tree.is_deleted(&doc.rev);
        self.write_doc(doc, metadata, new_rev_deleted, delta, stemmed)
            .await
    }

    async fn write_doc(
        &mut self,
        doc: ParsedDoc,
        mut metadata: DocMetadata,
        new_rev_deleted: bool,
        delta: i64,
        stemmed: Vec<Rev>,
    ) -> DbResult<String> {
        let rev = doc.rev.to_string();

        let db = self.db;
        let txn = &self.txn;
        let saves = doc.attachments.values().map(|att| {
            let (id, rev) = (doc.id.as_str(), rev.as_str());
            async move {
                match &att.bytes {
                    Some(bytes) => {
                        db.attachments
                            .save_attachment(txn, id, rev, &att.info.digest, bytes)
                            .await
                    }
                    None => db
                        .attachments
                        .add_ref(txn, id, rev, &att.info.digest)
                        .await
                        .map(|_| ()),
                }
            }
        });
        futures::future::try_join_all(saves).await?;

        self.doc_count_delta += delta;
        if !stemmed.is_empty() {
            self.stemmed.push((doc.id.clone(), stemmed));
        }

        if metadata.rev_map.contains_key(&rev) {
            return Ok(rev);
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        metadata.rev_map.insert(rev.clone(), seq);
        metadata.seq = seq;

        let body = serde_json::to_vec(&doc.to_body(new_rev_deleted)?)?;
        {
            let mut txn = self.txn.lock();
            txn.put(Partition::BySeq, seq_key(seq).to_vec(), body);
            txn.put(
                Partition::Docs,
                doc.id.as_bytes().to_vec(),
                storage::encode(&metadata)?,
            );
        }

        debug!(doc_id = %doc.id, rev = %rev, seq, "Staged document revision");
        if !self.touched.contains(&doc.id) {
            self.touched.push(doc.id.clone());
        }
        self.fetched.insert(doc.id, metadata);
        Ok(rev)
    }

    fn compact(&mut self) -> DbResult<()> {
        let db = self.db;
        let txn = self.txn.get_mut();

        for (id, revs) in std::mem::take(&mut self.stemmed) {
            compact_revs_in(db, txn, &id, &revs)?;
        }

        if db.config.auto_compaction == AutoCompaction::Inline {
            for id in &self.touched {
                let Some(bytes) = txn.get(&db.backend, Partition::Docs, id.as_bytes())? else {
                    continue;
                };
                let metadata: DocMetadata = storage::decode(&bytes)?;
                let revs = metadata.rev_tree.compactable_revs();
                compact_revs_in(db, txn, id, &revs)?;
            }
        }
        Ok(())
    }

    /// Commits the batch. Returns the ids of the documents that were written.
    fn commit(self) -> DbResult<Vec<String>> {
        let db = self.db;
        let current = db.doc_count.load(Ordering::SeqCst) as i64;
        let doc_count = (current + self.doc_count_delta).max(0) as u64;

        let mut txn = self.txn.into_inner();
        txn.put(Partition::Meta, UPDATE_SEQ_KEY.to_vec(), seq_key(self.next_seq).to_vec());
        txn.put(Partition::Meta, DOC_COUNT_KEY.to_vec(), seq_key(doc_count).to_vec());
        txn.execute(&db.backend)?;

        db.doc_count.store(doc_count, Ordering::SeqCst);
        db.update_seq.store(self.next_seq, Ordering::SeqCst);
        db.attachments.prune_locks();
        db.hub.notify(&db.config.name);

        debug!(
            update_seq = self.next_seq,
            doc_count,
            docs = self.touched.len(),
            "Committed bulk write"
        );
        Ok(self.touched)
    }
}

fn is_fatal(err: &DbError) -> bool {
    matches!(err, DbError::Storage(_) | DbError::Serialization(_))
}

impl Database {
    /// Writes a batch of documents atomically, returning one result per input document in
    /// input order.
    pub async fn bulk_docs(&self, docs: Vec<Value>, opts: &BulkOptions) -> DbResult<Vec<DocResult>> {
        self.write_docs(docs, opts.new_edits, false).await
    }

    pub(crate) async fn write_docs(
        &self,
        docs: Vec<Value>,
        new_edits: bool,
        was_delete: bool,
    ) -> DbResult<Vec<DocResult>> {
        let writes = docs
            .into_iter()
            .map(|doc| parse_doc(doc, new_edits))
            .collect::<DbResult<Vec<_>>>()?;

        let guard = self.inner.scheduler.write().await?;
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = BulkWrite::new(&self.inner, new_edits, was_delete);
        batch.verify_stubs(&writes)?;
        batch.fetch_existing(&writes)?;

        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let id = write.id().to_string();
            match batch.write(write).await {
                Err(e) if is_fatal(&e) => return Err(e),
                result => results.push(DocResult { id, result }),
            }
        }

        batch.compact()?;
        let touched = batch.commit()?;
        drop(guard);

        if self.inner.config.auto_compaction == AutoCompaction::Deferred && !touched.is_empty() {
            let db = self.clone();
            tokio::spawn(async move {
                if let Err(e) = db.compact_documents(&touched).await {
                    warn!(error = %e, "Deferred compaction failed");
                }
            });
        }

        Ok(results)
    }

    /// Writes a single document and returns its new revision.
    pub async fn put(&self, doc: Value) -> DbResult<String> {
        if doc.get("_id").is_none() {
            return Err(DbError::InvalidDoc("_id is required for puts".to_string()));
        }
        self.write_one(doc, false).await
    }

    /// Writes a single document under a generated id. Returns the id and revision.
    pub async fn post(&self, mut doc: Value) -> DbResult<(String, String)> {
        if let Value::Object(obj) = &mut doc {
            obj.remove("_id");
        }
        let mut results = self.write_docs(vec![doc], true, false).await?;
        let result = results
            .pop()
            .ok_or_else(|| DbError::InvalidDoc("empty write result".to_string()))?;
        let id = result.id.clone();
        Ok((id, result.into_result()?))
    }

    /// Deletes a document at the given revision, returning the deletion's revision.
    pub async fn remove(&self, id: &str, rev: &str) -> DbResult<String> {
        let doc = serde_json::json!({"_id": id, "_rev": rev, "_deleted": true});
        self.write_one(doc, true).await
    }

    async fn write_one(&self, doc: Value, was_delete: bool) -> DbResult<String> {
        self.write_docs(vec![doc], true, was_delete)
            .await?
            .pop()
            .ok_or_else(|| DbError::InvalidDoc("empty write result".to_string()))?
            .into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_db;
    use crate::db::GetOptions;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let first = db.put(json!({"_id": "b"})).await.unwrap();

        let results = db
            .bulk_docs(
                vec![
                    json!({"_id": "a"}),
                    json!({"_id": "b"}),
                    json!({"_id": "b", "_rev": first, "x": 1}),
                ],
                &BulkOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "a");
        assert!(results[0].is_ok());
        assert!(matches!(results[1].error(), Some(DbError::RevisionConflict)));
        assert!(results[2].rev().unwrap().starts_with("2-"));
        assert_eq!(db.info().await.unwrap().doc_count, 2);
    }

    #[tokio::test]
    async fn test_missing_stub_aborts_whole_batch() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);

        let err = db
            .bulk_docs(
                vec![
                    json!({"_id": "ok"}),
                    json!({"_id": "bad", "_attachments": {
                        "f": {"stub": true, "digest": "md5-nothere"}
                    }}),
                ],
                &BulkOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::MissingAttachmentStub(_)));
        assert_eq!(err.status(), 412);
        assert_eq!(db.info().await.unwrap().update_seq, 0);
        assert!(db.get("ok", &GetOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_base64_aborts_whole_batch() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let err = db
            .bulk_docs(
                vec![
                    json!({"_id": "ok"}),
                    json!({"_id": "bad", "_attachments": {"f": {"data": "%%%"}}}),
                ],
                &BulkOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::BadArgument(_)));
        assert_eq!(db.info().await.unwrap().doc_count, 0);
    }

    #[tokio::test]
    async fn test_new_doc_with_unknown_rev_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let err = db
            .put(json!({"_id": "x", "_rev": "1-abc"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::RevisionConflict));
    }

    #[tokio::test]
    async fn test_last_generation_cannot_be_extended() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let last = format!("{}-a", u64::MAX);

        let err = db
            .put(json!({"_id": "x", "_rev": last.clone()}))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidRev(_)));
        assert!(matches!(
            db.get("x", &GetOptions::default()).await,
            Err(DbError::MissingDoc(_))
        ));

        // A deleted leaf at the last generation cannot be recreated on top of
        db.bulk_docs(
            vec![json!({"_id": "x", "_rev": last, "_deleted": true})],
            &BulkOptions { new_edits: false },
        )
        .await
        .unwrap();
        let err = db.put(json!({"_id": "x", "v": 1})).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidRev(_)));
        assert_eq!(db.info().await.unwrap().doc_count, 0);
    }

    #[tokio::test]
    async fn test_replicated_write_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let opts = BulkOptions { new_edits: false };
        let doc = json!({"_id": "r", "_rev": "1-abc", "v": 1});

        db.bulk_docs(vec![doc.clone()], &opts).await.unwrap();
        let seq = db.info().await.unwrap().update_seq;
        let bodies = db.inner.backend.len(Partition::BySeq);

        let again = db.bulk_docs(vec![doc], &opts).await.unwrap();
        assert_eq!(again[0].rev(), Some("1-abc"));
        assert_eq!(db.info().await.unwrap().update_seq, seq);
        assert_eq!(db.inner.backend.len(Partition::BySeq), bodies);
    }

    #[tokio::test]
    async fn test_replicated_branches_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let opts = BulkOptions { new_edits: false };
        db.bulk_docs(
            vec![
                json!({"_id": "c", "_rev": "3-aaa", "_revisions": {"start": 3, "ids": ["aaa", "b", "a"]}}),
                json!({"_id": "c", "_rev": "3-bbb", "_revisions": {"start": 3, "ids": ["bbb", "b", "a"]}}),
            ],
            &opts,
        )
        .await
        .unwrap();

        let opts = GetOptions {
            conflicts: true,
            ..Default::default()
        };
        let doc = db.get("c", &opts).await.unwrap().doc;
        assert_eq!(doc["_rev"], json!("3-bbb"));
        assert_eq!(doc["_conflicts"], json!(["3-aaa"]));
    }

    #[tokio::test]
    async fn test_recreate_after_delete_continues_tree() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let rev1 = db.put(json!({"_id": "x", "v": 1})).await.unwrap();
        let rev2 = db.remove("x", &rev1).await.unwrap();
        assert_eq!(db.info().await.unwrap().doc_count, 0);

        let rev3 = db.put(json!({"_id": "x", "v": 3})).await.unwrap();
        assert!(rev3.starts_with("3-"), "{} should follow {}", rev3, rev2);
        assert_eq!(db.info().await.unwrap().doc_count, 1);

        assert!(matches!(
            db.remove("gone", "1-abc").await,
            Err(DbError::MissingDoc(_))
        ));
        let rev4 = db.remove("x", &rev3).await.unwrap();
        assert!(matches!(
            db.remove("x", &rev4).await,
            Err(DbError::MissingDoc(_))
        ));
    }

    #[tokio::test]
    async fn test_revs_limit_stems_and_purges_bodies() {
        let temp_dir = TempDir::new().unwrap();
        let db = crate::db::Database::open(
            crate::db::DatabaseConfig::new("stem", temp_dir.path()).with_revs_limit(2),
        )
        .unwrap();

        let mut rev = db.put(json!({"_id": "x", "n": 0})).await.unwrap();
        for n in 1..5 {
            rev = db
                .put(json!({"_id": "x", "_rev": rev, "n": n}))
                .await
                .unwrap();
        }

        let tree = db.get_revision_tree("x").await.unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(db.inner.backend.len(Partition::BySeq), 2);
    }

    #[tokio::test]
    async fn test_post_generates_id() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let (id, rev) = db.post(json!({"kind": "note"})).await.unwrap();
        assert!(!id.is_empty());
        assert!(rev.starts_with("1-"));
        assert_eq!(
            db.get(&id, &GetOptions::default()).await.unwrap().doc["kind"],
            json!("note")
        );
    }
}
