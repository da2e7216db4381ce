//! Compaction: purging superseded revision bodies and orphaned attachments.
//!
//! Purging a revision removes its body from the sequence partition, drops it from the
//! document's `rev_map`, marks its tree node missing and releases the attachment references it
//! held. Attachments left without references lose both their record and their bytes. All of it
//! is staged in one transaction together with the updated metadata.
//!
//! A background [`Compactor`] can run whole-database compaction periodically or once.

use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::attachments::ref_key;
use crate::changes::ChangesOptions;
use crate::db::document::{DocMetadata, LocalWrite};
use crate::db::error::{DbError, DbResult};
use crate::db::local::stage_local;
use crate::db::{Database, DbInner};
use crate::revs::Rev;
use crate::storage::{self, seq_key, Partition, Transaction};

const COMPACTION_CHECKPOINT: &str = "_local/compaction";

/// Stages the purge of `revs` from one document into `txn`. Returns how many bodies were
/// removed.
pub(crate) fn compact_revs_in(
    db: &DbInner,
    txn: &mut Transaction,
    doc_id: &str,
    revs: &[Rev],
) -> DbResult<usize> {
    if revs.is_empty() {
        return Ok(0);
    }
    let bytes = txn
        .get(&db.backend, Partition::Docs, doc_id.as_bytes())?
        .ok_or_else(DbError::missing)?;
    let mut metadata: DocMetadata = storage::decode(&bytes)?;

    let purge: HashSet<Rev> = revs.iter().cloned().collect();
    let seqs: Vec<u64> = revs
        .iter()
        .filter_map(|rev| metadata.rev_map.remove(&rev.to_string()))
        .collect();
    metadata.rev_tree.mark_missing(&purge);
    txn.put(
        Partition::Docs,
        doc_id.as_bytes().to_vec(),
        storage::encode(&metadata)?,
    );

    let mut digests = BTreeSet::new();
    for seq in &seqs {
        let key = seq_key(*seq);
        if let Some(body) = txn.get(&db.backend, Partition::BySeq, &key)? {
            let body: Value = serde_json::from_slice(&body)?;
            if let Some(Value::Object(atts)) = body.get("_attachments") {
                for att in atts.values() {
                    if let Some(digest) = att.get("digest").and_then(Value::as_str) {
                        digests.insert(digest.to_string());
                    }
                }
            }
        }
        txn.delete(Partition::BySeq, key.to_vec());
    }

    let purged_refs: HashSet<String> = revs
        .iter()
        .map(|rev| ref_key(doc_id, &rev.to_string()))
        .collect();
    let mut orphaned = 0;
    for digest in &digests {
        if db.attachments.release_refs(txn, digest, &purged_refs)? {
            orphaned += 1;
        }
    }

    debug!(
        doc_id = %doc_id,
        revs = revs.len(),
        bodies = seqs.len(),
        orphaned,
        "Staged revision purge"
    );
    Ok(seqs.len())
}

/// Result of a whole-database compaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    pub docs_compacted: usize,
    pub revs_purged: usize,
    pub last_seq: u64,
}

impl Database {
    /// Purges the given revisions of one document.
    pub async fn compact_revisions(&self, doc_id: &str, revs: &[String]) -> DbResult<()> {
        let revs = revs
            .iter()
            .map(|rev| rev.parse::<Rev>())
            .collect::<Result<Vec<_>, _>>()?;

        let _guard = self.inner.scheduler.write().await?;
        let mut txn = Transaction::new();
        compact_revs_in(&self.inner, &mut txn, doc_id, &revs)?;
        txn.execute(&self.inner.backend)?;
        Ok(())
    }

    /// Purges every stored revision of a document farther than `max_height` generations from
    /// its nearest leaf. Returns the purged revisions.
    pub async fn compact_document(&self, doc_id: &str, max_height: u64) -> DbResult<Vec<Rev>> {
        let _guard = self.inner.scheduler.write().await?;
        let metadata = self
            .inner
            .load_metadata(doc_id)?
            .ok_or_else(DbError::missing)?;
        let revs = metadata.rev_tree.revs_above_height(max_height);

        let mut txn = Transaction::new();
        compact_revs_in(&self.inner, &mut txn, doc_id, &revs)?;
        txn.execute(&self.inner.backend)?;
        Ok(revs)
    }

    /// Purges all non-leaf revisions of the given documents in one transaction.
    pub(crate) async fn compact_documents(&self, ids: &[String]) -> DbResult<usize> {
        let _guard = self.inner.scheduler.write().await?;
        let mut txn = Transaction::new();
        let mut purged = 0;
        for id in ids {
            let Some(metadata) = self.inner.load_metadata(id)? else {
                continue;
            };
            let revs = metadata.rev_tree.compactable_revs();
            purged += compact_revs_in(&self.inner, &mut txn, id, &revs)?;
        }
        txn.execute(&self.inner.backend)?;
        debug!(docs = ids.len(), purged, "Compacted documents");
        Ok(purged)
    }

    /// Compacts every document changed since the last run down to its leaves, then records
    /// the sequence it reached so the next run resumes from there.
    pub async fn compact(&self) -> DbResult<CompactionSummary> {
        let _guard = self.inner.scheduler.write().await?;
        let mut txn = Transaction::new();

        let checkpoint = txn
            .get(&self.inner.backend, Partition::Local, COMPACTION_CHECKPOINT.as_bytes())?
            .map(|bytes| serde_json::from_slice::<Map<String, Value>>(&bytes))
            .transpose()?;
        let since = checkpoint
            .as_ref()
            .and_then(|doc| doc.get("last_seq"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let checkpoint_rev = checkpoint
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let opts = ChangesOptions {
            since,
            ..Default::default()
        };
        let changes = self
            .inner
            .scan_changes(&opts, |_| ControlFlow::Continue(()))?;

        let mut summary = CompactionSummary {
            last_seq: changes.last_seq,
            ..Default::default()
        };
        for change in &changes.results {
            let Some(bytes) = txn.get(&self.inner.backend, Partition::Docs, change.id.as_bytes())?
            else {
                continue;
            };
            let metadata: DocMetadata = storage::decode(&bytes)?;
            let revs = metadata.rev_tree.compactable_revs();
            if revs.is_empty() {
                continue;
            }
            summary.revs_purged += compact_revs_in(&self.inner, &mut txn, &change.id, &revs)?;
            summary.docs_compacted += 1;
        }

        let mut data = Map::new();
        data.insert("last_seq".to_string(), json!(summary.last_seq));
        stage_local(
            &self.inner,
            &mut txn,
            LocalWrite {
                id: COMPACTION_CHECKPOINT.to_string(),
                rev: checkpoint_rev,
                deleted: false,
                data,
            },
        )?;
        txn.execute(&self.inner.backend)?;

        info!(
            name = %self.inner.config.name,
            docs = summary.docs_compacted,
            revs = summary.revs_purged,
            last_seq = summary.last_seq,
            "Compaction completed"
        );
        Ok(summary)
    }
}

/// Compaction strategy.
#[derive(Clone, Debug)]
pub enum CompactionMode {
    /// Compact at a fixed interval until the database closes.
    Periodic(Duration),

    /// Compact once.
    Once,
}

/// Background compactor.
pub struct Compactor {
    db: Database,
    mode: CompactionMode,
}

impl Compactor {
    pub fn new(db: Database, mode: CompactionMode) -> Self {
        Self { db, mode }
    }

    /// Spawns the compaction task.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode {
                CompactionMode::Periodic(every) => self.run_periodic(every).await,
                CompactionMode::Once => {
                    self.run_once().await;
                }
            }
        })
    }

    async fn run_periodic(&self, every: Duration) {
        let mut ticker = interval(every);
        info!("Starting periodic compactor with interval: {:?}", every);

        loop {
            ticker.tick().await;
            match self.db.compact().await {
                Ok(summary) if summary.revs_purged > 0 => {
                    info!(
                        "Periodic compaction purged {} revisions up to seq {}",
                        summary.revs_purged, summary.last_seq
                    );
                }
                Ok(_) => debug!("Periodic compaction found nothing to purge"),
                Err(DbError::NotOpen) => {
                    info!("Database closed, stopping compactor");
                    break;
                }
                Err(e) => warn!("Periodic compaction failed: {}", e),
            }
        }
    }

    /// Runs a single compaction pass.
    pub async fn run_once(&self) -> Option<CompactionSummary> {
        match self.db.compact().await {
            Ok(summary) => {
                info!(
                    "One-time compaction purged {} revisions",
                    summary.revs_purged
                );
                Some(summary)
            }
            Err(e) => {
                warn!("One-time compaction failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::digest_of;
    use crate::db::tests::open_db;
    use crate::db::{AutoCompaction, DatabaseConfig, GetOptions};
    use crate::revs::RevStatus;
    use tempfile::TempDir;

    async fn two_revisions(db: &Database) -> (String, String) {
        let rev1 = db.put(json!({"_id": "x", "v": 1})).await.unwrap();
        let rev2 = db
            .put(json!({"_id": "x", "_rev": rev1, "v": 2}))
            .await
            .unwrap();
        (rev1, rev2)
    }

    fn get_rev(rev: &str) -> GetOptions {
        GetOptions {
            rev: Some(rev.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_compact_revisions_purges_body() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let (rev1, rev2) = two_revisions(&db).await;

        db.compact_revisions("x", &[rev1.clone()]).await.unwrap();

        assert!(matches!(
            db.get("x", &get_rev(&rev1)).await,
            Err(DbError::MissingDoc(_))
        ));
        assert_eq!(db.get("x", &get_rev(&rev2)).await.unwrap().doc["v"], json!(2));

        let tree = db.get_revision_tree("x").await.unwrap();
        let node = tree.get(&rev1.parse().unwrap()).unwrap();
        assert_eq!(node.status, RevStatus::Missing);
    }

    #[tokio::test]
    async fn test_orphaned_attachment_is_collected() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        let rev1 = db
            .put(json!({"_id": "x", "_attachments": {"f": {"data": "aGVsbG8="}}}))
            .await
            .unwrap();
        db.put(json!({"_id": "x", "_rev": rev1, "plain": true}))
            .await
            .unwrap();

        let digest = digest_of(b"hello");
        assert!(db.inner.attachments.exists(&digest).unwrap());

        let purged = db.compact_document("x", 0).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert!(!db.inner.attachments.exists(&digest).unwrap());
        assert_eq!(db.inner.backend.len(Partition::Binaries), 0);
    }

    #[tokio::test]
    async fn test_compact_records_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        two_revisions(&db).await;
        db.put(json!({"_id": "y"})).await.unwrap();

        let summary = db.compact().await.unwrap();
        assert_eq!(summary.docs_compacted, 1);
        assert_eq!(summary.revs_purged, 1);
        assert_eq!(summary.last_seq, 3);

        let checkpoint = db.get_local(COMPACTION_CHECKPOINT).await.unwrap();
        assert_eq!(checkpoint["last_seq"], json!(3));

        let again = db.compact().await.unwrap();
        assert_eq!(again.docs_compacted, 0);
        assert_eq!(again.last_seq, 3);
    }

    #[tokio::test]
    async fn test_inline_auto_compaction() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(
            DatabaseConfig::new("auto", temp_dir.path())
                .with_auto_compaction(AutoCompaction::Inline),
        )
        .unwrap();
        let (rev1, _) = two_revisions(&db).await;

        assert_eq!(db.inner.backend.len(Partition::BySeq), 1);
        assert!(db.get("x", &get_rev(&rev1)).await.is_err());
    }

    #[tokio::test]
    async fn test_deferred_auto_compaction() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(
            DatabaseConfig::new("deferred", temp_dir.path())
                .with_auto_compaction(AutoCompaction::Deferred),
        )
        .unwrap();
        two_revisions(&db).await;

        let mut bodies = db.inner.backend.len(Partition::BySeq);
        for _ in 0..50 {
            if bodies == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            bodies = db.inner.backend.len(Partition::BySeq);
        }
        assert_eq!(bodies, 1);
    }

    #[tokio::test]
    async fn test_compactor_once_and_stop_on_close() {
        let temp_dir = TempDir::new().unwrap();
        let db = open_db(&temp_dir);
        two_revisions(&db).await;

        let summary = Compactor::new(db.clone(), CompactionMode::Once)
            .run_once()
            .await
            .unwrap();
        assert_eq!(summary.revs_purged, 1);

        let handle = Compactor::new(
            db.clone(),
            CompactionMode::Periodic(Duration::from_millis(10)),
        )
        .run();
        db.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("compactor should stop after close")
            .unwrap();
    }
}
