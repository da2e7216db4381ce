//! Local documents: single-revision records under `_local/` ids.
//!
//! Local documents have no revision tree, no history and no sequence number, so they never
//! show up in the change feed. Their revision is `0-N`, bumped on every write, and every
//! update or delete must name the current revision exactly.

use serde_json::{Map, Value};
use tracing::debug;

use crate::db::document::{is_local_id, parse_doc, LocalWrite, ParsedWrite};
use crate::db::error::{DbError, DbResult};
use crate::db::{Database, DbInner};
use crate::storage::{Partition, Transaction};

fn local_rev_number(rev: &str) -> DbResult<u64> {
    rev.strip_prefix("0-")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| DbError::InvalidRev(rev.to_string()))
}

fn read_local(db: &DbInner, txn: &Transaction, id: &str) -> DbResult<Option<Map<String, Value>>> {
    match txn.get(&db.backend, Partition::Local, id.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Stages a local document write (or delete) in `txn` and returns the resulting revision.
pub(crate) fn stage_local(db: &DbInner, txn: &mut Transaction, local: LocalWrite) -> DbResult<String> {
    let existing = read_local(db, txn, &local.id)?;
    let current_rev = existing
        .as_ref()
        .and_then(|doc| doc.get("_rev"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if local.deleted {
        if existing.is_none() {
            return Err(DbError::missing());
        }
        if current_rev != local.rev {
            return Err(DbError::RevisionConflict);
        }
        txn.delete(Partition::Local, local.id.as_bytes().to_vec());
        debug!(doc_id = %local.id, "Staged local document delete");
        return Ok("0-0".to_string());
    }

    match (&existing, &local.rev) {
        (None, Some(_)) => return Err(DbError::RevisionConflict),
        (Some(_), rev) if current_rev.as_ref() != rev.as_ref() => {
            return Err(DbError::RevisionConflict)
        }
        _ => {}
    }

    let next = match &local.rev {
        Some(rev) => local_rev_number(rev)?
            .checked_add(1)
            .ok_or_else(|| DbError::InvalidRev(rev.clone()))?,
        None => 1,
    };
    let rev = format!("0-{}", next);

    let mut doc = local.data;
    doc.insert("_id".to_string(), Value::String(local.id.clone()));
    doc.insert("_rev".to_string(), Value::String(rev.clone()));
    txn.put(
        Partition::Local,
        local.id.as_bytes().to_vec(),
        serde_json::to_vec(&Value::Object(doc))?,
    );
    debug!(doc_id = %local.id, rev = %rev, "Staged local document");
    Ok(rev)
}

impl Database {
    pub async fn get_local(&self, id: &str) -> DbResult<Value> {
        let _guard = self.inner.scheduler.read().await?;
        read_local(&self.inner, &Transaction::new(), id)?
            .map(Value::Object)
            .ok_or_else(DbError::missing)
    }

    /// Creates or updates a local document. Updates must carry the current `_rev`.
    pub async fn put_local(&self, doc: Value) -> DbResult<String> {
        let ParsedWrite::Local(local) = parse_doc(doc, true)? else {
            return Err(DbError::BadArgument(
                "local document ids must start with _local/".to_string(),
            ));
        };
        let _guard = self.inner.scheduler.write().await?;
        let mut txn = Transaction::new();
        let rev = stage_local(&self.inner, &mut txn, local)?;
        txn.execute(&self.inner.backend)?;
        Ok(rev)
    }

    pub async fn remove_local(&self, id: &str, rev: &str) -> DbResult<()> {
        if !is_local_id(id) {
            return Err(DbError::BadArgument(
                "local document ids must start with _local/".to_string(),
            ));
        }
        let local = LocalWrite {
            id: id.to_string(),
            rev: Some(rev.to_string()),
            deleted: true,
            data: Map::new(),
        };
        let _guard = self.inner.scheduler.write().await?;
        let mut txn = Transaction::new();
        stage_local(&self.inner, &mut txn, local)?;
        txn.execute(&self.inner.backend)?;
        Ok(())
    }
}
