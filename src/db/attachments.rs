//! Attachment operations on documents.
//!
//! Adding or removing an attachment writes a new revision of its document through the regular
//! write path; other attachments ride along as stubs.

use serde_json::{json, Map, Value};

use crate::attachments::encode_payload;
use crate::db::document::is_local_id;
use crate::db::error::{DbError, DbResult};
use crate::db::{Database, GetOptions};
use crate::revs::Rev;

fn attachments_of(doc: &mut Value) -> Option<&mut Map<String, Value>> {
    match doc.get_mut("_attachments") {
        Some(Value::Object(atts)) => Some(atts),
        _ => None,
    }
}

fn reject_local(doc_id: &str) -> DbResult<()> {
    if is_local_id(doc_id) {
        return Err(DbError::BadArgument(
            "local documents do not have attachments".to_string(),
        ));
    }
    Ok(())
}

impl Database {
    /// Reads an attachment of the winning revision, or of `rev` when given.
    pub async fn get_attachment(
        &self,
        doc_id: &str,
        name: &str,
        rev: Option<&str>,
    ) -> DbResult<Vec<u8>> {
        reject_local(doc_id)?;
        let _guard = self.inner.scheduler.read().await?;
        let metadata = self
            .inner
            .load_metadata(doc_id)?
            .ok_or_else(DbError::missing)?;

        let rev = match rev {
            Some(rev) => rev.parse::<Rev>()?,
            None if metadata.deleted => return Err(DbError::deleted()),
            None => metadata.winning_rev.clone(),
        };
        let body = self
            .inner
            .load_revision(&metadata, &rev)?
            .ok_or_else(DbError::missing)?;

        let digest = body
            .get("_attachments")
            .and_then(|atts| atts.get(name))
            .and_then(|att| att.get("digest"))
            .and_then(Value::as_str)
            .ok_or_else(DbError::missing)?;
        self.inner
            .attachments
            .get_attachment(digest)?
            .ok_or_else(DbError::missing)
    }

    /// Adds or replaces an attachment, creating the document when it does not exist. Updates
    /// must name the document's current revision. Returns the new revision.
    pub async fn put_attachment(
        &self,
        doc_id: &str,
        name: &str,
        rev: Option<&str>,
        bytes: &[u8],
        content_type: &str,
    ) -> DbResult<String> {
        reject_local(doc_id)?;
        let mut doc = match self.get(doc_id, &GetOptions::default()).await {
            Ok(fetched) => fetched.doc,
            Err(DbError::MissingDoc(_)) => json!({ "_id": doc_id }),
            Err(e) => return Err(e),
        };

        let Value::Object(obj) = &mut doc else {
            return Err(DbError::InvalidDoc("Document must be a JSON object".to_string()));
        };
        match rev {
            Some(rev) => {
                obj.insert("_rev".to_string(), Value::String(rev.to_string()));
            }
            None => {
                obj.remove("_rev");
            }
        }
        obj.entry("_attachments")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(atts) = attachments_of(&mut doc) {
            atts.insert(
                name.to_string(),
                json!({"content_type": content_type, "data": encode_payload(bytes)}),
            );
        }

        self.put(doc).await
    }

    /// Removes an attachment from the current revision. Returns the new revision.
    pub async fn remove_attachment(&self, doc_id: &str, name: &str, rev: &str) -> DbResult<String> {
        reject_local(doc_id)?;
        let mut doc = self.get(doc_id, &GetOptions::default()).await?.doc;
        if doc.get("_rev").and_then(Value::as_str) != Some(rev) {
            return Err(DbError::RevisionConflict);
        }

        let atts = attachments_of(&mut doc).ok_or_else(DbError::missing)?;
        if atts.remove(name).is_none() {
            return Err(DbError::missing());
        }
        if atts.is_empty() {
            if let Value::Object(obj) = &mut doc {
                obj.remove("_attachments");
            }
        }

        self.put(doc).await
    }
}
