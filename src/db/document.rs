//! Document metadata, input parsing and revision hashing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::attachments::{decode_payload, digest_of};
use crate::db::error::{DbError, DbResult};
use crate::revs::{Rev, RevPath, RevStatus, RevTree};

pub const LOCAL_PREFIX: &str = "_local/";
const DESIGN_PREFIX: &str = "_design/";

/// Underscore fields a document may carry. Anything else starting with `_` is rejected.
const RESERVED_FIELDS: &[&str] = &[
    "_id",
    "_rev",
    "_attachments",
    "_deleted",
    "_revisions",
    "_revs_info",
    "_conflicts",
    "_deleted_conflicts",
    "_local_seq",
    "_rev_tree",
    "_replication_id",
    "_replication_state",
    "_replication_state_time",
    "_replication_state_reason",
    "_replication_stats",
    "_removed",
];

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

/// Per-document record kept in the document partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMetadata {
    pub id: String,
    pub rev_tree: RevTree,
    /// Revision string to the sequence its body is stored under.
    pub rev_map: BTreeMap<String, u64>,
    pub winning_rev: Rev,
    pub deleted: bool,
    /// Sequence of the most recent write to this document.
    pub seq: u64,
}

impl DocMetadata {
    pub fn from_tree(id: String, rev_tree: RevTree) -> DbResult<Self> {
        let winning_rev = rev_tree
            .winning_rev()
            .ok_or_else(|| DbError::InvalidDoc(format!("empty revision tree for {}", id)))?;
        let deleted = rev_tree.is_deleted(&winning_rev);
        Ok(Self {
            id,
            rev_tree,
            rev_map: BTreeMap::new(),
            winning_rev,
            deleted,
            seq: 0,
        })
    }

    /// Recomputes the cached winner and deletion flag after the tree changed.
    pub fn refresh(&mut self) -> DbResult<()> {
        self.winning_rev = self
            .rev_tree
            .winning_rev()
            .ok_or_else(|| DbError::InvalidDoc(format!("empty revision tree for {}", self.id)))?;
        self.deleted = self.rev_tree.is_deleted(&self.winning_rev);
        Ok(())
    }

    pub fn seq_of(&self, rev: &Rev) -> Option<u64> {
        self.rev_map.get(&rev.to_string()).copied()
    }
}

/// Attachment description as stored in a body and returned to readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub content_type: String,
    pub digest: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub revpos: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
    /// Base64 content, present only when a reader asked for inline attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedAttachment {
    pub info: AttachmentInfo,
    /// Decoded bytes; `None` for a stub that refers to stored content.
    pub bytes: Option<Vec<u8>>,
}

/// A validated versioned document ready for the write path.
#[derive(Clone, Debug)]
pub struct ParsedDoc {
    pub id: String,
    pub rev: Rev,
    pub path: RevPath,
    pub deleted: bool,
    /// User fields only.
    pub data: Map<String, Value>,
    pub attachments: BTreeMap<String, ParsedAttachment>,
}

impl ParsedDoc {
    /// True when the path's oldest revision is only a parent reference, i.e. the client named
    /// a `_rev` to build on.
    pub fn root_is_missing(&self) -> bool {
        self.path
            .ids
            .first()
            .map(|n| n.status == RevStatus::Missing)
            .unwrap_or(false)
    }

    /// Re-parents a fresh first revision onto `parent`, used when a deleted document is
    /// written again without a `_rev`.
    pub fn rebase(&mut self, parent: &Rev) -> DbResult<()> {
        let hash = revision_hash(Some(parent), self.deleted, &self.data, &self.attachments);
        self.rev = parent.child(hash.clone())?;
        self.path = RevPath::child_of(parent, hash, self.deleted);
        for att in self.attachments.values_mut() {
            if att.bytes.is_some() {
                att.info.revpos = self.rev.pos;
            }
        }
        Ok(())
    }

    pub fn stub_digests(&self) -> impl Iterator<Item = &str> {
        self.attachments
            .values()
            .filter(|a| a.bytes.is_none())
            .map(|a| a.info.digest.as_str())
    }

    /// The JSON body persisted under the revision's sequence.
    pub fn to_body(&self, deleted: bool) -> DbResult<Value> {
        let mut body = self.data.clone();
        body.insert("_id".to_string(), Value::String(self.id.clone()));
        body.insert("_rev".to_string(), Value::String(self.rev.to_string()));
        if deleted {
            body.insert("_deleted".to_string(), Value::Bool(true));
        }
        if !self.attachments.is_empty() {
            let mut atts = Map::new();
            for (name, att) in &self.attachments {
                let mut info = att.info.clone();
                info.stub = false;
                info.data = None;
                atts.insert(name.clone(), serde_json::to_value(info)?);
            }
            body.insert("_attachments".to_string(), Value::Object(atts));
        }
        Ok(Value::Object(body))
    }
}

/// A write to an unversioned `_local/` document.
#[derive(Clone, Debug)]
pub struct LocalWrite {
    pub id: String,
    pub rev: Option<String>,
    pub deleted: bool,
    pub data: Map<String, Value>,
}

#[derive(Clone, Debug)]
pub enum ParsedWrite {
    Doc(ParsedDoc),
    Local(LocalWrite),
}

impl ParsedWrite {
    pub fn id(&self) -> &str {
        match self {
            ParsedWrite::Doc(doc) => &doc.id,
            ParsedWrite::Local(local) => &local.id,
        }
    }
}

/// Outcome of one document in a bulk write.
#[derive(Debug)]
pub struct DocResult {
    pub id: String,
    pub result: DbResult<String>,
}

impl DocResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn rev(&self) -> Option<&str> {
        self.result.as_deref().ok()
    }

    pub fn error(&self) -> Option<&DbError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> DbResult<String> {
        self.result
    }
}

#[derive(Deserialize)]
struct Revisions {
    start: u64,
    ids: Vec<String>,
}

/// Deterministic revision hash over the parent, the deletion flag and the canonical content.
pub fn revision_hash(
    parent: Option<&Rev>,
    deleted: bool,
    data: &Map<String, Value>,
    attachments: &BTreeMap<String, ParsedAttachment>,
) -> String {
    let digests: BTreeMap<&str, &str> = attachments
        .iter()
        .map(|(name, att)| (name.as_str(), att.info.digest.as_str()))
        .collect();
    let canonical = json!({
        "parent": parent.map(|r| r.to_string()),
        "deleted": deleted,
        "body": data,
        "attachments": digests,
    });
    hex::encode(md5::compute(canonical.to_string()).0)
}

fn validate_id(id: &str) -> DbResult<()> {
    if id.is_empty() {
        return Err(DbError::InvalidDoc("_id must not be empty".to_string()));
    }
    if id.starts_with('_') && !id.starts_with(LOCAL_PREFIX) && !id.starts_with(DESIGN_PREFIX) {
        return Err(DbError::InvalidDoc(format!(
            "Only reserved document ids may start with underscore: {}",
            id
        )));
    }
    Ok(())
}

fn parse_attachment(name: &str, value: Value) -> DbResult<ParsedAttachment> {
    if name.starts_with('_') {
        return Err(DbError::BadArgument(format!(
            "Attachment name can't start with '_': {}",
            name
        )));
    }
    let Value::Object(att) = value else {
        return Err(DbError::BadArgument(format!(
            "Attachment {} must be an object",
            name
        )));
    };
    let content_type = att
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();

    if att.get("stub").and_then(Value::as_bool).unwrap_or(false) {
        let digest = att
            .get("digest")
            .and_then(Value::as_str)
            .ok_or_else(|| DbError::BadArgument(format!("Stub attachment {} has no digest", name)))?;
        return Ok(ParsedAttachment {
            info: AttachmentInfo {
                content_type,
                digest: digest.to_string(),
                length: att.get("length").and_then(Value::as_u64).unwrap_or(0),
                revpos: att.get("revpos").and_then(Value::as_u64).unwrap_or(0),
                stub: true,
                data: None,
            },
            bytes: None,
        });
    }

    let data = att
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::BadArgument(format!("Attachment {} has no data", name)))?;
    let bytes = decode_payload(data).map_err(|_| {
        DbError::BadArgument("Attachment is not a valid base64 string".to_string())
    })?;
    Ok(ParsedAttachment {
        info: AttachmentInfo {
            content_type,
            digest: digest_of(&bytes),
            length: bytes.len() as u64,
            revpos: 0,
            stub: true,
            data: None,
        },
        bytes: Some(bytes),
    })
}

/// Validates a client document and works out the revision it is written as.
///
/// With `new_edits` the document proposes a child of its `_rev` (or a new root). Without it
/// the document carries an explicit revision, optionally with a `_revisions` history.
pub fn parse_doc(value: Value, new_edits: bool) -> DbResult<ParsedWrite> {
    let Value::Object(mut obj) = value else {
        return Err(DbError::InvalidDoc(
            "Document must be a JSON object".to_string(),
        ));
    };

    let id = match obj.remove("_id") {
        Some(Value::String(id)) => id,
        Some(_) => return Err(DbError::InvalidDoc("_id must be a string".to_string())),
        None if new_edits => Uuid::new_v4().simple().to_string(),
        None => return Err(DbError::InvalidDoc("_id is required".to_string())),
    };
    validate_id(&id)?;

    let rev_field = match obj.remove("_rev") {
        Some(Value::String(rev)) => Some(rev),
        Some(other) => return Err(DbError::InvalidRev(other.to_string())),
        None => None,
    };
    let deleted = matches!(obj.remove("_deleted"), Some(Value::Bool(true)));
    let revisions = obj.remove("_revisions");
    let attachments_value = obj.remove("_attachments");

    let special: Vec<String> = obj.keys().filter(|k| k.starts_with('_')).cloned().collect();
    for key in special {
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            return Err(DbError::InvalidDoc(format!(
                "Bad special document member: {}",
                key
            )));
        }
        obj.remove(&key);
    }

    if is_local_id(&id) {
        return Ok(ParsedWrite::Local(LocalWrite {
            id,
            rev: rev_field,
            deleted,
            data: obj,
        }));
    }

    let mut attachments = BTreeMap::new();
    if !deleted {
        match attachments_value {
            Some(Value::Object(atts)) => {
                for (name, att) in atts {
                    let parsed = parse_attachment(&name, att)?;
                    attachments.insert(name, parsed);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(DbError::InvalidDoc(
                    "_attachments must be an object".to_string(),
                ))
            }
        }
    }

    let (rev, path) = if new_edits {
        let parent = rev_field.as_deref().map(str::parse::<Rev>).transpose()?;
        let hash = revision_hash(parent.as_ref(), deleted, &obj, &attachments);
        match parent {
            Some(parent) => (
                parent.child(hash.clone())?,
                RevPath::child_of(&parent, hash, deleted),
            ),
            None => {
                let rev = Rev::new(1, hash);
                let path = RevPath::single(&rev, deleted);
                (rev, path)
            }
        }
    } else if let Some(revisions) = revisions {
        let revisions: Revisions = serde_json::from_value(revisions)
            .map_err(|e| DbError::InvalidDoc(format!("Invalid _revisions: {}", e)))?;
        let path = RevPath::from_revisions(revisions.start, &revisions.ids, deleted)?;
        let rev = path
            .leaf()
            .ok_or_else(|| DbError::InvalidRev("empty _revisions".to_string()))?;
        (rev, path)
    } else {
        let rev: Rev = rev_field
            .ok_or_else(|| DbError::InvalidRev("missing _rev".to_string()))?
            .parse()?;
        let path = RevPath::single(&rev, deleted);
        (rev, path)
    };

    for att in attachments.values_mut() {
        if att.bytes.is_some() || att.info.revpos == 0 {
            att.info.revpos = rev.pos;
        }
    }

    Ok(ParsedWrite::Doc(ParsedDoc {
        id,
        rev,
        path,
        deleted,
        data: obj,
        attachments,
    }))
}
