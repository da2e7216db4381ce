//! # sofadb: an MVCC document storage engine on sled
//!
//! sofadb stores schemaless JSON documents with full revision history, the way CouchDB-style
//! databases do. It provides:
//!
//! - **Revision trees**: every document keeps a tree of revisions; concurrent edits become
//!   branches and a deterministic winner is chosen among the leaves
//! - **Bulk writes**: batches commit atomically, with per-document results
//! - **Replication writes**: `new_edits = false` stores foreign revisions and their history
//! - **Attachments**: content-addressed (md5), deduplicated and reference counted
//! - **Change feed**: historical and live, one entry per document at its latest sequence
//! - **Compaction**: superseded revision bodies and orphaned attachments are purged
//!
//! # Usage
//!
//! ```no_run
//! use sofadb::{Database, DatabaseConfig, GetOptions};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), sofadb::DbError> {
//! let db = Database::open(DatabaseConfig::new("notes", "/tmp/notes.sofadb"))?;
//! let rev = db.put(json!({"_id": "greeting", "text": "hello"})).await?;
//! let doc = db.get("greeting", &GetOptions::default()).await?.doc;
//! assert_eq!(doc["_rev"], json!(rev));
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod attachments;
pub mod changes;
pub mod db;
pub mod revs;
pub mod scheduler;
pub mod storage;

// Re-export main types at crate root for convenience
pub use attachments::AttachmentStore;
pub use changes::{
    CancelHandle, Change, ChangeFilter, ChangeStyle, ChangesHub, ChangesOptions,
    ChangesResponse, LiveChanges, LiveStream,
};
pub use db::{
    AllDocsOptions, AllDocsResponse, AutoCompaction, BulkOptions, CompactionMode,
    CompactionSummary, Compactor, Database, DatabaseConfig, DbError, DbInfo, DbResult,
    DocResult, GetOptions, OpenRev, OpenRevs,
};
pub use revs::{MergeOutcome, Rev, RevTree};
pub use scheduler::Scheduler;
pub use storage::{Backend, BackendConfig, Partition, Transaction};
