//! The change feed.
//!
//! Every revision written gets the next update sequence and its body is stored under that
//! sequence. A document's metadata remembers the sequence of its most recent write, so a scan
//! over the sequence partition reports each document once: at the entry whose sequence matches
//! the metadata. Entries from older writes are skipped.
//!
//! Historical feeds scan once. Live feeds register a listener in the [`ChangesHub`] and rescan
//! from the last delivered sequence whenever a commit wakes them.

pub mod hub;

pub use hub::{CancelHandle, ChangesHub};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::db::{Database, DbError, DbInner, DbResult, DocMetadata, GetOptions};
use crate::storage::{parse_seq_key, seq_key, Partition, ScanOptions, StorageError};

/// Which revisions a change lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChangeStyle {
    /// Only the winning revision.
    #[default]
    MainOnly,
    /// Every leaf revision, winner first.
    AllDocs,
}

/// Predicate applied to each change before it is emitted.
#[derive(Clone)]
pub struct ChangeFilter(Arc<dyn Fn(&Change) -> bool + Send + Sync>);

impl ChangeFilter {
    pub fn new(f: impl Fn(&Change) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, change: &Change) -> bool {
        (self.0)(change)
    }
}

impl fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangeFilter")
    }
}

#[derive(Clone, Debug)]
pub struct ChangesOptions {
    /// Report changes with a sequence strictly greater than this.
    pub since: u64,
    /// Stop after this many changes. `Some(0)` is treated as 1.
    pub limit: Option<usize>,
    /// Scan from the newest sequence backwards. `since` is ignored.
    pub descending: bool,
    pub include_docs: bool,
    /// Add `_conflicts` to included docs.
    pub conflicts: bool,
    /// Inline attachment bodies in included docs.
    pub attachments: bool,
    pub style: ChangeStyle,
    /// Only report these document ids.
    pub doc_ids: Option<BTreeSet<String>>,
    /// Only report changes the predicate accepts. The predicate sees the document even
    /// when `include_docs` is off.
    pub filter: Option<ChangeFilter>,
    /// Collect changes in the response. With `false` only the callback sees them.
    pub return_docs: bool,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            since: 0,
            limit: None,
            descending: false,
            include_docs: false,
            conflicts: false,
            attachments: false,
            style: ChangeStyle::MainOnly,
            doc_ids: None,
            filter: None,
            return_docs: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChangeRev {
    pub rev: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Change {
    pub seq: u64,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl Change {
    /// The winning revision at the time of the scan.
    pub fn rev(&self) -> &str {
        self.changes.first().map(|c| c.rev.as_str()).unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChangesResponse {
    pub results: Vec<Change>,
    pub last_seq: u64,
}

impl DbInner {
    fn change_for(
        &self,
        seq: u64,
        body: Map<String, Value>,
        metadata: &DocMetadata,
        opts: &ChangesOptions,
    ) -> DbResult<Change> {
        let winner = &metadata.winning_rev;
        let changes = match opts.style {
            ChangeStyle::MainOnly => vec![ChangeRev {
                rev: winner.to_string(),
            }],
            ChangeStyle::AllDocs => metadata
                .rev_tree
                .leaves()
                .into_iter()
                .map(|leaf| ChangeRev {
                    rev: leaf.rev.to_string(),
                })
                .collect(),
        };

        let doc = if opts.include_docs || opts.filter.is_some() {
            let winner_str = winner.to_string();
            let body = if body.get("_rev").and_then(Value::as_str) == Some(winner_str.as_str()) {
                Some(body)
            } else {
                self.load_revision(metadata, winner)?
            };
            let shape = GetOptions {
                conflicts: opts.conflicts,
                attachments: opts.attachments,
                ..Default::default()
            };
            body.map(|body| self.shape_doc(body, metadata, winner, &shape))
                .transpose()?
        } else {
            None
        };

        Ok(Change {
            seq,
            id: metadata.id.clone(),
            changes,
            deleted: metadata.deleted,
            doc,
        })
    }

    /// Scans the sequence partition once. `on_change` sees every emitted change, in order, and
    /// ends the scan early by returning `ControlFlow::Break`.
    pub(crate) fn scan_changes<F>(
        &self,
        opts: &ChangesOptions,
        mut on_change: F,
    ) -> DbResult<ChangesResponse>
    where
        F: FnMut(&Change) -> ControlFlow<()>,
    {
        let mut scan = ScanOptions::default();
        if opts.descending {
            scan.reverse = true;
        } else if opts.since > 0 {
            scan.gte = Some(seq_key(opts.since).to_vec());
        }
        let limit = opts.limit.map(|l| l.max(1));

        let mut response = ChangesResponse {
            results: Vec::new(),
            last_seq: opts.since,
        };
        let mut metadata_cache: HashMap<String, DocMetadata> = HashMap::new();
        let mut emitted = 0;

        for item in self.backend.iter(Partition::BySeq, &scan) {
            let (key, value) = item?;
            let seq = parse_seq_key(&key)
                .ok_or_else(|| StorageError::Corrupt(format!("sequence key {:?}", key)))?;
            if !opts.descending && seq <= opts.since {
                continue;
            }

            let body: Map<String, Value> = serde_json::from_slice(&value)?;
            let Some(id) = body.get("_id").and_then(Value::as_str).map(str::to_string) else {
                return Err(StorageError::Corrupt(format!("body at seq {} has no _id", seq)).into());
            };
            if let Some(ids) = &opts.doc_ids {
                if !ids.contains(&id) {
                    continue;
                }
            }

            if !metadata_cache.contains_key(&id) {
                match self.load_metadata(&id)? {
                    Some(metadata) => {
                        metadata_cache.insert(id.clone(), metadata);
                    }
                    None => continue,
                }
            }
            let Some(metadata) = metadata_cache.get(&id) else {
                continue;
            };
            // Superseded by a later write of the same document.
            if metadata.seq != seq {
                continue;
            }
            response.last_seq = seq;

            let mut change = self.change_for(seq, body, metadata, opts)?;
            if let Some(filter) = &opts.filter {
                if !filter.matches(&change) {
                    continue;
                }
            }
            if !opts.include_docs {
                change.doc = None;
            }

            let flow = on_change(&change);
            if opts.return_docs {
                response.results.push(change);
            }
            emitted += 1;
            if flow.is_break() || limit.is_some_and(|l| emitted >= l) {
                break;
            }
        }

        debug!(
            since = opts.since,
            last_seq = response.last_seq,
            emitted,
            "Change scan complete"
        );
        Ok(response)
    }
}

/// Cancels the feed when dropped.
#[derive(Debug)]
struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// A live change feed. Dropping it cancels the feed.
#[derive(Debug)]
pub struct LiveChanges {
    rx: mpsc::Receiver<Change>,
    guard: CancelOnDrop,
}

impl LiveChanges {
    /// The next change, or `None` once the feed is canceled, the limit is reached or the
    /// database closes.
    pub async fn next(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.guard.0.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.guard.0.clone()
    }

    pub fn into_stream(self) -> LiveStream {
        LiveStream {
            inner: ReceiverStream::new(self.rx),
            _guard: self.guard,
        }
    }
}

/// [`LiveChanges`] as a [`Stream`].
#[derive(Debug)]
pub struct LiveStream {
    inner: ReceiverStream<Change>,
    _guard: CancelOnDrop,
}

impl Stream for LiveStream {
    type Item = Change;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn run_live(
    db: Database,
    mut opts: ChangesOptions,
    handle: CancelHandle,
    listener: Arc<hub::Listener>,
    tx: mpsc::Sender<Change>,
) {
    let mut remaining = opts.limit.map(|l| l.max(1));
    opts.descending = false;
    opts.return_docs = true;

    'feed: loop {
        if listener.is_canceled() {
            break;
        }

        let scanned = {
            let Ok(_guard) = db.inner.scheduler.read().await else {
                break;
            };
            opts.limit = remaining;
            db.inner.scan_changes(&opts, |_| ControlFlow::Continue(()))
        };
        let response = match scanned {
            Ok(response) => response,
            Err(e) => {
                warn!(db = %db.name(), error = %e, "Live change scan failed");
                break;
            }
        };

        opts.since = response.last_seq;
        for change in response.results {
            if tx.send(change).await.is_err() {
                break 'feed;
            }
            if let Some(left) = remaining.as_mut() {
                *left -= 1;
            }
        }
        if remaining == Some(0) {
            break;
        }

        listener.wait().await;
    }

    handle.cancel();
    debug!(db = %db.name(), listener_id = listener.id(), "Live change feed stopped");
}

impl Database {
    /// Reads the change feed once.
    pub async fn changes(&self, opts: &ChangesOptions) -> DbResult<ChangesResponse> {
        let _guard = self.inner.scheduler.read().await?;
        self.inner.scan_changes(opts, |_| ControlFlow::Continue(()))
    }

    /// Reads the change feed once, handing each change to `on_change` as it is found. Returning
    /// `ControlFlow::Break` stops the feed after that change.
    pub async fn changes_with<F>(&self, opts: &ChangesOptions, on_change: F) -> DbResult<ChangesResponse>
    where
        F: FnMut(&Change) -> ControlFlow<()>,
    {
        let _guard = self.inner.scheduler.read().await?;
        self.inner.scan_changes(opts, on_change)
    }

    /// Follows the change feed: first everything after `opts.since`, then every later commit.
    /// `descending` is ignored.
    pub fn live_changes(&self, opts: ChangesOptions) -> DbResult<LiveChanges> {
        if self.is_closed() {
            return Err(DbError::NotOpen);
        }
        let name = self.name().to_string();
        let listener = self.inner.hub.add_listener(&name);
        let handle = CancelHandle::new(Arc::clone(&self.inner.hub), &name, Arc::clone(&listener));
        let (tx, rx) = mpsc::channel(self.inner.config.live_buffer);

        tokio::spawn(run_live(self.clone(), opts, handle.clone(), listener, tx));
        debug!(db = %name, "Live change feed started");

        Ok(LiveChanges {
            rx,
            guard: CancelOnDrop(handle),
        })
    }
}
