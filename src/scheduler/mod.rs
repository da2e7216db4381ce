//! Per-database operation scheduler.
//!
//! Operations queue up in FIFO order tagged as reads or writes. A contiguous run of reads at
//! the head of the queue runs concurrently; a write runs only when nothing else is running, and
//! everything queued behind it waits. Admission hands out an [`OpGuard`]; dropping the guard
//! completes the operation and dispatches whatever is next.
//!
//! Guards travel to waiters through oneshot channels. A waiter whose future was dropped before
//! admission simply fails to receive its guard, which is then released on the spot, so a
//! cancelled caller never wedges the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Database is not open")]
    NotOpen,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

struct Pending {
    kind: OpKind,
    tx: oneshot::Sender<OpGuard>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Pending>,
    running_reads: usize,
    running_write: bool,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    /// Admits as many queued operations as the head of the queue allows.
    fn dispatch(self: &Arc<Self>) {
        // Guards whose waiter went away. Dropped after the lock is released, since dropping a
        // guard re-enters the scheduler.
        let mut rejected = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(kind) = state.queue.front().map(|p| p.kind) {
                let admissible = match kind {
                    OpKind::Read => !state.running_write,
                    OpKind::Write => !state.running_write && state.running_reads == 0,
                };
                if !admissible {
                    break;
                }
                let Some(pending) = state.queue.pop_front() else {
                    break;
                };
                match kind {
                    OpKind::Read => state.running_reads += 1,
                    OpKind::Write => state.running_write = true,
                }
                let guard = OpGuard {
                    kind,
                    shared: Arc::clone(self),
                };
                if let Err(guard) = pending.tx.send(guard) {
                    rejected.push(guard);
                }
                if kind == OpKind::Write {
                    break;
                }
            }
        }
        if !rejected.is_empty() {
            debug!(count = rejected.len(), "Releasing operations abandoned before admission");
        }
        drop(rejected);
    }

    fn release(self: &Arc<Self>, kind: OpKind) {
        {
            let mut state = self.state.lock();
            match kind {
                OpKind::Read => state.running_reads = state.running_reads.saturating_sub(1),
                OpKind::Write => state.running_write = false,
            }
        }
        self.dispatch();
    }
}

/// Proof of admission. The operation is complete when the guard drops.
pub struct OpGuard {
    kind: OpKind,
    shared: Arc<Shared>,
}

impl OpGuard {
    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.shared.release(self.kind);
    }
}

impl std::fmt::Debug for OpGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpGuard").field("kind", &self.kind).finish()
    }
}

#[derive(Clone, Default)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for admission as a read.
    pub async fn read(&self) -> SchedulerResult<OpGuard> {
        self.enqueue(OpKind::Read).await
    }

    /// Waits for exclusive admission as a write.
    pub async fn write(&self) -> SchedulerResult<OpGuard> {
        self.enqueue(OpKind::Write).await
    }

    async fn enqueue(&self, kind: OpKind) -> SchedulerResult<OpGuard> {
        let rx = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SchedulerError::NotOpen);
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Pending { kind, tx });
            rx
        };
        self.shared.dispatch();
        rx.await.map_err(|_| SchedulerError::NotOpen)
    }

    /// Refuses new operations and fails every queued waiter with `NotOpen`. Operations that
    /// are already running finish normally.
    pub fn close(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            std::mem::take(&mut state.queue)
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing queued operations on close");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of operations waiting for admission.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Currently admitted reads, and whether a write is running.
    pub fn running(&self) -> (usize, bool) {
        let state = self.shared.state.lock();
        (state.running_reads, state.running_write)
    }
}
