//! Registry of live change listeners, keyed by database name.
//!
//! A commit calls [`ChangesHub::notify`] for its database, which wakes every listener of that
//! database. Listeners re-run their scan from the last sequence they delivered, so a wakeup
//! carries no payload and several commits may collapse into one wakeup.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// One registered live feed.
#[derive(Debug)]
pub(crate) struct Listener {
    id: u64,
    wake: Notify,
    canceled: AtomicBool,
}

impl Listener {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Waits for the next commit or cancellation. A wakeup that arrived while nobody was
    /// waiting is kept, so none is lost between scans.
    pub(crate) async fn wait(&self) {
        self.wake.notified().await;
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct ChangesHub {
    /// db name -> listener id -> listener
    listeners: DashMap<String, HashMap<u64, Arc<Listener>>>,

    next_listener_id: AtomicU64,
}

impl ChangesHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_listener(&self, db_name: &str) -> Arc<Listener> {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = Arc::new(Listener {
            id,
            wake: Notify::new(),
            canceled: AtomicBool::new(false),
        });
        self.listeners
            .entry(db_name.to_string())
            .or_default()
            .insert(id, Arc::clone(&listener));
        debug!(db = %db_name, listener_id = id, "Change listener added");
        listener
    }

    /// Cancels and unregisters a listener. Returns `false` if it was already gone.
    pub(crate) fn remove_listener(&self, db_name: &str, id: u64) -> bool {
        let removed = match self.listeners.get_mut(db_name) {
            Some(mut entry) => entry.remove(&id),
            None => None,
        };
        self.listeners.remove_if(db_name, |_, map| map.is_empty());

        match removed {
            Some(listener) => {
                listener.cancel();
                debug!(db = %db_name, listener_id = id, "Change listener removed");
                true
            }
            None => false,
        }
    }

    /// Wakes every listener of a database.
    pub fn notify(&self, db_name: &str) {
        if let Some(entry) = self.listeners.get(db_name) {
            for listener in entry.values() {
                listener.wake.notify_one();
            }
        }
    }

    /// Cancels every listener of a database. Returns how many were canceled.
    pub fn remove_all(&self, db_name: &str) -> usize {
        match self.listeners.remove(db_name) {
            Some((_, listeners)) => {
                for listener in listeners.values() {
                    listener.cancel();
                }
                listeners.len()
            }
            None => 0,
        }
    }

    pub fn listener_count(&self, db_name: &str) -> usize {
        self.listeners
            .get(db_name)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}

/// Cancels one live feed. Cloneable; canceling twice is a no-op.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    hub: Arc<ChangesHub>,
    db_name: String,
    listener: Arc<Listener>,
}

impl CancelHandle {
    pub(crate) fn new(hub: Arc<ChangesHub>, db_name: &str, listener: Arc<Listener>) -> Self {
        Self {
            hub,
            db_name: db_name.to_string(),
            listener,
        }
    }

    pub fn cancel(&self) {
        if !self.hub.remove_listener(&self.db_name, self.listener.id()) {
            // Already unregistered by a database close; still make sure the task stops.
            self.listener.cancel();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.listener.is_canceled()
    }
}
