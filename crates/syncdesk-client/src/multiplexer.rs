//! Subscription multiplexer: wraps raw store subscriptions and
//! republishes them as latest-value watches.
//!
//! Each watched path has one pump task moving deliveries from the
//! store's queue into a `tokio::sync::watch` channel, so a slow
//! consumer only ever observes the most recent snapshot (bursts
//! coalesce) and identical consecutive deliveries are suppressed.
//! A failed subscription terminates the watch for that path; there is
//! no automatic resubscribe.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use syncdesk_store::{Delivery, Snapshot, StoreClient, StoreError};

// ─── Watch State ──────────────────────────────────────────────────

/// Latest published state of one watched path.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchState {
    /// Nothing delivered yet.
    Pending,
    /// Most recent full snapshot.
    Snapshot(Snapshot),
    /// The subscription failed; terminal for this path.
    Failed(StoreError),
}

/// Consumer handle for one watched path.
///
/// `next` resolves with each distinct delivery, skipping any snapshot
/// that was superseded while the consumer was busy.
#[derive(Debug)]
pub struct WatchStream {
    rx: watch::Receiver<WatchState>,
    primed: bool,
}

impl WatchStream {
    fn new(rx: watch::Receiver<WatchState>) -> Self {
        Self { rx, primed: false }
    }

    /// Await the next distinct delivery. Returns `None` once the path
    /// was unwatched.
    pub async fn next(&mut self) -> Option<WatchState> {
        if !self.primed {
            self.primed = true;
            // A snapshot may have been published before this stream
            // first looked; deliver it instead of waiting.
            let current = self.rx.borrow_and_update().clone();
            if !matches!(current, WatchState::Pending) {
                return Some(current);
            }
        }
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let state = self.rx.borrow_and_update().clone();
            if !matches!(state, WatchState::Pending) {
                return Some(state);
            }
        }
    }
}

// ─── Multiplexer ──────────────────────────────────────────────────

struct WatchEntry {
    tx: watch::Sender<WatchState>,
    pump: JoinHandle<()>,
}

/// Shared watch registry for one session. Watching the same path
/// twice shares a single upstream subscription.
pub struct Multiplexer<S> {
    store: Arc<S>,
    watches: Mutex<HashMap<String, WatchEntry>>,
}

impl<S: StoreClient> Multiplexer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or join) a watch on `path`.
    pub async fn watch(&self, path: &str) -> Result<WatchStream, StoreError> {
        let mut watches = self.watches.lock().await;
        if let Some(entry) = watches.get(path) {
            return Ok(WatchStream::new(entry.tx.subscribe()));
        }

        let mut upstream = self.store.subscribe(path).await?;
        let (tx, rx) = watch::channel(WatchState::Pending);

        let pump_tx = tx.clone();
        let pump_path = path.to_owned();
        let pump = tokio::spawn(async move {
            while let Some(delivery) = upstream.recv().await {
                match delivery {
                    Delivery::Snapshot(snapshot) => {
                        publish(&pump_tx, snapshot);
                    }
                    Delivery::Failed(error) => {
                        tracing::error!("watch on {pump_path} failed: {error}");
                        let _ = pump_tx.send(WatchState::Failed(error));
                        return;
                    }
                }
            }
            tracing::debug!("store subscription for {pump_path} ended");
        });

        watches.insert(path.to_owned(), WatchEntry { tx, pump });
        Ok(WatchStream::new(rx))
    }

    /// Stop delivery for `path` and discard the cached baseline.
    /// Consumers observe end-of-stream; an in-flight snapshot already
    /// published is still visible to them. A later `watch` re-seeds
    /// from a fresh full read.
    pub async fn unwatch(&self, path: &str) {
        if let Some(entry) = self.watches.lock().await.remove(path) {
            entry.pump.abort();
        }
    }

    /// Tear down all watches (session shutdown).
    pub async fn shutdown(&self) {
        for (_, entry) in self.watches.lock().await.drain() {
            entry.pump.abort();
        }
    }
}

/// Publish a snapshot unless it equals the currently published one.
fn publish(tx: &watch::Sender<WatchState>, snapshot: Snapshot) {
    tx.send_if_modified(|current| {
        if matches!(current, WatchState::Snapshot(prev) if *prev == snapshot) {
            return false;
        }
        *current = WatchState::Snapshot(snapshot.clone());
        true
    });
}

// ─── Tests ────────────────────────────────────────────────────────
