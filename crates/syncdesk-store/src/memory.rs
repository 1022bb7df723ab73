//! In-memory tree store implementing `StoreClient`.
//!
//! Faithful to the remote store's observable behavior: full-snapshot
//! delivery per subscribed path, shallow merge patches with null
//! field removal, disconnect intents applied by the store itself,
//! and a liveness channel that starts out `false`.
//!
//! Test hooks: an ordered operation log, a configurable
//! registration-ack delay, and per-path permission denial.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::client::{Delivery, Snapshot, StoreClient};
use crate::error::StoreError;
use crate::path;

// ─── Operation Log ────────────────────────────────────────────────

/// One acknowledged store operation, recorded in acknowledgment
/// order. Lets tests assert cross-operation ordering (e.g. that the
/// disconnect intent was registered before any online write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Write { path: String, patch: Value },
    IntentRegistered { path: String, patch: Value },
}

// ─── Store ────────────────────────────────────────────────────────

struct Subscriber {
    path: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct State {
    tree: Map<String, Value>,
    subscribers: Vec<Subscriber>,
    intents: Vec<(String, Value)>,
    denied: HashSet<String>,
    ops: Vec<StoreOp>,
    register_delay: Option<Duration>,
}

struct StoreInner {
    state: Mutex<State>,
    conn_tx: watch::Sender<bool>,
}

/// Shared in-memory store; cheap to clone, all clones see one tree.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (conn_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(State {
                    tree: Map::new(),
                    subscribers: Vec::new(),
                    intents: Vec::new(),
                    denied: HashSet::new(),
                    ops: Vec::new(),
                    register_delay: None,
                }),
                conn_tx,
            }),
        }
    }

    /// Mark the transport live. `send_replace` so the value sticks
    /// even when no session has subscribed to liveness yet.
    pub fn connect(&self) {
        self.inner.conn_tx.send_replace(true);
    }

    /// Drop the transport: the store applies all registered disconnect
    /// intents itself, then reports `false` on the liveness channel.
    pub fn disconnect(&self) {
        let intents = {
            let mut state = self.lock();
            std::mem::take(&mut state.intents)
        };
        for (path, patch) in intents {
            // Intent patches were validated at registration time.
            if let Err(e) = self.apply_write(&path, patch) {
                tracing::warn!("disconnect intent failed at {path}: {e}");
            }
        }
        self.inner.conn_tx.send_replace(false);
    }

    /// Delay acknowledgment of `register_on_disconnect` by `delay`
    /// (simulates a slow round trip for presence-ordering tests).
    pub fn set_register_delay(&self, delay: Duration) {
        self.lock().register_delay = Some(delay);
    }

    /// Deny a path: pending subscriptions under it terminate with
    /// `PermissionDenied`, later subscribes and writes are rejected.
    pub fn deny(&self, path: &str) {
        let mut state = self.lock();
        state.denied.insert(path.to_owned());
        let mut kept = Vec::new();
        for sub in state.subscribers.drain(..) {
            if paths_overlap(&sub.path, path) {
                let _ = sub
                    .tx
                    .send(Delivery::Failed(StoreError::PermissionDenied(
                        sub.path.clone(),
                    )));
            } else {
                kept.push(sub);
            }
        }
        state.subscribers = kept;
    }

    /// Ordered log of acknowledged operations.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    /// Current snapshot of a collection (test/seed convenience).
    pub fn snapshot_at(&self, path: &str) -> Result<Snapshot, StoreError> {
        let segs = path::segments(path)?;
        Ok(read_snapshot(&self.lock().tree, &segs))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_denied(&self, state: &State, path: &str) -> Result<(), StoreError> {
        for denied in &state.denied {
            if path == denied || path.starts_with(&format!("{denied}/")) {
                return Err(StoreError::PermissionDenied(path.to_owned()));
            }
        }
        Ok(())
    }

    /// Merge a patch and fan the new snapshots out to every
    /// overlapping subscriber.
    fn apply_write(&self, path: &str, patch: Value) -> Result<(), StoreError> {
        let segs = path::segments(path)?;
        let Value::Object(fields) = patch else {
            return Err(StoreError::WriteRejected {
                path: path.to_owned(),
                reason: "patch must be a JSON object".to_owned(),
            });
        };

        let mut state = self.lock();
        self.check_denied(&state, path)?;

        let node = node_mut(&mut state.tree, &segs);
        for (key, value) in fields {
            if value.is_null() {
                node.remove(&key);
            } else {
                node.insert(key, value);
            }
        }

        // Fan out full snapshots, pruning dropped receivers.
        let mut deliveries = Vec::new();
        state.subscribers.retain(|sub| {
            if !paths_overlap(&sub.path, path) {
                return true;
            }
            deliveries.push((sub.path.clone(), sub.tx.clone()));
            !sub.tx.is_closed()
        });
        for (sub_path, tx) in deliveries {
            let Ok(segs) = path::segments(&sub_path) else {
                continue;
            };
            let _ = tx.send(Delivery::Snapshot(read_snapshot(&state.tree, &segs)));
        }

        Ok(())
    }
}

impl StoreClient for MemoryStore {
    async fn subscribe(&self, path: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, StoreError> {
        let segs = path::segments(path)?;
        let mut state = self.lock();
        self.check_denied(&state, path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Delivery::Snapshot(read_snapshot(&state.tree, &segs)));
        state.subscribers.push(Subscriber {
            path: path.to_owned(),
            tx,
        });
        Ok(rx)
    }

    async fn write(&self, path: &str, patch: Value) -> Result<(), StoreError> {
        self.apply_write(path, patch.clone())?;
        self.lock().ops.push(StoreOp::Write {
            path: path.to_owned(),
            patch,
        });
        Ok(())
    }

    async fn register_on_disconnect(&self, path: &str, patch: Value) -> Result<(), StoreError> {
        path::segments(path)?;
        if !patch.is_object() {
            return Err(StoreError::WriteRejected {
                path: path.to_owned(),
                reason: "patch must be a JSON object".to_owned(),
            });
        }

        let delay = self.lock().register_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        self.check_denied(&state, path)?;
        state.intents.push((path.to_owned(), patch.clone()));
        state.ops.push(StoreOp::IntentRegistered {
            path: path.to_owned(),
            patch,
        });
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.conn_tx.subscribe()
    }
}

// ─── Tree Helpers ─────────────────────────────────────────────────

/// Walk to the object at `segs`, creating (or replacing non-object
/// values with) empty objects along the way.
fn node_mut<'a>(root: &'a mut Map<String, Value>, segs: &[&str]) -> &'a mut Map<String, Value> {
    let mut current = root;
    for seg in segs {
        let slot = current
            .entry((*seg).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !matches!(slot, Value::Object(_)) {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            unreachable!("slot was just made an object");
        };
        current = next;
    }
    current
}

/// Read the children of the node at `segs` as a snapshot. A missing
/// or non-object node reads as the empty collection.
fn read_snapshot(root: &Map<String, Value>, segs: &[&str]) -> Snapshot {
    let mut current = root;
    for seg in segs {
        match current.get(*seg) {
            Some(Value::Object(next)) => current = next,
            _ => return Snapshot::new(),
        }
    }
    current
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Whether a write at `written` is visible to a subscription at `sub`
/// (either path is an ancestor of the other, or they are equal).
fn paths_overlap(sub: &str, written: &str) -> bool {
    sub == written
        || written.starts_with(&format!("{sub}/"))
        || sub.starts_with(&format!("{written}/"))
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn recv_snapshot(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Snapshot {
        match rx.recv().await.expect("delivery") {
            Delivery::Snapshot(snap) => snap,
            Delivery::Failed(e) => panic!("unexpected failure: {e}"),
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_snapshot() {
        let store = MemoryStore::new();
        store
            .write("users/u1", json!({"uid": "u1", "online": false}))
            .await
            .expect("write");

        let mut rx = store.subscribe("users").await.expect("subscribe");
        let snap = recv_snapshot(&mut rx).await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["u1"]["uid"], "u1");
    }

    #[tokio::test]
    async fn write_under_path_redelivers_full_snapshot() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("tickets").await.expect("subscribe");
        assert!(recv_snapshot(&mut rx).await.is_empty());

        store
            .write("tickets/t1", json!({"id": "t1", "title": "broken"}))
            .await
            .expect("write");
        store
            .write("tickets/t2", json!({"id": "t2", "title": "also broken"}))
            .await
            .expect("write");

        let snap = recv_snapshot(&mut rx).await;
        assert_eq!(snap.len(), 1, "first delivery after t1 write");
        let snap = recv_snapshot(&mut rx).await;
        assert_eq!(snap.len(), 2, "full snapshot, not a delta");
    }

    #[tokio::test]
    async fn merge_is_shallow_and_null_removes() {
        let store = MemoryStore::new();
        store
            .write("users/u1", json!({"uid": "u1", "online": true, "note": "x"}))
            .await
            .expect("write");
        store
            .write("users/u1", json!({"online": false, "note": null}))
            .await
            .expect("write");

        let snap = store.snapshot_at("users").expect("snapshot");
        assert_eq!(snap["u1"]["uid"], "u1", "untouched field kept");
        assert_eq!(snap["u1"]["online"], false, "patched field merged");
        assert!(snap["u1"].get("note").is_none(), "null removes the field");
    }

    #[tokio::test]
    async fn non_object_patch_rejected() {
        let store = MemoryStore::new();
        let err = store.write("users/u1", json!(42)).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteRejected { .. }));
    }

    #[tokio::test]
    async fn invalid_path_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.write("", json!({})).await.unwrap_err(),
            StoreError::InvalidPath(_)
        ));
        assert!(matches!(
            store.subscribe("a//b").await.unwrap_err(),
            StoreError::InvalidPath(_)
        ));
    }

    #[tokio::test]
    async fn disconnect_applies_registered_intents() {
        let store = MemoryStore::new();
        store.connect();
        store
            .write("presence/u1/sessions/s1", json!({"online": true}))
            .await
            .expect("write");
        store
            .register_on_disconnect("presence/u1/sessions/s1", json!({"online": false}))
            .await
            .expect("register");

        store.disconnect();

        let snap = store.snapshot_at("presence/u1/sessions").expect("snapshot");
        assert_eq!(snap["s1"]["online"], false);
        assert!(!*store.connection_state().borrow());
    }

    #[tokio::test]
    async fn intents_apply_once() {
        let store = MemoryStore::new();
        store.connect();
        store
            .register_on_disconnect("presence/u1/sessions/s1", json!({"online": false}))
            .await
            .expect("register");
        store.disconnect();

        // Reconnect and go online again; the old intent must not fire.
        store.connect();
        store
            .write("presence/u1/sessions/s1", json!({"online": true}))
            .await
            .expect("write");
        store.disconnect();

        let snap = store.snapshot_at("presence/u1/sessions").expect("snapshot");
        assert_eq!(snap["s1"]["online"], true, "intent was consumed earlier");
    }

    #[tokio::test]
    async fn deny_terminates_existing_subscription() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("tickets").await.expect("subscribe");
        let _ = recv_snapshot(&mut rx).await;

        store.deny("tickets");

        match rx.recv().await.expect("delivery") {
            Delivery::Failed(StoreError::PermissionDenied(path)) => assert_eq!(path, "tickets"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(rx.recv().await.is_none(), "terminal: channel closes");

        // Later operations are rejected too.
        assert!(store.subscribe("tickets").await.is_err());
        assert!(store.write("tickets/t1", json!({"id": "t1"})).await.is_err());
    }

    #[tokio::test]
    async fn connection_state_starts_false() {
        let store = MemoryStore::new();
        assert!(!*store.connection_state().borrow());
        store.connect();
        assert!(*store.connection_state().borrow());
    }

    #[tokio::test]
    async fn connect_before_any_liveness_receiver_is_not_lost() {
        let store = MemoryStore::new();

        // No receiver exists yet; the flip must still take effect so a
        // session subscribing afterwards sees the live transport.
        store.connect();
        assert!(*store.connection_state().borrow());

        store.disconnect();
        assert!(!*store.connection_state().borrow());
    }

    #[tokio::test]
    async fn op_log_preserves_acknowledgment_order() {
        let store = MemoryStore::new();
        store
            .register_on_disconnect("presence/u1/sessions/s1", json!({"online": false}))
            .await
            .expect("register");
        store
            .write("presence/u1/sessions/s1", json!({"online": true}))
            .await
            .expect("write");

        let ops = store.ops();
        assert!(matches!(ops[0], StoreOp::IntentRegistered { .. }));
        assert!(matches!(ops[1], StoreOp::Write { .. }));
    }
}
