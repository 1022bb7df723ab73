//! The `StoreClient` trait: the only surface the realtime layer may
//! use to reach the backing store. Keeping every component behind this
//! trait makes the whole core testable against `MemoryStore`.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::sync::{mpsc, watch};

use crate::error::StoreError;

/// Full key→record map of a collection, re-delivered on every write
/// under its path. Never a delta.
pub type Snapshot = BTreeMap<String, serde_json::Value>;

/// One delivery on a raw subscription queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Full current snapshot of the subscribed collection.
    Snapshot(Snapshot),
    /// The subscription failed. Terminal: no further deliveries follow.
    Failed(StoreError),
}

/// Client handle to a remote mutable key-value tree.
///
/// Concurrency discipline of the remote store is assumed as given:
/// last-write-wins per path, no transactions across paths.
pub trait StoreClient: Send + Sync + 'static {
    /// Open a subscription on the collection at `path`.
    ///
    /// The current full snapshot is delivered first, then a full
    /// snapshot after every write under the path. Per-path delivery is
    /// ordered; there is no cross-path ordering.
    fn subscribe(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<Delivery>, StoreError>> + Send;

    /// Merge `patch` into the record at `path`. Object fields are
    /// merged shallowly; a `null` field value removes the field.
    fn write(
        &self,
        path: &str,
        patch: serde_json::Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Register a patch the store applies by itself if this session's
    /// connection drops. Resolves once the registration is
    /// acknowledged. Cancelable by writing directly before disconnect.
    fn register_on_disconnect(
        &self,
        path: &str,
        patch: serde_json::Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Liveness channel: `true` while this session's transport is up.
    /// May report a stale `false` before the handshake completes.
    fn connection_state(&self) -> watch::Receiver<bool>;
}
