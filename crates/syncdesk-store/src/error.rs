//! Store-boundary error taxonomy.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Subscription or write denied for a path. Terminal for the
    /// affected subscription; no automatic resubscribe.
    #[error("permission denied for path {0}")]
    PermissionDenied(String),

    /// The session's transport is down.
    #[error("store connection is down")]
    Disconnected,

    /// Malformed path (empty, or empty segment).
    #[error("invalid store path: {0}")]
    InvalidPath(String),

    /// The store rejected a merge patch.
    #[error("write rejected at {path}: {reason}")]
    WriteRejected { path: String, reason: String },

    /// The subscription channel closed unexpectedly.
    #[error("subscription closed for path {0}")]
    SubscriptionClosed(String),
}
