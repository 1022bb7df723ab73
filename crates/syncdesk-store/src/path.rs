//! Typed path helpers for the store tree layout.
//!
//! Layout (collections are flattened, never nested inside records):
//!   users/{uid}
//!   presence/{uid}/sessions/{session_id}
//!   tickets/{ticket_id}
//!   messages/{ticket_id}/{push_key}

use crate::error::StoreError;

pub const USERS: &str = "users";
pub const TICKETS: &str = "tickets";

pub fn user(uid: &str) -> String {
    format!("{USERS}/{uid}")
}

pub fn ticket(ticket_id: &str) -> String {
    format!("{TICKETS}/{ticket_id}")
}

/// Per-ticket message collection.
pub fn messages(ticket_id: &str) -> String {
    format!("messages/{ticket_id}")
}

pub fn message(ticket_id: &str, key: &str) -> String {
    format!("messages/{ticket_id}/{key}")
}

/// A user's session-presence collection.
pub fn presence_sessions(uid: &str) -> String {
    format!("presence/{uid}/sessions")
}

pub fn presence_session(uid: &str, session_id: &str) -> String {
    format!("presence/{uid}/sessions/{session_id}")
}

/// Split a path into non-empty segments.
pub fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    if path.is_empty() {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    Ok(parts)
}
