//! Chat ordering and message construction.
//!
//! Consumers re-sort the full message snapshot on every delivery; there
//! is no incremental merge. Ordering is by timestamp ascending with the
//! store-assigned push key as tie-breaker, so a fixed snapshot always
//! renders in the same order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{Message, SyncdeskError};

/// Build a new chat message for appending.
///
/// Text must contain at least one non-whitespace character. The `id`
/// is left empty; the store assigns the push key on append, which makes
/// the append idempotent at the store layer.
pub fn new_message(
    ticket_id: &str,
    author: &str,
    text: &str,
    now: DateTime<Utc>,
) -> Result<Message, SyncdeskError> {
    if text.trim().is_empty() {
        return Err(SyncdeskError::EmptyMessage);
    }
    Ok(Message {
        id: String::new(),
        ticket_id: ticket_id.to_owned(),
        author: author.to_owned(),
        text: text.to_owned(),
        timestamp: now,
    })
}

/// Order a full message snapshot for rendering.
///
/// Timestamps are client-supplied in part of the flow, so ordering is
/// best effort; the key tie-break keeps it deterministic.
pub fn ordered(snapshot: &BTreeMap<String, Message>) -> Vec<Message> {
    let mut messages: Vec<Message> = snapshot.values().cloned().collect();
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    messages
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().expect("valid ts")
    }

    fn message(id: &str, ts_ms: i64) -> Message {
        Message {
            id: id.to_owned(),
            ticket_id: "t1".to_owned(),
            author: "u1".to_owned(),
            text: "hello".to_owned(),
            timestamp: at(ts_ms),
        }
    }

    fn snapshot(messages: &[Message]) -> BTreeMap<String, Message> {
        messages.iter().map(|m| (m.id.clone(), m.clone())).collect()
    }

    #[test]
    fn new_message_rejects_blank_text() {
        assert_eq!(
            new_message("t1", "u1", "   \n", at(0)).unwrap_err(),
            SyncdeskError::EmptyMessage
        );
    }

    #[test]
    fn new_message_leaves_id_for_the_store() {
        let msg = new_message("t1", "u1", "hi", at(5)).expect("message");
        assert!(msg.id.is_empty());
        assert_eq!(msg.ticket_id, "t1");
        assert_eq!(msg.timestamp, at(5));
    }

    #[test]
    fn ordered_sorts_by_timestamp() {
        let snap = snapshot(&[message("c", 300), message("a", 100), message("b", 200)]);
        let msgs = ordered(&snap);
        let ids: Vec<&str> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn ties_broken_by_push_key() {
        let snap = snapshot(&[message("k2", 100), message("k1", 100), message("k3", 100)]);
        let msgs = ordered(&snap);
        let ids: Vec<&str> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["k1", "k2", "k3"]);
    }

    #[test]
    fn ordering_is_deterministic_for_any_input_order() {
        let a = snapshot(&[message("k1", 100), message("k2", 50), message("k3", 100)]);
        let b = snapshot(&[message("k3", 100), message("k1", 100), message("k2", 50)]);
        assert_eq!(ordered(&a), ordered(&b));
    }
}
