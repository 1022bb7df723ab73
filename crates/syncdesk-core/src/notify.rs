//! Snapshot change detection: diffs successive full-collection
//! snapshots against a retained baseline and emits discrete
//! Created/Updated events exactly once per observed change.

use std::collections::{BTreeMap, HashMap};

use crate::types::Recency;

// ─── Change ───────────────────────────────────────────────────────

/// Discrete event derived from a snapshot diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    /// Key observed for the first time.
    Created(T),
    /// Previously seen key reappeared with an advanced recency field.
    Updated(T),
}

impl<T> Change<T> {
    pub fn item(&self) -> &T {
        match self {
            Self::Created(item) | Self::Updated(item) => item,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

// ─── Change Detector ──────────────────────────────────────────────

/// Per-subscription diff state, owned by exactly one watch.
///
/// The baseline never evicts: a key that disappears from a later
/// snapshot is retained, so at most one `Created` is ever emitted per
/// key even if the key disappears and reappears. Removals emit no
/// event (deletions are silent by design).
#[derive(Debug)]
pub struct ChangeDetector<T> {
    previous: HashMap<String, T>,
}

impl<T> Default for ChangeDetector<T> {
    fn default() -> Self {
        Self {
            previous: HashMap::new(),
        }
    }
}

impl<T: Clone + Recency> ChangeDetector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff one full snapshot against the retained baseline.
    ///
    /// All events are computed against the prior baseline first; the
    /// baseline is updated only afterwards, so the next snapshot is
    /// never diffed against a partially updated map. Events are
    /// returned in key order for determinism.
    pub fn diff(&mut self, snapshot: &BTreeMap<String, T>) -> Vec<Change<T>> {
        let mut events = Vec::new();

        for (key, item) in snapshot {
            match self.previous.get(key) {
                None => events.push(Change::Created(item.clone())),
                Some(prev) if item.updated_at() > prev.updated_at() => {
                    events.push(Change::Updated(item.clone()));
                }
                Some(_) => {}
            }
        }

        for (key, item) in snapshot {
            self.previous.insert(key.clone(), item.clone());
        }

        events
    }

    /// Whether a key has ever been observed.
    pub fn seen(&self, key: &str) -> bool {
        self.previous.contains_key(key)
    }

    /// Number of keys ever observed.
    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    /// Discard the baseline. The next snapshot re-seeds from scratch
    /// (used when a watch is torn down and re-opened).
    pub fn reset(&mut self) {
        self.previous.clear();
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ticket, TicketPriority, TicketStatus};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().expect("valid ts")
    }

    fn ticket(id: &str, updated_ms: i64) -> Ticket {
        Ticket {
            id: id.to_owned(),
            owner_uid: "u1".to_owned(),
            title: "printer on fire".to_owned(),
            category: "hardware".to_owned(),
            priority: TicketPriority::Normal,
            status: TicketStatus::Open,
            protocol: None,
            created_at: at(0),
            updated_at: at(updated_ms),
        }
    }

    fn snapshot(tickets: &[Ticket]) -> BTreeMap<String, Ticket> {
        tickets.iter().map(|t| (t.id.clone(), t.clone())).collect()
    }

    #[test]
    fn first_observation_emits_created() {
        let mut detector = ChangeDetector::new();
        assert!(detector.diff(&BTreeMap::new()).is_empty());

        let events = detector.diff(&snapshot(&[ticket("t1", 100)]));
        assert_eq!(events, vec![Change::Created(ticket("t1", 100))]);
    }

    #[test]
    fn unchanged_redelivery_emits_nothing() {
        let mut detector = ChangeDetector::new();
        detector.diff(&snapshot(&[ticket("t1", 100)]));

        let events = detector.diff(&snapshot(&[ticket("t1", 100)]));
        assert!(events.is_empty(), "same updated_at must not re-notify");
    }

    #[test]
    fn advanced_recency_emits_exactly_one_updated() {
        let mut detector = ChangeDetector::new();
        detector.diff(&snapshot(&[ticket("t1", 100)]));

        let events = detector.diff(&snapshot(&[ticket("t1", 150)]));
        assert_eq!(events, vec![Change::Updated(ticket("t1", 150))]);

        // Re-delivery of the advanced snapshot stays silent.
        assert!(detector.diff(&snapshot(&[ticket("t1", 150)])).is_empty());
    }

    #[test]
    fn regressed_recency_emits_nothing() {
        let mut detector = ChangeDetector::new();
        detector.diff(&snapshot(&[ticket("t1", 150)]));

        // Strictly-greater comparison: an older updated_at is ignored.
        assert!(detector.diff(&snapshot(&[ticket("t1", 100)])).is_empty());
    }

    #[test]
    fn at_most_one_created_per_key_across_removal() {
        let mut detector = ChangeDetector::new();
        detector.diff(&snapshot(&[ticket("t1", 100)]));

        // t1 disappears: silent, baseline retained.
        assert!(detector.diff(&BTreeMap::new()).is_empty());
        assert!(detector.seen("t1"));

        // t1 reappears unchanged: still silent.
        assert!(detector.diff(&snapshot(&[ticket("t1", 100)])).is_empty());

        // t1 reappears advanced: Updated, never a second Created.
        let events = detector.diff(&snapshot(&[ticket("t1", 200)]));
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_created());
    }

    #[test]
    fn mixed_snapshot_orders_events_by_key() {
        let mut detector = ChangeDetector::new();
        detector.diff(&snapshot(&[ticket("t1", 100)]));

        let events = detector.diff(&snapshot(&[
            ticket("t3", 50),
            ticket("t1", 150),
            ticket("t2", 10),
        ]));
        assert_eq!(
            events,
            vec![
                Change::Updated(ticket("t1", 150)),
                Change::Created(ticket("t2", 10)),
                Change::Created(ticket("t3", 50)),
            ]
        );
    }

    #[test]
    fn reset_reseeds_as_created() {
        let mut detector = ChangeDetector::new();
        detector.diff(&snapshot(&[ticket("t1", 100)]));
        detector.reset();
        assert!(detector.is_empty());

        let events = detector.diff(&snapshot(&[ticket("t1", 100)]));
        assert_eq!(events.len(), 1);
        assert!(events[0].is_created());
    }
}
