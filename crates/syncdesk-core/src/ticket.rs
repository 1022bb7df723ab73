//! Ticket lifecycle: Open → InProgress → Resolved, Resolved terminal.
//!
//! The stored status field is the only runtime source of truth. The
//! legacy closure-marker text survives solely as a historical tag on
//! the system message (`is_closure_message`); it is never consulted
//! to derive a ticket's status.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{CLOSED_MARKER, Message, SYSTEM_AUTHOR, SyncdeskError, Ticket, TicketStatus};

// ─── Transitions ──────────────────────────────────────────────────

/// Validate a status transition.
///
/// Legal edges: `Open → InProgress`, `Open → Resolved`,
/// `InProgress → Resolved`. Self-loops are accepted as no-ops. Any
/// edge out of `Resolved` is rejected — there is no reopen path.
pub fn transition(
    ticket_id: &str,
    current: TicketStatus,
    next: TicketStatus,
) -> Result<TicketStatus, SyncdeskError> {
    use TicketStatus::*;

    match (current, next) {
        (a, b) if a == b => Ok(a),
        (Open, InProgress) | (Open, Resolved) | (InProgress, Resolved) => Ok(next),
        (Resolved, _) => Err(SyncdeskError::TicketResolved {
            ticket_id: ticket_id.to_owned(),
        }),
        (from, to) => Err(SyncdeskError::InvalidTransition {
            ticket_id: ticket_id.to_owned(),
            from,
            to,
        }),
    }
}

/// Status after observing one chat message.
///
/// Any non-system message moves an `Open` ticket to `InProgress`.
/// System messages (including the closure notice) never transition;
/// terminal states are unaffected.
pub fn status_after_message(current: TicketStatus, message: &Message) -> TicketStatus {
    if message.is_system() || current != TicketStatus::Open {
        return current;
    }
    TicketStatus::InProgress
}

// ─── Close Action ─────────────────────────────────────────────────

/// Merge patch written to the ticket record on close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPatch {
    pub status: TicketStatus,
    pub updated_at: DateTime<Utc>,
}

/// The two writes produced by an administrative close: the status
/// patch and the companion system message. The writes are issued
/// separately and are not transactional; the caller decides how to
/// report a partial failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    pub patch: StatusPatch,
    pub system_message: Message,
}

/// Build the close outcome for a ticket.
///
/// Rejected when the ticket is already `Resolved`. The system message
/// carries the fixed closure marker for historical views; `id` is left
/// empty and assigned by the store's push key on append.
pub fn close(ticket: &Ticket, closed_by: &str, now: DateTime<Utc>) -> Result<CloseOutcome, SyncdeskError> {
    transition(&ticket.id, ticket.status, TicketStatus::Resolved)?;
    if ticket.status.is_terminal() {
        return Err(SyncdeskError::TicketResolved {
            ticket_id: ticket.id.clone(),
        });
    }

    Ok(CloseOutcome {
        patch: StatusPatch {
            status: TicketStatus::Resolved,
            updated_at: now,
        },
        system_message: Message {
            id: String::new(),
            ticket_id: ticket.id.clone(),
            author: SYSTEM_AUTHOR.to_owned(),
            text: format!("{CLOSED_MARKER} by {closed_by}"),
            timestamp: now,
        },
    })
}

/// Whether a message is the machine-generated closure notice.
///
/// Kept only so such messages are never fed back into
/// `status_after_message` as requester activity; never used to derive
/// `Resolved`.
pub fn is_closure_message(message: &Message) -> bool {
    message.is_system() && message.text.contains(CLOSED_MARKER)
}

// ─── Tests ────────────────────────────────────────────────────────
