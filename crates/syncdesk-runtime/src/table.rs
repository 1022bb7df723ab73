//! Plain-text rendering for the one-shot CLI commands.

use syncdesk_core::types::{Message, Ticket, TicketStatus, UserPresence};

/// Status indicator glyph for a ticket.
fn status_indicator(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Open => "○",
        TicketStatus::InProgress => "◉",
        TicketStatus::Resolved => "●",
    }
}

/// Build a summary line like "2 open, 1 in_progress, 3 resolved".
fn format_summary(tickets: &[Ticket]) -> String {
    let mut counts = Vec::new();
    for status in TicketStatus::ALL {
        let count = tickets.iter().filter(|t| t.status == status).count();
        if count > 0 {
            counts.push(format!("{count} {status}"));
        }
    }
    if counts.is_empty() {
        return "no tickets".to_string();
    }
    counts.join(", ")
}

/// Format the ticket overview for `syncdesk tickets`.
///
/// Example output:
/// ```text
/// Tickets
/// ─────────────────────────────────────────────────────────────
/// ◉ 0001700000000000-0000  in_progress  high    hardware  u1      laptop missing
/// ○ 0001700000000000-0001  open         normal  network   u2      vpn drops
///
/// Summary: 1 open, 1 in_progress
/// ```
pub fn format_tickets(tickets: &[Ticket]) -> String {
    let mut out = String::new();
    out.push_str("Tickets\n");
    out.push_str("─────────────────────────────────────────────────────────────\n");

    if tickets.is_empty() {
        out.push_str("  No tickets.\n");
        return out;
    }

    for ticket in tickets {
        out.push_str(&format!(
            "{} {:<22} {:<12} {:<7} {:<10} {:<8} {}\n",
            status_indicator(ticket.status),
            ticket.id,
            ticket.status,
            ticket.priority,
            ticket.category,
            ticket.owner_uid,
            ticket.title,
        ));
    }

    out.push('\n');
    out.push_str(&format!("Summary: {}\n", format_summary(tickets)));
    out
}

/// Format the user overview for `syncdesk users`.
pub fn format_users(users: &[UserPresence]) -> String {
    let mut out = String::new();
    out.push_str("Users\n");
    out.push_str("─────────────────────────────────────────────────────────────\n");

    if users.is_empty() {
        out.push_str("  No users.\n");
        return out;
    }

    for user in users {
        let presence = if user.online { "online" } else { "offline" };
        let last_seen = match user.last_seen {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "never".to_string(),
        };
        let flags = if user.active { "" } else { " [deactivated]" };
        out.push_str(&format!(
            "{:<12} {:<10} {:<8} {:<20} {}{}\n",
            user.uid, user.role, presence, last_seen, user.display_name, flags,
        ));
    }

    out
}

/// Format a ticket's chat transcript for `syncdesk messages`.
pub fn format_messages(messages: &[Message]) -> String {
    let mut out = String::new();

    if messages.is_empty() {
        out.push_str("  No messages.\n");
        return out;
    }

    for message in messages {
        out.push_str(&format!(
            "[{}] {:>10}: {}\n",
            message.timestamp.format("%H:%M:%S"),
            message.author,
            message.text,
        ));
    }

    out
}
