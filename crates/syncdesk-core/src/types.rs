//! Shared record types for the console: users, tickets, chat messages.
//! All records serialize as JSON objects and travel through the store
//! as merge patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author value reserved for machine-generated lifecycle messages.
pub const SYSTEM_AUTHOR: &str = "system";

/// Marker phrase embedded in the system closure message. Historical
/// views matched on this text; at runtime the stored status field is
/// the only source of truth (see `ticket::is_closure_message`).
pub const CLOSED_MARKER: &str = "[ticket closed]";

// ─── Role ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Requester,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Requester => "requester",
        }
    }

    pub fn is_admin(self) -> bool {
        self == Self::Admin
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Ticket Status & Priority ─────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    Resolved,
}

impl TicketStatus {
    pub const ALL: [Self; 3] = [Self::Open, Self::InProgress, Self::Resolved];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
        }
    }

    /// Resolved is terminal: no transition leads back out of it.
    pub fn is_terminal(self) -> bool {
        self == Self::Resolved
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = SyncdeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            _ => Err(SyncdeskError::UnknownStatus(s.to_owned())),
        }
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for TicketPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Records ──────────────────────────────────────────────────────

/// User profile plus the aggregated online flag.
///
/// Owned by the session authenticated as `uid`; `role` and `active`
/// are mutated only by administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub uid: String,
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Per-session liveness record under `presence/{uid}/sessions/{sid}`.
///
/// One record per live connection; the user-level online flag is the
/// fan-in aggregate over these (see `presence::aggregate_presence`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPresence {
    pub session_id: String,
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub owner_uid: String,
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub priority: TicketPriority,
    #[serde(default)]
    pub status: TicketStatus,
    /// Free-form handling notes carried with the ticket.
    #[serde(default)]
    pub protocol: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only chat message. `id` is the store-assigned push key;
/// ordering is by `timestamp`, ties broken by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub ticket_id: String,
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn is_system(&self) -> bool {
        self.author == SYSTEM_AUTHOR
    }
}

// ─── Record Kind ──────────────────────────────────────────────────

/// Which collection a change event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    User,
    Ticket,
    Message,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ticket => "ticket",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Recency ──────────────────────────────────────────────────────

/// Recency field used by the change detector to distinguish an
/// advanced record from a re-delivered identical one.
pub trait Recency {
    fn updated_at(&self) -> DateTime<Utc>;
}

impl Recency for Ticket {
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Recency for Message {
    fn updated_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Recency for UserPresence {
    fn updated_at(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Recency for SessionPresence {
    fn updated_at(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

// ─── Error ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncdeskError {
    InvalidRecord(String),
    TicketResolved {
        ticket_id: String,
    },
    InvalidTransition {
        ticket_id: String,
        from: TicketStatus,
        to: TicketStatus,
    },
    UnknownStatus(String),
    EmptyMessage,
}

impl fmt::Display for SyncdeskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRecord(msg) => write!(f, "invalid record: {msg}"),
            Self::TicketResolved { ticket_id } => {
                write!(f, "ticket {ticket_id} is resolved and cannot change status")
            }
            Self::InvalidTransition { ticket_id, from, to } => {
                write!(f, "ticket {ticket_id}: illegal transition {from} -> {to}")
            }
            Self::UnknownStatus(s) => write!(f, "unknown ticket status: {s}"),
            Self::EmptyMessage => write!(f, "message text is empty"),
        }
    }
}

impl std::error::Error for SyncdeskError {}

// ─── Tests ────────────────────────────────────────────────────────
