//! Per-session presence machine and the user-level fan-in aggregate.
//!
//! Each live connection owns one session record; the machine publishes
//! "online" only after the store has acknowledged the disconnect
//! intent registration, so a session that dies between the two store
//! operations can never be left marked online.
//!
//! Pure, deterministic. The async driver lives in syncdesk-client.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::SessionPresence;

// ─── Phases & Actions ─────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    #[default]
    Disconnected,
    /// Connected; waiting for the disconnect-intent registration ack.
    Registering,
    Online,
}

/// Merge patch for a session presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresencePatch {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Store operation the driver must perform next, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    /// Register `{online:false, last_seen}` to be applied by the store
    /// itself when this session's connection drops. Must be
    /// acknowledged before anything is written.
    RegisterDisconnectIntent { patch: PresencePatch },
    /// Write `{online:true, last_seen}` for this session. Emitted only
    /// after the intent registration ack was observed.
    WriteOnline { patch: PresencePatch },
    /// Direct offline write on explicit logout; the pending disconnect
    /// intent becomes moot.
    WriteOffline { patch: PresencePatch },
}

// ─── Machine ──────────────────────────────────────────────────────

/// Presence state machine for one session:
/// `Disconnected → Registering → Online → Disconnected`.
#[derive(Debug, Default)]
pub struct PresenceMachine {
    phase: PresencePhase,
    ever_connected: bool,
}

impl PresenceMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> PresencePhase {
        self.phase
    }

    /// Feed one liveness delivery from the store's connection-state
    /// channel.
    ///
    /// A `false` before the first `true` is ignored: the store may
    /// deliver a stale "not connected" while the real handshake is
    /// still completing.
    pub fn on_connection(&mut self, connected: bool, now: DateTime<Utc>) -> Option<PresenceAction> {
        if connected {
            self.ever_connected = true;
            if self.phase == PresencePhase::Disconnected {
                self.phase = PresencePhase::Registering;
                return Some(PresenceAction::RegisterDisconnectIntent {
                    patch: PresencePatch {
                        online: false,
                        last_seen: now,
                    },
                });
            }
            return None;
        }

        if !self.ever_connected {
            // Stale startup delivery.
            return None;
        }

        // Connection dropped: the store applies the registered intent
        // itself; nothing for the client to write.
        self.phase = PresencePhase::Disconnected;
        None
    }

    /// The disconnect-intent registration was acknowledged.
    ///
    /// Returns the online write only when still in `Registering`: if
    /// the connection dropped while the ack was in flight, the session
    /// must not be marked online.
    pub fn on_intent_registered(&mut self, now: DateTime<Utc>) -> Option<PresenceAction> {
        if self.phase != PresencePhase::Registering {
            return None;
        }
        self.phase = PresencePhase::Online;
        Some(PresenceAction::WriteOnline {
            patch: PresencePatch {
                online: true,
                last_seen: now,
            },
        })
    }

    /// Explicit logout: direct offline write, back to `Disconnected`.
    pub fn on_logout(&mut self, now: DateTime<Utc>) -> PresenceAction {
        self.phase = PresencePhase::Disconnected;
        PresenceAction::WriteOffline {
            patch: PresencePatch {
                online: false,
                last_seen: now,
            },
        }
    }
}

// ─── Aggregate ────────────────────────────────────────────────────

/// User-level presence derived from the per-session records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceAggregate {
    /// True while any session is online.
    pub online: bool,
    /// Most recent `last_seen` across all sessions.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Fan-in over a user's session records.
///
/// One session's disconnect intent only flips its own record, so a
/// dying session can never mark a user with other live sessions
/// offline.
pub fn aggregate_presence(sessions: &BTreeMap<String, SessionPresence>) -> PresenceAggregate {
    PresenceAggregate {
        online: sessions.values().any(|s| s.online),
        last_seen: sessions.values().filter_map(|s| s.last_seen).max(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────
