//! Presence tracker driver: runs the core presence machine against
//! the store for one authenticated session.
//!
//! Ordering invariant (the whole point of this module): the online
//! write is issued only after the disconnect-intent registration has
//! been acknowledged. A session dying between the two operations is
//! therefore never left marked online.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use syncdesk_core::presence::{PresenceAction, PresenceMachine};
use syncdesk_core::types::Role;
use syncdesk_store::{StoreClient, StoreError, path};

/// Handle to a running presence tracker task.
#[derive(Debug)]
pub struct PresenceHandle {
    logout_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    /// Explicit logout: writes the session offline directly and stops
    /// the tracker. The pending disconnect intent becomes moot.
    pub async fn logout(self) {
        let _ = self.logout_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Create the user profile record when none exists yet, with
/// `online=false` (the tracker flips it once the protocol completes).
pub async fn ensure_profile<S: StoreClient>(
    store: &S,
    uid: &str,
    display_name: &str,
    email: &str,
    role: Role,
) -> Result<(), StoreError> {
    let mut rx = store.subscribe(path::USERS).await?;
    let existing = match rx.recv().await {
        Some(syncdesk_store::Delivery::Snapshot(snap)) => snap.contains_key(uid),
        Some(syncdesk_store::Delivery::Failed(e)) => return Err(e),
        None => return Err(StoreError::SubscriptionClosed(path::USERS.to_owned())),
    };
    drop(rx);

    if existing {
        return Ok(());
    }

    tracing::info!("creating profile for {uid}");
    store
        .write(
            &path::user(uid),
            json!({
                "uid": uid,
                "display_name": display_name,
                "email": email,
                "role": role,
                "online": false,
                "active": true,
            }),
        )
        .await
}

/// Spawn the presence tracker for `uid`/`session_id`.
///
/// The tracker owns its machine and its liveness subscription; the
/// caller interacts only through the returned handle.
pub fn spawn<S: StoreClient>(store: Arc<S>, uid: &str, session_id: &str) -> PresenceHandle {
    let (logout_tx, logout_rx) = mpsc::channel(1);
    let uid = uid.to_owned();
    let session_id = session_id.to_owned();
    let task = tokio::spawn(async move {
        run(store, uid, session_id, logout_rx).await;
    });
    PresenceHandle { logout_tx, task }
}

async fn run<S: StoreClient>(
    store: Arc<S>,
    uid: String,
    session_id: String,
    mut logout_rx: mpsc::Receiver<()>,
) {
    let mut conn = store.connection_state();
    let mut machine = PresenceMachine::new();
    let session_path = path::presence_session(&uid, &session_id);

    // Prime with the current liveness value; a stale `false` here is
    // ignored by the machine.
    let connected = *conn.borrow_and_update();
    let action = machine.on_connection(connected, Utc::now());
    perform(&*store, &mut machine, &conn, &uid, &session_id, &session_path, action).await;

    loop {
        tokio::select! {
            _ = logout_rx.recv() => {
                let action = machine.on_logout(Utc::now());
                perform(&*store, &mut machine, &conn, &uid, &session_id, &session_path, Some(action))
                    .await;
                tracing::info!("session {session_id} logged out");
                return;
            }
            changed = conn.changed() => {
                if changed.is_err() {
                    return;
                }
                let connected = *conn.borrow_and_update();
                let action = machine.on_connection(connected, Utc::now());
                perform(&*store, &mut machine, &conn, &uid, &session_id, &session_path, action)
                    .await;
            }
        }
    }
}

/// Execute one machine action, feeding any follow-up back in.
async fn perform<S: StoreClient>(
    store: &S,
    machine: &mut PresenceMachine,
    conn: &tokio::sync::watch::Receiver<bool>,
    uid: &str,
    session_id: &str,
    session_path: &str,
    action: Option<PresenceAction>,
) {
    let Some(action) = action else { return };
    match action {
        PresenceAction::RegisterDisconnectIntent { patch } => {
            let patch_json = json!({
                "session_id": session_id,
                "online": patch.online,
                "last_seen": patch.last_seen,
            });
            match store.register_on_disconnect(session_path, patch_json).await {
                Ok(()) => {
                    // The connection may have dropped while the ack
                    // was in flight; feed that in first so a dead
                    // session is never marked online.
                    if !*conn.borrow() {
                        machine.on_connection(false, Utc::now());
                    }
                    if let Some(follow_up) = machine.on_intent_registered(Utc::now()) {
                        write_presence(store, uid, session_id, session_path, follow_up).await;
                    }
                }
                Err(e) => {
                    // Without a registered intent the session must not
                    // go online: a crash would leave a stale flag.
                    tracing::warn!("disconnect intent registration failed for {uid}: {e}");
                }
            }
        }
        other => write_presence(store, uid, session_id, session_path, other).await,
    }
}

/// Issue the store writes for an online/offline action.
async fn write_presence<S: StoreClient>(
    store: &S,
    uid: &str,
    session_id: &str,
    session_path: &str,
    action: PresenceAction,
) {
    match action {
        PresenceAction::WriteOnline { patch } => {
            let session_patch = json!({
                "session_id": session_id,
                "online": true,
                "last_seen": patch.last_seen,
            });
            if let Err(e) = store.write(session_path, session_patch).await {
                tracing::warn!("online write failed for {uid}: {e}");
                return;
            }
            // User-level mirror: any session online marks the user
            // online. The offline direction is derived by readers from
            // the session records (fan-in aggregate).
            let user_patch = json!({
                "online": true,
                "last_seen": patch.last_seen,
                "active": true,
            });
            if let Err(e) = store.write(&path::user(uid), user_patch).await {
                tracing::warn!("user mirror write failed for {uid}: {e}");
            }
        }
        PresenceAction::WriteOffline { patch } => {
            let session_patch = json!({
                "session_id": session_id,
                "online": false,
                "last_seen": patch.last_seen,
            });
            if let Err(e) = store.write(session_path, session_patch).await {
                tracing::warn!("offline write failed for {uid}: {e}");
            }
        }
        PresenceAction::RegisterDisconnectIntent { .. } => {
            unreachable!("registration is handled in perform");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
