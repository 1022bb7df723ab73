//! End-to-end session flows over the in-memory store: ticket
//! lifecycle, message-driven transitions, exactly-once events, and
//! cross-session presence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use syncdesk_client::{ClientError, ConsoleSession, RecordEvent, SessionConfig};
use syncdesk_core::types::{CLOSED_MARKER, Role, SyncdeskError, TicketPriority, TicketStatus};
use syncdesk_store::MemoryStore;

const TICK: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_millis(1_000);

fn admin_config(uid: &str, session_id: &str) -> SessionConfig {
    let mut config = SessionConfig::new(uid, session_id);
    config.role = Role::Admin;
    config
}

async fn start_session(
    store: &Arc<MemoryStore>,
    config: SessionConfig,
) -> (ConsoleSession<MemoryStore>, mpsc::Receiver<RecordEvent>) {
    ConsoleSession::start(Arc::clone(store), config)
        .await
        .expect("session start")
}

/// Await events until one matches, failing the test on timeout.
async fn wait_for_event(
    rx: &mut mpsc::Receiver<RecordEvent>,
    mut pred: impl FnMut(&RecordEvent) -> bool,
) -> RecordEvent {
    timeout(DEADLINE, async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event before deadline")
}

/// Poll a projection-side condition until it holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(DEADLINE, async {
        while !cond() {
            sleep(TICK).await;
        }
    })
    .await
    .expect("condition before deadline");
}

// ─── Ticket Lifecycle ─────────────────────────────────────────────

#[tokio::test]
async fn ticket_creation_emits_created_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (session, mut events) = start_session(&store, admin_config("admin", "s1")).await;

    let ticket = session
        .create_ticket("laptop missing", "hardware", TicketPriority::High)
        .await
        .expect("create");

    let event = wait_for_event(&mut events, |e| matches!(e, RecordEvent::TicketCreated(_))).await;
    let RecordEvent::TicketCreated(created) = event else {
        unreachable!()
    };
    assert_eq!(created.id, ticket.id);
    assert_eq!(created.status, TicketStatus::Open);

    // No second Created for the same key, whatever else arrives.
    sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(&event, RecordEvent::TicketCreated(t) if t.id == ticket.id),
            "duplicate Created for {}",
            ticket.id
        );
    }

    assert_eq!(session.ticket(&ticket.id).expect("projected").id, ticket.id);
    session.logout().await;
}

#[tokio::test]
async fn first_message_moves_open_ticket_to_in_progress() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (session, mut events) = start_session(&store, admin_config("admin", "s1")).await;

    let ticket = session
        .create_ticket("vpn drops", "network", TicketPriority::Normal)
        .await
        .expect("create");
    wait_until(|| session.ticket(&ticket.id).is_some()).await;

    session
        .post_message(&ticket.id, "started looking into this")
        .await
        .expect("post");

    wait_for_event(&mut events, |e| {
        matches!(e, RecordEvent::MessageCreated(m) if m.ticket_id == ticket.id)
    })
    .await;
    wait_until(|| session.ticket_status(&ticket.id) == Some(TicketStatus::InProgress)).await;

    session.logout().await;
}

#[tokio::test]
async fn close_resolves_and_appends_system_message() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (session, mut events) = start_session(&store, admin_config("admin", "s1")).await;

    let ticket = session
        .create_ticket("printer on fire", "hardware", TicketPriority::Urgent)
        .await
        .expect("create");
    wait_until(|| session.ticket(&ticket.id).is_some()).await;

    session.close_ticket(&ticket.id).await.expect("close");

    wait_until(|| session.ticket_status(&ticket.id) == Some(TicketStatus::Resolved)).await;
    wait_for_event(&mut events, |e| {
        matches!(e, RecordEvent::MessageCreated(m) if m.is_system())
    })
    .await;

    let messages = session.messages(&ticket.id);
    let closure = messages.last().expect("closure message");
    assert!(closure.is_system());
    assert!(closure.text.contains(CLOSED_MARKER));
    assert!(closure.text.contains("admin"));

    session.logout().await;
}

#[tokio::test]
async fn resolved_ticket_stays_resolved() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (session, _events) = start_session(&store, admin_config("admin", "s1")).await;

    let ticket = session
        .create_ticket("stale", "misc", TicketPriority::Low)
        .await
        .expect("create");
    wait_until(|| session.ticket(&ticket.id).is_some()).await;
    session.close_ticket(&ticket.id).await.expect("close");
    wait_until(|| session.ticket_status(&ticket.id) == Some(TicketStatus::Resolved)).await;

    // A second close is rejected outright.
    let err = session.close_ticket(&ticket.id).await.unwrap_err();
    assert_eq!(
        err,
        ClientError::Domain(SyncdeskError::TicketResolved {
            ticket_id: ticket.id.clone()
        })
    );

    // Chat stays open on a resolved ticket, but no message reopens it.
    session
        .post_message(&ticket.id, "thanks, confirmed fixed")
        .await
        .expect("post on resolved");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        session.ticket_status(&ticket.id),
        Some(TicketStatus::Resolved),
        "no transition out of Resolved"
    );

    session.logout().await;
}

#[tokio::test]
async fn requester_cannot_close_or_deactivate() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (session, _events) = start_session(&store, SessionConfig::new("u1", "s1")).await;

    let ticket = session
        .create_ticket("no sound", "hardware", TicketPriority::Normal)
        .await
        .expect("create");
    wait_until(|| session.ticket(&ticket.id).is_some()).await;

    assert_eq!(
        session.close_ticket(&ticket.id).await.unwrap_err(),
        ClientError::NotAdmin
    );
    assert_eq!(
        session.set_user_active("u1", false).await.unwrap_err(),
        ClientError::NotAdmin
    );

    session.logout().await;
}

#[tokio::test]
async fn posting_to_unknown_ticket_rejected() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (session, _events) = start_session(&store, SessionConfig::new("u1", "s1")).await;

    assert_eq!(
        session.post_message("no-such-ticket", "hello").await.unwrap_err(),
        ClientError::UnknownTicket("no-such-ticket".to_owned())
    );
    assert_eq!(
        session.post_message("no-such-ticket", "").await.unwrap_err(),
        ClientError::UnknownTicket("no-such-ticket".to_owned())
    );

    session.logout().await;
}

// ─── Cross-Session Visibility ─────────────────────────────────────

#[tokio::test]
async fn sessions_observe_each_others_tickets_and_messages() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (requester, _requester_events) =
        start_session(&store, SessionConfig::new("u1", "s1")).await;
    let (admin, mut admin_events) = start_session(&store, admin_config("admin", "s2")).await;

    let ticket = requester
        .create_ticket("screen flickers", "hardware", TicketPriority::Normal)
        .await
        .expect("create");

    let event = wait_for_event(&mut admin_events, |e| {
        matches!(e, RecordEvent::TicketCreated(t) if t.id == ticket.id)
    })
    .await;
    let RecordEvent::TicketCreated(seen) = event else {
        unreachable!()
    };
    assert_eq!(seen.owner_uid, "u1");

    wait_until(|| requester.ticket(&ticket.id).is_some()).await;
    requester
        .post_message(&ticket.id, "happens every morning")
        .await
        .expect("post");
    wait_for_event(&mut admin_events, |e| {
        matches!(e, RecordEvent::MessageCreated(m) if m.ticket_id == ticket.id && m.author == "u1")
    })
    .await;

    // The author's session drives the transition; the admin observes it.
    wait_until(|| admin.ticket_status(&ticket.id) == Some(TicketStatus::InProgress)).await;

    admin.logout().await;
    requester.logout().await;
}

#[tokio::test]
async fn presence_aggregates_across_sessions() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (observer, _observer_events) = start_session(&store, admin_config("admin", "s0")).await;

    let (first, _e1) = start_session(&store, SessionConfig::new("u1", "s1")).await;
    wait_until(|| observer.user_online("u1").online).await;

    let (second, _e2) = start_session(&store, SessionConfig::new("u1", "s2")).await;

    // One session leaving keeps the user online while another remains.
    first.logout().await;
    sleep(Duration::from_millis(50)).await;
    assert!(observer.user_online("u1").online, "s2 still connected");

    second.logout().await;
    wait_until(|| !observer.user_online("u1").online).await;
    assert!(
        observer.user_online("u1").last_seen.is_some(),
        "last_seen survives going offline"
    );

    // The user record must agree: with no live connection the stale
    // connect-time mirror may not leak through user queries.
    let user = observer.user("u1").expect("known user");
    assert!(!user.online, "no live session, so the record reads offline");
    assert!(user.last_seen.is_some());
    assert!(
        observer.list_users().iter().all(|u| u.uid != "u1" || !u.online),
        "list_users agrees with the aggregate"
    );

    observer.logout().await;
}

#[tokio::test]
async fn transport_drop_flips_presence_without_online_race() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (observer, _events) = start_session(&store, admin_config("admin", "s0")).await;
    let (user, _user_events) = start_session(&store, SessionConfig::new("u1", "s1")).await;
    wait_until(|| observer.user_online("u1").online).await;

    // The store applies the registered intent on disconnect.
    store.disconnect();
    wait_until(|| !observer.user_online("u1").online).await;

    user.logout().await;
    observer.logout().await;
}

// ─── Change Log ───────────────────────────────────────────────────

#[tokio::test]
async fn changes_since_is_incremental() {
    let store = Arc::new(MemoryStore::new());
    store.connect();
    let (session, _events) = start_session(&store, admin_config("admin", "s1")).await;

    let first = session
        .create_ticket("one", "misc", TicketPriority::Low)
        .await
        .expect("create");
    wait_until(|| session.ticket(&first.id).is_some()).await;
    let mark = session.version();

    let second = session
        .create_ticket("two", "misc", TicketPriority::Low)
        .await
        .expect("create");
    wait_until(|| session.ticket(&second.id).is_some()).await;

    let changes = session.changes_since(mark);
    assert!(
        changes.iter().any(|c| c.key == second.id),
        "new ticket appears after the mark"
    );
    assert!(
        changes.iter().all(|c| c.version > mark),
        "nothing at or below the mark is replayed"
    );

    session.logout().await;
}
