//! Console session: watches the shared collections, diffs snapshots
//! into discrete record events, maintains queryable derived state,
//! and issues the mutating operations (create/post/close).
//!
//! Each watch runs in its own task and owns its own diff state; state
//! crosses task boundaries only through channels and the projection
//! mutex. Per-path processing is sequential, so event emission is
//! exactly-once per observed change.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use syncdesk_core::chat;
use syncdesk_core::notify::{Change, ChangeDetector};
use syncdesk_core::presence::{PresenceAggregate, aggregate_presence};
use syncdesk_core::ticket;
use syncdesk_core::types::{
    Message, RecordKind, Role, SessionPresence, SyncdeskError, Ticket, TicketPriority,
    TicketStatus, UserPresence,
};
use syncdesk_store::keys::PushKeyGen;
use syncdesk_store::{Snapshot, StoreClient, path};

use crate::error::ClientError;
use crate::multiplexer::{Multiplexer, WatchState, WatchStream};
use crate::presence::{self, PresenceHandle};

// ─── Events ───────────────────────────────────────────────────────

/// Discrete notification produced for the UI, exactly once per
/// observed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    UserCreated(UserPresence),
    UserUpdated(UserPresence),
    TicketCreated(Ticket),
    TicketUpdated(Ticket),
    MessageCreated(Message),
    MessageUpdated(Message),
}

impl RecordEvent {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::UserCreated(_) | Self::UserUpdated(_) => RecordKind::User,
            Self::TicketCreated(_) | Self::TicketUpdated(_) => RecordKind::Ticket,
            Self::MessageCreated(_) | Self::MessageUpdated(_) => RecordKind::Message,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(
            self,
            Self::UserCreated(_) | Self::TicketCreated(_) | Self::MessageCreated(_)
        )
    }
}

/// Change-log entry for poll-style clients (`changes_since`).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StateChange {
    pub version: u64,
    pub kind: RecordKind,
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub uid: String,
    pub session_id: String,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    /// Capacity of the event channel; watch tasks apply backpressure
    /// when the consumer lags.
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(uid: &str, session_id: &str) -> Self {
        Self {
            uid: uid.to_owned(),
            session_id: session_id.to_owned(),
            display_name: uid.to_owned(),
            email: String::new(),
            role: Role::Requester,
            event_capacity: 256,
        }
    }
}

// ─── Projection ───────────────────────────────────────────────────

#[derive(Default)]
struct Projection {
    users: BTreeMap<String, UserPresence>,
    tickets: BTreeMap<String, Ticket>,
    /// Messages per ticket, already in render order.
    messages: BTreeMap<String, Vec<Message>>,
    /// Session-presence records per uid.
    sessions: BTreeMap<String, BTreeMap<String, SessionPresence>>,
    version: u64,
    changes: Vec<StateChange>,
}

impl Projection {
    fn record_change(&mut self, kind: RecordKind, key: &str, now: DateTime<Utc>) {
        self.version += 1;
        self.changes.push(StateChange {
            version: self.version,
            kind,
            key: key.to_owned(),
            timestamp: now,
        });
    }
}

struct Ctx<S> {
    store: Arc<S>,
    mux: Multiplexer<S>,
    projection: Mutex<Projection>,
    events_tx: mpsc::Sender<RecordEvent>,
    keys: Mutex<PushKeyGen>,
    watched_messages: Mutex<HashSet<String>>,
    watched_presence: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    uid: String,
    role: Role,
}

// ─── Session ──────────────────────────────────────────────────────

/// One authenticated console session over a shared store.
pub struct ConsoleSession<S: StoreClient> {
    ctx: Arc<Ctx<S>>,
    presence: Option<PresenceHandle>,
}

impl<S: StoreClient> ConsoleSession<S> {
    /// Connect a session: ensure the profile record, start the
    /// presence tracker, and open the collection watches. Returns the
    /// session plus the discrete event stream for the UI.
    pub async fn start(
        store: Arc<S>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<RecordEvent>), ClientError> {
        presence::ensure_profile(
            &*store,
            &config.uid,
            &config.display_name,
            &config.email,
            config.role,
        )
        .await?;

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let ctx = Arc::new(Ctx {
            store: Arc::clone(&store),
            mux: Multiplexer::new(Arc::clone(&store)),
            projection: Mutex::new(Projection::default()),
            events_tx,
            keys: Mutex::new(PushKeyGen::new()),
            watched_messages: Mutex::new(HashSet::new()),
            watched_presence: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            uid: config.uid.clone(),
            role: config.role,
        });

        let users_stream = ctx.mux.watch(path::USERS).await?;
        spawn_task(&ctx, run_users_watch(Arc::clone(&ctx), users_stream));

        let tickets_stream = ctx.mux.watch(path::TICKETS).await?;
        spawn_task(&ctx, run_tickets_watch(Arc::clone(&ctx), tickets_stream));

        watch_presence_sessions(&ctx, &config.uid).await;

        let presence = presence::spawn(store, &config.uid, &config.session_id);
        tracing::info!("session {} started for {}", config.session_id, config.uid);

        Ok((
            Self {
                ctx,
                presence: Some(presence),
            },
            events_rx,
        ))
    }

    // ── Queries ────────────────────────────────────────────────

    /// User records with `online`/`last_seen` overlaid from the
    /// session-record aggregate. The stored user-level mirror only
    /// flips to true on connect; the aggregate is what tracks the last
    /// session ending, so queries never report a user online with no
    /// live connection.
    pub fn list_users(&self) -> Vec<UserPresence> {
        let projection = self.lock();
        projection
            .users
            .values()
            .map(|user| with_live_presence(&projection, user.clone()))
            .collect()
    }

    pub fn user(&self, uid: &str) -> Option<UserPresence> {
        let projection = self.lock();
        projection
            .users
            .get(uid)
            .map(|user| with_live_presence(&projection, user.clone()))
    }

    /// Aggregated presence over the user's session records. This is
    /// the authoritative online signal.
    pub fn user_online(&self, uid: &str) -> PresenceAggregate {
        let projection = self.lock();
        match projection.sessions.get(uid) {
            Some(sessions) => aggregate_presence(sessions),
            None => aggregate_presence(&BTreeMap::new()),
        }
    }

    pub fn list_tickets(&self) -> Vec<Ticket> {
        self.lock().tickets.values().cloned().collect()
    }

    pub fn ticket(&self, ticket_id: &str) -> Option<Ticket> {
        self.lock().tickets.get(ticket_id).cloned()
    }

    pub fn ticket_status(&self, ticket_id: &str) -> Option<TicketStatus> {
        self.lock().tickets.get(ticket_id).map(|t| t.status)
    }

    /// Messages for a ticket in render order (timestamp, then key).
    pub fn messages(&self, ticket_id: &str) -> Vec<Message> {
        self.lock()
            .messages
            .get(ticket_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn changes_since(&self, since_version: u64) -> Vec<StateChange> {
        let projection = self.lock();
        let start = projection
            .changes
            .partition_point(|c| c.version <= since_version);
        projection.changes[start..].to_vec()
    }

    /// Drop change entries at or below `before_version` once all
    /// pollers have acknowledged past it.
    pub fn trim_changes_before(&self, before_version: u64) {
        self.lock().changes.retain(|c| c.version > before_version);
    }

    // ── Operations ─────────────────────────────────────────────

    /// Create a new ticket owned by this session's user.
    pub async fn create_ticket(
        &self,
        title: &str,
        category: &str,
        priority: TicketPriority,
    ) -> Result<Ticket, ClientError> {
        let now = Utc::now();
        let id = self.next_key(now);
        let ticket = Ticket {
            id: id.clone(),
            owner_uid: self.ctx.uid.clone(),
            title: title.to_owned(),
            category: category.to_owned(),
            priority,
            status: TicketStatus::Open,
            protocol: None,
            created_at: now,
            updated_at: now,
        };
        self.ctx
            .store
            .write(&path::ticket(&id), to_patch(&ticket)?)
            .await?;
        Ok(ticket)
    }

    /// Append a chat message authored by this session's user.
    ///
    /// The status transition to `InProgress` is not issued here: it
    /// happens on the watch path when the message is observed, so
    /// there is exactly one code path deriving status from messages.
    pub async fn post_message(&self, ticket_id: &str, text: &str) -> Result<Message, ClientError> {
        if !self.lock().tickets.contains_key(ticket_id) {
            return Err(ClientError::UnknownTicket(ticket_id.to_owned()));
        }
        let now = Utc::now();
        let mut message = chat::new_message(ticket_id, &self.ctx.uid, text, now)?;
        message.id = self.next_key(now);
        self.ctx
            .store
            .write(&path::message(ticket_id, &message.id), to_patch(&message)?)
            .await?;
        Ok(message)
    }

    /// Administrative close: write `status=resolved` and append the
    /// system closure message. The two writes are not transactional;
    /// a failed message append is reported after the status write
    /// already took effect.
    pub async fn close_ticket(&self, ticket_id: &str) -> Result<(), ClientError> {
        if !self.ctx.role.is_admin() {
            return Err(ClientError::NotAdmin);
        }
        let ticket = self
            .ticket(ticket_id)
            .ok_or_else(|| ClientError::UnknownTicket(ticket_id.to_owned()))?;

        let now = Utc::now();
        let outcome = ticket::close(&ticket, &self.ctx.uid, now)?;

        self.ctx
            .store
            .write(&path::ticket(ticket_id), to_patch(&outcome.patch)?)
            .await?;

        let mut message = outcome.system_message;
        message.id = self.next_key(now);
        if let Err(e) = self
            .ctx
            .store
            .write(&path::message(ticket_id, &message.id), to_patch(&message)?)
            .await
        {
            tracing::warn!("ticket {ticket_id} resolved but closure message append failed: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    /// Administrative activation toggle on a user record.
    pub async fn set_user_active(&self, uid: &str, active: bool) -> Result<(), ClientError> {
        if !self.ctx.role.is_admin() {
            return Err(ClientError::NotAdmin);
        }
        self.ctx
            .store
            .write(&path::user(uid), json!({ "active": active }))
            .await?;
        Ok(())
    }

    /// Explicit logout: presence goes offline directly, all watches
    /// are torn down.
    pub async fn logout(mut self) {
        if let Some(presence) = self.presence.take() {
            presence.logout().await;
        }
        self.ctx.mux.shutdown().await;
        for task in self.ctx.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    // ── Internals ──────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, Projection> {
        self.ctx.projection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_key(&self, now: DateTime<Utc>) -> String {
        self.ctx
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next(now)
    }
}

/// Overlay the session-record aggregate onto a user record.
fn with_live_presence(projection: &Projection, mut user: UserPresence) -> UserPresence {
    let aggregate = match projection.sessions.get(&user.uid) {
        Some(sessions) => aggregate_presence(sessions),
        None => PresenceAggregate {
            online: false,
            last_seen: None,
        },
    };
    user.online = aggregate.online;
    user.last_seen = user.last_seen.max(aggregate.last_seen);
    user
}

fn to_patch<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ClientError> {
    serde_json::to_value(value)
        .map_err(|e| ClientError::Domain(SyncdeskError::InvalidRecord(e.to_string())))
}

fn spawn_task<S: StoreClient>(
    ctx: &Arc<Ctx<S>>,
    fut: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let handle = tokio::spawn(fut);
    ctx.tasks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(handle);
}

// ─── Watch Tasks ──────────────────────────────────────────────────

/// Decode a raw snapshot into typed records, skipping malformed ones.
fn decode<T: DeserializeOwned>(kind: RecordKind, snapshot: &Snapshot) -> BTreeMap<String, T> {
    let mut out = BTreeMap::new();
    for (key, value) in snapshot {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(item) => {
                out.insert(key.clone(), item);
            }
            Err(e) => tracing::warn!("skipping malformed {kind} record {key}: {e}"),
        }
    }
    out
}

async fn run_users_watch<S: StoreClient>(ctx: Arc<Ctx<S>>, mut stream: WatchStream) {
    let mut detector = ChangeDetector::<UserPresence>::new();
    while let Some(state) = stream.next().await {
        let snapshot = match state {
            WatchState::Snapshot(snapshot) => snapshot,
            WatchState::Failed(e) => {
                tracing::error!("users watch terminated: {e}");
                return;
            }
            WatchState::Pending => continue,
        };
        let typed = decode::<UserPresence>(RecordKind::User, &snapshot);

        // Lazily track session presence for every known user so
        // aggregated online state is queryable for all of them.
        for uid in typed.keys() {
            watch_presence_sessions(&ctx, uid).await;
        }

        let events = detector.diff(&typed);
        let now = Utc::now();
        {
            let mut projection = ctx.projection.lock().unwrap_or_else(|e| e.into_inner());
            projection.users = typed;
            for event in &events {
                projection.record_change(RecordKind::User, &event.item().uid, now);
            }
        }
        for event in events {
            let event = match event {
                Change::Created(user) => RecordEvent::UserCreated(user),
                Change::Updated(user) => RecordEvent::UserUpdated(user),
            };
            if ctx.events_tx.send(event).await.is_err() {
                return; // consumer gone
            }
        }
    }
}

async fn run_tickets_watch<S: StoreClient>(ctx: Arc<Ctx<S>>, mut stream: WatchStream) {
    let mut detector = ChangeDetector::<Ticket>::new();
    while let Some(state) = stream.next().await {
        let snapshot = match state {
            WatchState::Snapshot(snapshot) => snapshot,
            WatchState::Failed(e) => {
                tracing::error!("tickets watch terminated: {e}");
                return;
            }
            WatchState::Pending => continue,
        };
        let typed = decode::<Ticket>(RecordKind::Ticket, &snapshot);

        // Open a message watch for every ticket we see.
        for ticket_id in typed.keys() {
            watch_ticket_messages(&ctx, ticket_id).await;
        }

        let events = detector.diff(&typed);
        let now = Utc::now();
        {
            let mut projection = ctx.projection.lock().unwrap_or_else(|e| e.into_inner());
            projection.tickets = typed;
            for event in &events {
                projection.record_change(RecordKind::Ticket, &event.item().id, now);
            }
        }
        for event in events {
            let event = match event {
                Change::Created(ticket) => RecordEvent::TicketCreated(ticket),
                Change::Updated(ticket) => RecordEvent::TicketUpdated(ticket),
            };
            if ctx.events_tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

async fn watch_ticket_messages<S: StoreClient>(ctx: &Arc<Ctx<S>>, ticket_id: &str) {
    {
        let mut watched = ctx
            .watched_messages
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !watched.insert(ticket_id.to_owned()) {
            return;
        }
    }
    match ctx.mux.watch(&path::messages(ticket_id)).await {
        Ok(stream) => {
            spawn_task(
                ctx,
                run_messages_watch(Arc::clone(ctx), ticket_id.to_owned(), stream),
            );
        }
        Err(e) => tracing::error!("cannot watch messages for {ticket_id}: {e}"),
    }
}

async fn run_messages_watch<S: StoreClient>(
    ctx: Arc<Ctx<S>>,
    ticket_id: String,
    mut stream: WatchStream,
) {
    let mut detector = ChangeDetector::<Message>::new();
    while let Some(state) = stream.next().await {
        let snapshot = match state {
            WatchState::Snapshot(snapshot) => snapshot,
            WatchState::Failed(e) => {
                tracing::error!("message watch for {ticket_id} terminated: {e}");
                return;
            }
            WatchState::Pending => continue,
        };
        let mut typed = decode::<Message>(RecordKind::Message, &snapshot);
        // The map key is the store-assigned push key; trust it over a
        // missing id field.
        for (key, message) in typed.iter_mut() {
            if message.id.is_empty() {
                message.id = key.clone();
            }
        }

        let events = detector.diff(&typed);
        let now = Utc::now();
        {
            let mut projection = ctx.projection.lock().unwrap_or_else(|e| e.into_inner());
            projection
                .messages
                .insert(ticket_id.clone(), chat::ordered(&typed));
            for event in &events {
                projection.record_change(RecordKind::Message, &event.item().id, now);
            }
        }

        // Message-driven status: a freshly observed message from this
        // session's own user moves an Open ticket to InProgress. Only
        // the author's session issues the write so concurrent
        // observers do not race on it.
        for event in &events {
            if let Change::Created(message) = event
                && message.author == ctx.uid
            {
                maybe_start_progress(&ctx, &ticket_id, message).await;
            }
        }

        for event in events {
            let event = match event {
                Change::Created(message) => RecordEvent::MessageCreated(message),
                Change::Updated(message) => RecordEvent::MessageUpdated(message),
            };
            if ctx.events_tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Issue the `Open → InProgress` write when the observed message
/// calls for it. Status is read from the stored field, never derived
/// from message text.
async fn maybe_start_progress<S: StoreClient>(ctx: &Arc<Ctx<S>>, ticket_id: &str, message: &Message) {
    let next = {
        let projection = ctx.projection.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ticket) = projection.tickets.get(ticket_id) else {
            return;
        };
        let next = ticket::status_after_message(ticket.status, message);
        if next == ticket.status {
            return;
        }
        next
    };

    let patch = json!({ "status": next, "updated_at": Utc::now() });
    if let Err(e) = ctx.store.write(&path::ticket(ticket_id), patch).await {
        tracing::warn!("status transition for {ticket_id} failed: {e}");
    }
}

async fn watch_presence_sessions<S: StoreClient>(ctx: &Arc<Ctx<S>>, uid: &str) {
    {
        let mut watched = ctx
            .watched_presence
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !watched.insert(uid.to_owned()) {
            return;
        }
    }
    match ctx.mux.watch(&path::presence_sessions(uid)).await {
        Ok(stream) => {
            spawn_task(
                ctx,
                run_presence_watch(Arc::clone(ctx), uid.to_owned(), stream),
            );
        }
        Err(e) => tracing::error!("cannot watch presence for {uid}: {e}"),
    }
}

async fn run_presence_watch<S: StoreClient>(ctx: Arc<Ctx<S>>, uid: String, mut stream: WatchStream) {
    let mut detector = ChangeDetector::<SessionPresence>::new();
    while let Some(state) = stream.next().await {
        let snapshot = match state {
            WatchState::Snapshot(snapshot) => snapshot,
            WatchState::Failed(e) => {
                tracing::error!("presence watch for {uid} terminated: {e}");
                return;
            }
            WatchState::Pending => continue,
        };
        let typed = decode::<SessionPresence>(RecordKind::User, &snapshot);
        let events = detector.diff(&typed);

        let now = Utc::now();
        let mut projection = ctx.projection.lock().unwrap_or_else(|e| e.into_inner());
        projection.sessions.insert(uid.clone(), typed);
        if !events.is_empty() {
            // Presence flips surface through the change log; record
            // events for users come from the users watch.
            projection.record_change(RecordKind::User, &uid, now);
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
