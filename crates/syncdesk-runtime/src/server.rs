//! Unix-socket server exposing one console session to local clients.
//!
//! Protocol: newline-delimited JSON-RPC over Unix stream sockets.
//!
//! Supported methods:
//!   - `list_users`     -- current user records
//!   - `list_tickets`   -- current ticket records
//!   - `list_messages`  -- ordered messages for one ticket
//!   - `changes_since`  -- incremental change log entries
//!   - `post_message`   -- append a chat message
//!   - `close_ticket`   -- administrative close
//!   - `subscribe`      -- push record events to this client

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use syncdesk_client::{ConsoleSession, RecordEvent};
use syncdesk_store::StoreClient;

// ─── JSON-RPC Types ───────────────────────────────────────────────

fn default_jsonrpc() -> String {
    "2.0".into()
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// Server-initiated push (no `id`).
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

fn ok_response(id: Option<u64>, result: serde_json::Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        id,
        result: Some(result),
        error: None,
    }
}

fn err_response(id: Option<u64>, code: i32, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        id,
        result: None,
        error: Some(JsonRpcError { code, message }),
    }
}

// ─── Params ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TicketParams {
    ticket_id: String,
}

#[derive(Debug, Deserialize)]
struct PostParams {
    ticket_id: String,
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChangesParams {
    #[serde(default)]
    since: u64,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    /// Record kinds to push; empty means all.
    #[serde(default)]
    kinds: Vec<String>,
}

// ─── Event Fan-Out ────────────────────────────────────────────────

/// Map a session event to a JSON-RPC push if the client wants the
/// record kind.
fn event_to_push(event: &RecordEvent, kinds: &[String]) -> Option<JsonRpcNotification> {
    if !kinds.is_empty() && !kinds.iter().any(|k| k == event.kind().as_str()) {
        return None;
    }
    let action = if event.is_created() { "created" } else { "updated" };
    let record = match event {
        RecordEvent::UserCreated(u) | RecordEvent::UserUpdated(u) => serde_json::to_value(u),
        RecordEvent::TicketCreated(t) | RecordEvent::TicketUpdated(t) => serde_json::to_value(t),
        RecordEvent::MessageCreated(m) | RecordEvent::MessageUpdated(m) => serde_json::to_value(m),
    }
    .ok()?;
    Some(JsonRpcNotification {
        jsonrpc: "2.0".into(),
        method: "record_event".into(),
        params: serde_json::json!({
            "kind": event.kind(),
            "action": action,
            "record": record,
        }),
    })
}

/// Move session events into a broadcast channel so every connected
/// client gets its own cursor.
pub fn fan_out_events(
    mut events_rx: mpsc::Receiver<RecordEvent>,
    capacity: usize,
) -> broadcast::Sender<RecordEvent> {
    let (tx, _rx) = broadcast::channel(capacity);
    let fan_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            // Send fails only when no client is subscribed; drop.
            let _ = fan_tx.send(event);
        }
        tracing::debug!("session event stream ended");
    });
    tx
}

// ─── Server ───────────────────────────────────────────────────────

pub struct RuntimeServer<S: StoreClient> {
    socket_path: PathBuf,
    session: Arc<ConsoleSession<S>>,
    events_tx: broadcast::Sender<RecordEvent>,
    cancel: CancellationToken,
}

impl<S: StoreClient> RuntimeServer<S> {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        session: Arc<ConsoleSession<S>>,
        events_tx: broadcast::Sender<RecordEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            session,
            events_tx,
            cancel,
        }
    }

    /// Bind the listener and accept connections until cancelled.
    pub async fn run(self) -> std::io::Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        cleanup_socket(&self.socket_path).await;

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(path = %self.socket_path.display(), "runtime server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let session = Arc::clone(&self.session);
                            let events_rx = self.events_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, session, events_rx).await {
                                    tracing::debug!(error = %e, "client handler finished with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("runtime server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ─── Per-Client Handler ───────────────────────────────────────────

async fn handle_client<S: StoreClient>(
    stream: UnixStream,
    session: Arc<ConsoleSession<S>>,
    mut events_rx: broadcast::Receiver<RecordEvent>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    tracing::debug!("client connected");

    // None until the client subscribes; Some(kinds) after.
    let mut subscribed_kinds: Option<Vec<String>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(l)) => l,
                    Ok(None) => {
                        tracing::debug!("client disconnected (EOF)");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "read error, dropping client");
                        return Err(e);
                    }
                };

                let req: JsonRpcRequest = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        let resp = err_response(None, -32700, format!("parse error: {e}"));
                        write_json(&mut writer, &resp).await?;
                        continue;
                    }
                };

                tracing::debug!(method = %req.method, id = ?req.id, "request received");
                let resp = dispatch(&session, req, &mut subscribed_kinds).await;
                write_json(&mut writer, &resp).await?;
            }

            event = events_rx.recv() => {
                let event = match event {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "client lagged, dropped events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("event channel closed, dropping client");
                        return Ok(());
                    }
                };

                if let Some(kinds) = &subscribed_kinds {
                    if let Some(push) = event_to_push(&event, kinds) {
                        if let Err(e) = write_json(&mut writer, &push).await {
                            tracing::debug!(error = %e, "failed to push event, dropping client");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

async fn dispatch<S: StoreClient>(
    session: &ConsoleSession<S>,
    req: JsonRpcRequest,
    subscribed_kinds: &mut Option<Vec<String>>,
) -> JsonRpcResponse {
    let id = req.id;
    match req.method.as_str() {
        "list_users" => match serde_json::to_value(session.list_users()) {
            Ok(users) => ok_response(id, serde_json::json!({ "users": users })),
            Err(e) => err_response(id, -32603, e.to_string()),
        },

        "list_tickets" => match serde_json::to_value(session.list_tickets()) {
            Ok(tickets) => ok_response(id, serde_json::json!({ "tickets": tickets })),
            Err(e) => err_response(id, -32603, e.to_string()),
        },

        "list_messages" => match serde_json::from_value::<TicketParams>(req.params) {
            Ok(params) => {
                if session.ticket(&params.ticket_id).is_none() {
                    return err_response(
                        id,
                        -32602,
                        format!("unknown ticket: {}", params.ticket_id),
                    );
                }
                match serde_json::to_value(session.messages(&params.ticket_id)) {
                    Ok(messages) => ok_response(id, serde_json::json!({ "messages": messages })),
                    Err(e) => err_response(id, -32603, e.to_string()),
                }
            }
            Err(e) => err_response(id, -32602, format!("invalid params: {e}")),
        },

        "changes_since" => {
            let params: ChangesParams = serde_json::from_value(req.params).unwrap_or_default();
            let changes = session.changes_since(params.since);
            match serde_json::to_value(changes) {
                Ok(changes) => ok_response(
                    id,
                    serde_json::json!({ "version": session.version(), "changes": changes }),
                ),
                Err(e) => err_response(id, -32603, e.to_string()),
            }
        }

        "post_message" => match serde_json::from_value::<PostParams>(req.params) {
            Ok(params) => match session.post_message(&params.ticket_id, &params.text).await {
                Ok(message) => match serde_json::to_value(&message) {
                    Ok(message) => ok_response(id, serde_json::json!({ "message": message })),
                    Err(e) => err_response(id, -32603, e.to_string()),
                },
                Err(e) => err_response(id, -32000, e.to_string()),
            },
            Err(e) => err_response(id, -32602, format!("invalid params: {e}")),
        },

        "close_ticket" => match serde_json::from_value::<TicketParams>(req.params) {
            Ok(params) => match session.close_ticket(&params.ticket_id).await {
                Ok(()) => ok_response(id, serde_json::json!({ "closed": true })),
                Err(e) => err_response(id, -32000, e.to_string()),
            },
            Err(e) => err_response(id, -32602, format!("invalid params: {e}")),
        },

        "subscribe" => {
            let params: SubscribeParams = serde_json::from_value(req.params)
                .unwrap_or(SubscribeParams { kinds: Vec::new() });
            tracing::debug!(kinds = ?params.kinds, "client subscribed");
            *subscribed_kinds = Some(params.kinds);
            ok_response(id, serde_json::json!({ "subscribed": true }))
        }

        _ => err_response(id, -32601, format!("method not found: {}", req.method)),
    }
}

// ─── Helpers ──────────────────────────────────────────────────────

/// Serialize a value as a single JSON line terminated by `\n` and flush.
async fn write_json<T: Serialize>(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    value: &T,
) -> std::io::Result<()> {
    let mut buf = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Remove a stale socket file if it exists.
async fn cleanup_socket(path: &Path) {
    if path.exists() {
        tracing::info!(path = %path.display(), "removing stale socket");
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(error = %e, path = %path.display(), "failed to remove stale socket");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
