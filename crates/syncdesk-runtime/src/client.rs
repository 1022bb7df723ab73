//! Minimal client for the runtime JSON-RPC Unix socket API.

use std::path::Path;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use syncdesk_core::types::{Message, Ticket, UserPresence};

pub struct ConsoleClient {
    stream: BufReader<UnixStream>,
    next_id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[allow(dead_code)]
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[allow(dead_code)]
    code: i32,
    message: String,
}

/// Parse a raw JSON-RPC response line into its `result` value.
///
/// Extracted from `ConsoleClient::call` so it can be unit-tested
/// without a live socket connection.
fn parse_response(line: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let resp: JsonRpcResponse = serde_json::from_str(line)?;
    if let Some(err) = resp.error {
        return Err(format!("server error: {}", err.message).into());
    }
    resp.result.ok_or_else(|| "missing result in response".into())
}

impl ConsoleClient {
    /// Connect to the runtime at the given Unix socket path.
    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            stream: BufReader::new(stream),
            next_id: 1,
        })
    }

    /// Issue one request and read its response line.
    pub async fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        let id = self.next_id;
        self.next_id += 1;
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let writer = self.stream.get_mut();
        writer.write_all(request.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut line = String::new();
        self.stream.read_line(&mut line).await?;
        parse_response(&line)
    }

    pub async fn list_tickets(&mut self) -> Result<Vec<Ticket>, Box<dyn std::error::Error>> {
        let result = self.call("list_tickets", serde_json::json!({})).await?;
        Ok(serde_json::from_value(result["tickets"].clone())?)
    }

    pub async fn list_users(&mut self) -> Result<Vec<UserPresence>, Box<dyn std::error::Error>> {
        let result = self.call("list_users", serde_json::json!({})).await?;
        Ok(serde_json::from_value(result["users"].clone())?)
    }

    pub async fn list_messages(
        &mut self,
        ticket_id: &str,
    ) -> Result<Vec<Message>, Box<dyn std::error::Error>> {
        let result = self
            .call("list_messages", serde_json::json!({ "ticket_id": ticket_id }))
            .await?;
        Ok(serde_json::from_value(result["messages"].clone())?)
    }

    pub async fn post_message(
        &mut self,
        ticket_id: &str,
        text: &str,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let result = self
            .call(
                "post_message",
                serde_json::json!({ "ticket_id": ticket_id, "text": text }),
            )
            .await?;
        Ok(serde_json::from_value(result["message"].clone())?)
    }

    pub async fn close_ticket(&mut self, ticket_id: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.call("close_ticket", serde_json::json!({ "ticket_id": ticket_id }))
            .await?;
        Ok(())
    }
}
