use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use syncdesk_client::{ConsoleSession, SessionConfig};
use syncdesk_core::types::Role;
use syncdesk_runtime::client::ConsoleClient;
use syncdesk_runtime::server::{RuntimeServer, fan_out_events};
use syncdesk_runtime::table::{format_messages, format_tickets, format_users};
use syncdesk_store::{MemoryStore, StoreClient, path};

/// Default directory for runtime sockets.
const DEFAULT_SOCKET_DIR: &str = "/tmp/syncdesk";
const DEFAULT_SOCKET: &str = "/tmp/syncdesk/syncdeskd.sock";

#[derive(Parser)]
#[command(name = "syncdesk", about = "Realtime ticketing console runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime server (default when no subcommand given)
    Serve {
        /// Socket path for client connections
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: String,

        /// User id the hosted session authenticates as
        #[arg(long, default_value = "admin")]
        uid: String,

        /// Role of the hosted session
        #[arg(long, default_value = "admin")]
        role: String,

        /// Seed the store with demo users and tickets
        #[arg(long)]
        seed: bool,
    },
    /// Ticket overview (one-shot)
    Tickets {
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
    /// User overview (one-shot)
    Users {
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
    /// Chat transcript for one ticket
    Messages {
        /// Ticket id
        ticket_id: String,
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
    /// Append a chat message to a ticket
    Post {
        /// Ticket id
        ticket_id: String,
        /// Message text
        text: String,
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
    /// Close a ticket (requires an admin session on the server)
    Close {
        /// Ticket id
        ticket_id: String,
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
    /// Raw JSON-RPC call, printing the result verbatim
    Json {
        /// Method name, e.g. list_tickets
        method: String,
        /// Params as a JSON object
        #[arg(default_value = "{}")]
        params: String,
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
}

/// Filter directives for the subscriber: `SYNCDESK_LOG` wins over
/// `RUST_LOG`, defaulting to info.
fn log_directives(syncdesk_log: Option<String>, rust_log: Option<String>) -> String {
    syncdesk_log
        .or(rust_log)
        .unwrap_or_else(|| "info".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let directives = log_directives(
        std::env::var("SYNCDESK_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(directives))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_serve(DEFAULT_SOCKET.to_string(), "admin".into(), "admin".into(), false).await,
        Some(Commands::Serve {
            socket,
            uid,
            role,
            seed,
        }) => run_serve(socket, uid, role, seed).await,
        Some(Commands::Tickets { socket }) => {
            let mut client = connect(&socket).await?;
            let tickets = client.list_tickets().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            print!("{}", format_tickets(&tickets));
            Ok(())
        }
        Some(Commands::Users { socket }) => {
            let mut client = connect(&socket).await?;
            let users = client.list_users().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            print!("{}", format_users(&users));
            Ok(())
        }
        Some(Commands::Messages { ticket_id, socket }) => {
            let mut client = connect(&socket).await?;
            let messages = client
                .list_messages(&ticket_id)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            print!("{}", format_messages(&messages));
            Ok(())
        }
        Some(Commands::Post {
            ticket_id,
            text,
            socket,
        }) => {
            let mut client = connect(&socket).await?;
            let message = client
                .post_message(&ticket_id, &text)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("posted {}", message.id);
            Ok(())
        }
        Some(Commands::Close { ticket_id, socket }) => {
            let mut client = connect(&socket).await?;
            client
                .close_ticket(&ticket_id)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("closed {ticket_id}");
            Ok(())
        }
        Some(Commands::Json {
            method,
            params,
            socket,
        }) => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("params must be a JSON object")?;
            let mut client = connect(&socket).await?;
            let result = client
                .call(&method, params)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

async fn connect(socket: &str) -> anyhow::Result<ConsoleClient> {
    ConsoleClient::connect(socket).await.map_err(|e| {
        eprintln!("Failed to connect to runtime at {socket}: {e}");
        eprintln!("Is the server running? Start it with: syncdesk serve");
        anyhow::anyhow!(e)
    })
}

async fn run_serve(socket: String, uid: String, role: String, seed: bool) -> anyhow::Result<()> {
    tracing::info!(socket = %socket, uid = %uid, role = %role, seed, "starting syncdesk runtime");

    std::fs::create_dir_all(DEFAULT_SOCKET_DIR)?;

    let store = Arc::new(MemoryStore::new());
    store.connect();

    if seed {
        seed_demo_data(&store).await?;
    }

    let role = match role.as_str() {
        "admin" => Role::Admin,
        "requester" => Role::Requester,
        other => anyhow::bail!("unknown role: {other}"),
    };
    let mut config = SessionConfig::new(&uid, &format!("cli-{}", std::process::id()));
    config.display_name = uid.clone();
    config.role = role;

    let (session, events_rx) = ConsoleSession::start(Arc::clone(&store), config)
        .await
        .context("session start failed")?;
    let session = Arc::new(session);

    let events_tx = fan_out_events(events_rx, 64);
    let cancel = CancellationToken::new();
    let server = RuntimeServer::new(
        PathBuf::from(&socket),
        Arc::clone(&session),
        events_tx,
        cancel.clone(),
    );

    tokio::select! {
        result = server.run() => {
            match result {
                Ok(()) => tracing::warn!("server exited unexpectedly"),
                Err(e) => tracing::warn!("server error: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            cancel.cancel();
        }
    }

    if let Ok(session) = Arc::try_unwrap(session) {
        session.logout().await;
    }

    let socket_path = PathBuf::from(&socket);
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            tracing::warn!(path = %socket_path.display(), "failed to remove socket file: {e}");
        }
    }

    tracing::info!("syncdesk runtime stopped");
    Ok(())
}

/// Write a small demo dataset so the one-shot commands have something
/// to show on a fresh store.
async fn seed_demo_data(store: &MemoryStore) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    store
        .write(
            &path::user("u-ada"),
            json!({
                "uid": "u-ada",
                "display_name": "Ada",
                "email": "ada@example.com",
                "role": "requester",
                "online": false,
                "active": true,
            }),
        )
        .await?;
    store
        .write(
            &path::ticket("t-demo"),
            json!({
                "id": "t-demo",
                "owner_uid": "u-ada",
                "title": "projector shows only blue",
                "category": "hardware",
                "priority": "normal",
                "status": "open",
                "created_at": now,
                "updated_at": now,
            }),
        )
        .await?;
    store
        .write(
            &path::message("t-demo", "0000000000000-0000"),
            json!({
                "id": "0000000000000-0000",
                "ticket_id": "t-demo",
                "author": "u-ada",
                "text": "happens with every laptop we tried",
                "timestamp": now,
            }),
        )
        .await?;
    tracing::info!("demo data seeded");
    Ok(())
}
