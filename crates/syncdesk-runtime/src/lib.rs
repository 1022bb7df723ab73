//! syncdesk-runtime: the local runtime binary's building blocks.
//!
//! Hosts one console session over an in-process store and exposes it
//! to local clients as newline-delimited JSON-RPC on a Unix socket,
//! plus the thin client and table rendering used by the one-shot CLI
//! commands.

pub mod client;
pub mod server;
pub mod table;

pub use client::ConsoleClient;
pub use server::{RuntimeServer, fan_out_events};
