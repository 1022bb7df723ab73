//! syncdesk-core: pure domain state machines for the realtime console.
//! Record types, snapshot change detection, ticket lifecycle, chat
//! ordering, and the per-session presence machine.
//!
//! No IO, no async. All time values are passed in as parameters.

pub mod chat;
pub mod notify;
pub mod presence;
pub mod ticket;
pub mod types;
