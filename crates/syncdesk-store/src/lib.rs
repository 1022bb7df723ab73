//! syncdesk-store: the remote tree-store boundary.
//!
//! Defines the `StoreClient` trait the realtime layer is written
//! against (subscribe / write / register-on-disconnect / connection
//! state), typed path helpers, push-key generation, and an in-memory
//! store implementing the trait for tests and the demo runtime.

pub mod client;
pub mod error;
pub mod keys;
pub mod memory;
pub mod path;

pub use client::{Delivery, Snapshot, StoreClient};
pub use error::StoreError;
pub use memory::MemoryStore;
