//! syncdesk-client: the per-session realtime layer.
//!
//! Wires the store boundary into the console: the subscription
//! multiplexer (latest-value snapshot watches), the presence tracker
//! driver, and the session projection that turns snapshot diffs into
//! discrete Created/Updated events and queryable derived state.

pub mod error;
pub mod multiplexer;
pub mod presence;
pub mod session;

pub use error::ClientError;
pub use multiplexer::{Multiplexer, WatchState, WatchStream};
pub use presence::PresenceHandle;
pub use session::{ConsoleSession, RecordEvent, SessionConfig};
