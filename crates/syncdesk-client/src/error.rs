//! Client-layer error type: store failures plus domain rule
//! violations surfaced by session operations.

use syncdesk_core::types::SyncdeskError;
use syncdesk_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] SyncdeskError),

    #[error("unknown ticket: {0}")]
    UnknownTicket(String),

    #[error("administrator role required")]
    NotAdmin,
}
