//! Unified error types surfaced by the engine API.
//!
//! Only submission failures and irrecoverable receipt failures reach callers
//! as errors; read and notification problems degrade into staleness.

use chain_core::{ActionKind, TransactionId};
use thiserror::Error;
use tokio::sync::oneshot;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("wallet not connected")]
    NoAccount,

    #[error("invalid amount for {kind}: {reason}")]
    InvalidAmount {
        kind: ActionKind,
        reason: &'static str,
    },

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("{kind} reverted: {reason}")]
    Reverted { kind: ActionKind, reason: String },

    #[error("receipt for {0} was not observed")]
    ReceiptTimeout(TransactionId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gate worker command channel closed")]
    CommandChannelClosed,

    #[error("gate worker reply channel closed")]
    ReplyChannelClosed(#[source] oneshot::error::RecvError),

    #[error("gate worker join failed")]
    WorkerJoin(#[source] tokio::task::JoinError),

    #[error("engine requires a {0} before building")]
    MissingCollaborator(&'static str),
}
