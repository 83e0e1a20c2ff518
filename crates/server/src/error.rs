//! Error kinds surfaced at component boundaries.
//!
//! Store and transport failures are mapped into these kinds before they leave
//! the registry, approval table, broker or coordinator. Only `Corrupt` is fatal
//! (the daemon refuses to start on unreadable state).

use claude_mattermost_protocol::{ApprovalStatus, SessionStatus};
use claude_mattermost_relay::RelayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Session {id} is not active (status: {status})")]
    SessionNotActive { id: String, status: SessionStatus },

    #[error("Remote relay unavailable: {0}")]
    RelayUnavailable(#[from] RelayError),

    /// Lost the race to resolve an approval. Callers treat this as a no-op.
    #[error("Approval {request_id} was already resolved as {status}")]
    ConflictingResolution {
        request_id: String,
        status: ApprovalStatus,
    },

    #[error("No decision for approval {0} before its deadline")]
    Timeout(String),

    #[error("Session {id} already owns thread {existing}; refusing to replace it with {requested}")]
    DuplicateThread {
        id: String,
        existing: String,
        requested: String,
    },

    /// A resumed session's thread was deleted remotely.
    #[error("Thread {thread_id} of session {id} no longer exists; refusing to start a new one")]
    ThreadGone { id: String, thread_id: String },

    #[error("Corrupt record in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("Store error: {0}")]
    Store(rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn session_not_found(id: &str) -> Self {
        CoreError::NotFound {
            kind: "session",
            id: id.to_string(),
        }
    }

    pub fn approval_not_found(id: &str) -> Self {
        CoreError::NotFound {
            kind: "approval",
            id: id.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::ConflictingResolution { .. })
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(col, ty, source) => CoreError::Corrupt {
                table: "unknown",
                detail: format!("column {} ({}): {}", col, ty, source),
            },
            rusqlite::Error::InvalidColumnType(col, name, ty) => CoreError::Corrupt {
                table: "unknown",
                detail: format!("column {} '{}' has unexpected type {}", col, name, ty),
            },
            other => CoreError::Store(other),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Re-label a `Corrupt` error with the table it came from.
pub(crate) fn in_table(table: &'static str) -> impl Fn(CoreError) -> CoreError {
    move |err| match err {
        CoreError::Corrupt { detail, .. } => CoreError::Corrupt { table, detail },
        other => other,
    }
}
