use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

use super::conflict::Conflict;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    /// The row exists but its status does not allow `action`.
    #[error("cannot {action} {id}: status is {status}")]
    InvalidState {
        id: Ulid,
        status: &'static str,
        action: &'static str,
    },
    #[error("window for {id} closed at {expired_at}")]
    WindowExpired { id: Ulid, expired_at: Ms },
    #[error("resource conflict: {0}")]
    ResourceConflict(Conflict),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("duplicate plate number: {0}")]
    DuplicatePlate(String),
    #[error("booking {0} is already paid")]
    AlreadyPaid(Ulid),
    #[error("stale version for {id}: expected {expected}, found {actual}")]
    StaleVersion { id: Ulid, expected: u32, actual: u32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::WindowExpired { .. } => "window_expired",
            EngineError::ResourceConflict(_) => "resource_conflict",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::DuplicatePlate(_) => "duplicate_plate",
            EngineError::AlreadyPaid(_) => "already_paid",
            EngineError::StaleVersion { .. } => "stale_version",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
