use serde::Serialize;

use crate::model::RowId;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuditError {
    /// The "still current" guard matched no row: another writer closed this
    /// version first, or the in-memory record is already closed.
    #[error("guard violation: {table} row {id} is no longer the current version")]
    GuardViolation { table: String, id: RowId },
    /// Uniqueness or foreign-key failure reported verbatim by the store.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// A record's own pre-create or pre-delete hook refused the write.
    #[error("hook failure: {0}")]
    HookFailure(String),
    #[error("{table} record has no identifier; it was never persisted")]
    NotPersisted { table: String },
    #[error("{table} row {id} not found")]
    NotFound { table: String, id: RowId },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GuardViolation,
    ConstraintViolation,
    HookFailure,
    NotPersisted,
    NotFound,
    Validation,
    Storage,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GuardViolation => "guard_violation",
            Self::ConstraintViolation => "constraint_violation",
            Self::HookFailure => "hook_failure",
            Self::NotPersisted => "not_persisted",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Storage => "storage",
        }
    }
}

impl AuditError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GuardViolation { .. } => ErrorKind::GuardViolation,
            Self::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Self::HookFailure(_) => ErrorKind::HookFailure,
            Self::NotPersisted { .. } => ErrorKind::NotPersisted,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Error returned by [`crate::Record`] lifecycle hooks.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<HookError> for AuditError {
    fn from(err: HookError) -> Self {
        Self::HookFailure(err.0)
    }
}
