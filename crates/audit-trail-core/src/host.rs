use crate::error::AuditError;
use crate::model::RowId;
use crate::value::{Filter, Patch};

/// Storage services the engine needs from its host.
///
/// Savepoints nest: `rollback_to` undoes work since the named savepoint and
/// keeps it open; `release` closes it (and everything opened after it).
pub trait VersionHost {
    /// # Errors
    /// Fails when a transaction is already open or the store refuses it.
    fn begin(&mut self) -> Result<(), AuditError>;

    /// # Errors
    /// Fails when no transaction is open or the commit is refused.
    fn commit(&mut self) -> Result<(), AuditError>;

    /// # Errors
    /// Fails when no transaction is open.
    fn rollback(&mut self) -> Result<(), AuditError>;

    /// # Errors
    /// Fails on invalid names or when the store refuses the savepoint.
    fn savepoint(&mut self, name: &str) -> Result<(), AuditError>;

    /// # Errors
    /// Fails when `name` is not an open savepoint.
    fn rollback_to(&mut self, name: &str) -> Result<(), AuditError>;

    /// # Errors
    /// Fails when `name` is not an open savepoint or the enclosing commit fails.
    fn release(&mut self, name: &str) -> Result<(), AuditError>;

    /// Set `set` on every row of `table` matching `filter`; returns the matched row count.
    ///
    /// # Errors
    /// Constraint failures surface as [`AuditError::ConstraintViolation`].
    fn update_columns(&mut self, table: &str, set: &Patch, filter: &Filter)
        -> Result<usize, AuditError>;

    /// Insert a new row and return the identifier the store allocated.
    ///
    /// # Errors
    /// Constraint failures surface as [`AuditError::ConstraintViolation`].
    fn insert_row(&mut self, table: &str, values: &Patch) -> Result<RowId, AuditError>;

    /// # Errors
    /// Constraint failures surface as [`AuditError::ConstraintViolation`].
    fn delete_rows(&mut self, table: &str, filter: &Filter) -> Result<usize, AuditError>;

    /// Current stored column values of one row, regardless of soft-delete state.
    ///
    /// # Errors
    /// Fails when the store cannot be read.
    fn fetch_row(&self, table: &str, id: RowId) -> Result<Option<Patch>, AuditError>;
}
