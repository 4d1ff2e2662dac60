use std::sync::Arc;

use tracing::debug;

use crate::engine::{DeleteOutcome, UpdateOutcome, VersioningEngine};
use crate::error::AuditError;
use crate::host::VersionHost;
use crate::model::{self, AuditFields, Record, RowId, ID_COLUMN};
use crate::value::{Filter, Patch};

/// Write interception points a host pipeline dispatches to.
pub trait WriteCallbacks<H: VersionHost + ?Sized>: Send + Sync {
    fn is_auditable(&self, record: &dyn Record) -> bool {
        model::is_auditable(record)
    }

    /// # Errors
    /// Propagates hook, constraint and storage failures.
    fn on_create(&self, host: &mut H, record: &mut dyn Record) -> Result<RowId, AuditError>;

    /// # Errors
    /// Propagates guard, hook, constraint and storage failures.
    fn on_update(
        &self,
        host: &mut H,
        record: &mut dyn Record,
        changes: &Patch,
    ) -> Result<UpdateOutcome, AuditError>;

    /// # Errors
    /// Propagates guard, hook, constraint and storage failures.
    fn on_delete(&self, host: &mut H, record: &mut dyn Record) -> Result<DeleteOutcome, AuditError>;
}

/// Destructive writes with no versioning: in-place update, hard delete.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainWrites;

impl<H: VersionHost + ?Sized> WriteCallbacks<H> for PlainWrites {
    fn is_auditable(&self, _record: &dyn Record) -> bool {
        false
    }

    fn on_create(&self, host: &mut H, record: &mut dyn Record) -> Result<RowId, AuditError> {
        record.before_create()?;
        let mut values = record.values();
        if let Some(fields) = record.audit_fields() {
            values.extend(fields.to_patch());
        }
        let id = host.insert_row(record.table(), &values)?;
        record.set_id(Some(id));
        Ok(id)
    }

    fn on_update(
        &self,
        host: &mut H,
        record: &mut dyn Record,
        changes: &Patch,
    ) -> Result<UpdateOutcome, AuditError> {
        let table = record.table().to_string();
        let id = record.id().ok_or_else(|| AuditError::NotPersisted { table: table.clone() })?;
        if changes.is_empty() {
            return Ok(UpdateOutcome::InPlace { id, rows_affected: 0 });
        }
        for (column, value) in changes.iter() {
            record.assign(column, value)?;
        }
        let rows_affected = host.update_columns(&table, changes, &Filter::by_id(id))?;
        Ok(UpdateOutcome::InPlace { id, rows_affected })
    }

    fn on_delete(&self, host: &mut H, record: &mut dyn Record) -> Result<DeleteOutcome, AuditError> {
        let table = record.table().to_string();
        let id = record.id().ok_or_else(|| AuditError::NotPersisted { table: table.clone() })?;
        record.before_delete()?;
        let rows_affected = host.delete_rows(&table, &Filter::by_id(id))?;
        Ok(DeleteOutcome::Removed { id, rows_affected })
    }
}

impl<H: VersionHost + ?Sized> WriteCallbacks<H> for VersioningEngine {
    fn on_create(&self, host: &mut H, record: &mut dyn Record) -> Result<RowId, AuditError> {
        self.create(host, record)
    }

    fn on_update(
        &self,
        host: &mut H,
        record: &mut dyn Record,
        changes: &Patch,
    ) -> Result<UpdateOutcome, AuditError> {
        self.apply_update(host, record, changes)
    }

    fn on_delete(&self, host: &mut H, record: &mut dyn Record) -> Result<DeleteOutcome, AuditError> {
        self.delete(host, record)
    }
}

/// Host-side write path. The host owns its storage handle and receives the
/// callbacks it should run at construction time, instead of the engine
/// patching a global dispatch table.
pub struct WritePipeline<H: VersionHost> {
    host: H,
    callbacks: Arc<dyn WriteCallbacks<H>>,
}

impl<H: VersionHost> WritePipeline<H> {
    /// Pipeline with [`PlainWrites`] installed.
    pub fn new(host: H) -> Self {
        Self { host, callbacks: Arc::new(PlainWrites) }
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Arc<dyn WriteCallbacks<H>>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    pub fn is_auditable(&self, record: &dyn Record) -> bool {
        self.callbacks.is_auditable(record)
    }

    /// # Errors
    /// See [`WriteCallbacks::on_create`].
    pub fn create(&mut self, record: &mut dyn Record) -> Result<RowId, AuditError> {
        self.callbacks.on_create(&mut self.host, record)
    }

    /// # Errors
    /// See [`WriteCallbacks::on_update`].
    pub fn update(&mut self, record: &mut dyn Record, changes: &Patch) -> Result<UpdateOutcome, AuditError> {
        self.callbacks.on_update(&mut self.host, record, changes)
    }

    /// # Errors
    /// See [`WriteCallbacks::on_delete`].
    pub fn delete(&mut self, record: &mut dyn Record) -> Result<DeleteOutcome, AuditError> {
        self.callbacks.on_delete(&mut self.host, record)
    }

    /// Overwrite the in-memory record with its stored row, audit columns included.
    ///
    /// # Errors
    /// [`AuditError::NotFound`] when the row is gone, or a validation error when
    /// the stored columns do not fit the record.
    pub fn reload(&self, record: &mut dyn Record) -> Result<(), AuditError> {
        let table = record.table().to_string();
        let id = record.id().ok_or_else(|| AuditError::NotPersisted { table: table.clone() })?;
        let row = self.host.fetch_row(&table, id)?.ok_or(AuditError::NotFound { table: table.clone(), id })?;

        for (column, value) in row.iter() {
            if let Some(fields) = record.audit_fields_mut() {
                if fields.assign_column(column, value)? {
                    continue;
                }
            } else if column == ID_COLUMN || AuditFields::is_audit_column(column) {
                continue;
            }
            record.assign(column, value)?;
        }
        debug!(table = %table, id = %id, "reloaded record");
        Ok(())
    }
}

impl<H: VersionHost + std::fmt::Debug> std::fmt::Debug for WritePipeline<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePipeline").field("host", &self.host).finish_non_exhaustive()
    }
}
