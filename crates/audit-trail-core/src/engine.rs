use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, ParentLink};
use crate::error::AuditError;
use crate::host::VersionHost;
use crate::model::{
    AuditFields, DeletedAt, Record, RowId, Timestamp, DELETED_AT_COLUMN, LAST_CHANGED_USER_COLUMN,
};
use crate::value::{Filter, Patch};

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Plain record: the row was mutated in place.
    InPlace { id: RowId, rows_affected: usize },
    /// Auditable record: `closed` was superseded by the freshly inserted `current`.
    RolledOver { closed: RowId, current: RowId, closed_at: Timestamp },
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Plain record: the row is gone.
    Removed { id: RowId, rows_affected: usize },
    /// Auditable record: the current version was closed with no successor.
    Closed { id: RowId, closed_at: Timestamp },
}

/// Turns updates of auditable records into close-then-insert rollovers.
///
/// Every write runs inside its own savepoint, so the engine works both on a
/// bare connection and nested inside a caller's transaction.
#[derive(Debug)]
pub struct VersioningEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    savepoints: AtomicU64,
}

impl VersioningEngine {
    /// # Errors
    /// Returns [`AuditError::Validation`] when `config` is invalid.
    pub fn new(config: EngineConfig) -> Result<Self, AuditError> {
        config.validate()?;
        Ok(Self { config, clock: Arc::new(SystemClock::new()), savepoints: AtomicU64::new(0) })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Insert `record` as the root of a new chain (or as a plain row).
    ///
    /// # Errors
    /// Fails when the record already has an identifier, the actor is missing,
    /// the pre-create hook refuses, or the insert violates a constraint.
    pub fn create<H>(&self, host: &mut H, record: &mut dyn Record) -> Result<RowId, AuditError>
    where
        H: VersionHost + ?Sized,
    {
        let table = record.table().to_string();
        if let Some(id) = record.id() {
            return Err(AuditError::Validation(format!(
                "{table} row {id} is already persisted; update it instead"
            )));
        }

        let snapshot = record.audit_fields().cloned();
        if let Some(fields) = record.audit_fields_mut() {
            self.require_actor(&table, fields)?;
            fields.parent_version_id = None;
            fields.deleted_at = DeletedAt::Current;
            fields.created_at = None;
        }

        let result = self.scoped(host, "create", |host| self.insert_version(host, record));
        match result {
            Ok(id) => {
                info!(table = %table, id = %id, "created chain root");
                Ok(id)
            }
            Err(err) => {
                restore(record, snapshot);
                Err(err)
            }
        }
    }

    /// Apply `changes` to `record` and persist them.
    ///
    /// Plain records get one in-place update. Auditable records close the
    /// current version and insert its successor atomically; on failure the
    /// store is untouched and the record's audit fields are restored, while
    /// the assigned domain changes stay on the in-memory record.
    ///
    /// # Errors
    /// [`AuditError::GuardViolation`] when the version is no longer current,
    /// [`AuditError::ConstraintViolation`] from the store,
    /// [`AuditError::HookFailure`] from the record's hooks, and
    /// [`AuditError::Validation`] for bad changes or a missing actor.
    pub fn apply_update<H>(
        &self,
        host: &mut H,
        record: &mut dyn Record,
        changes: &Patch,
    ) -> Result<UpdateOutcome, AuditError>
    where
        H: VersionHost + ?Sized,
    {
        let table = record.table().to_string();
        let id = record.id().ok_or_else(|| AuditError::NotPersisted { table: table.clone() })?;

        let Some(fields) = record.audit_fields() else {
            if changes.is_empty() {
                debug!(table = %table, id = %id, "empty change set on plain row");
                return Ok(UpdateOutcome::InPlace { id, rows_affected: 0 });
            }
            assign_changes(record, changes)?;
            let rows_affected = host.update_columns(&table, changes, &Filter::by_id(id))?;
            debug!(table = %table, id = %id, rows_affected, "updated plain row in place");
            return Ok(UpdateOutcome::InPlace { id, rows_affected });
        };

        if !fields.is_current() {
            return Err(AuditError::GuardViolation { table, id });
        }
        self.require_actor(&table, fields)?;
        if let Some(column) = changes.columns().find(|column| AuditFields::is_audit_column(column)) {
            return Err(AuditError::Validation(format!(
                "column {column} is maintained by the versioning engine"
            )));
        }

        let snapshot = Some(fields.clone());
        assign_changes(record, changes)?;

        let result = self.scoped(host, "update", |host| self.roll_over(host, record, id));
        if result.is_err() {
            restore(record, snapshot);
        }
        result
    }

    /// Explicit terminal delete: close the current version (auditable) or
    /// remove the row (plain).
    ///
    /// # Errors
    /// Same taxonomy as [`Self::apply_update`].
    pub fn delete<H>(&self, host: &mut H, record: &mut dyn Record) -> Result<DeleteOutcome, AuditError>
    where
        H: VersionHost + ?Sized,
    {
        let table = record.table().to_string();
        let id = record.id().ok_or_else(|| AuditError::NotPersisted { table: table.clone() })?;

        if record.audit_fields().is_none() {
            let rows_affected = self.scoped(host, "delete", |host| {
                record.before_delete()?;
                host.delete_rows(&table, &Filter::by_id(id))
            })?;
            debug!(table = %table, id = %id, rows_affected, "removed plain row");
            return Ok(DeleteOutcome::Removed { id, rows_affected });
        }

        let snapshot = record.audit_fields().cloned();
        let result = self.scoped(host, "delete", |host| {
            record.before_delete()?;
            self.close_version(host, record)
        });
        match result {
            Ok(closed_at) => {
                info!(table = %table, id = %id, closed_at = %closed_at, "closed version without successor");
                Ok(DeleteOutcome::Closed { id, closed_at })
            }
            Err(err) => {
                restore(record, snapshot);
                Err(err)
            }
        }
    }

    /// Stamp `deleted_at` and `last_changed_user` on the record's current
    /// version, guarded by `deleted_at IS NULL`.
    ///
    /// Opens no scope of its own; run it inside one.
    ///
    /// # Errors
    /// [`AuditError::GuardViolation`] when no current row matched.
    pub fn close_version<H>(&self, host: &mut H, record: &mut dyn Record) -> Result<Timestamp, AuditError>
    where
        H: VersionHost + ?Sized,
    {
        let table = record.table().to_string();
        let id = record.id().ok_or_else(|| AuditError::NotPersisted { table: table.clone() })?;
        let fields = record.audit_fields().ok_or_else(|| not_auditable(&table))?;
        if !fields.is_current() {
            return Err(AuditError::GuardViolation { table, id });
        }
        self.require_actor(&table, fields)?;

        let closed_at = self.clock.now();
        let set = Patch::new()
            .set(DELETED_AT_COLUMN, DeletedAt::Closed(closed_at).to_value())
            .set(LAST_CHANGED_USER_COLUMN, fields.last_changed_user.clone());
        let guard = Filter::by_id(id).is_null(DELETED_AT_COLUMN);

        let matched = host.update_columns(&table, &set, &guard)?;
        if matched == 0 {
            warn!(table = %table, id = %id, "version was closed concurrently");
            return Err(AuditError::GuardViolation { table, id });
        }

        if let Some(fields) = record.audit_fields_mut() {
            fields.deleted_at = DeletedAt::Closed(closed_at);
        }
        debug!(table = %table, id = %id, closed_at = %closed_at, "closed version");
        Ok(closed_at)
    }

    fn roll_over<H>(&self, host: &mut H, record: &mut dyn Record, closed: RowId) -> Result<UpdateOutcome, AuditError>
    where
        H: VersionHost + ?Sized,
    {
        record.before_delete()?;
        let closed_at = self.close_version(host, record)?;

        let table = record.table().to_string();
        let fields = record.audit_fields_mut().ok_or_else(|| not_auditable(&table))?;
        let parent = match self.config.parent_link {
            ParentLink::Predecessor => closed,
            ParentLink::Root => fields.parent_version_id.unwrap_or(closed),
        };
        fields.id = None;
        fields.parent_version_id = Some(parent);
        fields.deleted_at = DeletedAt::Current;

        let current = self.insert_version(host, record)?;
        info!(
            table = %table,
            closed = %closed,
            current = %current,
            parent = %parent,
            "rolled over version"
        );
        Ok(UpdateOutcome::RolledOver { closed, current, closed_at })
    }

    fn insert_version<H>(&self, host: &mut H, record: &mut dyn Record) -> Result<RowId, AuditError>
    where
        H: VersionHost + ?Sized,
    {
        record.before_create()?;

        let now = self.clock.now();
        if let Some(fields) = record.audit_fields_mut() {
            fields.created_at.get_or_insert(now);
            fields.updated_at = Some(now);
        }

        let mut values = record.values();
        if let Some(fields) = record.audit_fields() {
            values.extend(fields.to_patch());
        }
        let id = host.insert_row(record.table(), &values)?;
        record.set_id(Some(id));
        Ok(id)
    }

    fn require_actor(&self, table: &str, fields: &AuditFields) -> Result<(), AuditError> {
        if self.config.require_actor && fields.last_changed_user.trim().is_empty() {
            return Err(AuditError::Validation(format!(
                "last_changed_user MUST be provided for every {table} write"
            )));
        }
        Ok(())
    }

    fn scoped<H, T, F>(&self, host: &mut H, operation: &'static str, body: F) -> Result<T, AuditError>
    where
        H: VersionHost + ?Sized,
        F: FnOnce(&mut H) -> Result<T, AuditError>,
    {
        let name = format!(
            "{}_{}",
            self.config.savepoint_prefix,
            self.savepoints.fetch_add(1, Ordering::Relaxed)
        );
        host.savepoint(&name)?;

        let result = body(&mut *host).and_then(|value| host.release(&name).map(|()| value));
        if let Err(err) = &result {
            debug!(operation, savepoint = %name, error = %err, "rolling back scope");
            if let Err(rollback_err) = host.rollback_to(&name) {
                warn!(operation, savepoint = %name, error = %rollback_err, "scope rollback failed");
            } else if let Err(release_err) = host.release(&name) {
                warn!(operation, savepoint = %name, error = %release_err, "scope release failed");
            }
        }
        result
    }
}

fn assign_changes(record: &mut dyn Record, changes: &Patch) -> Result<(), AuditError> {
    for (column, value) in changes.iter() {
        record.assign(column, value)?;
    }
    Ok(())
}

fn restore(record: &mut dyn Record, snapshot: Option<AuditFields>) {
    if let (Some(fields), Some(snapshot)) = (record.audit_fields_mut(), snapshot) {
        *fields = snapshot;
    }
}

fn not_auditable(table: &str) -> AuditError {
    AuditError::Validation(format!("{table} records do not carry versioning fields"))
}
