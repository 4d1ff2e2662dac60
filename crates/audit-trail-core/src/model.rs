use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{AuditError, HookError};
use crate::value::{Patch, Value};

pub const ID_COLUMN: &str = "id";
pub const PARENT_VERSION_ID_COLUMN: &str = "parent_version_id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const DELETED_AT_COLUMN: &str = "deleted_at";
pub const LAST_CHANGED_USER_COLUMN: &str = "last_changed_user";

/// Columns owned by the versioning engine; domain changes may not touch them.
pub const AUDIT_COLUMNS: [&str; 6] = [
    ID_COLUMN,
    PARENT_VERSION_ID_COLUMN,
    CREATED_AT_COLUMN,
    UPDATED_AT_COLUMN,
    DELETED_AT_COLUMN,
    LAST_CHANGED_USER_COLUMN,
];

/// Surrogate identifier of one physical row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl Display for RowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Truncate a wall-clock reading to millisecond precision.
    #[must_use]
    pub fn from_datetime(value: OffsetDateTime) -> Self {
        let millis = value.unix_timestamp_nanos() / 1_000_000;
        Self(i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX }))
    }

    /// # Errors
    /// Returns [`AuditError::Validation`] when the value is outside the supported date range.
    pub fn to_datetime(self) -> Result<OffsetDateTime, AuditError> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000)
            .map_err(|err| AuditError::Validation(format!("timestamp {} out of range: {err}", self.0)))
    }

    /// # Errors
    /// Returns [`AuditError::Validation`] when the value cannot be represented as RFC 3339.
    pub fn to_rfc3339(self) -> Result<String, AuditError> {
        self.to_datetime()?
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|err| AuditError::Validation(format!("failed to format timestamp: {err}")))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Soft-delete marker of a version.
///
/// Stored as `NULL` while current, so every millisecond value (zero included)
/// is a legitimate closing time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "state", content = "at", rename_all = "snake_case")]
pub enum DeletedAt {
    #[default]
    Current,
    Closed(Timestamp),
}

impl DeletedAt {
    #[must_use]
    pub fn is_current(self) -> bool {
        matches!(self, Self::Current)
    }

    #[must_use]
    pub fn closed_at(self) -> Option<Timestamp> {
        match self {
            Self::Current => None,
            Self::Closed(at) => Some(at),
        }
    }

    #[must_use]
    pub fn to_value(self) -> Value {
        Value::from(self.closed_at())
    }

    /// # Errors
    /// Returns [`AuditError::Validation`] for anything but `NULL` or an integer.
    pub fn from_value(value: &Value) -> Result<Self, AuditError> {
        match value {
            Value::Null => Ok(Self::Current),
            Value::Integer(millis) => Ok(Self::Closed(Timestamp::from_millis(*millis))),
            other => Err(AuditError::Validation(format!(
                "{DELETED_AT_COLUMN} must be NULL or an integer, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Versioning component embedded by every auditable record type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditFields {
    pub id: Option<RowId>,
    pub parent_version_id: Option<RowId>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub deleted_at: DeletedAt,
    pub last_changed_user: String,
}

impl AuditFields {
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self { last_changed_user: actor.into(), ..Self::default() }
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.deleted_at.is_current()
    }

    #[must_use]
    pub fn is_audit_column(column: &str) -> bool {
        AUDIT_COLUMNS.contains(&column)
    }

    /// Audit columns as written on insertion. `id` is left out while unassigned
    /// so the store allocates a fresh one.
    #[must_use]
    pub fn to_patch(&self) -> Patch {
        let mut patch = Patch::new();
        if let Some(id) = self.id {
            patch.push(ID_COLUMN, id);
        }
        patch.push(PARENT_VERSION_ID_COLUMN, self.parent_version_id);
        patch.push(CREATED_AT_COLUMN, self.created_at);
        patch.push(UPDATED_AT_COLUMN, self.updated_at);
        patch.push(DELETED_AT_COLUMN, self.deleted_at.to_value());
        patch.push(LAST_CHANGED_USER_COLUMN, self.last_changed_user.clone());
        patch
    }

    /// Load one stored audit column.
    ///
    /// Returns `Ok(false)` when `column` is not an audit column.
    ///
    /// # Errors
    /// Returns [`AuditError::Validation`] when the stored value has the wrong type.
    pub fn assign_column(&mut self, column: &str, value: &Value) -> Result<bool, AuditError> {
        match column {
            ID_COLUMN => self.id = optional_integer(column, value)?.map(RowId),
            PARENT_VERSION_ID_COLUMN => {
                self.parent_version_id = optional_integer(column, value)?.map(RowId);
            }
            CREATED_AT_COLUMN => {
                self.created_at = optional_integer(column, value)?.map(Timestamp::from_millis);
            }
            UPDATED_AT_COLUMN => {
                self.updated_at = optional_integer(column, value)?.map(Timestamp::from_millis);
            }
            DELETED_AT_COLUMN => self.deleted_at = DeletedAt::from_value(value)?,
            LAST_CHANGED_USER_COLUMN => {
                self.last_changed_user = match value {
                    Value::Text(actor) => actor.clone(),
                    Value::Null => String::new(),
                    other => return Err(type_mismatch(column, "text", other)),
                };
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn optional_integer(column: &str, value: &Value) -> Result<Option<i64>, AuditError> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(raw) => Ok(Some(*raw)),
        other => Err(type_mismatch(column, "integer", other)),
    }
}

pub(crate) fn type_mismatch(column: &str, expected: &str, got: &Value) -> AuditError {
    AuditError::Validation(format!("column {column} expects {expected}, got {}", got.type_name()))
}

/// A persistable row type as seen by the engine and the write pipeline.
///
/// Auditable types opt in by returning their [`AuditFields`] from
/// [`Record::audit_fields`]; everything else is written in place.
pub trait Record {
    fn table(&self) -> &str;

    /// Domain columns only. Audit columns are appended by the engine.
    fn values(&self) -> Patch;

    /// Apply one domain column value to the in-memory record.
    ///
    /// # Errors
    /// Returns [`AuditError::Validation`] for unknown columns or mistyped values.
    fn assign(&mut self, column: &str, value: &Value) -> Result<(), AuditError>;

    fn audit_fields(&self) -> Option<&AuditFields> {
        None
    }

    fn audit_fields_mut(&mut self) -> Option<&mut AuditFields> {
        None
    }

    /// Primary key; auditable records keep it in their [`AuditFields`].
    fn id(&self) -> Option<RowId> {
        self.audit_fields().and_then(|fields| fields.id)
    }

    fn set_id(&mut self, id: Option<RowId>) {
        if let Some(fields) = self.audit_fields_mut() {
            fields.id = id;
        }
    }

    /// Runs right before a row for this record is inserted.
    ///
    /// # Errors
    /// Any error aborts the surrounding write.
    fn before_create(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs right before this record's current version is closed or removed.
    ///
    /// # Errors
    /// Any error aborts the surrounding write.
    fn before_delete(&mut self) -> Result<(), HookError> {
        Ok(())
    }
}

/// Capability check used to fall back to plain writes.
#[must_use]
pub fn is_auditable(record: &dyn Record) -> bool {
    record.audit_fields().is_some()
}
