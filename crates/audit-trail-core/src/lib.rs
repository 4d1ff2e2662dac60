//! Versioned-record engine: updates close the current row and insert a
//! linked successor instead of overwriting history.

mod chain;
mod clock;
mod config;
mod engine;
mod error;
mod host;
mod model;
mod pipeline;
mod value;

#[cfg(test)]
mod testing;

pub use chain::{verify_chain, ChainProblem, ChainReport, VersionRow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{is_plain_identifier, EngineConfig, ParentLink};
pub use engine::{DeleteOutcome, UpdateOutcome, VersioningEngine};
pub use error::{AuditError, ErrorKind, HookError};
pub use host::VersionHost;
pub use model::{
    is_auditable, AuditFields, DeletedAt, Record, RowId, Timestamp, AUDIT_COLUMNS,
    CREATED_AT_COLUMN, DELETED_AT_COLUMN, ID_COLUMN, LAST_CHANGED_USER_COLUMN,
    PARENT_VERSION_ID_COLUMN, UPDATED_AT_COLUMN,
};
pub use pipeline::{PlainWrites, WriteCallbacks, WritePipeline};
pub use value::{Condition, Filter, Patch, Value};
