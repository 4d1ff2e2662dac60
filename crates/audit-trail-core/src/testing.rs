//! In-memory host and fixture records for unit tests.

use std::collections::BTreeMap;

use crate::error::{AuditError, HookError};
use crate::host::VersionHost;
use crate::model::{type_mismatch, AuditFields, Record, RowId, DELETED_AT_COLUMN, ID_COLUMN};
use crate::value::{Filter, Patch, Value};

type Tables = BTreeMap<String, BTreeMap<i64, Patch>>;

const TRANSACTION_SAVEPOINT: &str = "__transaction";

#[derive(Debug, Default)]
pub(crate) struct MemoryHost {
    tables: Tables,
    next_ids: BTreeMap<String, i64>,
    unique: BTreeMap<String, Vec<String>>,
    savepoints: Vec<(String, Tables, BTreeMap<String, i64>)>,
    history: Vec<String>,
    writes: usize,
}

impl MemoryHost {
    /// Emulate a partial unique index over rows whose `deleted_at` is NULL.
    pub(crate) fn unique_over_current(&mut self, table: &str, columns: &[&str]) {
        self.unique.insert(table.to_string(), columns.iter().map(ToString::to_string).collect());
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<Patch> {
        self.tables.get(table).map(|rows| rows.values().cloned().collect()).unwrap_or_default()
    }

    pub(crate) fn open_savepoints(&self) -> Vec<String> {
        self.savepoints.iter().map(|(name, _, _)| name.clone()).collect()
    }

    pub(crate) fn savepoint_history(&self) -> Vec<String> {
        self.history.clone()
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes
    }

    fn position(&self, name: &str) -> Result<usize, AuditError> {
        self.savepoints
            .iter()
            .rposition(|(open, _, _)| open == name)
            .ok_or_else(|| AuditError::Storage(format!("no such savepoint: {name}")))
    }

    fn check_unique(&self, table: &str, candidate: &Patch, skip: Option<i64>) -> Result<(), AuditError> {
        let Some(columns) = self.unique.get(table) else {
            return Ok(());
        };
        if !candidate.get(DELETED_AT_COLUMN).map_or(true, Value::is_null) {
            return Ok(());
        }
        let clash = self.tables.get(table).into_iter().flatten().any(|(id, row)| {
            Some(*id) != skip
                && row.get(DELETED_AT_COLUMN).map_or(true, Value::is_null)
                && columns.iter().all(|column| row.get(column) == candidate.get(column))
        });
        if clash {
            return Err(AuditError::ConstraintViolation(format!(
                "UNIQUE constraint failed: {table}.{}",
                columns.join(", ")
            )));
        }
        Ok(())
    }
}

impl VersionHost for MemoryHost {
    fn begin(&mut self) -> Result<(), AuditError> {
        self.savepoint(TRANSACTION_SAVEPOINT)
    }

    fn commit(&mut self) -> Result<(), AuditError> {
        self.release(TRANSACTION_SAVEPOINT)
    }

    fn rollback(&mut self) -> Result<(), AuditError> {
        self.rollback_to(TRANSACTION_SAVEPOINT)?;
        self.release(TRANSACTION_SAVEPOINT)
    }

    fn savepoint(&mut self, name: &str) -> Result<(), AuditError> {
        self.savepoints.push((name.to_string(), self.tables.clone(), self.next_ids.clone()));
        if name != TRANSACTION_SAVEPOINT {
            self.history.push(name.to_string());
        }
        Ok(())
    }

    fn rollback_to(&mut self, name: &str) -> Result<(), AuditError> {
        let position = self.position(name)?;
        self.savepoints.truncate(position + 1);
        let (_, tables, next_ids) = &self.savepoints[position];
        self.tables = tables.clone();
        self.next_ids = next_ids.clone();
        Ok(())
    }

    fn release(&mut self, name: &str) -> Result<(), AuditError> {
        let position = self.position(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    fn update_columns(&mut self, table: &str, set: &Patch, filter: &Filter) -> Result<usize, AuditError> {
        self.writes += 1;
        let matching = self
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(|(_, row)| filter.matches(row))
            .map(|(id, row)| {
                let mut updated = row.clone();
                updated.extend(set.clone());
                (*id, updated)
            })
            .collect::<Vec<_>>();
        for (id, updated) in &matching {
            self.check_unique(table, updated, Some(*id))?;
        }
        let count = matching.len();
        let rows = self.tables.entry(table.to_string()).or_default();
        for (id, updated) in matching {
            rows.insert(id, updated);
        }
        Ok(count)
    }

    fn insert_row(&mut self, table: &str, values: &Patch) -> Result<RowId, AuditError> {
        self.writes += 1;
        self.check_unique(table, values, None)?;
        let next = self.next_ids.entry(table.to_string()).or_insert(0);
        *next += 1;
        let id = *next;
        let mut row = Patch::new().set(ID_COLUMN, id);
        row.extend(values.clone());
        self.tables.entry(table.to_string()).or_default().insert(id, row);
        Ok(RowId(id))
    }

    fn delete_rows(&mut self, table: &str, filter: &Filter) -> Result<usize, AuditError> {
        self.writes += 1;
        let Some(rows) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, row| !filter.matches(row));
        Ok(before - rows.len())
    }

    fn fetch_row(&self, table: &str, id: RowId) -> Result<Option<Patch>, AuditError> {
        Ok(self.tables.get(table).and_then(|rows| rows.get(&id.0)).cloned())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Player {
    pub(crate) audit: AuditFields,
    pub(crate) name: String,
    pub(crate) nick_name: String,
    pub(crate) fail_before_delete: bool,
    pub(crate) fail_before_create: bool,
}

impl Player {
    pub(crate) fn new(name: &str, actor: &str) -> Self {
        Self {
            audit: AuditFields::new(actor),
            name: name.to_string(),
            nick_name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Record for Player {
    fn table(&self) -> &str {
        "players"
    }

    fn values(&self) -> Patch {
        Patch::new().set("name", self.name.clone()).set("nick_name", self.nick_name.clone())
    }

    fn assign(&mut self, column: &str, value: &Value) -> Result<(), AuditError> {
        let text = value.as_str().ok_or_else(|| type_mismatch(column, "text", value))?;
        match column {
            "name" => self.name = text.to_string(),
            "nick_name" => self.nick_name = text.to_string(),
            _ => return Err(AuditError::Validation(format!("unknown players column {column}"))),
        }
        Ok(())
    }

    fn audit_fields(&self) -> Option<&AuditFields> {
        Some(&self.audit)
    }

    fn audit_fields_mut(&mut self) -> Option<&mut AuditFields> {
        Some(&mut self.audit)
    }

    fn before_create(&mut self) -> Result<(), HookError> {
        if self.fail_before_create {
            return Err(HookError::new("error while before create"));
        }
        Ok(())
    }

    fn before_delete(&mut self) -> Result<(), HookError> {
        if self.fail_before_delete {
            return Err(HookError::new("error while before delete"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PlainPlayer {
    pub(crate) id: Option<RowId>,
    pub(crate) name: String,
}

impl PlainPlayer {
    pub(crate) fn new(name: &str) -> Self {
        Self { id: None, name: name.to_string() }
    }
}

impl Record for PlainPlayer {
    fn table(&self) -> &str {
        "plain_players"
    }

    fn values(&self) -> Patch {
        Patch::new().set("name", self.name.clone())
    }

    fn assign(&mut self, column: &str, value: &Value) -> Result<(), AuditError> {
        match (column, value) {
            ("name", Value::Text(name)) => {
                self.name.clone_from(name);
                Ok(())
            }
            ("name", other) => Err(type_mismatch(column, "text", other)),
            _ => Err(AuditError::Validation(format!("unknown plain_players column {column}"))),
        }
    }

    fn id(&self) -> Option<RowId> {
        self.id
    }

    fn set_id(&mut self, id: Option<RowId>) {
        self.id = id;
    }
}
