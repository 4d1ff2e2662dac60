use std::path::Path;

use anyhow::{anyhow, Context, Result};
use audit_trail_core::{
    is_plain_identifier, AuditError, Condition, DeletedAt, Filter, Patch, RowId, Timestamp, Value,
    VersionHost, VersionRow, CREATED_AT_COLUMN, DELETED_AT_COLUMN, ID_COLUMN,
    LAST_CHANGED_USER_COLUMN, PARENT_VERSION_ID_COLUMN, UPDATED_AT_COLUMN,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug)]
struct Scope {
    name: String,
    /// Opened on an autocommit connection, so releasing it commits.
    owns_transaction: bool,
}

/// [`VersionHost`] over one SQLite connection.
#[derive(Debug)]
pub struct SqliteHost {
    conn: Connection,
    scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
}

impl SqliteHost {
    /// Open a SQLite database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be configured.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// # Errors
    /// Returns an error when pragmas cannot be applied.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to apply sqlite pragmas")?;
        Ok(Self { conn, scopes: Vec::new() })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// # Errors
    /// Returns an error when any statement in `sql` fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("failed to execute sql batch")
    }

    /// # Errors
    /// Returns an error when `sqlite_master` cannot be queried.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![table],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to check if table exists: {table}"))?;
        Ok(exists == 1)
    }

    /// Create `table` with the audit columns plus `domain_columns` and, when
    /// `unique_current` is non-empty, a partial unique index over current rows.
    ///
    /// # Errors
    /// Returns an error on invalid identifiers or when the DDL fails.
    pub fn ensure_versioned_table(
        &self,
        table: &str,
        domain_columns: &[(&str, &str)],
        unique_current: &[&str],
    ) -> Result<()> {
        let mut ddl = create_versioned_table_sql(table, domain_columns)?;
        if !unique_current.is_empty() {
            ddl.push_str(&current_unique_index_sql(table, unique_current)?);
        }
        self.conn
            .execute_batch(&ddl)
            .with_context(|| format!("failed to create versioned table {table}"))?;
        debug!(table, "ensured versioned table");
        Ok(())
    }

    /// Every version of `table` matching `filter`, closed ones included, ordered by id.
    ///
    /// # Errors
    /// Returns an error on invalid identifiers or when the query fails.
    pub fn versions(&self, table: &str, filter: &Filter) -> Result<Vec<VersionRow>> {
        let mut values = Vec::new();
        let mut sql = format!(
            "SELECT {}, {}, {}, {} FROM {}",
            quote_ident(ID_COLUMN)?,
            quote_ident(PARENT_VERSION_ID_COLUMN)?,
            quote_ident(DELETED_AT_COLUMN)?,
            quote_ident(LAST_CHANGED_USER_COLUMN)?,
            quote_ident(table)?,
        );
        if !filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause(filter, &mut values)?);
        }
        sql.push_str(&format!(" ORDER BY {}", quote_ident(ID_COLUMN)?));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare version listing for {table}"))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok(VersionRow {
                id: RowId(row.get(0)?),
                parent_version_id: row.get::<_, Option<i64>>(1)?.map(RowId),
                deleted_at: row
                    .get::<_, Option<i64>>(2)?
                    .map_or(DeletedAt::Current, |millis| DeletedAt::Closed(Timestamp::from_millis(millis))),
                last_changed_user: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.with_context(|| format!("failed to decode version of {table}"))?);
        }
        Ok(versions)
    }

    /// # Errors
    /// Returns an error when the integrity pragmas cannot be run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
        })
    }

    fn exec(&self, sql: &str) -> Result<(), AuditError> {
        self.conn.execute_batch(sql).map_err(storage_error)
    }

    fn scope_position(&self, name: &str) -> Result<usize, AuditError> {
        self.scopes
            .iter()
            .rposition(|scope| scope.name == name)
            .ok_or_else(|| AuditError::Storage(format!("no such savepoint: {name}")))
    }

    fn abort_transaction(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "failed to roll back after aborted scope");
            }
        }
        self.scopes.clear();
    }
}

impl VersionHost for SqliteHost {
    fn begin(&mut self) -> Result<(), AuditError> {
        if self.in_transaction() {
            return Err(AuditError::Storage("a transaction is already open".to_string()));
        }
        self.exec("BEGIN IMMEDIATE")
    }

    fn commit(&mut self) -> Result<(), AuditError> {
        if !self.in_transaction() {
            return Err(AuditError::Storage("no transaction is open".to_string()));
        }
        self.exec("COMMIT")?;
        self.scopes.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), AuditError> {
        if !self.in_transaction() {
            return Err(AuditError::Storage("no transaction is open".to_string()));
        }
        self.exec("ROLLBACK")?;
        self.scopes.clear();
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<(), AuditError> {
        let quoted = quote_ident(name)?;
        // Take the write lock up front so the close guard reads the latest commit.
        let owns_transaction = !self.in_transaction();
        if owns_transaction {
            self.exec("BEGIN IMMEDIATE")?;
        }
        if let Err(err) = self.exec(&format!("SAVEPOINT {quoted}")) {
            if owns_transaction {
                self.abort_transaction();
            }
            return Err(err);
        }
        self.scopes.push(Scope { name: name.to_string(), owns_transaction });
        debug!(savepoint = name, owns_transaction, "opened savepoint");
        Ok(())
    }

    fn rollback_to(&mut self, name: &str) -> Result<(), AuditError> {
        let position = self.scope_position(name)?;
        self.exec(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)?))?;
        self.scopes.truncate(position + 1);
        debug!(savepoint = name, "rolled back to savepoint");
        Ok(())
    }

    fn release(&mut self, name: &str) -> Result<(), AuditError> {
        let position = self.scope_position(name)?;
        self.exec(&format!("RELEASE SAVEPOINT {}", quote_ident(name)?))?;
        let owned = self.scopes.drain(position..).any(|scope| scope.owns_transaction);
        if owned {
            if let Err(err) = self.exec("COMMIT") {
                self.abort_transaction();
                return Err(err);
            }
            debug!(savepoint = name, "committed scope transaction");
        }
        Ok(())
    }

    fn update_columns(&mut self, table: &str, set: &Patch, filter: &Filter) -> Result<usize, AuditError> {
        if set.is_empty() {
            return Err(AuditError::Validation(format!("update of {table} sets no columns")));
        }
        if filter.is_empty() {
            return Err(AuditError::Validation(format!("refusing unfiltered update of {table}")));
        }

        let mut values = Vec::with_capacity(set.len() + filter.conditions().len());
        let mut assignments = Vec::with_capacity(set.len());
        for (column, value) in set.iter() {
            values.push(to_sql_value(value));
            assignments.push(format!("{} = ?{}", quote_ident(column)?, values.len()));
        }
        let condition = where_clause(filter, &mut values)?;
        let sql = format!("UPDATE {} SET {} WHERE {condition}", quote_ident(table)?, assignments.join(", "));

        let rows = self.conn.execute(&sql, params_from_iter(values.iter())).map_err(storage_error)?;
        debug!(table, rows, "update");
        Ok(rows)
    }

    fn insert_row(&mut self, table: &str, values: &Patch) -> Result<RowId, AuditError> {
        let table_sql = quote_ident(table)?;
        let sql = if values.is_empty() {
            format!("INSERT INTO {table_sql} DEFAULT VALUES")
        } else {
            let columns = values.columns().map(quote_ident).collect::<Result<Vec<_>, _>>()?;
            let placeholders = (1..=values.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
            format!("INSERT INTO {table_sql} ({}) VALUES ({})", columns.join(", "), placeholders.join(", "))
        };

        self.conn
            .execute(&sql, params_from_iter(values.iter().map(|(_, value)| to_sql_value(value))))
            .map_err(storage_error)?;
        let id = RowId(self.conn.last_insert_rowid());
        debug!(table, id = %id, "insert");
        Ok(id)
    }

    fn delete_rows(&mut self, table: &str, filter: &Filter) -> Result<usize, AuditError> {
        if filter.is_empty() {
            return Err(AuditError::Validation(format!("refusing unfiltered delete from {table}")));
        }
        let mut values = Vec::new();
        let condition = where_clause(filter, &mut values)?;
        let sql = format!("DELETE FROM {} WHERE {condition}", quote_ident(table)?);

        let rows = self.conn.execute(&sql, params_from_iter(values.iter())).map_err(storage_error)?;
        debug!(table, rows, "delete");
        Ok(rows)
    }

    fn fetch_row(&self, table: &str, id: RowId) -> Result<Option<Patch>, AuditError> {
        let sql = format!("SELECT * FROM {} WHERE {} = ?1", quote_ident(table)?, quote_ident(ID_COLUMN)?);
        let mut stmt = self.conn.prepare(&sql).map_err(storage_error)?;
        let columns = stmt.column_names().into_iter().map(ToString::to_string).collect::<Vec<_>>();

        let mut rows = stmt.query(params![id.0]).map_err(storage_error)?;
        let Some(row) = rows.next().map_err(storage_error)? else {
            return Ok(None);
        };
        let mut patch = Patch::new();
        for (index, column) in columns.into_iter().enumerate() {
            patch.push(column, from_value_ref(row.get_ref(index).map_err(storage_error)?));
        }
        Ok(Some(patch))
    }
}

/// DDL for a versioned table: the audit columns followed by `domain_columns`
/// given as `(name, declaration)` pairs.
///
/// # Errors
/// Returns an error on invalid identifiers or declarations.
pub fn create_versioned_table_sql(table: &str, domain_columns: &[(&str, &str)]) -> Result<String> {
    let table_sql = quote_ident(table)?;
    let mut columns = vec![
        format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(ID_COLUMN)?),
        format!(
            "{} INTEGER REFERENCES {table_sql}({})",
            quote_ident(PARENT_VERSION_ID_COLUMN)?,
            quote_ident(ID_COLUMN)?
        ),
        format!("{} INTEGER", quote_ident(CREATED_AT_COLUMN)?),
        format!("{} INTEGER", quote_ident(UPDATED_AT_COLUMN)?),
        format!("{} INTEGER", quote_ident(DELETED_AT_COLUMN)?),
        format!("{} TEXT NOT NULL DEFAULT ''", quote_ident(LAST_CHANGED_USER_COLUMN)?),
    ];
    for (name, declaration) in domain_columns {
        if declaration.contains(';') {
            return Err(anyhow!("column declaration for {name} must be a single clause"));
        }
        columns.push(format!("{} {declaration}", quote_ident(name)?));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {table_sql} (\n  {}\n);\nCREATE INDEX IF NOT EXISTS {} ON {table_sql}({});\n",
        columns.join(",\n  "),
        quote_ident(&format!("idx_{table}_parent"))?,
        quote_ident(PARENT_VERSION_ID_COLUMN)?,
    ))
}

/// Partial unique index over current versions. Without it, uniqueness would
/// also apply to closed history rows and every rollover would conflict.
///
/// # Errors
/// Returns an error when `columns` is empty or holds invalid identifiers.
pub fn current_unique_index_sql(table: &str, columns: &[&str]) -> Result<String> {
    if columns.is_empty() {
        return Err(anyhow!("unique index on {table} needs at least one column"));
    }
    let quoted = columns.iter().map(|column| quote_ident(column)).collect::<Result<Vec<_>, _>>()?;
    Ok(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({}) WHERE {} IS NULL;\n",
        quote_ident(&format!("ux_{table}_current_{}", columns.join("_")))?,
        quote_ident(table)?,
        quoted.join(", "),
        quote_ident(DELETED_AT_COLUMN)?,
    ))
}

fn quote_ident(name: &str) -> Result<String, AuditError> {
    if !is_plain_identifier(name) {
        return Err(AuditError::Validation(format!("invalid sql identifier: {name:?}")));
    }
    Ok(format!("\"{name}\""))
}

fn where_clause(filter: &Filter, values: &mut Vec<SqlValue>) -> Result<String, AuditError> {
    let mut clauses = Vec::with_capacity(filter.conditions().len());
    for condition in filter.conditions() {
        let column = quote_ident(condition.column())?;
        match condition {
            Condition::IsNull(_) | Condition::Eq(_, Value::Null) => clauses.push(format!("{column} IS NULL")),
            Condition::Eq(_, value) => {
                values.push(to_sql_value(value));
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }
    }
    Ok(clauses.join(" AND "))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(raw) => SqlValue::Integer(*raw),
        Value::Real(raw) => SqlValue::Real(*raw),
        Value::Text(raw) => SqlValue::Text(raw.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(raw) => Value::Integer(raw),
        ValueRef::Real(raw) => Value::Real(raw),
        ValueRef::Text(raw) | ValueRef::Blob(raw) => Value::Text(String::from_utf8_lossy(raw).into_owned()),
    }
}

fn storage_error(err: rusqlite::Error) -> AuditError {
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        AuditError::ConstraintViolation(err.to_string())
    } else {
        AuditError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{SystemTime, UNIX_EPOCH};

    use audit_trail_core::{
        verify_chain, AuditFields, ChainReport, DeleteOutcome, EngineConfig, ErrorKind, HookError,
        ManualClock, Record, UpdateOutcome, VersioningEngine, WritePipeline,
    };
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Player {
        audit: AuditFields,
        name: String,
        nick_name: String,
        fail_before_create: bool,
    }

    impl Player {
        fn new(name: &str, actor: &str) -> Self {
            Self {
                audit: AuditFields::new(actor),
                name: name.to_string(),
                nick_name: name.to_string(),
                fail_before_create: false,
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
            let Some(text) = value.as_str() else {
                return Err(AuditError::Validation(format!("{column} expects text")));
            };
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
    }

    #[derive(Debug, Default)]
    struct Note {
        id: Option<RowId>,
        body: String,
    }

    impl Record for Note {
        fn table(&self) -> &str {
            "notes"
        }

        fn values(&self) -> Patch {
            Patch::new().set("body", self.body.clone())
        }

        fn assign(&mut self, column: &str, value: &Value) -> Result<(), AuditError> {
            match (column, value) {
                ("body", Value::Text(body)) => {
                    self.body.clone_from(body);
                    Ok(())
                }
                _ => Err(AuditError::Validation(format!("bad notes column {column}"))),
            }
        }

        fn id(&self) -> Option<RowId> {
            self.id
        }

        fn set_id(&mut self, id: Option<RowId>) {
            self.id = id;
        }
    }

    fn players_host(host: SqliteHost) -> Result<SqliteHost> {
        host.ensure_versioned_table(
            "players",
            &[("name", "TEXT NOT NULL"), ("nick_name", "TEXT NOT NULL DEFAULT ''")],
            &["name"],
        )?;
        host.execute_batch("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);")?;
        Ok(host)
    }

    fn engine() -> Result<VersioningEngine> {
        Ok(VersioningEngine::new(EngineConfig::default())?)
    }

    fn unique_db_path(label: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_nanos());
        std::env::temp_dir().join(format!(
            "audit-trail-{label}-{}-{nanos}-{}.sqlite3",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn remove_db_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn expect_err<T: std::fmt::Debug>(result: Result<T, AuditError>) -> AuditError {
        match result {
            Ok(value) => panic!("expected an error, got {value:?}"),
            Err(err) => err,
        }
    }

    #[test]
    fn three_updates_leave_a_linked_history() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut player = Player::new("teste", "u1");
        engine.create(&mut host, &mut player)?;

        player.audit.last_changed_user = "U2".to_string();
        engine.apply_update(&mut host, &mut player, &Patch::new().set("name", "updated row"))?;
        engine.apply_update(&mut host, &mut player, &Patch::new().set("name", "one more time"))?;

        let versions = host.versions("players", &Filter::new())?;
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0].parent_version_id, None);
        assert!(!versions[0].deleted_at.is_current());
        assert_eq!(versions[0].last_changed_user, "U2");
        assert_eq!(versions[1].parent_version_id, Some(versions[0].id));
        assert!(!versions[1].deleted_at.is_current());
        assert_eq!(versions[2].parent_version_id, Some(versions[1].id));
        assert!(versions[2].deleted_at.is_current());

        let report = verify_chain(&versions);
        assert!(report.is_valid(), "{:?}", report.problems);
        assert!(report.linear);
        assert_eq!(report.current, Some(versions[2].id));
        assert!(!host.in_transaction());
        Ok(())
    }

    fn run_chain(names: &[String]) -> Result<ChainReport> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut player = Player::new("seed", "u1");
        engine.create(&mut host, &mut player)?;
        for name in names {
            engine.apply_update(&mut host, &mut player, &Patch::new().set("name", name.clone()))?;
        }
        Ok(verify_chain(&host.versions("players", &Filter::new())?))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn property_rollovers_keep_one_current_version(names in prop::collection::vec("[a-z]{1,6}", 0..8)) {
            let report = match run_chain(&names) {
                Ok(report) => report,
                Err(err) => panic!("rollover chain failed: {err:#}"),
            };

            prop_assert!(report.is_valid(), "{:?}", report.problems);
            prop_assert!(report.linear);
            prop_assert_eq!(report.versions, names.len() + 1);
            prop_assert!(report.current.is_some());
        }
    }

    #[test]
    fn uniqueness_conflict_rolls_back_the_close() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut first = Player::new("a", "u1");
        let mut second = Player::new("b", "u1");
        engine.create(&mut host, &mut first)?;
        engine.create(&mut host, &mut second)?;

        let err = expect_err(engine.apply_update(&mut host, &mut second, &Patch::new().set("name", "a")));

        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert!(err.to_string().contains("UNIQUE constraint failed: players.name"), "{err}");
        let versions = host.versions("players", &Filter::new())?;
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|version| version.deleted_at.is_current()));
        assert!(second.audit.is_current());
        assert_eq!(second.audit.id, Some(versions[1].id));
        assert!(!host.in_transaction());
        Ok(())
    }

    #[test]
    fn failing_pre_create_hook_keeps_the_old_version_current() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut player = Player::new("teste", "u1");
        engine.create(&mut host, &mut player)?;
        player.fail_before_create = true;

        let err = expect_err(engine.apply_update(&mut host, &mut player, &Patch::new().set("name", "x")));

        assert_eq!(err, AuditError::HookFailure("error while before create".to_string()));
        let versions = host.versions("players", &Filter::new())?;
        assert_eq!(versions.len(), 1);
        assert!(versions[0].deleted_at.is_current());
        Ok(())
    }

    #[test]
    fn stale_copy_on_a_second_handle_hits_the_guard() -> Result<()> {
        let db_path = unique_db_path("stale");
        {
            let engine = engine()?;
            let mut first = players_host(SqliteHost::open(&db_path)?)?;
            let mut second = SqliteHost::open(&db_path)?;

            let mut fresh = Player::new("teste", "u1");
            engine.create(&mut first, &mut fresh)?;
            let mut stale = fresh.clone();

            engine.apply_update(&mut first, &mut fresh, &Patch::new().set("nick_name", "first"))?;
            let err = expect_err(engine.apply_update(&mut second, &mut stale, &Patch::new().set("nick_name", "second")));

            assert_eq!(err.kind(), ErrorKind::GuardViolation);
            let versions = second.versions("players", &Filter::new())?;
            assert_eq!(versions.len(), 2);
            assert_eq!(versions.iter().filter(|version| version.deleted_at.is_current()).count(), 1);
            assert!(!second.in_transaction());
        }
        remove_db_files(&db_path)
    }

    #[test]
    fn racing_updates_of_one_version_let_exactly_one_win() -> Result<()> {
        let db_path = unique_db_path("race");
        let engine = Arc::new(engine()?);
        let mut seed = Player::new("teste", "u1");
        {
            let mut host = players_host(SqliteHost::open(&db_path)?)?;
            engine.create(&mut host, &mut seed)?;
        }

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for nick in ["left", "right"] {
            let (engine, barrier, path, mut player) =
                (Arc::clone(&engine), Arc::clone(&barrier), db_path.clone(), seed.clone());
            handles.push(thread::spawn(move || -> Result<Result<UpdateOutcome, AuditError>> {
                let mut host = SqliteHost::open(&path)?;
                barrier.wait();
                Ok(engine.apply_update(&mut host, &mut player, &Patch::new().set("nick_name", nick)))
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("race thread panicked"));
            };
            outcomes.push(thread_result?);
        }

        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|outcome| matches!(outcome, Err(AuditError::GuardViolation { .. })))
                .count(),
            1
        );

        let host = SqliteHost::open(&db_path)?;
        let report = verify_chain(&host.versions("players", &Filter::new())?);
        assert!(report.is_valid(), "{:?}", report.problems);
        assert_eq!(report.versions, 2);
        let integrity = host.integrity_check()?;
        assert!(integrity.quick_check_ok);
        assert!(integrity.foreign_key_violations.is_empty());
        drop(host);

        remove_db_files(&db_path)
    }

    #[test]
    fn plain_records_bypass_versioning() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut note = Note { id: None, body: "first".to_string() };
        let id = engine.create(&mut host, &mut note)?;

        let outcome = engine.apply_update(&mut host, &mut note, &Patch::new().set("body", "second"))?;
        assert_eq!(outcome, UpdateOutcome::InPlace { id, rows_affected: 1 });
        let row = host.fetch_row("notes", id)?;
        assert_eq!(row.as_ref().and_then(|row| row.get("body")), Some(&Value::from("second")));
        assert_eq!(row.map(|row| row.len()), Some(2));

        let outcome = engine.delete(&mut host, &mut note)?;
        assert_eq!(outcome, DeleteOutcome::Removed { id, rows_affected: 1 });
        assert_eq!(host.fetch_row("notes", id)?, None);
        Ok(())
    }

    #[test]
    fn empty_change_sets_succeed_for_plain_and_auditable_records() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut note = Note { id: None, body: "first".to_string() };
        let note_id = engine.create(&mut host, &mut note)?;
        let mut player = Player::new("teste", "u1");
        let player_id = engine.create(&mut host, &mut player)?;

        let outcome = engine.apply_update(&mut host, &mut note, &Patch::new())?;
        assert_eq!(outcome, UpdateOutcome::InPlace { id: note_id, rows_affected: 0 });
        let row = host.fetch_row("notes", note_id)?;
        assert_eq!(row.as_ref().and_then(|row| row.get("body")), Some(&Value::from("first")));

        let outcome = engine.apply_update(&mut host, &mut player, &Patch::new())?;
        assert!(matches!(outcome, UpdateOutcome::RolledOver { closed, .. } if closed == player_id));
        assert!(!host.in_transaction());
        Ok(())
    }

    #[test]
    fn actor_is_stamped_on_closed_and_new_versions() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut player = Player::new("teste", "u1");
        engine.create(&mut host, &mut player)?;

        player.audit.last_changed_user = "u2".to_string();
        engine.apply_update(&mut host, &mut player, &Patch::new().set("name", "renamed"))?;
        player.audit.last_changed_user = "u3".to_string();
        engine.delete(&mut host, &mut player)?;

        let actors = host
            .versions("players", &Filter::new())?
            .into_iter()
            .map(|version| version.last_changed_user)
            .collect::<Vec<_>>();
        assert_eq!(actors, ["u2", "u3"]);
        Ok(())
    }

    #[test]
    fn caller_savepoints_compose_with_engine_scopes() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?;
        let mut player = Player::new("teste", "u1");
        engine.create(&mut host, &mut player)?;

        host.begin()?;
        engine.apply_update(&mut host, &mut player, &Patch::new().set("name", "kept"))?;
        host.savepoint("between")?;
        engine.apply_update(&mut host, &mut player, &Patch::new().set("name", "discarded"))?;
        assert!(host.in_transaction());
        host.rollback_to("between")?;
        host.release("between")?;
        host.commit()?;

        let versions = host.versions("players", &Filter::new())?;
        assert_eq!(versions.len(), 2);
        let current = host.fetch_row("players", versions[1].id)?;
        assert_eq!(current.as_ref().and_then(|row| row.get("name")), Some(&Value::from("kept")));

        host.begin()?;
        let mut reread = Player::new("", "u5");
        reread.audit.id = Some(versions[1].id);
        engine.apply_update(&mut host, &mut reread, &Patch::new().set("name", "rolled back"))?;
        host.rollback()?;

        assert_eq!(host.versions("players", &Filter::new())?, versions);
        Ok(())
    }

    #[test]
    fn zero_closing_time_still_counts_as_closed() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;
        let engine = engine()?.with_clock(Arc::new(ManualClock::new(Timestamp::from_millis(0))));
        let mut player = Player::new("teste", "u1");
        engine.create(&mut host, &mut player)?;
        let mut stale = player.clone();

        let outcome = engine.delete(&mut host, &mut player)?;
        assert!(matches!(outcome, DeleteOutcome::Closed { closed_at, .. } if closed_at.as_millis() == 0));

        let err = expect_err(engine.apply_update(&mut host, &mut stale, &Patch::new().set("name", "x")));
        assert_eq!(err.kind(), ErrorKind::GuardViolation);
        let versions = host.versions("players", &Filter::new())?;
        assert_eq!(versions[0].deleted_at, DeletedAt::Closed(Timestamp::from_millis(0)));
        Ok(())
    }

    #[test]
    fn store_failures_are_classified() -> Result<()> {
        let mut host = players_host(SqliteHost::open_in_memory()?)?;

        let null_body = expect_err(host.insert_row("notes", &Patch::new().set("body", Value::Null)));
        assert_eq!(null_body.kind(), ErrorKind::ConstraintViolation);
        assert!(null_body.to_string().contains("NOT NULL constraint failed: notes.body"), "{null_body}");

        let orphan = expect_err(host.insert_row(
            "players",
            &Patch::new().set("name", "orphan").set(PARENT_VERSION_ID_COLUMN, 99_i64),
        ));
        assert_eq!(orphan.kind(), ErrorKind::ConstraintViolation);

        let missing = expect_err(host.insert_row("missing_table", &Patch::new().set("body", "x")));
        assert_eq!(missing.kind(), ErrorKind::Storage);

        let injected = expect_err(host.insert_row("notes; DROP TABLE notes", &Patch::new()));
        assert_eq!(injected.kind(), ErrorKind::Validation);

        let unfiltered = expect_err(host.update_columns("notes", &Patch::new().set("body", "x"), &Filter::new()));
        assert_eq!(unfiltered.kind(), ErrorKind::Validation);
        assert!(host.table_exists("notes")?);
        Ok(())
    }

    #[test]
    fn pipeline_reload_reads_the_stored_version() -> Result<()> {
        let host = players_host(SqliteHost::open_in_memory()?)?;
        let mut pipeline = WritePipeline::new(host).with_callbacks(Arc::new(engine()?));
        let mut player = Player::new("teste", "u1");
        pipeline.create(&mut player)?;
        let mut stale = player.clone();
        pipeline.update(&mut player, &Patch::new().set("nick_name", "nick"))?;

        pipeline.reload(&mut stale)?;

        assert!(!stale.audit.is_current());
        assert_eq!(stale.nick_name, "teste");
        assert_eq!(stale.audit.created_at, player.audit.created_at);

        let report = pipeline.host().integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.quick_check_message, "ok");
        assert!(report.foreign_key_violations.is_empty());
        Ok(())
    }
}
