//! SQLite store adapter.
//!
//! # Example
//!
//! ```
//! use revisio::sqlite::SqliteStore;
//! use revisio::{FieldDef, FieldType, Operation, Revision, RevisionRegistry, Runner, RunnerConfig};
//!
//! let registry = RevisionRegistry::new(vec![
//!     Revision::root("1.0.0"),
//!     Revision::new("1.0.1", "1.0.0")
//!         .operation(Operation::raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
//!             .reverse("DROP TABLE users")),
//!     Revision::new("1.0.2", "1.0.1")
//!         .operation(Operation::add_field("users", FieldDef::new("email", FieldType::Text))),
//! ]);
//! let runner = Runner::new(registry, RunnerConfig::automated("docs"));
//!
//! let mut store = SqliteStore::open_in_memory().unwrap();
//! let report = runner.migrate_to(&mut store, "head").unwrap();
//! assert_eq!(report.applied_ids(), vec!["1.0.1", "1.0.2"]);
//! assert_eq!(runner.current(&mut store).unwrap(), "1.0.2");
//!
//! let mut stmt = store.connection().prepare("PRAGMA table_info(users)").unwrap();
//! let columns = stmt
//!     .query_map([], |row| row.get::<_, String>(1))
//!     .unwrap()
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(columns, vec!["id", "name", "email"]);
//! ```
//!
//! # Transactions
//!
//! Every step runs inside `BEGIN IMMEDIATE`, so the write lock is taken up
//! front and a concurrent writer waits for the busy timeout instead of failing
//! half-way. SQLite's DDL is transactional, so the version marker is written
//! inside the same transaction as the step's operations.
//!
//! [SqliteStore::without_transactional_ddl] switches the store to the behaviour
//! of engines whose DDL commits implicitly: the marker is then written after
//! the step's commit, and a crash between the two leaves the step applied but
//! unrecorded.
//!
//! # Altering columns
//!
//! SQLite can add and drop plain columns in place. The table is rebuilt when a
//! column is altered, when an added column is `UNIQUE` or `NOT NULL` without a
//! default, and when a dropped column is `UNIQUE`, part of the primary key or
//! carries a `REFERENCES` constraint. A rebuild creates a new table from the
//! current column definitions (types, nullability, defaults, primary key,
//! single-column unique and foreign-key constraints), copies the rows, drops
//! the old table and renames the new one. Explicit indexes are re-created
//! afterwards; an index covering a removed column is dropped with it, and a
//! renamed column keeps its indexes under the new name. Table-level `CHECK`
//! constraints and multi-column unique/foreign-key constraints do not survive
//! a rebuild.
//!
//! Foreign key enforcement is off while a step runs so that dropping a parent
//! table does not cascade into its children. Every reference is checked
//! before the step commits; a dangling one fails the step.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, OptionalExtension, ToSql, Transaction,
    TransactionBehavior,
};

use crate::error::Error;
use crate::operation::{FieldDef, Predicate, Row, SchemaChange, Value};
use crate::store::{RowAccess, RowMutation, StepScope, StoreAdapter, VersionMarker, VersionStore};
use crate::DEFAULT_VERSION_TABLE_NAME;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Real(v) => ToSqlOutput::from(*v),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl From<rusqlite::types::Value> for Value {
    fn from(value: rusqlite::types::Value) -> Self {
        match value {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(v) => Value::Integer(v),
            rusqlite::types::Value::Real(v) => Value::Real(v),
            rusqlite::types::Value::Text(v) => Value::Text(v),
            rusqlite::types::Value::Blob(v) => Value::Blob(v),
        }
    }
}

/// Errors that mean the database itself cannot be used, as opposed to a
/// statement failing.
fn availability(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::PermissionDenied
            ) =>
        {
            Error::StoreUnavailable(err.to_string())
        }
        _ => Error::Rusqlite(err),
    }
}

/// A SQLite database the runner can migrate.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    version_table: String,
    busy_timeout: Duration,
    transactional_ddl: bool,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).map_err(availability)?;
        Self::checked(conn)
    }

    /// Open the database file at `path`, failing with
    /// [Error::StoreUnavailable] instead of creating it when it is missing.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(availability)?;
        Self::checked(conn)
    }

    fn checked(conn: Connection) -> Result<Self, Error> {
        // opening is lazy about unreadable files; touch the schema
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(availability)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().map_err(availability)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            version_table: DEFAULT_VERSION_TABLE_NAME.to_string(),
            busy_timeout: Duration::from_secs(30),
            transactional_ddl: true,
        }
    }

    /// Set a custom name for the version marker table.
    /// Defaults to "_revisio_version_".
    pub fn with_version_table(mut self, name: impl Into<String>) -> Self {
        self.version_table = name.into();
        self
    }

    /// How long a step waits for another writer's lock. Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Record the version marker after each step's commit instead of inside
    /// the step's transaction.
    pub fn without_transactional_ddl(mut self) -> Self {
        self.transactional_ddl = false;
        self
    }

    pub fn version_table(&self) -> &str {
        &self.version_table
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }
}

impl StoreAdapter for SqliteStore {
    type Scope<'a> = SqliteScope<'a>;

    fn begin(&mut self) -> Result<SqliteScope<'_>, Error> {
        let SqliteStore {
            conn,
            version_table,
            busy_timeout,
            ..
        } = self;
        let conn: &Connection = conn;
        conn.busy_timeout(*busy_timeout).map_err(availability)?;
        // must precede BEGIN: the pragma is a no-op inside a transaction
        let foreign_keys = ForeignKeys::suspend(conn)?;
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(availability)?;
        Ok(SqliteScope {
            tx,
            version_table,
            foreign_keys,
        })
    }

    fn transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }
}

impl VersionStore for SqliteStore {
    fn get(&mut self) -> Result<Option<VersionMarker>, Error> {
        read_marker(&self.conn, &self.version_table).map_err(availability)
    }

    fn set(&mut self, marker: &VersionMarker) -> Result<(), Error> {
        conn_busy(&self.conn, self.busy_timeout)?;
        write_marker(&self.conn, &self.version_table, marker).map_err(availability)
    }
}

fn conn_busy(conn: &Connection, timeout: Duration) -> Result<(), Error> {
    conn.busy_timeout(timeout).map_err(availability)
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
    let exists = stmt.query([table])?.next()?.is_some();
    Ok(exists)
}

fn read_marker(conn: &Connection, table: &str) -> rusqlite::Result<Option<VersionMarker>> {
    if !table_exists(conn, table)? {
        return Ok(None);
    }
    conn.query_row(
        &format!(
            "SELECT revision, checksum, applied_at FROM \"{}\" WHERE slot = 1",
            table
        ),
        [],
        |row| {
            let applied_at: String = row.get(2)?;
            let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?
                .with_timezone(&Utc);
            Ok(VersionMarker {
                revision: row.get(0)?,
                checksum: row.get(1)?,
                applied_at,
            })
        },
    )
    .optional()
}

/// Single statement upsert so readers never see a half-written marker.
fn write_marker(conn: &Connection, table: &str, marker: &VersionMarker) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (slot INTEGER PRIMARY KEY CHECK (slot = 1), revision TEXT NOT NULL, checksum TEXT NOT NULL, applied_at TEXT NOT NULL)",
            table
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "INSERT INTO \"{}\" (slot, revision, checksum, applied_at) VALUES (1, ?1, ?2, ?3) \
             ON CONFLICT(slot) DO UPDATE SET revision = excluded.revision, checksum = excluded.checksum, applied_at = excluded.applied_at",
            table
        ),
        params![marker.revision, marker.checksum, marker.applied_at.to_rfc3339()],
    )?;
    Ok(())
}

/// One step's `BEGIN IMMEDIATE` transaction. Dropping it rolls back.
pub struct SqliteScope<'a> {
    // declared before `foreign_keys` so the rollback runs before enforcement returns
    tx: Transaction<'a>,
    version_table: &'a str,
    foreign_keys: ForeignKeys<'a>,
}

/// Foreign key enforcement switched off for the length of a step.
///
/// With enforcement on, the `DROP TABLE` of a rebuild deletes every child row
/// through `ON DELETE CASCADE`, and cascades would remove rows the export guard
/// never saw. References are instead verified with `PRAGMA foreign_key_check`
/// before the step commits, and enforcement is restored when the guard drops.
struct ForeignKeys<'a> {
    conn: &'a Connection,
    enforced: bool,
}

impl<'a> ForeignKeys<'a> {
    fn suspend(conn: &'a Connection) -> Result<Self, Error> {
        let enforced: bool = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_err(availability)?;
        if enforced {
            conn.execute_batch("PRAGMA foreign_keys = OFF")
                .map_err(availability)?;
        }
        Ok(Self { conn, enforced })
    }

    fn check(&self, tx: &Connection) -> Result<(), Error> {
        if !self.enforced {
            return Ok(());
        }
        let violation: Option<(String, String)> = tx
            .query_row("PRAGMA foreign_key_check", [], |row| {
                Ok((row.get(0)?, row.get(2)?))
            })
            .optional()?;
        match violation {
            Some((table, parent)) => Err(Error::Generic(format!(
                "foreign key violation: rows in '{}' reference missing rows in '{}'",
                table, parent
            ))),
            None => Ok(()),
        }
    }
}

impl Drop for ForeignKeys<'_> {
    fn drop(&mut self) {
        if !self.enforced {
            return;
        }
        if let Err(_error) = self.conn.execute_batch("PRAGMA foreign_keys = ON") {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %_error, "Could not re-enable foreign key enforcement");
        }
    }
}

impl RowAccess for SqliteScope<'_> {
    fn count(&self, predicate: &Predicate) -> Result<u64, Error> {
        let count: i64 = self.tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM \"{}\"{}",
                predicate.table(),
                predicate.where_clause()
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn select(&self, predicate: &Predicate) -> Result<Vec<Row>, Error> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT * FROM \"{}\"{}",
            predicate.table(),
            predicate.where_clause()
        ))?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let rows = stmt
            .query_map([], |row| {
                let mut out = Row::new();
                for (index, column) in columns.iter().enumerate() {
                    let value: rusqlite::types::Value = row.get(index)?;
                    out.push(column.clone(), Value::from(value));
                }
                Ok(out)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl RowMutation for SqliteScope<'_> {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, Error> {
        let changed = self
            .tx
            .execute(sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(changed)
    }
}

impl StepScope for SqliteScope<'_> {
    fn execute_batch(&self, sql: &str) -> Result<(), Error> {
        if sql.trim().is_empty() {
            return Ok(());
        }
        self.tx.execute_batch(sql)?;
        Ok(())
    }

    fn delete(&self, predicate: &Predicate) -> Result<u64, Error> {
        let removed = self.tx.execute(
            &format!(
                "DELETE FROM \"{}\"{}",
                predicate.table(),
                predicate.where_clause()
            ),
            [],
        )?;
        Ok(removed as u64)
    }

    fn apply_schema_change(&self, change: &SchemaChange) -> Result<(), Error> {
        match change {
            SchemaChange::AddField { table, field } => {
                let in_place = !field.unique && (field.nullable || field.default.is_some());
                if in_place {
                    self.tx.execute(
                        &format!("ALTER TABLE \"{}\" ADD COLUMN {}", table, field.column_sql()),
                        [],
                    )?;
                } else {
                    rebuild_table(&self.tx, table, Rebuild::Add(field))?;
                }
            }
            SchemaChange::RemoveField { table, field } => {
                let columns = table_columns(&self.tx, table)?;
                let Some(existing) = columns.iter().find(|c| c.name == field.name) else {
                    return Err(Error::Generic(format!(
                        "column '{}' does not exist in table '{}'",
                        field.name, table
                    )));
                };
                if existing.unique || existing.references.is_some() || existing.primary_key > 0 {
                    rebuild_table(&self.tx, table, Rebuild::Remove(&field.name))?;
                } else {
                    self.tx.execute(
                        &format!("ALTER TABLE \"{}\" DROP COLUMN \"{}\"", table, field.name),
                        [],
                    )?;
                }
            }
            SchemaChange::AlterField { table, from, to } => {
                rebuild_table(&self.tx, table, Rebuild::Alter { from, to })?;
            }
        }
        Ok(())
    }

    fn set_version(&self, marker: &VersionMarker) -> Result<(), Error> {
        write_marker(&self.tx, self.version_table, marker)?;
        Ok(())
    }

    fn commit(self) -> Result<(), Error> {
        let SqliteScope {
            tx, foreign_keys, ..
        } = self;
        foreign_keys.check(&tx)?;
        tx.commit()?;
        drop(foreign_keys);
        Ok(())
    }
}

/// A column as currently declared in the database.
#[derive(Debug, Clone, PartialEq)]
struct ColumnSpec {
    name: String,
    decl_type: String,
    not_null: bool,
    default: Option<String>,
    /// 1-based position within the primary key, 0 when not part of it.
    primary_key: i64,
    unique: bool,
    /// (table, column, on_delete)
    references: Option<(String, String, String)>,
}

impl ColumnSpec {
    fn from_field(field: &FieldDef) -> Self {
        Self {
            name: field.name.clone(),
            decl_type: field.field_type.sql_type().to_string(),
            not_null: !field.nullable,
            default: field.default.clone(),
            primary_key: 0,
            unique: field.unique,
            references: field
                .references
                .as_ref()
                .map(|(table, column)| (table.clone(), column.clone(), "CASCADE".to_string())),
        }
    }

    fn sql(&self, single_primary_key: bool) -> String {
        let mut sql = format!("\"{}\"", self.name);
        if !self.decl_type.is_empty() {
            sql.push(' ');
            sql.push_str(&self.decl_type);
        }
        if single_primary_key && self.primary_key > 0 {
            sql.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
        if let Some((table, column, on_delete)) = &self.references {
            sql.push_str(&format!(" REFERENCES \"{}\" (\"{}\")", table, column));
            if on_delete != "NO ACTION" {
                sql.push_str(&format!(" ON DELETE {}", on_delete));
            }
        }
        sql
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnSpec>, Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let mut columns = stmt
        .query_map([], |row| {
            Ok(ColumnSpec {
                name: row.get(1)?,
                decl_type: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default: row.get(4)?,
                primary_key: row.get(5)?,
                unique: false,
                references: None,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        return Err(Error::Generic(format!("table '{}' does not exist", table)));
    }

    // single-column foreign keys
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list(\"{}\")", table))?;
    let keys = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (id, target_table, from, to, on_delete) in &keys {
        if keys.iter().filter(|k| k.0 == *id).count() != 1 {
            continue;
        }
        if let Some(column) = columns.iter_mut().find(|c| &c.name == from) {
            column.references = Some((
                target_table.clone(),
                to.clone().unwrap_or_else(|| "id".to_string()),
                on_delete.clone(),
            ));
        }
    }

    // single-column UNIQUE constraints (origin 'u')
    let mut stmt = conn.prepare(&format!("PRAGMA index_list(\"{}\")", table))?;
    let unique_indexes = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, unique, origin)| *unique && origin == "u")
        .map(|(name, _, _)| name)
        .collect::<Vec<_>>();
    for index in unique_indexes {
        let mut stmt = conn.prepare(&format!("PRAGMA index_info(\"{}\")", index))?;
        let indexed = stmt
            .query_map([], |row| row.get::<_, String>(2))?
            .collect::<Result<Vec<_>, _>>()?;
        if let [only] = indexed.as_slice() {
            if let Some(column) = columns.iter_mut().find(|c| &c.name == only) {
                column.unique = true;
            }
        }
    }

    Ok(columns)
}

enum Rebuild<'a> {
    Add(&'a FieldDef),
    Remove(&'a str),
    Alter { from: &'a FieldDef, to: &'a FieldDef },
}

fn rebuild_table(conn: &Connection, table: &str, change: Rebuild<'_>) -> Result<(), Error> {
    let current = table_columns(conn, table)?;

    // (new column, source expression for the copy)
    let mut target: Vec<(ColumnSpec, Option<String>)> = current
        .iter()
        .map(|c| (c.clone(), Some(format!("\"{}\"", c.name))))
        .collect();
    let mut dropped_column = None;
    let mut renamed = None;
    match change {
        Rebuild::Add(field) => {
            if current.iter().any(|c| c.name == field.name) {
                return Err(Error::Generic(format!(
                    "column '{}' already exists in table '{}'",
                    field.name, table
                )));
            }
            target.push((ColumnSpec::from_field(field), None));
        }
        Rebuild::Remove(name) => {
            let before = target.len();
            target.retain(|(column, _)| column.name != name);
            if target.len() == before {
                return Err(Error::Generic(format!(
                    "column '{}' does not exist in table '{}'",
                    name, table
                )));
            }
            dropped_column = Some(name.to_string());
        }
        Rebuild::Alter { from, to } => {
            let Some(slot) = target.iter_mut().find(|(c, _)| c.name == from.name) else {
                return Err(Error::Generic(format!(
                    "column '{}' does not exist in table '{}'",
                    from.name, table
                )));
            };
            // keeps the old name through the copy; renamed afterwards so
            // indexes and references follow the column
            let mut spec = ColumnSpec::from_field(to);
            spec.name = from.name.clone();
            spec.primary_key = slot.0.primary_key;
            slot.0 = spec;
            if from.name != to.name {
                renamed = Some((from.name.as_str(), to.name.as_str()));
            }
        }
    }

    let primary_key: Vec<&ColumnSpec> = {
        let mut keys: Vec<&ColumnSpec> = target
            .iter()
            .map(|(c, _)| c)
            .filter(|c| c.primary_key > 0)
            .collect();
        keys.sort_by_key(|c| c.primary_key);
        keys
    };
    let single_primary_key = primary_key.len() == 1;
    let mut definitions: Vec<String> = target
        .iter()
        .map(|(c, _)| c.sql(single_primary_key))
        .collect();
    if primary_key.len() > 1 {
        definitions.push(format!(
            "PRIMARY KEY ({})",
            primary_key
                .iter()
                .map(|c| format!("\"{}\"", c.name))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let indexes = explicit_indexes(conn, table)?;

    let staging = format!("_revisio_rebuild_{}", table);
    conn.execute(
        &format!("CREATE TABLE \"{}\" ({})", staging, definitions.join(", ")),
        [],
    )?;
    let copied: Vec<&(ColumnSpec, Option<String>)> =
        target.iter().filter(|(_, source)| source.is_some()).collect();
    if !copied.is_empty() {
        let columns = copied
            .iter()
            .map(|(c, _)| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sources = copied
            .iter()
            .filter_map(|(_, source)| source.clone())
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" ({}) SELECT {} FROM \"{}\"",
                staging, columns, sources, table
            ),
            [],
        )?;
    }
    conn.execute(&format!("DROP TABLE \"{}\"", table), [])?;
    conn.execute(
        &format!("ALTER TABLE \"{}\" RENAME TO \"{}\"", staging, table),
        [],
    )?;

    for index in indexes {
        if let Some(column) = &dropped_column {
            if index.columns.iter().any(|c| c == column) {
                continue;
            }
        }
        conn.execute(&index.sql, [])?;
    }
    if let Some((from, to)) = renamed {
        conn.execute(
            &format!(
                "ALTER TABLE \"{}\" RENAME COLUMN \"{}\" TO \"{}\"",
                table, from, to
            ),
            [],
        )?;
    }
    Ok(())
}

/// An index created with `CREATE INDEX`, as opposed to one backing a
/// constraint.
struct ExplicitIndex {
    sql: String,
    /// Indexed table columns; expression terms are left out.
    columns: Vec<String>,
}

fn explicit_indexes(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ExplicitIndex>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master WHERE type='index' AND tbl_name=?1 AND sql IS NOT NULL",
    )?;
    let found = stmt
        .query_map([table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    found
        .into_iter()
        .map(|(name, sql)| {
            let mut info = conn.prepare(&format!("PRAGMA index_info(\"{}\")", name))?;
            let columns = info
                .query_map([], |row| row.get::<_, Option<String>>(2))?
                .filter_map(|column| column.transpose())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ExplicitIndex { sql, columns })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::FieldType;

    fn marker(revision: &str) -> VersionMarker {
        VersionMarker {
            revision: revision.to_string(),
            checksum: "abc".to_string(),
            applied_at: Utc::now(),
        }
    }

    fn columns(store: &SqliteStore, table: &str) -> Vec<String> {
        let mut stmt = store
            .connection()
            .prepare(&format!("PRAGMA table_info({})", table))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn marker_is_unset_on_fresh_database() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get().unwrap(), None);
        assert!(!table_exists(store.connection(), DEFAULT_VERSION_TABLE_NAME).unwrap());
    }

    #[test]
    fn marker_set_overwrites_single_row() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.set(&marker("1.0.23")).unwrap();
        store.set(&marker("1.0.24")).unwrap();
        let read = store.get().unwrap().unwrap();
        assert_eq!(read.revision, "1.0.24");
        assert_eq!(read.checksum, "abc");
        let rows: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM _revisio_version_", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn custom_version_table() {
        let mut store = SqliteStore::open_in_memory()
            .unwrap()
            .with_version_table("schema_marker");
        store.set(&marker("7")).unwrap();
        assert!(table_exists(store.connection(), "schema_marker").unwrap());
        assert_eq!(store.get().unwrap().unwrap().revision, "7");
    }

    #[test]
    fn unreachable_database_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("db.sqlite3");
        let err = SqliteStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "{:?}", err);

        let garbage = dir.path().join("garbage.sqlite3");
        std::fs::write(&garbage, b"this is not a sqlite database, not even close....").unwrap();
        let err = SqliteStore::open(&garbage).unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "{:?}", err);
    }

    #[test]
    fn open_existing_does_not_create_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        let err = SqliteStore::open_existing(&path).unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "{:?}", err);
        assert!(!path.exists());

        SqliteStore::open(&path).unwrap();
        let mut store = SqliteStore::open_existing(&path).unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn dropped_scope_rolls_back_marker_and_data() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        {
            let scope = store.begin().unwrap();
            scope.delete(&Predicate::all("t")).unwrap();
            scope.set_version(&marker("2")).unwrap();
        }
        assert_eq!(store.get().unwrap(), None);
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let scope = store.begin().unwrap();
        scope.set_version(&marker("2")).unwrap();
        scope.commit().unwrap();
        assert_eq!(store.get().unwrap().unwrap().revision, "2");
    }

    #[test]
    fn add_and_remove_plain_field_in_place() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch("CREATE TABLE logs (id INTEGER PRIMARY KEY, objname TEXT)")
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::AddField {
                table: "logs".to_string(),
                field: FieldDef::new("levelname", FieldType::Text)
                    .not_null()
                    .default_sql("'INFO'"),
            })
            .unwrap();
        scope
            .apply_schema_change(&SchemaChange::RemoveField {
                table: "logs".to_string(),
                field: FieldDef::new("objname", FieldType::Text),
            })
            .unwrap();
        scope.commit().unwrap();
        assert_eq!(columns(&store, "logs"), vec!["id", "levelname"]);
    }

    #[test]
    fn alter_field_rebuild_keeps_rows_constraints_and_indexes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE nodes (id INTEGER PRIMARY KEY);
                 INSERT INTO nodes VALUES (10);
                 CREATE TABLE logs (
                    id INTEGER PRIMARY KEY,
                    uuid TEXT,
                    dbnode_id INTEGER REFERENCES nodes (id) ON DELETE CASCADE,
                    message TEXT
                 );
                 CREATE INDEX logs_message ON logs (message);
                 INSERT INTO logs VALUES (1, 'u-1', 10, 'a');
                 INSERT INTO logs VALUES (2, 'u-2', 10, 'b');",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::AlterField {
                table: "logs".to_string(),
                from: FieldDef::new("uuid", FieldType::Uuid),
                to: FieldDef::new("uuid", FieldType::Uuid).not_null().unique(),
            })
            .unwrap();
        scope.commit().unwrap();

        let conn = store.connection();
        let specs = table_columns(conn, "logs").unwrap();
        let uuid = specs.iter().find(|c| c.name == "uuid").unwrap();
        assert!(uuid.not_null);
        assert!(uuid.unique);
        let node = specs.iter().find(|c| c.name == "dbnode_id").unwrap();
        assert_eq!(
            node.references,
            Some(("nodes".to_string(), "id".to_string(), "CASCADE".to_string()))
        );
        assert_eq!(specs.iter().find(|c| c.name == "id").unwrap().primary_key, 1);

        let rows: Vec<(i64, String)> = conn
            .prepare("SELECT id, uuid FROM logs ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows, vec![(1, "u-1".to_string()), (2, "u-2".to_string())]);
        let index: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name='logs_message'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, 1);
        // the new constraint is enforced
        assert!(conn
            .execute("INSERT INTO logs (id, uuid, dbnode_id) VALUES (3, 'u-1', 10)", [])
            .is_err());
    }

    #[test]
    fn alter_to_not_null_fails_on_null_rows() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE logs (id INTEGER PRIMARY KEY, uuid TEXT);
                 INSERT INTO logs VALUES (1, NULL);",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        let result = scope.apply_schema_change(&SchemaChange::AlterField {
            table: "logs".to_string(),
            from: FieldDef::new("uuid", FieldType::Uuid),
            to: FieldDef::new("uuid", FieldType::Uuid).not_null(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn remove_referencing_field_rebuilds() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE nodes (id INTEGER PRIMARY KEY);
                 CREATE TABLE logs (id INTEGER PRIMARY KEY, dbnode_id INTEGER REFERENCES nodes (id), message TEXT);
                 CREATE INDEX logs_node ON logs (dbnode_id);
                 INSERT INTO nodes VALUES (1);
                 INSERT INTO logs VALUES (1, 1, 'kept');",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::RemoveField {
                table: "logs".to_string(),
                field: FieldDef::new("dbnode_id", FieldType::Integer).references("nodes", "id"),
            })
            .unwrap();
        scope.commit().unwrap();
        assert_eq!(columns(&store, "logs"), vec!["id", "message"]);
        let message: String = store
            .connection()
            .query_row("SELECT message FROM logs WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(message, "kept");
    }

    #[test]
    fn add_unique_field_rebuilds() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch("CREATE TABLE logs (id INTEGER PRIMARY KEY)")
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::AddField {
                table: "logs".to_string(),
                field: FieldDef::new("uuid", FieldType::Uuid).unique(),
            })
            .unwrap();
        scope.commit().unwrap();
        let specs = table_columns(store.connection(), "logs").unwrap();
        assert!(specs.iter().any(|c| c.name == "uuid" && c.unique));
    }

    fn foreign_keys_enforced(store: &SqliteStore) -> bool {
        store
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap()
    }

    fn index_columns(store: &SqliteStore, index: &str) -> Vec<String> {
        let mut stmt = store
            .connection()
            .prepare(&format!("PRAGMA index_info({})", index))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(2))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn rebuilding_parent_table_keeps_cascading_children() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE nodes (id INTEGER PRIMARY KEY, label TEXT);
                 CREATE TABLE logs (
                    id INTEGER PRIMARY KEY,
                    node_id INTEGER REFERENCES nodes (id) ON DELETE CASCADE
                 );
                 INSERT INTO nodes VALUES (1, 'calc');
                 INSERT INTO logs VALUES (1, 1), (2, 1);",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::AlterField {
                table: "nodes".to_string(),
                from: FieldDef::new("label", FieldType::Text),
                to: FieldDef::new("label", FieldType::Text)
                    .not_null()
                    .default_sql("''"),
            })
            .unwrap();
        scope.commit().unwrap();

        let children: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM logs WHERE node_id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(children, 2);
        assert!(foreign_keys_enforced(&store));
        // cascades are live again once the step is over
        store.connection().execute("DELETE FROM nodes", []).unwrap();
        let children: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(children, 0);
    }

    #[test]
    fn dangling_reference_fails_commit_and_rolls_back() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE nodes (id INTEGER PRIMARY KEY);
                 CREATE TABLE logs (id INTEGER PRIMARY KEY, node_id INTEGER REFERENCES nodes (id) ON DELETE CASCADE);
                 INSERT INTO nodes VALUES (1);
                 INSERT INTO logs VALUES (1, 1);",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        assert_eq!(scope.delete(&Predicate::all("nodes")).unwrap(), 1);
        let err = scope.commit().unwrap_err();
        assert!(err.to_string().contains("foreign key violation"), "{}", err);

        let conn = store.connection();
        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count("nodes"), 1);
        assert_eq!(count("logs"), 1);
        assert!(foreign_keys_enforced(&store));
    }

    #[test]
    fn dropped_scope_restores_foreign_keys() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.connection().execute_batch("PRAGMA foreign_keys = ON").unwrap();
        {
            let _scope = store.begin().unwrap();
        }
        assert!(foreign_keys_enforced(&store));

        store.connection().execute_batch("PRAGMA foreign_keys = OFF").unwrap();
        store.begin().unwrap().commit().unwrap();
        assert!(!foreign_keys_enforced(&store));
    }

    #[test]
    fn renamed_column_keeps_its_indexes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE logs (id INTEGER PRIMARY KEY, name TEXT, objname TEXT, code TEXT UNIQUE);
                 CREATE INDEX logs_objname ON logs (objname);
                 CREATE INDEX logs_name ON logs (name);
                 INSERT INTO logs VALUES (1, 'first', 'calc', 'a');",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::AlterField {
                table: "logs".to_string(),
                from: FieldDef::new("name", FieldType::Text),
                to: FieldDef::new("title", FieldType::Text),
            })
            .unwrap();
        scope.commit().unwrap();

        assert_eq!(columns(&store, "logs"), vec!["id", "title", "objname", "code"]);
        assert_eq!(index_columns(&store, "logs_objname"), vec!["objname"]);
        assert_eq!(index_columns(&store, "logs_name"), vec!["title"]);
        let title: String = store
            .connection()
            .query_row("SELECT title FROM logs WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(title, "first");
        let specs = table_columns(store.connection(), "logs").unwrap();
        assert!(specs.iter().any(|c| c.name == "code" && c.unique));
    }

    #[test]
    fn removed_column_only_drops_indexes_covering_it() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE logs (id INTEGER PRIMARY KEY, node TEXT UNIQUE, node_label TEXT);
                 CREATE INDEX logs_node_label ON logs (node_label);
                 CREATE INDEX logs_node_pair ON logs (node, node_label);",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::RemoveField {
                table: "logs".to_string(),
                field: FieldDef::new("node", FieldType::Text).unique(),
            })
            .unwrap();
        scope.commit().unwrap();

        let indexes: Vec<String> = store
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND sql IS NOT NULL ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(indexes, vec!["logs_node_label"]);
    }

    #[test]
    fn add_nullable_referencing_field_in_place() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE nodes (id INTEGER PRIMARY KEY);
                 CREATE TABLE logs (id INTEGER PRIMARY KEY);
                 INSERT INTO logs VALUES (7);",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        scope
            .apply_schema_change(&SchemaChange::AddField {
                table: "logs".to_string(),
                field: FieldDef::new("dbnode_id", FieldType::Integer).references("nodes", "id"),
            })
            .unwrap();
        scope.commit().unwrap();

        // a rebuild would have replaced the original statement text
        let sql: String = store
            .connection()
            .query_row("SELECT sql FROM sqlite_master WHERE name = 'logs'", [], |row| row.get(0))
            .unwrap();
        assert!(sql.starts_with("CREATE TABLE logs ("), "{}", sql);
        let specs = table_columns(store.connection(), "logs").unwrap();
        let node = specs.iter().find(|c| c.name == "dbnode_id").unwrap();
        assert_eq!(node.references.as_ref().map(|r| r.0.as_str()), Some("nodes"));
        assert_eq!(columns(&store, "logs"), vec!["id", "dbnode_id"]);
    }

    #[test]
    fn row_mutation_update() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE logs (id INTEGER PRIMARY KEY, metadata TEXT);
                 INSERT INTO logs VALUES (1, '{}'), (2, '{}');",
            )
            .unwrap();
        let scope = store.begin().unwrap();
        let changed = scope
            .update(
                "logs",
                ("id", &Value::Integer(2)),
                &[("metadata", Value::from("{\"a\":1}"))],
            )
            .unwrap();
        assert_eq!(changed, 1);
        let rows = scope
            .select(&Predicate::matching("logs", "id = 2"))
            .unwrap();
        assert_eq!(rows[0].get("metadata"), Some(&Value::from("{\"a\":1}")));
    }
}
