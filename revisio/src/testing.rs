//! Testing utilities for revision development and verification.
//!
//! Enabled by the `testing` feature. Everything here runs against an
//! in-memory SQLite database in automated mode, with exports captured in
//! memory instead of on disk.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::types::FromSql;
use rusqlite::Connection;

use crate::error::Error;
use crate::guard::Confirm;
use crate::operation::ExportName;
use crate::registry::RevisionRegistry;
use crate::runner::{MigrationReport, Runner, RunnerConfig};
use crate::sink::{ExportSink, Retention};
use crate::sqlite::SqliteStore;

/// An export sink that keeps every payload in memory.
///
/// Clones share the same buffer, so a test can hand one clone to the runner
/// and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    writes: Arc<Mutex<Vec<(ExportName, Vec<u8>)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(name, payload)` written so far, oldest first.
    pub fn writes(&self) -> Vec<(ExportName, Vec<u8>)> {
        self.writes
            .lock()
            .map(|writes| writes.clone())
            .unwrap_or_default()
    }

    /// Payloads parsed back into JSON rows.
    pub fn rows(&self) -> Result<Vec<Vec<serde_json::Value>>, Error> {
        self.writes()
            .iter()
            .map(|(_, payload)| serde_json::from_slice(payload).map_err(Error::from))
            .collect()
    }
}

impl ExportSink for MemorySink {
    fn location_hint(&self, name: &ExportName) -> String {
        format!("memory://{}*{}", name.prefix, name.suffix)
    }

    fn write(&mut self, name: &ExportName, payload: &[u8]) -> Result<PathBuf, Error> {
        let mut writes = self
            .writes
            .lock()
            .map_err(|_| Error::Generic("memory sink poisoned".to_string()))?;
        writes.push((name.clone(), payload.to_vec()));
        Ok(PathBuf::from(format!(
            "memory://{}{}{}",
            name.prefix,
            writes.len(),
            name.suffix
        )))
    }

    fn retention(&self) -> Retention {
        Retention::Transient
    }
}

/// An export sink whose every write fails, for checking that nothing is
/// destroyed when an export cannot be written.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSink;

impl ExportSink for FailingSink {
    fn location_hint(&self, name: &ExportName) -> String {
        format!("nowhere://{}*{}", name.prefix, name.suffix)
    }

    fn write(&mut self, _name: &ExportName, _payload: &[u8]) -> Result<PathBuf, Error> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "export sink is unavailable",
        )))
    }

    fn retention(&self) -> Retention {
        Retention::Transient
    }
}

/// Answers confirmation prompts from a script and records each prompt.
/// Declines once the script runs out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConfirm {
    answers: Arc<Mutex<VecDeque<bool>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConfirm {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into_iter().collect())),
            prompts: Arc::default(),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool, Error> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let answer = self
            .answers
            .lock()
            .map_err(|_| Error::Generic("scripted confirm poisoned".to_string()))?
            .pop_front()
            .unwrap_or(false);
        Ok(answer)
    }
}

/// A test harness wrapping a runner and an in-memory SQLite store.
///
/// # Example
///
/// ```
/// use revisio::testing::TestHarness;
/// use revisio::{Operation, Predicate, Revision, RevisionRegistry};
///
/// fn registry() -> RevisionRegistry {
///     RevisionRegistry::new(vec![
///         Revision::root("0"),
///         Revision::new("1", "0").operation(
///             Operation::raw("CREATE TABLE logs (id INTEGER PRIMARY KEY, objname TEXT)")
///                 .reverse("DROP TABLE logs"),
///         ),
///         Revision::new("2", "1").operation(Operation::delete_rows(Predicate::matching(
///             "logs",
///             "objname IS NULL",
///         ))),
///     ])
/// }
///
/// # fn test() -> Result<(), revisio::Error> {
/// let mut harness = TestHarness::new(registry());
/// harness.migrate_to("1")?;
/// harness.execute("INSERT INTO logs VALUES (1, NULL), (2, 'node')")?;
/// harness.migrate_to("head")?;
///
/// assert_eq!(harness.query_one::<i64>("SELECT COUNT(*) FROM logs")?, 1);
/// assert_eq!(harness.exported_rows()?[0].len(), 1);
/// # Ok(())
/// # }
/// # test().unwrap();
/// ```
pub struct TestHarness {
    store: SqliteStore,
    runner: Runner,
    sink: MemorySink,
}

impl TestHarness {
    /// Harness over a fresh in-memory database in automated mode.
    ///
    /// Pass the same registry the application uses in production: once a
    /// revision has shipped, the asserts written against it should not change.
    pub fn new(registry: RevisionRegistry) -> Self {
        Self::with_connection(in_memory(), registry)
    }

    /// Harness over a custom connection, e.g. a file-based database.
    pub fn with_connection(conn: Connection, registry: RevisionRegistry) -> Self {
        let sink = MemorySink::new();
        let runner = Runner::new(registry, RunnerConfig::automated("test")).with_sink(sink.clone());
        Self {
            store: SqliteStore::from_connection(conn),
            runner,
            sink,
        }
    }

    /// Harness whose runner is interactive and answers prompts with `confirm`.
    pub fn interactive(registry: RevisionRegistry, confirm: impl Confirm + 'static) -> Self {
        let sink = MemorySink::new();
        let runner = Runner::new(registry, RunnerConfig::new("test"))
            .with_sink(sink.clone())
            .with_confirm(confirm);
        Self {
            store: SqliteStore::from_connection(in_memory()),
            runner,
            sink,
        }
    }

    pub fn migrate_to(&mut self, target: &str) -> Result<MigrationReport, Error> {
        self.runner.migrate_to(&mut self.store, target)
    }

    pub fn current(&mut self) -> Result<String, Error> {
        self.runner.current(&mut self.store)
    }

    /// Execute SQL statements (for setting up test data).
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.store.connection().execute_batch(sql)?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T: FromSql>(&mut self, sql: &str) -> Result<T, Error> {
        let value = self.store.connection().query_row(sql, [], |row| row.get(0))?;
        Ok(value)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T: FromSql>(&mut self, sql: &str) -> Result<Vec<T>, Error> {
        let mut stmt = self.store.connection().prepare(sql)?;
        let values = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(values)
    }

    /// Rows captured by every export so far, one entry per export.
    pub fn exported_rows(&self) -> Result<Vec<Vec<serde_json::Value>>, Error> {
        self.sink.rows()
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }

    /// Assert that a table exists in the database.
    pub fn assert_table_exists(&mut self, table: &str) -> Result<(), Error> {
        if !self.table_exists(table)? {
            return Err(Error::Generic(format!("Table '{}' does not exist", table)));
        }
        Ok(())
    }

    /// Assert that a table does not exist in the database.
    pub fn assert_table_not_exists(&mut self, table: &str) -> Result<(), Error> {
        if self.table_exists(table)? {
            return Err(Error::Generic(format!(
                "Table '{}' exists but should not",
                table
            )));
        }
        Ok(())
    }

    /// Assert that a column exists in a table.
    pub fn assert_column_exists(&mut self, table: &str, column: &str) -> Result<(), Error> {
        if !self.columns(table)?.iter().any(|c| c == column) {
            return Err(Error::Generic(format!(
                "Column '{}' does not exist in table '{}'",
                column, table
            )));
        }
        Ok(())
    }

    /// Assert that a column does not exist in a table.
    pub fn assert_column_not_exists(&mut self, table: &str, column: &str) -> Result<(), Error> {
        if self.columns(table)?.iter().any(|c| c == column) {
            return Err(Error::Generic(format!(
                "Column '{}' exists in table '{}' but should not",
                column, table
            )));
        }
        Ok(())
    }

    /// Column names of `table` in declaration order.
    pub fn columns(&mut self, table: &str) -> Result<Vec<String>, Error> {
        self.query_all(&format!("SELECT name FROM pragma_table_info('{}')", table))
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, Error> {
        let count: i64 = self.store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn store(&mut self) -> &mut SqliteStore {
        &mut self.store
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }
}

fn in_memory() -> Connection {
    match Connection::open_in_memory() {
        Ok(conn) => conn,
        Err(err) => panic!("failed to create in-memory test database: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType, Operation, Predicate, Revision};

    fn registry() -> RevisionRegistry {
        RevisionRegistry::new(vec![
            Revision::root("0"),
            Revision::new("1", "0").operation(
                Operation::raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
                    .reverse("DROP TABLE users"),
            ),
            Revision::new("2", "1")
                .operation(Operation::add_field(
                    "users",
                    FieldDef::new("email", FieldType::Text),
                ))
                .operation(
                    Operation::delete_rows(Predicate::matching("users", "name IS NULL"))
                        .reverse_noop(),
                ),
        ])
    }

    #[test]
    fn harness_walks_the_chain() {
        let mut harness = TestHarness::new(registry());
        assert_eq!(harness.current().unwrap(), "0");
        harness.assert_table_not_exists("users").unwrap();

        harness.migrate_to("1").unwrap();
        harness.assert_table_exists("users").unwrap();
        harness.assert_column_not_exists("users", "email").unwrap();
        harness
            .execute("INSERT INTO users VALUES (1, 'alice'), (2, NULL)")
            .unwrap();

        harness.migrate_to("head").unwrap();
        harness.assert_column_exists("users", "email").unwrap();
        assert_eq!(
            harness.query_all::<String>("SELECT name FROM users").unwrap(),
            vec!["alice"]
        );
        let exported = harness.exported_rows().unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0][0]["id"], 2);

        harness.migrate_to("0").unwrap();
        harness.assert_table_not_exists("users").unwrap();
    }

    #[test]
    fn interactive_harness_asks_before_deleting() {
        let confirm = ScriptedConfirm::new(vec![false]);
        let mut harness = TestHarness::interactive(registry(), confirm.clone());
        harness.migrate_to("1").unwrap();
        harness.execute("INSERT INTO users VALUES (1, NULL)").unwrap();

        let err = harness.migrate_to("2").unwrap_err();
        assert!(matches!(err, Error::UserAborted { .. }));
        assert_eq!(confirm.prompts().len(), 1);
        assert_eq!(harness.current().unwrap(), "1");
        assert_eq!(harness.query_one::<i64>("SELECT COUNT(*) FROM users").unwrap(), 1);
    }

    #[test]
    fn assertions_report_failures() {
        let mut harness = TestHarness::new(registry());
        assert!(harness.assert_table_exists("users").is_err());
        harness.migrate_to("1").unwrap();
        assert!(harness.assert_column_exists("users", "email").is_err());
    }

    #[test]
    fn scripted_confirm_declines_when_exhausted() {
        let confirm = ScriptedConfirm::new(vec![true]);
        assert!(confirm.confirm("first").unwrap());
        assert!(!confirm.confirm("second").unwrap());
        assert_eq!(confirm.prompts(), vec!["first", "second"]);
    }
}
