//! The narrow interface the engine needs from a backing store.
//!
//! A store hands out one [StepScope] per revision step. Everything the step
//! does (schema changes, row deletions, data callbacks, and, when the store
//! supports transactional DDL, the version marker update) goes through that
//! scope, and dropping the scope without calling [StepScope::commit] discards
//! all of it.

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::operation::{Predicate, Row, SchemaChange, Value};

/// Read access handed to data callbacks and the export guard.
pub trait RowAccess {
    /// Number of rows matching `predicate`.
    fn count(&self, predicate: &Predicate) -> Result<u64, Error>;

    /// All rows matching `predicate`, in retrieval order, with every column.
    fn select(&self, predicate: &Predicate) -> Result<Vec<Row>, Error>;

    /// Visit matching rows one at a time.
    fn for_each_row(
        &self,
        predicate: &Predicate,
        visit: &mut dyn FnMut(&Row) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for row in self.select(predicate)? {
            visit(&row)?;
        }
        Ok(())
    }
}

/// Write access handed to data callbacks.
pub trait RowMutation {
    /// Run one parameterised statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, Error>;

    /// Set `changes` on the rows of `table` whose `key` column equals the given
    /// value.
    fn update(
        &self,
        table: &str,
        key: (&str, &Value),
        changes: &[(&str, Value)],
    ) -> Result<usize, Error> {
        if changes.is_empty() {
            return Ok(0);
        }
        let assignments = changes
            .iter()
            .map(|(column, _)| format!("\"{}\" = ?", column))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ?",
            table, assignments, key.0
        );
        let mut params: Vec<Value> = changes.iter().map(|(_, value)| value.clone()).collect();
        params.push(key.1.clone());
        self.execute(&sql, &params)
    }
}

/// The persisted pointer to the currently applied revision.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMarker {
    pub revision: String,
    /// Checksum of the revision when it was applied.
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// Transactional scope for one revision step.
pub trait StepScope: RowAccess + RowMutation {
    /// Run one or more raw statements.
    fn execute_batch(&self, sql: &str) -> Result<(), Error>;

    /// Delete the rows matching `predicate`, returning how many were removed.
    fn delete(&self, predicate: &Predicate) -> Result<u64, Error>;

    fn apply_schema_change(&self, change: &SchemaChange) -> Result<(), Error>;

    /// Write the version marker inside this scope. Only called when the store
    /// reports [StoreAdapter::transactional_ddl].
    fn set_version(&self, marker: &VersionMarker) -> Result<(), Error>;

    fn commit(self) -> Result<(), Error>;
}

/// A store the runner can migrate.
pub trait StoreAdapter {
    type Scope<'a>: StepScope
    where
        Self: 'a;

    /// Open the transactional scope for one step.
    fn begin(&mut self) -> Result<Self::Scope<'_>, Error>;

    /// Whether schema changes roll back with the scope. When `false` the
    /// runner records the version marker right after commit instead of inside
    /// the scope, and a crash between the two re-applies the step on the next
    /// run.
    fn transactional_ddl(&self) -> bool;
}

/// Where the current revision id is persisted.
///
/// Writes are single-writer; the runner holds `&mut` to the store for the
/// whole run, and separate processes must be serialised by the caller.
pub trait VersionStore {
    fn get(&mut self) -> Result<Option<VersionMarker>, Error>;

    fn set(&mut self, marker: &VersionMarker) -> Result<(), Error>;
}
