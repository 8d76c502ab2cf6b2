//! Typed operations that make up a [Revision](crate::Revision).
//!
//! An [Operation] always knows its forward action. It may also know a reverse
//! action; an operation without one makes its whole revision irreversible.
//! Schema changes derive their reverse automatically, raw statements and data
//! callbacks declare theirs (or declare an explicit no-op), and row deletions
//! are one-way unless explicitly marked as a no-op on the way back.

use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::Error;
use crate::store::{RowAccess, RowMutation};

/// Which way a revision is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// A single column value as read from, or written to, the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An ordered list of `field -> value` pairs.
///
/// Field order is the column order of the query that produced the row, and it
/// is preserved when the row is serialized for export.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Selects rows of one table, optionally narrowed by a SQL boolean expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    table: String,
    filter: Option<String>,
}

impl Predicate {
    /// Every row of `table`.
    pub fn all(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    /// Rows of `table` for which `filter` holds, e.g. `"objname LIKE 'node.%'"`.
    pub fn matching(table: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Some(filter.into()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// ` WHERE (...)` or an empty string.
    pub fn where_clause(&self) -> String {
        match &self.filter {
            Some(filter) => format!(" WHERE ({})", filter),
            None => String::new(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{} WHERE {}", self.table, filter),
            None => write!(f, "{} (all rows)", self.table),
        }
    }
}

/// How an export file is named inside the sink's directory: `prefix` + random
/// part + `suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportName {
    pub prefix: String,
    pub suffix: String,
}

impl ExportName {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub(crate) fn for_table(table: &str) -> Self {
        Self::new(format!("{}-", table), ".json")
    }
}

/// Column types understood by the schema-change operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Timestamp,
    Uuid,
    Json,
}

impl FieldType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Integer | FieldType::Boolean => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text | FieldType::Timestamp | FieldType::Json => "TEXT",
            FieldType::Uuid => "TEXT",
            FieldType::Blob => "BLOB",
        }
    }
}

/// A named column with its type descriptor and nullability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub unique: bool,
    /// Raw SQL default expression.
    pub default: Option<String>,
    /// `(table, column)` this field references.
    pub references: Option<(String, String)>,
}

impl FieldDef {
    /// A nullable, non-unique column without default.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            unique: false,
            default: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_sql(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some((table.into(), column.into()));
        self
    }

    /// Column definition as used inside `CREATE TABLE` / `ADD COLUMN`.
    pub fn column_sql(&self) -> String {
        let mut sql = format!("\"{}\" {}", self.name, self.field_type.sql_type());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
        if let Some((table, column)) = &self.references {
            sql.push_str(&format!(
                " REFERENCES \"{}\" (\"{}\") ON DELETE CASCADE",
                table, column
            ));
        }
        sql
    }
}

/// Adds, removes or alters a named field of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    AddField { table: String, field: FieldDef },
    /// The full definition is kept so the reverse can re-create the column.
    RemoveField { table: String, field: FieldDef },
    AlterField {
        table: String,
        from: FieldDef,
        to: FieldDef,
    },
}

impl SchemaChange {
    pub fn table(&self) -> &str {
        match self {
            SchemaChange::AddField { table, .. }
            | SchemaChange::RemoveField { table, .. }
            | SchemaChange::AlterField { table, .. } => table,
        }
    }

    pub fn inverse(&self) -> SchemaChange {
        match self {
            SchemaChange::AddField { table, field } => SchemaChange::RemoveField {
                table: table.clone(),
                field: field.clone(),
            },
            SchemaChange::RemoveField { table, field } => SchemaChange::AddField {
                table: table.clone(),
                field: field.clone(),
            },
            SchemaChange::AlterField { table, from, to } => SchemaChange::AlterField {
                table: table.clone(),
                from: to.clone(),
                to: from.clone(),
            },
        }
    }

    /// Removing a column loses every non-null value stored in it.
    pub fn destroys(&self) -> Option<(Predicate, ExportName)> {
        match self {
            SchemaChange::RemoveField { table, field } => Some((
                Predicate::matching(table.clone(), format!("\"{}\" IS NOT NULL", field.name)),
                ExportName::new(format!("{}-{}-", table, field.name), ".json"),
            )),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaChange::AddField { table, field } => {
                format!("add field {}.{} ({})", table, field.name, field.column_sql())
            }
            SchemaChange::RemoveField { table, field } => {
                format!("remove field {}.{}", table, field.name)
            }
            SchemaChange::AlterField { table, from, to } => format!(
                "alter field {}.{} ({} -> {})",
                table,
                from.name,
                from.column_sql(),
                to.column_sql()
            ),
        }
    }
}

/// A SQL statement with an optional reverse statement.
///
/// An empty statement executes nothing; `reverse_noop()` uses that to mark a
/// statement as reversible without undoing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatement {
    sql: String,
    reverse: Option<String>,
    destroys: Option<Predicate>,
    reverse_destroys: Option<Predicate>,
    export: Option<ExportName>,
}

impl RawStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            reverse: None,
            destroys: None,
            reverse_destroys: None,
            export: None,
        }
    }

    pub fn reverse(mut self, sql: impl Into<String>) -> Self {
        self.reverse = Some(sql.into());
        self
    }

    pub fn reverse_noop(self) -> Self {
        self.reverse("")
    }

    /// Declare the rows the forward statement removes, so they are exported
    /// first.
    pub fn destroying(mut self, predicate: Predicate) -> Self {
        self.destroys = Some(predicate);
        self
    }

    /// Declare the rows the reverse statement removes.
    pub fn destroying_on_reverse(mut self, predicate: Predicate) -> Self {
        self.reverse_destroys = Some(predicate);
        self
    }

    pub fn export_as(mut self, name: ExportName) -> Self {
        self.export = Some(name);
        self
    }
}

/// Deletes the rows matching a predicate. The rows always go through the
/// export guard first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRows {
    predicate: Predicate,
    export: ExportName,
    reverse_noop: bool,
}

impl DeleteRows {
    pub fn new(predicate: Predicate) -> Self {
        let export = ExportName::for_table(predicate.table());
        Self {
            predicate,
            export,
            reverse_noop: false,
        }
    }

    pub fn export_as(mut self, name: ExportName) -> Self {
        self.export = name;
        self
    }

    /// Allow downgrades through this operation; the deleted rows are not
    /// re-imported.
    pub fn reverse_noop(mut self) -> Self {
        self.reverse_noop = true;
        self
    }
}

/// Host code run against a step's open transaction.
pub type CallbackFn = Arc<dyn Fn(&dyn RowAccess, &dyn RowMutation) -> Result<(), Error> + Send + Sync>;

/// A named data transform with read and mutate handles on the step's scope.
#[derive(Clone)]
pub struct DataCallback {
    name: String,
    forward: CallbackFn,
    reverse: Option<CallbackFn>,
}

impl DataCallback {
    pub fn new<F>(name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(&dyn RowAccess, &dyn RowMutation) -> Result<(), Error> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            forward: Arc::new(forward),
            reverse: None,
        }
    }

    pub fn reverse<F>(mut self, reverse: F) -> Self
    where
        F: Fn(&dyn RowAccess, &dyn RowMutation) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.reverse = Some(Arc::new(reverse));
        self
    }

    pub fn reverse_noop(self) -> Self {
        self.reverse(|_, _| Ok(()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// Manual Debug impl since closures don't implement Debug
impl fmt::Debug for DataCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCallback")
            .field("name", &self.name)
            .field("reverse", &self.reverse.is_some())
            .finish()
    }
}

/// One step inside a revision.
#[derive(Debug, Clone)]
pub enum Operation {
    SchemaChange(SchemaChange),
    RawStatement(RawStatement),
    DeleteRows(DeleteRows),
    DataCallback(DataCallback),
}

impl Operation {
    pub fn add_field(table: impl Into<String>, field: FieldDef) -> Self {
        Operation::SchemaChange(SchemaChange::AddField {
            table: table.into(),
            field,
        })
    }

    pub fn remove_field(table: impl Into<String>, field: FieldDef) -> Self {
        Operation::SchemaChange(SchemaChange::RemoveField {
            table: table.into(),
            field,
        })
    }

    pub fn alter_field(table: impl Into<String>, from: FieldDef, to: FieldDef) -> Self {
        Operation::SchemaChange(SchemaChange::AlterField {
            table: table.into(),
            from,
            to,
        })
    }

    pub fn raw(sql: impl Into<String>) -> RawStatement {
        RawStatement::new(sql)
    }

    pub fn delete_rows(predicate: Predicate) -> DeleteRows {
        DeleteRows::new(predicate)
    }

    pub fn callback<F>(name: impl Into<String>, forward: F) -> DataCallback
    where
        F: Fn(&dyn RowAccess, &dyn RowMutation) -> Result<(), Error> + Send + Sync + 'static,
    {
        DataCallback::new(name, forward)
    }

    pub fn is_reversible(&self) -> bool {
        self.action(Direction::Backward).is_some()
    }

    /// The action to run in `direction`, or `None` when the operation has no
    /// reverse.
    pub(crate) fn action(&self, direction: Direction) -> Option<Action<'_>> {
        match (self, direction) {
            (Operation::SchemaChange(change), Direction::Forward) => {
                Some(Action::Schema(change.clone()))
            }
            (Operation::SchemaChange(change), Direction::Backward) => {
                Some(Action::Schema(change.inverse()))
            }
            (Operation::RawStatement(raw), Direction::Forward) => Some(Action::Sql {
                sql: &raw.sql,
                destroys: raw.destroys.as_ref(),
                export: raw.export.as_ref(),
            }),
            (Operation::RawStatement(raw), Direction::Backward) => {
                raw.reverse.as_deref().map(|sql| Action::Sql {
                    sql,
                    destroys: raw.reverse_destroys.as_ref(),
                    export: raw.export.as_ref(),
                })
            }
            (Operation::DeleteRows(delete), Direction::Forward) => Some(Action::Delete {
                predicate: &delete.predicate,
                export: &delete.export,
            }),
            (Operation::DeleteRows(delete), Direction::Backward) => {
                delete.reverse_noop.then_some(Action::Noop)
            }
            (Operation::DataCallback(callback), Direction::Forward) => Some(Action::Callback {
                name: &callback.name,
                run: &callback.forward,
            }),
            (Operation::DataCallback(callback), Direction::Backward) => {
                callback.reverse.as_ref().map(|run| Action::Callback {
                    name: &callback.name,
                    run,
                })
            }
        }
    }

    /// Stable text used for checksums and previews.
    pub fn describe(&self) -> String {
        match self {
            Operation::SchemaChange(change) => change.describe(),
            Operation::RawStatement(raw) => format!(
                "raw sql [{}] reverse [{}]",
                raw.sql,
                raw.reverse.as_deref().unwrap_or("<irreversible>")
            ),
            Operation::DeleteRows(delete) => format!("delete rows {}", delete.predicate),
            Operation::DataCallback(callback) => format!(
                "callback {}{}",
                callback.name,
                if callback.reverse.is_some() {
                    ""
                } else {
                    " <irreversible>"
                }
            ),
        }
    }
}

impl From<SchemaChange> for Operation {
    fn from(value: SchemaChange) -> Self {
        Operation::SchemaChange(value)
    }
}

impl From<RawStatement> for Operation {
    fn from(value: RawStatement) -> Self {
        Operation::RawStatement(value)
    }
}

impl From<DeleteRows> for Operation {
    fn from(value: DeleteRows) -> Self {
        Operation::DeleteRows(value)
    }
}

impl From<DataCallback> for Operation {
    fn from(value: DataCallback) -> Self {
        Operation::DataCallback(value)
    }
}

/// An operation resolved for one direction.
pub(crate) enum Action<'a> {
    Schema(SchemaChange),
    Sql {
        sql: &'a str,
        destroys: Option<&'a Predicate>,
        export: Option<&'a ExportName>,
    },
    Delete {
        predicate: &'a Predicate,
        export: &'a ExportName,
    },
    Callback {
        name: &'a str,
        run: &'a CallbackFn,
    },
    Noop,
}

impl Action<'_> {
    /// Rows this action would destroy, with the name their export gets.
    pub(crate) fn destroys(&self) -> Option<(Predicate, ExportName)> {
        match self {
            Action::Schema(change) => change.destroys(),
            Action::Sql {
                destroys: Some(predicate),
                export,
                ..
            } => Some((
                (*predicate).clone(),
                export
                    .map(|name| (*name).clone())
                    .unwrap_or_else(|| ExportName::for_table(predicate.table())),
            )),
            Action::Sql { destroys: None, .. } => None,
            Action::Delete { predicate, export } => Some(((*predicate).clone(), (*export).clone())),
            Action::Callback { .. } | Action::Noop => None,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Action::Schema(change) => change.describe(),
            Action::Sql { sql, .. } => format!("raw sql [{}]", sql),
            Action::Delete { predicate, .. } => format!("delete rows {}", predicate),
            Action::Callback { name, .. } => format!("callback {}", name),
            Action::Noop => "no-op".to_string(),
        }
    }
}
