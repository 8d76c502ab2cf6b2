//! # Revisio
//!
//! `revisio` moves a relational schema, and the data in it, along a chain of
//! named revisions, forward or backward.
//!
//! # Motivation
//!
//! Schema migrations that also reshape data tend to delete rows: orphaned log
//! entries, legacy records, values of a column about to be dropped. Once those
//! rows are gone they are gone. Revisio counts the rows a destructive operation
//! would remove, asks for confirmation, and writes them to an export file
//! before the operation is allowed to run. A failed export stops the deletion.
//!
//! ## Revisions
//!
//! A [Revision] names its parent and carries an ordered list of [Operation]s:
//! schema changes (add, remove or alter a field), raw SQL with an optional
//! reverse, row deletions, and host-code callbacks. Each operation knows its
//! forward action and may know a reverse one; a revision with any one-way
//! operation cannot be downgraded.
//!
//! ```
//! use revisio::sqlite::SqliteStore;
//! use revisio::{FieldDef, FieldType, Operation, Predicate, Revision, RevisionRegistry, Runner, RunnerConfig};
//!
//! let registry = RevisionRegistry::new(vec![
//!     Revision::root("1.0.22"),
//!     Revision::new("1.0.23", "1.0.22").operation(
//!         Operation::raw("CREATE TABLE logs (id INTEGER PRIMARY KEY, objname TEXT, message TEXT)")
//!             .reverse("DROP TABLE logs"),
//!     ),
//!     Revision::new("1.0.24", "1.0.23")
//!         .description("drop legacy workflow logs")
//!         .operation(Operation::delete_rows(Predicate::matching(
//!             "logs",
//!             "objname LIKE 'aiida.workflows.user.%'",
//!         )))
//!         .operation(Operation::remove_field("logs", FieldDef::new("objname", FieldType::Text))),
//! ]);
//!
//! // automated mode: no prompt, exports are discarded after each step
//! let runner = Runner::new(registry, RunnerConfig::automated("docs"));
//! let mut store = SqliteStore::open_in_memory().unwrap();
//! runner.migrate_to(&mut store, "1.0.23").unwrap();
//! store
//!     .connection()
//!     .execute("INSERT INTO logs VALUES (1, 'aiida.workflows.user.x', 'old')", [])
//!     .unwrap();
//!
//! let report = runner.migrate_to(&mut store, "head").unwrap();
//! assert_eq!(report.applied_ids(), vec!["1.0.24"]);
//! assert_eq!(report.exports[0].rows, 1);
//! assert_eq!(runner.current(&mut store).unwrap(), "1.0.24");
//!
//! // 1.0.24 deletes rows without a reverse, so it cannot be undone
//! assert!(matches!(
//!     runner.migrate_to(&mut store, "base"),
//!     Err(revisio::Error::IrreversibleRevision(_))
//! ));
//! ```
//!
//! # Version marker
//!
//! The store persists a single marker naming the applied revision, with the
//! revision's checksum. It is written inside each step's transaction when the
//! store supports transactional DDL. Otherwise it is written right after the
//! commit, and a failure in between surfaces as [Error::MarkerNotRecorded]:
//! the step is applied but re-running the same target will apply it again.
//!
//! # Concurrency
//!
//! A run is single-threaded and owns its store exclusively. Concurrent runs
//! against the same database must be serialised outside this crate.
//!
//! # Features
//!
//! - `sqlite` (default): the [sqlite] store adapter.
//! - `tracing` (default): spans and events for every step.
//! - `testing`: [testing::TestHarness] and test doubles.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
pub use error::Error;

mod operation;
pub use operation::{
    CallbackFn, DataCallback, DeleteRows, Direction, ExportName, FieldDef, FieldType, Operation,
    Predicate, RawStatement, Row, SchemaChange, Value,
};

mod revision;
pub use revision::Revision;

mod registry;
pub use registry::{RevisionRegistry, Step, BASE, HEAD};

mod store;
pub use store::{RowAccess, RowMutation, StepScope, StoreAdapter, VersionMarker, VersionStore};

mod sink;
pub use sink::{ExportSink, FileSink, Retention};

mod guard;
pub use guard::{
    AssumeYes, Confirm, DenyConfirm, ExportGuard, ExportRecord, GuardMode, GuardRequest,
};

mod runner;
pub use runner::{
    AppliedStep, ExportSummary, MigrationReport, PlannedStep, Runner, RunnerConfig,
};

/// Default name of the table holding the version marker.
pub const DEFAULT_VERSION_TABLE_NAME: &str = "_revisio_version_";

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(all(feature = "sqlite", any(test, feature = "testing")))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
