//! Moves a store from its current revision to a target revision.
//!
//! Each step of the resolved path runs in its own transactional scope and is
//! committed on its own. When a step fails, that step's scope is rolled back
//! and the run stops; steps committed earlier in the same run stand, and the
//! version marker names the last one. Re-running to the same target resumes.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::guard::{Confirm, DenyConfirm, ExportGuard, ExportRecord, GuardMode, GuardRequest};
use crate::operation::{Action, Direction, Predicate};
use crate::registry::{RevisionRegistry, Step};
use crate::revision::Revision;
use crate::sink::{ExportSink, FileSink, Retention};
use crate::store::{StepScope, StoreAdapter, VersionMarker, VersionStore};

/// Everything a run needs to know about its environment.
///
/// There is no ambient "current profile": the profile a runner works on is
/// whatever its config names.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub profile: String,
    pub mode: GuardMode,
    /// Where [FileSink] exports are written.
    pub export_dir: PathBuf,
    /// Overrides the retention implied by `mode`.
    pub retention: Option<Retention>,
    /// Name of the version marker table, for stores that keep one.
    pub version_table: String,
    pub busy_timeout: Duration,
}

impl RunnerConfig {
    /// A user-facing configuration: destructive steps need confirmation and
    /// exports are kept in `./revisio-exports`.
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            mode: GuardMode::Interactive,
            export_dir: PathBuf::from("revisio-exports"),
            retention: None,
            version_table: crate::DEFAULT_VERSION_TABLE_NAME.to_string(),
            busy_timeout: Duration::from_secs(30),
        }
    }

    /// A test or batch configuration: no confirmation, and exports go to the
    /// system temp dir and are discarded after each step.
    pub fn automated(profile: impl Into<String>) -> Self {
        Self {
            mode: GuardMode::Automated,
            export_dir: std::env::temp_dir().join("revisio-exports"),
            ..Self::new(profile)
        }
    }

    pub fn with_mode(mut self, mode: GuardMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = dir.into();
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_version_table(mut self, name: impl Into<String>) -> Self {
        self.version_table = name.into();
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Interactive runs keep their exports, automated runs discard them,
    /// unless overridden.
    pub fn retention(&self) -> Retention {
        self.retention.unwrap_or(match self.mode {
            GuardMode::Interactive => Retention::Durable,
            GuardMode::Automated => Retention::Transient,
        })
    }

    /// Open a SQLite store with this config's version table and busy timeout.
    #[cfg(feature = "sqlite")]
    pub fn open_sqlite(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<crate::sqlite::SqliteStore, Error> {
        Ok(crate::sqlite::SqliteStore::open(path)?
            .with_version_table(self.version_table.clone())
            .with_busy_timeout(self.busy_timeout))
    }

    /// Like [RunnerConfig::open_sqlite], but a missing database file is
    /// [Error::StoreUnavailable] rather than created.
    #[cfg(feature = "sqlite")]
    pub fn open_existing_sqlite(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<crate::sqlite::SqliteStore, Error> {
        Ok(crate::sqlite::SqliteStore::open_existing(path)?
            .with_version_table(self.version_table.clone())
            .with_busy_timeout(self.busy_timeout))
    }
}

/// One step of a planned run, as shown by [Runner::preview].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub revision: String,
    pub direction: Direction,
    /// Revision the marker will name afterwards.
    pub target: String,
    /// Operations that may remove rows and will go through the export guard.
    pub destructive: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub revision: String,
    pub direction: Direction,
    pub duration: Duration,
}

/// Rows exported by one destructive operation during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub revision: String,
    pub predicate: Predicate,
    pub rows: usize,
    pub location: PathBuf,
    /// Whether the file is still on disk after the run.
    pub retained: bool,
}

/// Outcome of a successful [Runner::migrate_to].
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub from: String,
    pub to: String,
    pub steps: Vec<AppliedStep>,
    pub exports: Vec<ExportSummary>,
}

impl MigrationReport {
    pub fn applied_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.revision.as_str()).collect()
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

type StartHook = Box<dyn Fn(&str, Direction) + Send + Sync>;
type CompleteHook = Box<dyn Fn(&str, Direction, Duration) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, Direction, &Error) + Send + Sync>;

/// Drives a [RevisionRegistry] against a store.
pub struct Runner {
    registry: RevisionRegistry,
    config: RunnerConfig,
    guard: ExportGuard,
    sink: RefCell<Box<dyn ExportSink>>,
    on_step_start: Option<StartHook>,
    on_step_complete: Option<CompleteHook>,
    on_step_error: Option<ErrorHook>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("guard", &self.guard)
            .field("revisions", &self.registry.revisions().len())
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Destructive steps are declined until [Runner::with_confirm] wires in a
    /// real confirmation channel (interactive mode only). Exports go to a
    /// [FileSink] in the config's export directory.
    pub fn new(registry: RevisionRegistry, config: RunnerConfig) -> Self {
        let guard = ExportGuard::new(config.mode, Box::new(DenyConfirm));
        let sink = FileSink::new(config.export_dir.clone(), config.retention());
        Self {
            registry,
            config,
            guard,
            sink: RefCell::new(Box::new(sink)),
            on_step_start: None,
            on_step_complete: None,
            on_step_error: None,
        }
    }

    pub fn with_confirm(mut self, confirm: impl Confirm + 'static) -> Self {
        self.guard = ExportGuard::new(self.config.mode, Box::new(confirm));
        self
    }

    pub fn with_sink(mut self, sink: impl ExportSink + 'static) -> Self {
        self.sink = RefCell::new(Box::new(sink));
        self
    }

    /// Called with the revision id and direction before a step opens its scope.
    pub fn on_step_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Direction) + Send + Sync + 'static,
    {
        self.on_step_start = Some(Box::new(callback));
        self
    }

    /// Called after a step committed and its marker was recorded.
    pub fn on_step_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Direction, Duration) + Send + Sync + 'static,
    {
        self.on_step_complete = Some(Box::new(callback));
        self
    }

    /// Called when a step fails, before the error is returned.
    pub fn on_step_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Direction, &Error) + Send + Sync + 'static,
    {
        self.on_step_error = Some(Box::new(callback));
        self
    }

    pub fn registry(&self) -> &RevisionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The revision the store is at. An unset marker means the designated root.
    pub fn current(&self, store: &mut impl VersionStore) -> Result<String, Error> {
        let marker = store.get()?;
        Ok(self.current_revision(marker.as_ref())?.id().to_string())
    }

    fn current_revision(&self, marker: Option<&VersionMarker>) -> Result<&Revision, Error> {
        match marker {
            None => Ok(self.registry.base()),
            Some(marker) => self
                .registry
                .get(&marker.revision)
                .ok_or_else(|| Error::UnknownRevision(marker.revision.clone())),
        }
    }

    /// Fails with `ChecksumMismatch` when the applied revision was edited
    /// after it was recorded.
    fn verified_current(&self, marker: Option<&VersionMarker>) -> Result<&Revision, Error> {
        let revision = self.current_revision(marker)?;
        if let Some(marker) = marker {
            let computed = revision.checksum();
            if marker.checksum != computed {
                return Err(Error::ChecksumMismatch {
                    revision: marker.revision.clone(),
                    recorded: marker.checksum.clone(),
                    computed,
                });
            }
        }
        Ok(revision)
    }

    /// Revisions within an optional `from:to` range, newest first.
    pub fn history(&self, range: Option<&str>) -> Result<Vec<&Revision>, Error> {
        self.registry.history(range)
    }

    /// The steps [Runner::migrate_to] would run, without running them.
    pub fn preview(
        &self,
        store: &mut impl VersionStore,
        target: &str,
    ) -> Result<Vec<PlannedStep>, Error> {
        let marker = store.get()?;
        let from = self.verified_current(marker.as_ref())?;
        let steps = self.registry.resolve_path(from.id(), target)?;
        Ok(steps
            .iter()
            .map(|step| PlannedStep {
                revision: step.revision.id().to_string(),
                direction: step.direction,
                target: step.target().to_string(),
                destructive: step.revision.destructive_count(step.direction),
            })
            .collect())
    }

    /// Apply every step between the store's current revision and `target`
    /// (`head`, `base` or an id), upgrading or downgrading as needed.
    ///
    /// Validation happens before any mutation: an unknown or disconnected
    /// target, an irreversible revision on a backward path, or a checksum
    /// mismatch all return without touching the store. Migrating to the
    /// current revision is a successful no-op.
    pub fn migrate_to<S>(&self, store: &mut S, target: &str) -> Result<MigrationReport, Error>
    where
        S: StoreAdapter + VersionStore,
    {
        let marker = store.get()?;
        let from = self.verified_current(marker.as_ref())?.id().to_string();
        let to = self.registry.resolve(target)?.id().to_string();
        let steps = self.registry.resolve_path(&from, &to)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            profile = %self.config.profile,
            from = %from,
            to = %to,
            steps = ?steps.iter().map(|s| (s.revision.id(), s.direction)).collect::<Vec<_>>(),
            "Resolved migration path"
        );

        let mut report = MigrationReport {
            from,
            to,
            steps: Vec::with_capacity(steps.len()),
            exports: Vec::new(),
        };
        if steps.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::info!(revision = %report.to, "Already at target revision");
            return Ok(report);
        }

        // every step of this run records the same timestamp
        let applied_at = Utc::now();
        for step in steps {
            self.apply_step(store, step, applied_at, &mut report)?;
        }
        Ok(report)
    }

    /// [Runner::migrate_to], refusing targets behind the current revision.
    pub fn upgrade<S>(&self, store: &mut S, target: &str) -> Result<MigrationReport, Error>
    where
        S: StoreAdapter + VersionStore,
    {
        self.check_direction(store, target, Direction::Forward)?;
        self.migrate_to(store, target)
    }

    /// [Runner::migrate_to], refusing targets ahead of the current revision.
    pub fn downgrade<S>(&self, store: &mut S, target: &str) -> Result<MigrationReport, Error>
    where
        S: StoreAdapter + VersionStore,
    {
        self.check_direction(store, target, Direction::Backward)?;
        self.migrate_to(store, target)
    }

    fn check_direction(
        &self,
        store: &mut impl VersionStore,
        target: &str,
        expected: Direction,
    ) -> Result<(), Error> {
        let planned = self.preview(store, target)?;
        if let Some(step) = planned.iter().find(|s| s.direction != expected) {
            let (verb, instead) = match expected {
                Direction::Forward => ("upgrade", "downgrade"),
                Direction::Backward => ("downgrade", "upgrade"),
            };
            return Err(Error::InvalidTarget(format!(
                "cannot {} to '{}': it requires running revision '{}' {}; use {} instead",
                verb, target, step.revision, step.direction, instead
            )));
        }
        Ok(())
    }

    /// Record `target` as the current revision without running anything.
    /// Returns the revision the marker named before.
    pub fn stamp(&self, store: &mut impl VersionStore, target: &str) -> Result<String, Error> {
        let previous = store.get()?.map(|m| m.revision);
        let revision = self.registry.resolve(target)?;
        store.set(&VersionMarker {
            revision: revision.id().to_string(),
            checksum: revision.checksum(),
            applied_at: Utc::now(),
        })?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            from = ?previous,
            to = revision.id(),
            "Stamped version marker without running operations"
        );

        Ok(previous.unwrap_or_else(|| self.registry.base().id().to_string()))
    }

    fn apply_step<S>(
        &self,
        store: &mut S,
        step: Step<'_>,
        applied_at: DateTime<Utc>,
        report: &mut MigrationReport,
    ) -> Result<(), Error>
    where
        S: StoreAdapter + VersionStore,
    {
        let revision = step.revision;
        let id = revision.id();
        let direction = step.direction;
        let target = self.registry.resolve(step.target())?;
        let marker = VersionMarker {
            revision: target.id().to_string(),
            checksum: target.checksum(),
            applied_at,
        };

        #[cfg(feature = "tracing")]
        let _span = match direction {
            Direction::Forward => tracing::info_span!("revision_up", revision = id),
            Direction::Backward => {
                tracing::info_span!("revision_down", revision = id, target = target.id())
            }
        }
        .entered();

        #[cfg(feature = "tracing")]
        tracing::info!(
            description = revision.summary().unwrap_or(""),
            operations = revision.operations().len(),
            "Starting revision"
        );

        if let Some(ref callback) = self.on_step_start {
            callback(id, direction);
        }

        let started = Instant::now();
        let transactional = store.transactional_ddl();
        let mut exports = Vec::new();
        let outcome = self.run_scope(store, step, &marker, transactional, &mut exports);
        let retained = self.finish_exports();

        if let Err(error) = outcome {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %error, "Revision failed; its changes were rolled back");

            if let Some(ref callback) = self.on_step_error {
                callback(id, direction, &error);
            }

            let kept: Vec<PathBuf> = if retained {
                exports.iter().filter_map(|r| r.location.clone()).collect()
            } else {
                Vec::new()
            };
            return Err(match error {
                Error::UserAborted {
                    revision, table, rows, ..
                } => Error::UserAborted {
                    revision,
                    table,
                    rows,
                    exports: kept,
                },
                other => Error::MigrationStepFailed {
                    revision: id.to_string(),
                    source: Box::new(other),
                    exports: kept,
                },
            });
        }

        if !transactional {
            // The step is committed. A crash or failure from here until the
            // marker is written leaves the step applied but unrecorded.
            if let Err(error) = store.set(&marker) {
                let recorded = match direction {
                    Direction::Forward => revision.parent().unwrap_or(id),
                    Direction::Backward => id,
                };
                let error = Error::MarkerNotRecorded {
                    revision: target.id().to_string(),
                    recorded: recorded.to_string(),
                    source: Box::new(error),
                };

                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, "Revision committed but version marker not recorded");

                if let Some(ref callback) = self.on_step_error {
                    callback(id, direction, &error);
                }
                return Err(error);
            }
        }

        let duration = started.elapsed();

        #[cfg(feature = "tracing")]
        tracing::info!(
            duration_ms = duration.as_millis(),
            marker = target.id(),
            "Revision completed successfully"
        );

        report.steps.push(AppliedStep {
            revision: id.to_string(),
            direction,
            duration,
        });
        report.exports.extend(exports.into_iter().filter_map(|record| {
            let rows = record.rows.len();
            record.location.map(|location| ExportSummary {
                revision: id.to_string(),
                predicate: record.predicate,
                rows,
                location,
                retained,
            })
        }));

        if let Some(ref callback) = self.on_step_complete {
            callback(id, direction, duration);
        }
        Ok(())
    }

    /// Runs one step's actions inside a fresh scope. The scope is dropped
    /// (rolled back) on the first error.
    fn run_scope<S>(
        &self,
        store: &mut S,
        step: Step<'_>,
        marker: &VersionMarker,
        transactional: bool,
        exports: &mut Vec<ExportRecord>,
    ) -> Result<(), Error>
    where
        S: StoreAdapter,
    {
        let revision = step.revision;
        let actions = revision
            .actions(step.direction)
            .ok_or_else(|| Error::IrreversibleRevision(revision.id().to_string()))?;
        let scope = store.begin()?;
        for action in &actions {
            self.run_action(&scope, revision.id(), action, exports)?;
        }
        if transactional {
            scope.set_version(marker)?;
        }
        scope.commit()
    }

    fn run_action<C: StepScope>(
        &self,
        scope: &C,
        revision: &str,
        action: &Action<'_>,
        exports: &mut Vec<ExportRecord>,
    ) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        tracing::debug!(action = %action.describe(), "Running operation");

        if let Some((predicate, name)) = action.destroys() {
            let mut sink = self.sink.borrow_mut();
            let record = self.guard.guard_destructive(
                scope,
                GuardRequest {
                    revision,
                    predicate: &predicate,
                    name: &name,
                },
                sink.as_mut(),
            )?;
            exports.push(record);
        }

        match action {
            Action::Schema(change) => scope.apply_schema_change(change),
            Action::Sql { sql, .. } => {
                if sql.trim().is_empty() {
                    return Ok(());
                }
                scope.execute_batch(sql)
            }
            Action::Delete { predicate, .. } => {
                let _removed = scope.delete(predicate)?;
                #[cfg(feature = "tracing")]
                tracing::info!(rows = _removed, predicate = %predicate, "Deleted rows");
                Ok(())
            }
            Action::Callback { name: _name, run } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(callback = *_name, "Running data callback");
                run(scope, scope)
            }
            Action::Noop => Ok(()),
        }
    }

    /// Drop transient exports after a step. Returns whether exports written
    /// during the step are still on disk.
    fn finish_exports(&self) -> bool {
        let mut sink = self.sink.borrow_mut();
        if sink.retention() == Retention::Durable {
            return true;
        }
        if let Err(_error) = sink.discard_transient() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_error, "Could not discard transient exports");
        }
        false
    }
}
