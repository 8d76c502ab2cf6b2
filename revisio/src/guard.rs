//! Export-before-destroy safety for destructive operations.
//!
//! Before rows are removed, the guard counts them. Nothing happens when the
//! count is zero. Otherwise the operator is told how many rows are affected and
//! where they will be exported. In interactive mode they must confirm. The rows
//! are then serialized to the sink, and only after the sink write returns may
//! the destructive statement run. A failed export therefore always prevents
//! the deletion.

use std::fmt;
use std::path::PathBuf;

use crate::error::Error;
use crate::operation::{ExportName, Predicate, Row};
use crate::sink::ExportSink;
use crate::store::RowAccess;

/// How destructive steps are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardMode {
    /// Ask the confirmation channel before removing any row.
    #[default]
    Interactive,
    /// Skip confirmation (test suites, batch jobs). Exports still happen.
    Automated,
}

/// Yes/no prompt.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> Result<bool, Error>;
}

/// Declines everything. The default, so nothing is destroyed unless a caller
/// wires in a real prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyConfirm;

impl Confirm for DenyConfirm {
    fn confirm(&self, _prompt: &str) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Accepts everything, e.g. for a `--yes` flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Rows captured ahead of a destructive operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub predicate: Predicate,
    pub rows: Vec<Row>,
    /// `None` when nothing matched and nothing was written.
    pub location: Option<PathBuf>,
}

impl ExportRecord {
    fn empty(predicate: Predicate) -> Self {
        Self {
            predicate,
            rows: Vec::new(),
            location: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// What the guard is asked to protect.
#[derive(Debug, Clone, Copy)]
pub struct GuardRequest<'a> {
    pub revision: &'a str,
    pub predicate: &'a Predicate,
    pub name: &'a ExportName,
}

pub struct ExportGuard {
    mode: GuardMode,
    confirm: Box<dyn Confirm>,
}

impl fmt::Debug for ExportGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportGuard")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ExportGuard {
    pub fn new(mode: GuardMode, confirm: Box<dyn Confirm>) -> Self {
        Self { mode, confirm }
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Count, confirm, and export the rows `request.predicate` selects.
    ///
    /// Returns an empty record without touching the sink when nothing matches.
    /// Returns `Error::UserAborted` when confirmation is declined, before any
    /// export is written.
    pub fn guard_destructive(
        &self,
        rows: &dyn RowAccess,
        request: GuardRequest<'_>,
        sink: &mut dyn ExportSink,
    ) -> Result<ExportRecord, Error> {
        let predicate = request.predicate;
        let count = rows.count(predicate)?;
        if count == 0 {
            #[cfg(feature = "tracing")]
            tracing::debug!(predicate = %predicate, "No rows to export");
            return Ok(ExportRecord::empty(predicate.clone()));
        }

        let hint = sink.location_hint(request.name);
        #[cfg(feature = "tracing")]
        tracing::warn!(
            revision = request.revision,
            rows = count,
            predicate = %predicate,
            export = %hint,
            "Destructive operation will remove rows; exporting them first"
        );

        if self.mode == GuardMode::Interactive {
            let prompt = format!(
                "Revision {} will remove {} row(s) from '{}' ({}).\n\
                 They will be exported to {} first.\n\
                 Would you like to proceed?",
                request.revision,
                count,
                predicate.table(),
                predicate,
                hint
            );
            if !self.confirm.confirm(&prompt)? {
                return Err(Error::UserAborted {
                    revision: request.revision.to_string(),
                    table: predicate.table().to_string(),
                    rows: count,
                    exports: Vec::new(),
                });
            }
        }

        let selected = rows.select(predicate)?;
        let payload = serde_json::to_vec_pretty(&selected)?;
        let location = sink.write(request.name, &payload)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            rows = selected.len(),
            location = %location.display(),
            "Exported rows"
        );

        Ok(ExportRecord {
            predicate: predicate.clone(),
            rows: selected,
            location: Some(location),
        })
    }
}

impl Default for ExportGuard {
    fn default() -> Self {
        Self::new(GuardMode::Interactive, Box::new(DenyConfirm))
    }
}
