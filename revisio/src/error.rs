use std::path::PathBuf;

/// Error type for the revisio crate.
///
/// The first group of variants is detected before any mutation happens
/// (`UnknownRevision`, `DisconnectedChain`, `IrreversibleRevision`,
/// `InvalidRegistry`, `ChecksumMismatch`, `InvalidTarget`). Everything raised
/// while a step is running is wrapped in `MigrationStepFailed`, except a
/// declined confirmation which surfaces as `UserAborted`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown revision '{0}'")]
    UnknownRevision(String),

    #[error("no path between revision '{from}' and revision '{to}': they lie on different lines")]
    DisconnectedChain { from: String, to: String },

    #[error("revision '{0}' has no reverse action for every operation and cannot be downgraded")]
    IrreversibleRevision(String),

    #[error("revision '{revision}' aborted by user: {rows} row(s) in '{table}' were not removed")]
    UserAborted {
        revision: String,
        table: String,
        rows: u64,
        /// Exports from earlier operations of the same step that were kept on
        /// disk. The rows they hold were not removed.
        exports: Vec<PathBuf>,
    },

    #[error("revision '{revision}' failed: {source}")]
    MigrationStepFailed {
        revision: String,
        #[source]
        source: Box<Error>,
        /// Export files written during the failed step that were kept on disk.
        exports: Vec<PathBuf>,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The step's data changes were committed but the version marker was not
    /// written. Re-running the same target will apply the step a second time.
    #[error("revision '{revision}' was committed but the version marker still reads '{recorded}': {source}")]
    MarkerNotRecorded {
        revision: String,
        recorded: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid revision registry: {0}")]
    InvalidRegistry(String),

    #[error("revision '{revision}' checksum mismatch: recorded '{recorded}', computed '{computed}'. The revision was modified after being applied")]
    ChecksumMismatch {
        revision: String,
        recorded: String,
        computed: String,
    },

    #[error("{0}")]
    InvalidTarget(String),

    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),

    #[error("export i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("export serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// The revision a runtime failure is attached to, if any.
    pub fn revision(&self) -> Option<&str> {
        match self {
            Error::UnknownRevision(revision) | Error::IrreversibleRevision(revision) => {
                Some(revision)
            }
            Error::UserAborted { revision, .. }
            | Error::MigrationStepFailed { revision, .. }
            | Error::MarkerNotRecorded { revision, .. }
            | Error::ChecksumMismatch { revision, .. } => Some(revision),
            _ => None,
        }
    }

    /// Export files an operator can inspect after a failed or aborted step.
    pub fn export_paths(&self) -> &[PathBuf] {
        match self {
            Error::MigrationStepFailed { exports, .. } | Error::UserAborted { exports, .. } => {
                exports
            }
            _ => &[],
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Self::Generic(value.to_string())
    }
}
