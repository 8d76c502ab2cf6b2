//! Destinations for rows exported before a destructive operation.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::error::Error;
use crate::operation::ExportName;

/// Whether an export outlives the step that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep the file; its path is reported to the operator.
    Durable,
    /// Safe to discard once the step has committed or rolled back.
    Transient,
}

/// Append-only target for export payloads.
pub trait ExportSink {
    /// Where a payload with this name would land, for messages shown before
    /// anything is written.
    fn location_hint(&self, name: &ExportName) -> String;

    /// Write `payload` durably (flushed and synced) and return its location.
    fn write(&mut self, name: &ExportName, payload: &[u8]) -> Result<PathBuf, Error>;

    fn retention(&self) -> Retention;

    /// Drop transient exports. Called by the runner after each step.
    fn discard_transient(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Writes each export to its own uniquely named file in a directory.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    retention: Retention,
    transient: Vec<TempPath>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, retention: Retention) -> Self {
        Self {
            dir: dir.into(),
            retention,
            transient: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ExportSink for FileSink {
    fn location_hint(&self, name: &ExportName) -> String {
        self.dir
            .join(format!("{}*{}", name.prefix, name.suffix))
            .display()
            .to_string()
    }

    fn write(&mut self, name: &ExportName, payload: &[u8]) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(&name.prefix)
            .suffix(&name.suffix)
            .tempfile_in(&self.dir)?;
        file.write_all(payload)?;
        file.flush()?;
        file.as_file().sync_all()?;

        match self.retention {
            Retention::Durable => {
                let (_, path) = file.keep().map_err(|e| e.error)?;
                Ok(path)
            }
            Retention::Transient => {
                let path = file.into_temp_path();
                let location = path.to_path_buf();
                self.transient.push(path);
                Ok(location)
            }
        }
    }

    fn retention(&self) -> Retention {
        self.retention
    }

    fn discard_transient(&mut self) -> Result<(), Error> {
        for path in self.transient.drain(..) {
            path.close()?;
        }
        Ok(())
    }
}
