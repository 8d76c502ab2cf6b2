//! Named profiles read from a TOML file.
//!
//! ```toml
//! [profiles.dev]
//! database = "dev.sqlite3"
//! export_dir = "exports"
//!
//! [profiles.ci]
//! database = "ci.sqlite3"
//! test_profile = true
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use revisio::{Retention, RunnerConfig};
use serde::Deserialize;

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "revisio.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Path of the SQLite database.
    pub database: PathBuf,
    #[serde(default)]
    pub export_dir: Option<PathBuf>,
    /// Test profiles run without confirmation prompts and discard their
    /// exports after each step.
    #[serde(default)]
    pub test_profile: bool,
    /// Overrides the retention implied by `test_profile`.
    #[serde(default)]
    pub keep_exports: Option<bool>,
    #[serde(default)]
    pub version_table: Option<String>,
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    base_dir: PathBuf,
}

impl ConfigFile {
    pub fn parse(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut config: ConfigFile = toml::from_str(text)?;
        config.base_dir = base_dir.into();
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&text, base_dir)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Load `--config` if given, else `./revisio.toml`, else
    /// `<user config dir>/revisio/config.toml`.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match locate(explicit) {
            Some(path) => Self::load(&path),
            None => bail!(
                "no config file found; pass --config or create ./{}",
                LOCAL_CONFIG_FILE
            ),
        }
    }

    pub fn profile(&self, name: &str) -> Result<&Profile> {
        match self.profiles.get(name) {
            Some(profile) => Ok(profile),
            None => bail!(
                "unknown profile '{}'; available profiles: {}",
                name,
                if self.profiles.is_empty() {
                    "<none>".to_string()
                } else {
                    self.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
                }
            ),
        }
    }

    pub fn database_path(&self, profile: &Profile) -> PathBuf {
        self.base_dir.join(&profile.database)
    }

    /// The runner context for `name`.
    pub fn runner_config(&self, name: &str) -> Result<RunnerConfig> {
        let profile = self.profile(name)?;
        let mut config = if profile.test_profile {
            RunnerConfig::automated(name)
        } else {
            RunnerConfig::new(name).with_export_dir(self.base_dir.join("revisio-exports"))
        };
        if let Some(dir) = &profile.export_dir {
            config = config.with_export_dir(self.base_dir.join(dir));
        }
        match profile.keep_exports {
            Some(true) => config = config.with_retention(Retention::Durable),
            Some(false) => config = config.with_retention(Retention::Transient),
            None => {}
        }
        if let Some(table) = &profile.version_table {
            config = config.with_version_table(table.clone());
        }
        if let Some(ms) = profile.busy_timeout_ms {
            config = config.with_busy_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("revisio").join("config.toml"))
        .filter(|path| path.is_file())
}
