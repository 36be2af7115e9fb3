//! Where igdm keeps its files.
//!
//! ```text
//! $XDG_CONFIG_HOME/igdm/config.toml
//! $XDG_DATA_HOME/igdm/sessions/session_<username>.json
//! $XDG_DATA_HOME/igdm/sent_users.txt
//! $XDG_STATE_HOME/igdm/codes/{auth_code,2fa_code}_<username>.txt
//! ```
//!
//! `paths.data_dir` and `paths.state_dir` in the config replace the XDG
//! defaults; both accept `~` and environment variables.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::schema::annotated_default_config;
use crate::{APP_NAME, AppConfig};

/// File name of the sent-users ledger inside the data directory.
pub const LEDGER_FILE_NAME: &str = "sent_users.txt";

const CONFIG_FILE_NAME: &str = "config.toml";

/// Resolved locations of the config file and the data and state trees.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Path to the configuration file.
    pub config_file: PathBuf,
    /// Root for session records and the ledger.
    pub data_dir: PathBuf,
    /// Root for verification-code drop files.
    pub state_dir: PathBuf,
}

impl AppPaths {
    /// Resolve paths from the XDG defaults. `config_override` may name the
    /// config file or the directory containing it.
    ///
    /// # Errors
    ///
    /// Returns an error if no home directory can be found or expansion fails.
    pub fn discover(config_override: Option<&Path>) -> Result<Self> {
        let config_file = match config_override {
            Some(path) => {
                let path = expand_path(path)?;
                if path.is_dir() {
                    path.join(CONFIG_FILE_NAME)
                } else {
                    path
                }
            }
            None => default_config_dir()?.join(CONFIG_FILE_NAME),
        };
        if config_file.file_name().is_none() {
            return Err(anyhow!("not a config file path: {}", config_file.display()));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    /// Replace the data and state roots with the ones set in `cfg`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be expanded.
    pub fn apply_overrides(self, cfg: &AppConfig) -> Result<Self> {
        let data_dir = cfg
            .paths
            .data_dir
            .as_deref()
            .map_or(Ok(self.data_dir), expand_str_path)?;
        let state_dir = cfg
            .paths
            .state_dir
            .as_deref()
            .map_or(Ok(self.state_dir), expand_str_path)?;

        Ok(Self {
            config_file: self.config_file,
            data_dir,
            state_dir,
        })
    }

    /// Directory holding `session_<username>.json` files.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Path of the sent-users ledger.
    #[must_use]
    pub fn ledger_file(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE_NAME)
    }

    /// Directory watched for verification-code drop files.
    #[must_use]
    pub fn codes_dir(&self) -> PathBuf {
        self.state_dir.join("codes")
    }

    /// Create the sessions and codes directories. The ledger's parent is the
    /// data root, which the sessions directory already implies.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.sessions_dir(), self.codes_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Report what [`Self::ensure_directories`] would create.
    pub fn log_dry_run(&self) {
        log::info!(
            "dry-run: would create {} and {}",
            self.sessions_dir().display(),
            self.codes_dir().display()
        );
    }
}

impl std::fmt::Display for AppPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "config: {}, sessions: {}, ledger: {}, codes: {}",
            self.config_file.display(),
            self.sessions_dir().display(),
            self.ledger_file().display(),
            self.codes_dir().display()
        )
    }
}

/// Expand `~` and environment variables in a path. Non-UTF-8 paths are
/// returned unchanged.
///
/// # Errors
///
/// Returns an error if a referenced variable is unset.
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    path.to_str()
        .map_or_else(|| Ok(path.to_path_buf()), expand_str_path)
}

/// Expand `~` and environment variables in a string path.
///
/// # Errors
///
/// Returns an error if a referenced variable is unset.
pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(text).with_context(|| format!("expanding path {text}"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// One of the XDG base directories.
#[derive(Clone, Copy)]
enum Xdg {
    Config,
    Data,
    State,
}

impl Xdg {
    const fn env_var(self) -> &'static str {
        match self {
            Self::Config => "XDG_CONFIG_HOME",
            Self::Data => "XDG_DATA_HOME",
            Self::State => "XDG_STATE_HOME",
        }
    }

    fn platform_dir(self) -> Option<PathBuf> {
        match self {
            Self::Config => dirs::config_dir(),
            Self::Data => dirs::data_dir(),
            Self::State => dirs::state_dir(),
        }
    }

    const fn home_relative(self) -> &'static str {
        match self {
            Self::Config => ".config",
            Self::Data => ".local/share",
            Self::State => ".local/state",
        }
    }

    /// `$XDG_*_HOME/igdm`, then the platform directory, then `~/<fallback>/igdm`.
    fn resolve(self, env_value: Option<OsString>) -> Option<PathBuf> {
        env_value
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.platform_dir())
            .or_else(|| dirs::home_dir().map(|home| home.join(self.home_relative())))
            .map(|base| base.join(APP_NAME))
    }

    fn dir(self) -> Result<PathBuf> {
        self.resolve(std::env::var_os(self.env_var()))
            .ok_or_else(|| anyhow!("cannot determine {} (no home directory)", self.env_var()))
    }
}

/// Default config directory.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_config_dir() -> Result<PathBuf> {
    Xdg::Config.dir()
}

/// Default root for session records and the ledger.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_data_dir() -> Result<PathBuf> {
    Xdg::Data.dir()
}

/// Default root for verification-code drop files.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_state_dir() -> Result<PathBuf> {
    Xdg::State.dir()
}

/// Write the default config, with each section described, to `path`.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let body = format!(
        "# {APP_NAME} configuration ({})\n# Any key can be overridden with {}__SECTION__KEY.\n\n{}",
        path.display(),
        crate::env_prefix(),
        annotated_default_config()?
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}
