//! Per-account session record storage.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::CoreError;
use crate::platform::SessionRecord;

/// Stores `session_<username>.json` files in one directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the session files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the session file for `username`.
    #[must_use]
    pub fn path_for(&self, username: &str) -> PathBuf {
        self.dir
            .join(format!("session_{}.json", file_safe(username)))
    }

    /// Whether a session file exists for `username`.
    #[must_use]
    pub fn exists(&self, username: &str) -> bool {
        self.path_for(username).is_file()
    }

    /// Load the stored session for `username`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self, username: &str) -> Result<Option<SessionRecord>, CoreError> {
        let path = self.path_for(username);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Io(e)),
        };

        serde_json::from_str(&json).map(Some).map_err(|e| {
            CoreError::Serialization(format!("parsing session {}: {e}", path.display()))
        })
    }

    /// Write the session record, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the write fails.
    pub fn save(&self, record: &SessionRecord) -> Result<(), CoreError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&record.username);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| CoreError::Serialization(format!("serializing session: {e}")))?;

        // Write then rename so a crash never leaves a truncated session behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        log::debug!("saved session to {}", path.display());
        Ok(())
    }

    /// Delete the session file for `username`. Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self, username: &str) -> Result<bool, CoreError> {
        let path = self.path_for(username);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("deleted session file {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::Io(e)),
        }
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` so a username can't escape the directory.
pub(crate) fn file_safe(username: &str) -> String {
    username
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
