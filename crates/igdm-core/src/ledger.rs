//! Append-only ledger of contacted usernames.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{CoreError, Result};

/// Newline-delimited file of usernames that have already received a message.
///
/// Reads tolerate blank lines and surrounding whitespace. Appends from
/// concurrent tasks in this process are serialized.
#[derive(Debug)]
pub struct SentLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SentLedger {
    /// Create a ledger backed by `path`. The file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every recorded username. A missing file is an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn load(&self) -> Result<HashSet<String>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => {
                return Err(CoreError::Io(std::io::Error::new(
                    e.kind(),
                    format!("reading ledger {}: {e}", self.path.display()),
                )));
            }
        };

        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Whether `username` has been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn contains(&self, username: &str) -> Result<bool> {
        Ok(self.load().await?.contains(username.trim()))
    }

    /// Record `username`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written.
    pub async fn append(&self, username: &str) -> Result<()> {
        let username = username.trim();
        if username.is_empty() || username.contains('\n') {
            return Err(CoreError::Other(format!(
                "refusing to record invalid username {username:?}"
            )));
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{username}\n").as_bytes()).await?;
        file.flush().await?;
        log::debug!("recorded {username} in {}", self.path.display());
        Ok(())
    }
}
