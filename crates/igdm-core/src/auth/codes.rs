//! Out-of-band verification codes.
//!
//! When the platform asks for a challenge or two-factor code mid-login, the
//! authenticator blocks on a [`CodeSource`] with an explicit timeout. Two
//! sources exist:
//! - [`FileCodeSource`] polls for `auth_code_<username>.txt` /
//!   `2fa_code_<username>.txt`, consuming the file once read.
//! - [`CodeInbox`] hands codes delivered in-process (e.g. via the HTTP API)
//!   to whichever login is waiting for them.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::auth::session::file_safe;

/// Smallest gap between two drop-file checks.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stand-in deadline for timeouts too large for `Instant`, about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Which verification step a code answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    /// Challenge code sent by SMS or email.
    Challenge,
    /// Two-factor authentication code.
    TwoFactor,
}

impl CodeKind {
    /// Prefix of the drop file for this kind.
    #[must_use]
    pub const fn file_prefix(self) -> &'static str {
        match self {
            Self::Challenge => "auth_code",
            Self::TwoFactor => "2fa_code",
        }
    }
}

impl std::fmt::Display for CodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Challenge => write!(f, "challenge"),
            Self::TwoFactor => write!(f, "two-factor"),
        }
    }
}

/// Errors while waiting for a code.
#[derive(Debug, Error)]
pub enum CodeError {
    /// Nothing arrived before the deadline.
    #[error("no {kind} code for {username} within {}s", .timeout.as_secs())]
    Timeout {
        /// Account being logged in.
        username: String,
        /// Code that was expected.
        kind: CodeKind,
        /// How long we waited.
        timeout: Duration,
    },

    /// The drop file could not be read or removed.
    #[error("reading code file: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can produce a verification code for a waiting login.
#[async_trait]
pub trait CodeSource: Send + Sync + std::fmt::Debug {
    /// Block until a code for `username` arrives or `timeout` elapses.
    async fn wait_for_code(
        &self,
        username: &str,
        kind: CodeKind,
        timeout: Duration,
    ) -> Result<String, CodeError>;
}

/// Polls a directory for code drop files.
#[derive(Debug, Clone)]
pub struct FileCodeSource {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileCodeSource {
    /// Create a source watching `dir`, checking every `poll_interval`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Directory being watched.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the drop file for `username` and `kind`.
    #[must_use]
    pub fn path_for(&self, username: &str, kind: CodeKind) -> PathBuf {
        self.dir
            .join(format!("{}_{}.txt", kind.file_prefix(), file_safe(username)))
    }

    /// Write a drop file, as an operator would.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn deliver(&self, username: &str, kind: CodeKind, code: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(username, kind);
        std::fs::write(&path, code.trim())?;
        Ok(path)
    }

    async fn take(&self, path: &Path) -> Result<Option<String>, CodeError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CodeError::Io(e)),
        };

        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CodeError::Io(e)),
        }

        let code = content.trim();
        Ok((!code.is_empty()).then(|| code.to_string()))
    }
}

#[async_trait]
impl CodeSource for FileCodeSource {
    async fn wait_for_code(
        &self,
        username: &str,
        kind: CodeKind,
        timeout: Duration,
    ) -> Result<String, CodeError> {
        let path = self.path_for(username, kind);
        let deadline = deadline_after(timeout);
        log::info!("waiting for {kind} code in {}", path.display());

        loop {
            if let Some(code) = self.take(&path).await? {
                return Ok(code);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CodeError::Timeout {
                    username: username.to_string(),
                    kind,
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// In-process mailbox pairing delivered codes with waiting logins.
#[derive(Debug, Default)]
pub struct CodeInbox {
    waiting: Mutex<HashMap<(String, CodeKind), oneshot::Sender<String>>>,
}

impl CodeInbox {
    /// Create an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `code` to the login waiting on it. Returns `false` if nobody is waiting.
    #[must_use]
    pub fn deliver(&self, username: &str, kind: CodeKind, code: &str) -> bool {
        let sender = self.waiting.lock().remove(&key(username, kind));
        sender.is_some_and(|tx| tx.send(code.trim().to_string()).is_ok())
    }

    /// Whether a login is currently waiting for this code.
    #[must_use]
    pub fn is_waiting(&self, username: &str, kind: CodeKind) -> bool {
        self.waiting
            .lock()
            .get(&key(username, kind))
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl CodeSource for CodeInbox {
    async fn wait_for_code(
        &self,
        username: &str,
        kind: CodeKind,
        timeout: Duration,
    ) -> Result<String, CodeError> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(key(username, kind), tx);
        log::info!("waiting for {kind} code for {username} via API");

        let received = tokio::time::timeout(timeout, rx).await;

        // Drop our slot unless a newer waiter replaced it.
        {
            let mut waiting = self.waiting.lock();
            if waiting
                .get(&key(username, kind))
                .is_some_and(oneshot::Sender::is_closed)
            {
                waiting.remove(&key(username, kind));
            }
        }

        match received {
            Ok(Ok(code)) => Ok(code),
            _ => Err(CodeError::Timeout {
                username: username.to_string(),
                kind,
                timeout,
            }),
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn key(username: &str, kind: CodeKind) -> (String, CodeKind) {
    (username.trim().to_string(), kind)
}
