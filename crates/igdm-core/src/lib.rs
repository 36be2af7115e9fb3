//! Core library for igdm - follower outreach automation.
//!
//! This crate provides:
//! - Configuration loading and management
//! - XDG-compliant path resolution
//! - Schema and example config generation
//! - Session storage, verification codes, and login with retry/backoff
//! - The sent-users ledger and the outreach pipeline
//! - Background task registry with per-task log capture
//! - The platform client seam and its HTTP gateway implementation

pub mod auth;
pub mod config;
pub mod error;
pub mod ledger;
pub mod paths;
pub mod pipeline;
pub mod platform;
pub mod schema;
pub mod service;
pub mod tasks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::{AuthError, Authenticator, CodeInbox, CodeKind, Credentials, SessionStore};
pub use config::{AppConfig, LogLevel, LoggingConfig, PathsConfig};
pub use error::{CoreError, Result};
pub use ledger::SentLedger;
pub use paths::{AppPaths, default_data_dir, default_state_dir};
pub use pipeline::{OutreachPipeline, OutreachSummary, compose_message, parse_targets};
pub use platform::{ClientFactory, ClientHandle, PlatformClient, PlatformError};
pub use schema::{generate_example_config, generate_schema, write_generated_files};
pub use service::{JobError, OutreachService, SubmitRequest};
pub use tasks::{TaskLog, TaskRegistry, TaskSnapshot, TaskStatus};

/// Application name used for config directories and environment prefix.
pub const APP_NAME: &str = "igdm";

/// Repository URL embedded in generated schemas.
pub const REPO_URL: &str = env!("CARGO_PKG_REPOSITORY");

/// Returns the environment variable prefix for this application.
#[must_use]
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
