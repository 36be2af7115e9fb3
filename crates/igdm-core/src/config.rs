//! Configuration types and loading for the application.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::paths::{expand_str_path, write_default_config};
use crate::{AppPaths, env_prefix};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(
    title = "Application Configuration",
    description = "Main configuration for igdm"
)]
pub struct AppConfig {
    /// JSON Schema reference for editor support.
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub schema: Option<String>,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Custom paths for data and state directories.
    pub paths: PathsConfig,

    /// Login, session, and verification-code behavior.
    pub auth: AuthConfig,

    /// Randomized delays between outreach actions.
    pub pacing: PacingConfig,

    /// Candidate harvesting and message composition.
    pub outreach: OutreachConfig,

    /// HTTP server and task registry settings.
    pub server: ServerConfig,

    /// Platform gateway connection.
    pub platform: PlatformConfig,
}

impl AppConfig {
    /// Load configuration from file and environment, creating defaults if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read, parsed, or written.
    pub fn load(paths: &AppPaths, dry_run: bool) -> Result<Self> {
        if !paths.config_file.exists() {
            if dry_run {
                log::info!(
                    "dry-run: would create default config at {}",
                    paths.config_file.display()
                );
            } else {
                write_default_config(&paths.config_file)?;
            }
        }

        Self::load_from_path(&paths.config_file)
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn load_from_path(config_file: &Path) -> Result<Self> {
        let env_prefix = env_prefix();
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("auth.session_policy", "reuse")?
            .set_default("auth.max_login_attempts", 3_i64)?
            .set_default("server.port", 5000_i64)?
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
            .build()?;

        let mut config: Self = built.try_deserialize()?;

        if let Some(ref file) = config.logging.file {
            let expanded = expand_str_path(file)?;
            config.logging.file = Some(expanded.display().to_string());
        }

        Ok(config)
    }

    /// Apply the `PORT` environment variable, if set and valid.
    #[must_use]
    pub fn with_port_env(mut self) -> Self {
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        self
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Logging configuration")]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace).
    pub level: LogLevel,

    /// Optional path for log file output. Supports ~ and environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Log level enumeration for schema validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only emit error-level messages.
    Error,
    /// Emit warnings and errors.
    Warn,
    /// Emit informational messages and above (default).
    #[default]
    Info,
    /// Emit debug diagnostics and above.
    Debug,
    /// Emit all messages including fine-grained traces.
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

/// Path override configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Custom paths for data and state directories")]
pub struct PathsConfig {
    /// Directory for session records and the sent-users ledger. Supports ~ and
    /// environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Directory for verification-code drop files. Supports ~ and environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
}

/// What happens to a stored session before a login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Reuse the stored session; delete it only when the platform rejects it.
    #[default]
    Reuse,
    /// Delete the stored session before every login.
    Fresh,
}

/// Where out-of-band verification codes come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CodeSourceKind {
    /// Poll for `auth_code_<username>.txt` / `2fa_code_<username>.txt` in the state directory.
    #[default]
    File,
    /// Wait for codes posted to the HTTP API.
    Inbox,
}

/// An inclusive range of seconds a randomized delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DelayRange {
    /// Lower bound in seconds.
    pub min: u64,
    /// Upper bound in seconds.
    pub max: u64,
}

impl DelayRange {
    /// Create a range, swapping the bounds if given in the wrong order.
    #[must_use]
    pub const fn new(min: u64, max: u64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// A fixed delay.
    #[must_use]
    pub const fn fixed(secs: u64) -> Self {
        Self::new(secs, secs)
    }

    /// A range that never sleeps.
    #[must_use]
    pub const fn zero() -> Self {
        Self::fixed(0)
    }

    /// Draw a random duration from this range.
    #[must_use]
    pub fn sample(&self) -> Duration {
        use rand::Rng;

        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        if lo == hi {
            return Duration::from_secs(lo);
        }
        Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Login, session, and verification-code behavior")]
pub struct AuthConfig {
    /// Session deletion policy applied before logging in.
    pub session_policy: SessionPolicy,

    /// Credential login attempts before giving up.
    #[schemars(range(min = 1))]
    pub max_login_attempts: u32,

    /// Random delay before each credential login attempt.
    pub login_delay_secs: DelayRange,

    /// Base of the exponential backoff after a failed attempt; doubles per retry.
    pub backoff_base_secs: DelayRange,

    /// How long to wait for a challenge or two-factor code.
    pub code_timeout_secs: u64,

    /// How often the drop-file source checks for a code.
    pub code_poll_interval_secs: u64,

    /// Where verification codes are read from.
    pub code_source: CodeSourceKind,
}

impl AuthConfig {
    /// Settings that never sleep, for tests and dry runs.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            login_delay_secs: DelayRange::zero(),
            backoff_base_secs: DelayRange::zero(),
            code_poll_interval_secs: 0,
            ..Self::default()
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_policy: SessionPolicy::Reuse,
            max_login_attempts: 3,
            login_delay_secs: DelayRange::new(10, 30),
            backoff_base_secs: DelayRange::new(60, 180),
            code_timeout_secs: 600,
            code_poll_interval_secs: 5,
            code_source: CodeSourceKind::File,
        }
    }
}

/// Pacing configuration for the outreach loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Randomized delays between outreach actions")]
pub struct PacingConfig {
    /// Delay after following a user.
    pub follow_delay_secs: DelayRange,

    /// Delay after messaging a user, before the next candidate.
    pub message_delay_secs: DelayRange,

    /// Delay after a per-user failure, before the next candidate.
    pub failure_delay_secs: DelayRange,
}

impl PacingConfig {
    /// Pacing with every delay set to zero.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            follow_delay_secs: DelayRange::zero(),
            message_delay_secs: DelayRange::zero(),
            failure_delay_secs: DelayRange::zero(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            follow_delay_secs: DelayRange::new(600, 1200),
            message_delay_secs: DelayRange::new(1500, 2100),
            failure_delay_secs: DelayRange::fixed(60),
        }
    }
}

/// Outreach configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Candidate harvesting and message composition")]
pub struct OutreachConfig {
    /// Followers fetched per target account.
    #[schemars(range(min = 1))]
    pub followers_per_target: u32,

    /// Greeting line placed above the message. `{name}` becomes the recipient's display name.
    pub greeting: String,
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            followers_per_target: 100,
            greeting: "{name}様".to_string(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "HTTP server and task registry settings")]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: String,

    /// Port to listen on. The `PORT` environment variable takes precedence.
    pub port: u16,

    /// Outreach tasks allowed to run at once; the rest wait.
    #[schemars(range(min = 1))]
    pub max_concurrent_tasks: usize,

    /// Task records kept in memory.
    #[schemars(range(min = 1))]
    pub task_capacity: usize,

    /// Seconds a finished task record is kept.
    pub task_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            max_concurrent_tasks: 1,
            task_capacity: 256,
            task_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Platform gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(description = "Platform gateway connection")]
pub struct PlatformConfig {
    /// Base URL of the platform gateway.
    pub gateway_url: String,

    /// Timeout in seconds for a single gateway request.
    #[schemars(range(min = 1))]
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8400".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_range_orders_bounds() {
        let range = DelayRange::new(30, 10);
        assert_eq!(range.min, 10);
        assert_eq!(range.max, 30);
    }

    #[test]
    fn delay_range_samples_within_bounds() {
        let range = DelayRange::new(10, 30);
        for _ in 0..100 {
            let secs = range.sample().as_secs();
            assert!((10..=30).contains(&secs));
        }
        assert_eq!(DelayRange::fixed(60).sample(), Duration::from_secs(60));
    }

    #[test]
    fn defaults_match_pacing_contract() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.auth.max_login_attempts, 3);
        assert_eq!(cfg.auth.code_timeout_secs, 600);
        assert_eq!(cfg.pacing.follow_delay_secs, DelayRange::new(600, 1200));
        assert_eq!(cfg.pacing.message_delay_secs, DelayRange::new(1500, 2100));
        assert_eq!(cfg.outreach.followers_per_target, 100);
        assert_eq!(cfg.auth.session_policy, SessionPolicy::Reuse);
    }

    #[test]
    fn load_from_path_reads_toml_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[auth]\nsession_policy = \"fresh\"\n\n[pacing.follow_delay_secs]\nmin = 1\nmax = 2\n",
        )
        .expect("write config");

        let cfg = AppConfig::load_from_path(&path).expect("load config");
        assert_eq!(cfg.auth.session_policy, SessionPolicy::Fresh);
        assert_eq!(cfg.pacing.follow_delay_secs, DelayRange::new(1, 2));
        assert_eq!(cfg.pacing.message_delay_secs, DelayRange::new(1500, 2100));
    }
}
