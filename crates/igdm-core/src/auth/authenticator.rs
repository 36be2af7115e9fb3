//! Turning credentials into an authenticated platform client.
//!
//! Order of operations:
//! 1. Under [`SessionPolicy::Fresh`] the stored session is deleted up front.
//! 2. A stored session is loaded and checked with a lightweight request. A
//!    session the platform rejects as login-required is deleted.
//! 3. Otherwise a credential login runs, up to `max_login_attempts` times,
//!    each attempt preceded by a random delay. Challenge and two-factor
//!    prompts are answered from the configured [`CodeSource`]; other
//!    retryable failures back off exponentially before the next attempt.
//!
//! A successful credential login always writes a new session record.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::CoreError;
use crate::auth::codes::{CodeError, CodeKind, CodeSource};
use crate::auth::session::SessionStore;
use crate::config::{AuthConfig, SessionPolicy};
use crate::platform::{ClientFactory, ClientHandle, DeviceIds, PlatformError, SessionRecord};
use crate::tasks::TaskLog;

/// Errors that end an authentication attempt.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Username or password missing.
    #[error("username and password are required")]
    MissingCredentials,

    /// A verification code never arrived.
    #[error("{kind} code not received: {source}")]
    Code {
        /// Code that was expected.
        kind: CodeKind,
        /// Why the wait ended.
        #[source]
        source: CodeError,
    },

    /// The platform refused the login permanently.
    #[error("login rejected: {0}")]
    Rejected(PlatformError),

    /// Every login attempt failed.
    #[error("login failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: PlatformError,
    },

    /// Logged in, but the session could not be captured.
    #[error("could not capture session: {0}")]
    SessionDump(PlatformError),

    /// The session file could not be read, written, or removed.
    #[error("session storage error: {0}")]
    Storage(#[from] CoreError),
}

/// Account credentials supplied with a request. Never persisted.
#[derive(Clone)]
pub struct Credentials {
    /// Account handle.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Build credentials, trimming the username.
    #[must_use]
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.trim().to_string(),
            password: password.to_string(),
        }
    }

    /// Whether both fields are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Outcome of trying the stored session.
enum Reuse {
    Valid(ClientHandle),
    Fallback(Option<DeviceIds>),
}

/// Obtains authenticated client handles.
#[derive(Debug, Clone)]
pub struct Authenticator {
    factory: Arc<dyn ClientFactory>,
    sessions: SessionStore,
    codes: Arc<dyn CodeSource>,
    config: AuthConfig,
}

impl Authenticator {
    /// Create an authenticator.
    #[must_use]
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        sessions: SessionStore,
        codes: Arc<dyn CodeSource>,
        config: AuthConfig,
    ) -> Self {
        Self {
            factory,
            sessions,
            codes,
            config,
        }
    }

    /// Session store used by this authenticator.
    #[must_use]
    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Log in, reusing the stored session when the platform still accepts it.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing, a verification code never
    /// arrives, the platform rejects the credentials, every attempt fails, or
    /// the session file cannot be handled.
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
        log: &TaskLog,
    ) -> Result<ClientHandle, AuthError> {
        if !credentials.is_complete() {
            return Err(AuthError::MissingCredentials);
        }
        let username = credentials.username.as_str();

        if self.config.session_policy == SessionPolicy::Fresh && self.sessions.delete(username)? {
            log.info(format!("{username}: removed stored session before login"));
        }

        match self.try_stored_session(username, log).await? {
            Reuse::Valid(client) => Ok(client),
            Reuse::Fallback(device) => self.credential_login(credentials, device, log).await,
        }
    }

    async fn try_stored_session(&self, username: &str, log: &TaskLog) -> Result<Reuse, AuthError> {
        let record = match self.sessions.load(username) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Reuse::Fallback(None)),
            Err(e) => {
                log.warn(format!("{username}: unreadable session file ({e}), removing it"));
                self.sessions.delete(username)?;
                return Ok(Reuse::Fallback(None));
            }
        };

        let client = self.factory.create();
        client.load_session(&record);

        match client.verify_session().await {
            Ok(()) => {
                log.info(format!("{username}: logged in with saved session"));
                Ok(Reuse::Valid(client))
            }
            Err(PlatformError::LoginRequired(reason)) => {
                log.warn(format!(
                    "{username}: saved session expired ({reason}), falling back to password login"
                ));
                self.sessions.delete(username)?;
                Ok(Reuse::Fallback(Some(record.device)))
            }
            Err(e) => {
                log.warn(format!(
                    "{username}: could not use saved session ({e}), falling back to password login"
                ));
                Ok(Reuse::Fallback(Some(record.device)))
            }
        }
    }

    async fn credential_login(
        &self,
        credentials: &Credentials,
        device: Option<DeviceIds>,
        log: &TaskLog,
    ) -> Result<ClientHandle, AuthError> {
        let username = credentials.username.as_str();
        let client = self.factory.create();
        if let Some(device) = device {
            client.load_session(&SessionRecord {
                username: username.to_string(),
                device,
                ..SessionRecord::default()
            });
        }

        let attempts = self.config.max_login_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let delay = self.config.login_delay_secs.sample();
            log.info(format!(
                "{username}: login attempt {attempt}/{attempts} in {}s",
                delay.as_secs()
            ));
            tokio::time::sleep(delay).await;

            let outcome = match client.login(username, &credentials.password).await {
                Err(PlatformError::ChallengeRequired(reason)) => {
                    log.warn(format!("{username}: challenge required ({reason})"));
                    let code = self.await_code(username, CodeKind::Challenge, log).await?;
                    client.submit_challenge_code(&code).await
                }
                Err(PlatformError::TwoFactorRequired { identifier }) => {
                    log.warn(format!("{username}: two-factor code required"));
                    let code = self.await_code(username, CodeKind::TwoFactor, log).await?;
                    client
                        .login_two_factor(username, &credentials.password, &identifier, &code)
                        .await
                }
                other => other,
            };

            match outcome {
                Ok(()) => {
                    self.persist(&client, username)?;
                    log.info(format!("{username}: logged in"));
                    return Ok(client);
                }
                Err(e) if !e.is_retryable() => {
                    log.error(format!("{username}: login rejected: {e}"));
                    return Err(AuthError::Rejected(e));
                }
                Err(e) => {
                    log.warn(format!("{username}: login attempt {attempt} failed: {e}"));
                    if attempt < attempts {
                        let backoff = self.backoff(attempt);
                        log.info(format!("{username}: retrying in {}s", backoff.as_secs()));
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| PlatformError::Other("no login attempt was made".to_string()));
        log.error(format!("{username}: giving up after {attempts} attempts"));
        Err(AuthError::Exhausted { attempts, last })
    }

    async fn await_code(
        &self,
        username: &str,
        kind: CodeKind,
        log: &TaskLog,
    ) -> Result<String, AuthError> {
        let timeout = Duration::from_secs(self.config.code_timeout_secs);
        log.info(format!(
            "{username}: waiting up to {}s for {kind} code",
            timeout.as_secs()
        ));

        match self.codes.wait_for_code(username, kind, timeout).await {
            Ok(code) => {
                log.info(format!("{username}: {kind} code received"));
                Ok(code)
            }
            Err(source) => {
                log.error(format!("{username}: {source}"));
                Err(AuthError::Code { kind, source })
            }
        }
    }

    /// Base delay drawn from the configured range, doubled for every prior retry.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_secs.sample().as_secs();
        let factor = 1_u64 << attempt.saturating_sub(1).min(16);
        Duration::from_secs(base.saturating_mul(factor))
    }

    fn persist(&self, client: &ClientHandle, username: &str) -> Result<(), AuthError> {
        let mut record = client.dump_session().map_err(AuthError::SessionDump)?;
        record.username = username.to_string();
        record.saved_at = chrono::Utc::now().timestamp();
        self.sessions.save(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::codes::{CodeInbox, FileCodeSource};
    use crate::config::DelayRange;
    use crate::testing::{ScriptedFactory, ScriptedPlatform};

    struct Fixture {
        _dir: tempfile::TempDir,
        sessions: SessionStore,
        codes: FileCodeSource,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let sessions = SessionStore::new(dir.path().join("sessions"));
        let codes = FileCodeSource::new(dir.path().join("codes"), Duration::from_millis(10));
        Fixture {
            _dir: dir,
            sessions,
            codes,
        }
    }

    fn authenticator(
        fx: &Fixture,
        platform: &Arc<ScriptedPlatform>,
        config: AuthConfig,
    ) -> Authenticator {
        Authenticator::new(
            Arc::new(ScriptedFactory::new(Arc::clone(platform))),
            fx.sessions.clone(),
            Arc::new(fx.codes.clone()),
            config,
        )
    }

    fn saved(username: &str) -> SessionRecord {
        let mut record = SessionRecord {
            username: username.to_string(),
            ..SessionRecord::default()
        };
        record.device.uuid = "device-1".to_string();
        record.cookies.insert("sessionid".into(), "old".into());
        record
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected_without_calls() {
        let fx = fixture();
        let platform = Arc::new(ScriptedPlatform::new());
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());

        let err = auth
            .authenticate(&Credentials::new("  ", "pw"), &TaskLog::new("t"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, AuthError::MissingCredentials));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn fresh_login_persists_session() {
        let fx = fixture();
        let platform = Arc::new(ScriptedPlatform::new());
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());

        auth.authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect("login");

        assert_eq!(platform.calls(), vec!["login:me"]);
        let stored = fx.sessions.load("me").expect("load").expect("session saved");
        assert_eq!(stored.username, "me");
        assert!(stored.has_credentials());
        assert!(stored.saved_at > 0);
    }

    #[tokio::test]
    async fn valid_saved_session_skips_login() {
        let fx = fixture();
        fx.sessions.save(&saved("me")).expect("seed session");
        let platform = Arc::new(ScriptedPlatform::new());
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());

        auth.authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect("login");

        assert_eq!(platform.calls(), vec!["verify_session"]);
    }

    #[tokio::test]
    async fn expired_session_is_deleted_then_replaced() {
        let fx = fixture();
        fx.sessions.save(&saved("me")).expect("seed session");
        let platform = Arc::new(
            ScriptedPlatform::new()
                .with_verify_result(Err(PlatformError::LoginRequired("expired".into()))),
        );
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());

        auth.authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect("login");

        assert_eq!(platform.calls(), vec!["verify_session", "login:me"]);
        let stored = fx.sessions.load("me").expect("load").expect("new session");
        assert_eq!(stored.device.uuid, "device-1");
        assert_ne!(stored.cookies.get("sessionid").map(String::as_str), Some("old"));
    }

    #[tokio::test]
    async fn unverifiable_session_is_kept_on_other_errors() {
        let fx = fixture();
        fx.sessions.save(&saved("me")).expect("seed session");
        let platform = Arc::new(
            ScriptedPlatform::new()
                .with_verify_result(Err(PlatformError::Transport("gateway down".into())))
                .with_login_results(vec![Err(PlatformError::BadCredentials("nope".into()))]),
        );
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());
        let log = TaskLog::new("t");

        auth.authenticate(&Credentials::new("me", "pw"), &log)
            .await
            .expect_err("login rejected");

        assert_eq!(platform.calls(), vec!["verify_session", "login:me"]);
        let stored = fx.sessions.load("me").expect("load").expect("session kept");
        assert_eq!(stored.cookies.get("sessionid").map(String::as_str), Some("old"));
        assert!(log.contents().contains("could not use saved session"));
    }

    #[tokio::test]
    async fn fresh_policy_never_reuses_session() {
        let fx = fixture();
        fx.sessions.save(&saved("me")).expect("seed session");
        let platform = Arc::new(ScriptedPlatform::new());
        let config = AuthConfig {
            session_policy: SessionPolicy::Fresh,
            ..AuthConfig::immediate()
        };
        let auth = authenticator(&fx, &platform, config);

        auth.authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect("login");

        assert_eq!(platform.calls(), vec!["login:me"]);
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let fx = fixture();
        let platform = Arc::new(ScriptedPlatform::new().with_login_results(vec![
            Err(PlatformError::RateLimited("wait".into())),
            Err(PlatformError::Transport("reset".into())),
            Err(PlatformError::RateLimited("wait".into())),
        ]));
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());
        let log = TaskLog::new("t");

        let err = auth
            .authenticate(&Credentials::new("me", "pw"), &log)
            .await
            .expect_err("should exhaust");

        assert!(matches!(err, AuthError::Exhausted { attempts: 3, .. }));
        assert_eq!(platform.calls(), vec!["login:me", "login:me", "login:me"]);
        assert!(!fx.sessions.exists("me"));
        assert!(log.contents().contains("giving up after 3 attempts"));
    }

    #[tokio::test]
    async fn recovers_on_a_later_attempt() {
        let fx = fixture();
        let platform = Arc::new(ScriptedPlatform::new().with_login_results(vec![
            Err(PlatformError::RateLimited("wait".into())),
            Ok(()),
        ]));
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());

        auth.authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect("login");
        assert_eq!(platform.calls().len(), 2);
        assert!(fx.sessions.exists("me"));
    }

    #[tokio::test]
    async fn bad_credentials_stop_immediately() {
        let fx = fixture();
        let platform = Arc::new(ScriptedPlatform::new().with_login_results(vec![Err(
            PlatformError::BadCredentials("wrong password".into()),
        )]));
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());

        let err = auth
            .authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, AuthError::Rejected(PlatformError::BadCredentials(_))));
        assert_eq!(platform.calls().len(), 1);
    }

    #[tokio::test]
    async fn challenge_code_is_read_from_drop_file() {
        let fx = fixture();
        fx.codes
            .deliver("me", CodeKind::Challenge, "424242")
            .expect("write code");
        let platform = Arc::new(ScriptedPlatform::new().with_login_results(vec![Err(
            PlatformError::ChallengeRequired("sms".into()),
        )]));
        let auth = authenticator(&fx, &platform, AuthConfig::immediate());

        auth.authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect("login");

        assert_eq!(platform.calls(), vec!["login:me", "challenge:424242"]);
        assert!(!fx.codes.path_for("me", CodeKind::Challenge).exists());
        assert!(fx.sessions.exists("me"));
    }

    #[tokio::test]
    async fn two_factor_code_arrives_through_inbox() {
        let fx = fixture();
        let inbox = Arc::new(CodeInbox::new());
        let platform = Arc::new(ScriptedPlatform::new().with_login_results(vec![Err(
            PlatformError::TwoFactorRequired {
                identifier: "tf-1".into(),
            },
        )]));
        let auth = Authenticator::new(
            Arc::new(ScriptedFactory::new(Arc::clone(&platform))),
            fx.sessions.clone(),
            Arc::clone(&inbox) as Arc<dyn CodeSource>,
            AuthConfig::immediate(),
        );

        let login = tokio::spawn(async move {
            auth.authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
                .await
                .map(|_| ())
        });

        while !inbox.is_waiting("me", CodeKind::TwoFactor) {
            tokio::task::yield_now().await;
        }
        assert!(inbox.deliver("me", CodeKind::TwoFactor, "777000"));

        login.await.expect("join").expect("login");
        assert_eq!(platform.calls(), vec!["login:me", "two_factor:tf-1:777000"]);
    }

    #[tokio::test]
    async fn missing_challenge_code_aborts() {
        let fx = fixture();
        let platform = Arc::new(ScriptedPlatform::new().with_login_results(vec![Err(
            PlatformError::ChallengeRequired("email".into()),
        )]));
        let config = AuthConfig {
            code_timeout_secs: 0,
            ..AuthConfig::immediate()
        };
        let auth = authenticator(&fx, &platform, config);

        let err = auth
            .authenticate(&Credentials::new("me", "pw"), &TaskLog::new("t"))
            .await
            .expect_err("should fail");
        assert!(matches!(
            err,
            AuthError::Code {
                kind: CodeKind::Challenge,
                ..
            }
        ));
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let auth = Authenticator::new(
            Arc::new(ScriptedFactory::new(Arc::new(ScriptedPlatform::new()))),
            SessionStore::new("/unused"),
            Arc::new(CodeInbox::new()),
            AuthConfig {
                backoff_base_secs: DelayRange::fixed(60),
                ..AuthConfig::default()
            },
        );
        assert_eq!(auth.backoff(1), Duration::from_secs(60));
        assert_eq!(auth.backoff(2), Duration::from_secs(120));
        assert_eq!(auth.backoff(3), Duration::from_secs(240));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new(" me ", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("\"me\""));
        assert!(!debug.contains("hunter2"));
    }
}
