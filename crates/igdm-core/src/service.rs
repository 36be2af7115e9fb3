//! Outreach jobs: validation, background execution, and bookkeeping.
//!
//! [`OutreachService::submit`] registers a task and returns immediately; the
//! job itself runs on a tokio task that waits for a worker slot, logs in, runs
//! the pipeline, and writes the outcome back into the [`TaskRegistry`].
//! [`OutreachService::run_now`] runs the same job in the foreground.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    AuthError, Authenticator, CodeInbox, CodeSource, Credentials, FileCodeSource, SessionStore,
};
use crate::config::{AppConfig, CodeSourceKind, OutreachConfig, PacingConfig};
use crate::ledger::SentLedger;
use crate::paths::AppPaths;
use crate::pipeline::{OutreachPipeline, OutreachSummary, parse_targets};
use crate::platform::{ClientFactory, GatewayClientFactory};
use crate::tasks::{RegistryError, TaskHandle, TaskLog, TaskProgress, TaskRegistry};
use crate::{CoreError, Result};

/// Why a job did not produce a summary.
#[derive(Debug, Error)]
pub enum JobError {
    /// The request was incomplete.
    #[error("{0}")]
    InvalidRequest(String),

    /// The registry refused the task.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Login failed.
    #[error("login failed: {0}")]
    Auth(#[from] AuthError),

    /// The ledger could not be read or written.
    #[error("{0}")]
    Storage(#[from] CoreError),

    /// The job was cancelled before the pipeline started.
    #[error("cancelled")]
    Cancelled,
}

/// A validated outreach request.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Account to send from.
    pub credentials: Credentials,
    /// Accounts whose followers are contacted.
    pub targets: Vec<String>,
    /// Message body.
    pub message: String,
}

impl SubmitRequest {
    /// Validate raw form fields. `targets` is comma-separated.
    ///
    /// # Errors
    ///
    /// Returns an error if any field is blank.
    pub fn from_form(
        username: &str,
        password: &str,
        targets: &str,
        message: &str,
    ) -> std::result::Result<Self, JobError> {
        let credentials = Credentials::new(username, password);
        let targets = parse_targets(targets);
        let message = message.trim();

        let mut missing = Vec::new();
        if credentials.username.is_empty() {
            missing.push("username");
        }
        if credentials.password.is_empty() {
            missing.push("password");
        }
        if targets.is_empty() {
            missing.push("targets");
        }
        if message.is_empty() {
            missing.push("message");
        }
        if !missing.is_empty() {
            return Err(JobError::InvalidRequest(format!(
                "all fields are required (missing: {})",
                missing.join(", ")
            )));
        }

        Ok(Self {
            credentials,
            targets,
            message: message.to_string(),
        })
    }
}

/// Runs outreach jobs against shared stores.
#[derive(Debug, Clone)]
pub struct OutreachService {
    authenticator: Authenticator,
    ledger: Arc<SentLedger>,
    registry: Arc<TaskRegistry>,
    pacing: PacingConfig,
    outreach: OutreachConfig,
    slots: Arc<Semaphore>,
    inbox: Option<Arc<CodeInbox>>,
}

impl OutreachService {
    /// Create a service running one job at a time with default pacing.
    #[must_use]
    pub fn new(
        authenticator: Authenticator,
        ledger: Arc<SentLedger>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            authenticator,
            ledger,
            registry,
            pacing: PacingConfig::default(),
            outreach: OutreachConfig::default(),
            slots: Arc::new(Semaphore::new(1)),
            inbox: None,
        }
    }

    /// Build the service described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway HTTP client cannot be created.
    pub fn from_config(config: &AppConfig, paths: &AppPaths) -> Result<Self> {
        let factory: Arc<dyn ClientFactory> =
            Arc::new(GatewayClientFactory::new(&config.platform)?);

        let inbox = (config.auth.code_source == CodeSourceKind::Inbox)
            .then(|| Arc::new(CodeInbox::new()));
        let codes: Arc<dyn CodeSource> = match &inbox {
            Some(inbox) => Arc::clone(inbox) as Arc<dyn CodeSource>,
            None => Arc::new(FileCodeSource::new(
                paths.codes_dir(),
                Duration::from_secs(config.auth.code_poll_interval_secs),
            )),
        };

        let authenticator = Authenticator::new(
            factory,
            SessionStore::new(paths.sessions_dir()),
            codes,
            config.auth,
        );

        let service = Self::new(
            authenticator,
            Arc::new(SentLedger::new(paths.ledger_file())),
            Arc::new(TaskRegistry::from_config(&config.server)),
        )
        .with_pacing(config.pacing)
        .with_outreach(config.outreach.clone())
        .with_max_concurrent(config.server.max_concurrent_tasks);
        Ok(match inbox {
            Some(inbox) => service.with_code_inbox(inbox),
            None => service,
        })
    }

    /// Use the given delays.
    #[must_use]
    pub const fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    /// Use the given harvesting and message settings.
    #[must_use]
    pub fn with_outreach(mut self, outreach: OutreachConfig) -> Self {
        self.outreach = outreach;
        self
    }

    /// Allow up to `n` jobs to run at once.
    #[must_use]
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.slots = Arc::new(Semaphore::new(n.max(1)));
        self
    }

    /// Accept verification codes through `inbox`.
    #[must_use]
    pub fn with_code_inbox(mut self, inbox: Arc<CodeInbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Task registry.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Sent-users ledger.
    #[must_use]
    pub fn ledger(&self) -> &SentLedger {
        &self.ledger
    }

    /// Code inbox, when codes are delivered in-process.
    #[must_use]
    pub fn code_inbox(&self) -> Option<&CodeInbox> {
        self.inbox.as_deref()
    }

    /// Register a task and start it in the background. Returns the task ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry refuses the task.
    pub fn submit(&self, request: SubmitRequest) -> std::result::Result<String, RegistryError> {
        let handle = self.registry.create(&request.credentials.username)?;
        let task_id = handle.id.clone();
        log::info!(
            "task {task_id} registered for {} ({} targets)",
            request.credentials.username,
            request.targets.len()
        );

        let service = self.clone();
        tokio::spawn(async move { service.execute(handle, request).await });
        Ok(task_id)
    }

    /// Log in and run the pipeline in the foreground.
    ///
    /// # Errors
    ///
    /// Returns an error if login fails, the ledger cannot be used, or `cancel`
    /// fires before login completes.
    pub async fn run_now(
        &self,
        request: &SubmitRequest,
        log: &TaskLog,
        cancel: CancellationToken,
    ) -> std::result::Result<OutreachSummary, JobError> {
        self.run_job(request, log, cancel, None).await
    }

    async fn run_job(
        &self,
        request: &SubmitRequest,
        log: &TaskLog,
        cancel: CancellationToken,
        progress: Option<TaskProgress>,
    ) -> std::result::Result<OutreachSummary, JobError> {
        let client = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(JobError::Cancelled),
            client = self.authenticator.authenticate(&request.credentials, log) => client?,
        };

        let mut pipeline = OutreachPipeline::new(client, Arc::clone(&self.ledger), log.clone())
            .with_pacing(self.pacing)
            .with_outreach(self.outreach.clone())
            .with_cancellation(cancel);
        if let Some(progress) = progress {
            pipeline = pipeline.with_progress(progress);
        }
        Ok(pipeline.run(&request.targets, &request.message).await?)
    }

    async fn execute(self, handle: TaskHandle, request: SubmitRequest) {
        let TaskHandle { id, log, cancel } = handle;
        log.info(format!("Task started for {}", request.credentials.username));

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.registry.mark_cancelled(&id);
                return;
            }
            permit = Arc::clone(&self.slots).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            log.error("Worker pool closed");
            self.registry.fail(&id, "Worker pool closed");
            return;
        };

        self.registry.mark_processing(&id);
        let progress = TaskProgress::new(Arc::clone(&self.registry), &id);
        match self.run_job(&request, &log, cancel, Some(progress)).await {
            Ok(summary) => self.registry.finish(&id, &summary),
            Err(JobError::Cancelled) => {
                log.warn("Task cancelled before login completed");
                self.registry.mark_cancelled(&id);
            }
            Err(JobError::Auth(e)) => {
                log.error(format!("Login failed: {e}"));
                self.registry.fail(&id, &format!("Login failed: {e}"));
            }
            Err(e) => {
                log.error(format!("An error occurred: {e}"));
                self.registry.fail(&id, &format!("An error occurred: {e}"));
            }
        }
        log::info!("task {id} finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, DelayRange};
    use crate::platform::{PlatformError, UserId, UserShort};
    use crate::tasks::{TaskSnapshot, TaskStatus};
    use crate::testing::{ScriptedFactory, ScriptedPlatform};

    struct Fixture {
        _dir: tempfile::TempDir,
        service: OutreachService,
    }

    fn fixture(platform: &Arc<ScriptedPlatform>, pacing: PacingConfig) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let authenticator = Authenticator::new(
            Arc::new(ScriptedFactory::new(Arc::clone(platform))),
            SessionStore::new(dir.path().join("sessions")),
            Arc::new(CodeInbox::new()),
            AuthConfig::immediate(),
        );
        let service = OutreachService::new(
            authenticator,
            Arc::new(SentLedger::new(dir.path().join("sent_users.txt"))),
            Arc::new(TaskRegistry::new(16, Duration::from_secs(3600))),
        )
        .with_pacing(pacing);
        Fixture { _dir: dir, service }
    }

    fn follower(username: &str) -> UserShort {
        UserShort {
            pk: UserId(format!("id-{username}")),
            username: username.to_string(),
            full_name: None,
        }
    }

    fn request(username: &str) -> SubmitRequest {
        SubmitRequest::from_form(username, "pw", "acct_a", "hello").expect("valid request")
    }

    async fn wait_for(
        service: &OutreachService,
        task_id: &str,
        pred: impl Fn(&TaskSnapshot) -> bool,
    ) -> TaskSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(snap) = service.registry().snapshot(task_id) {
                    if pred(&snap) {
                        return snap;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not reach the expected state")
    }

    fn slow_messages() -> PacingConfig {
        PacingConfig {
            message_delay_secs: DelayRange::fixed(3600),
            ..PacingConfig::immediate()
        }
    }

    #[test]
    fn form_requires_every_field() {
        let err = SubmitRequest::from_form("me", "", " , ", "hi").expect_err("invalid");
        let text = err.to_string();
        assert!(text.contains("password"));
        assert!(text.contains("targets"));
        assert!(!text.contains("username"));

        let ok = SubmitRequest::from_form(" me ", "pw", "a, b", " hi ").expect("valid");
        assert_eq!(ok.credentials.username, "me");
        assert_eq!(ok.targets, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(ok.message, "hi");
    }

    #[tokio::test]
    async fn submitted_job_completes_in_background() {
        let platform = Arc::new(ScriptedPlatform::new().with_followers(
            "acct_a",
            vec![follower("u1"), follower("u2"), follower("u3")],
        ));
        let fx = fixture(&platform, PacingConfig::immediate());

        let task_id = fx.service.submit(request("me")).expect("submit");
        let snap = wait_for(&fx.service, &task_id, |s| s.status.is_finished()).await;

        assert_eq!(snap.status, TaskStatus::Complete);
        assert_eq!((snap.success, snap.failed), (3, 0));
        assert!(snap.logs.as_deref().is_some_and(|l| l.contains("DM sending complete")));
        assert_eq!(fx.service.ledger().load().await.expect("ledger").len(), 3);
    }

    #[tokio::test]
    async fn failed_login_is_an_error_without_side_effects() {
        let platform = Arc::new(
            ScriptedPlatform::new()
                .with_followers("acct_a", vec![follower("u1")])
                .with_login_results(vec![
                    Err(PlatformError::RateLimited("wait".into())),
                    Err(PlatformError::RateLimited("wait".into())),
                    Err(PlatformError::RateLimited("wait".into())),
                ]),
        );
        let fx = fixture(&platform, PacingConfig::immediate());

        let task_id = fx.service.submit(request("me")).expect("submit");
        let snap = wait_for(&fx.service, &task_id, |s| s.status.is_finished()).await;

        assert_eq!(snap.status, TaskStatus::Error);
        assert!(snap.message.starts_with("Login failed"));
        assert!(!fx.service.ledger().path().exists());
        assert!(platform.calls().iter().all(|c| c == "login:me"));
    }

    #[tokio::test]
    async fn second_job_for_same_account_is_refused() {
        let platform = Arc::new(
            ScriptedPlatform::new().with_followers("acct_a", vec![follower("u1"), follower("u2")]),
        );
        let fx = fixture(&platform, slow_messages());

        let first = fx.service.submit(request("me")).expect("submit");
        wait_for(&fx.service, &first, |_| !platform.sent_messages().is_empty()).await;

        assert!(matches!(
            fx.service.submit(request("me")),
            Err(RegistryError::AccountBusy { .. })
        ));

        fx.service.registry().cancel(&first).expect("cancel");
        let snap = wait_for(&fx.service, &first, |s| s.status.is_finished()).await;
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert_eq!(snap.success, 1);
    }

    #[tokio::test]
    async fn jobs_wait_for_a_free_slot() {
        let platform = Arc::new(
            ScriptedPlatform::new().with_followers("acct_a", vec![follower("u1"), follower("u2")]),
        );
        let fx = fixture(&platform, slow_messages());

        let running = fx.service.submit(request("first")).expect("submit");
        wait_for(&fx.service, &running, |s| s.status == TaskStatus::Processing).await;

        let queued = fx.service.submit(request("second")).expect("submit");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = fx.service.registry().snapshot(&queued).expect("snapshot");
        assert_eq!(snap.status, TaskStatus::Starting);

        fx.service.registry().cancel(&queued).expect("cancel queued");
        let snap = wait_for(&fx.service, &queued, |s| s.status.is_finished()).await;
        assert_eq!(snap.status, TaskStatus::Cancelled);

        fx.service.registry().cancel(&running).expect("cancel running");
        wait_for(&fx.service, &running, |s| s.status.is_finished()).await;
    }
}
