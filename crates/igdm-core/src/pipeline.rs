//! The outreach pipeline.
//!
//! Given an authenticated client, a list of target accounts, and a message body:
//! 1. harvest up to `followers_per_target` followers of every target, skipping
//!    anyone already in the ledger;
//! 2. for each candidate in order, follow if needed, personalize the message,
//!    send it, and record the recipient;
//! 3. pause between candidates using the configured randomized delays.
//!
//! Per-user failures are counted and logged; they never stop the run.
//! Cancellation is checked at every pause and platform call.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::{DelayRange, OutreachConfig, PacingConfig};
use crate::ledger::SentLedger;
use crate::platform::{ClientHandle, PlatformError, PlatformResult, UserProfile};
use crate::tasks::{TaskLog, TaskProgress, TaskStatus};

/// Split a comma-separated target list, dropping blanks and leading `@`.
#[must_use]
pub fn parse_targets(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().trim_start_matches('@').trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the personalized message for one recipient.
///
/// The greeting has `{name}` replaced by the display name and is followed by a
/// blank line and the body. The body may use `{name}` and `{username}`.
#[must_use]
pub fn compose_message(greeting: &str, profile: &UserProfile, body: &str) -> String {
    let name = profile.display_name();
    let fill = |text: &str| {
        text.replace("{name}", name)
            .replace("{username}", &profile.username)
    };

    let greeting = fill(greeting);
    let body = fill(body);
    if greeting.trim().is_empty() {
        body
    } else {
        format!("{greeting}\n\n{body}")
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutreachSummary {
    /// Terminal status: complete, error, or cancelled.
    pub status: TaskStatus,
    /// Candidates that reached an outcome.
    pub attempted: u32,
    /// Messages sent.
    pub success: u32,
    /// Per-user failures.
    pub failed: u32,
    /// Human-readable status line.
    pub message: String,
    /// Recipients that were messaged, in order.
    pub succeeded: Vec<String>,
    /// Candidates that failed, in order.
    pub failed_users: Vec<String>,
}

impl OutreachSummary {
    fn empty(status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            ..Self::default()
        }
    }
}

/// How a single candidate ended.
enum Outcome {
    Sent,
    Failed(String),
    Cancelled,
}

/// Why a guarded step did not produce a value.
enum Interrupt {
    Cancelled,
    Platform(&'static str, PlatformError),
}

impl From<Interrupt> for Outcome {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => Self::Cancelled,
            Interrupt::Platform(step, e) => Self::Failed(format!("{step}: {e}")),
        }
    }
}

/// Sequential, rate-limited outreach over an authenticated client.
#[derive(Debug)]
pub struct OutreachPipeline {
    client: ClientHandle,
    ledger: Arc<SentLedger>,
    log: TaskLog,
    pacing: PacingConfig,
    outreach: OutreachConfig,
    cancel: CancellationToken,
    progress: Option<TaskProgress>,
}

impl OutreachPipeline {
    /// Create a pipeline with default pacing and outreach settings.
    #[must_use]
    pub fn new(client: ClientHandle, ledger: Arc<SentLedger>, log: TaskLog) -> Self {
        Self {
            client,
            ledger,
            log,
            pacing: PacingConfig::default(),
            outreach: OutreachConfig::default(),
            cancel: CancellationToken::new(),
            progress: None,
        }
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

    /// Stop early when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish counters to a task record after every candidate.
    #[must_use]
    pub fn with_progress(mut self, progress: TaskProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run outreach against `targets` with the message `body`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or written. Platform
    /// failures are reported in the summary instead.
    pub async fn run(&self, targets: &[String], body: &str) -> Result<OutreachSummary> {
        let sent = self.ledger.load().await?;
        self.log
            .info(format!("{} users already contacted", sent.len()));

        let Some(candidates) = self.collect_candidates(targets, &sent).await else {
            return Ok(self.cancelled(OutreachSummary::default()));
        };

        if candidates.is_empty() {
            self.log.error("No new followers to message");
            return Ok(OutreachSummary::empty(
                TaskStatus::Error,
                "No new followers available to message",
            ));
        }
        self.log
            .info(format!("{} candidates to contact", candidates.len()));

        let mut summary = OutreachSummary::default();
        let total = candidates.len();

        for (index, candidate) in candidates.iter().enumerate() {
            let is_last = index + 1 == total;

            match self.contact(candidate, body).await {
                Outcome::Sent => {
                    self.ledger.append(candidate).await?;
                    summary.success += 1;
                    summary.attempted += 1;
                    summary.succeeded.push(candidate.clone());
                    self.report(&summary);
                    self.log.info(format!(
                        "Sent message to {candidate} ({}/{total})",
                        index + 1
                    ));
                    if !is_last
                        && !self.pause(self.pacing.message_delay_secs, "next message").await
                    {
                        return Ok(self.cancelled(summary));
                    }
                }
                Outcome::Failed(reason) => {
                    summary.failed += 1;
                    summary.attempted += 1;
                    summary.failed_users.push(candidate.clone());
                    self.report(&summary);
                    self.log
                        .error(format!("Failed to message {candidate}: {reason}"));
                    if !is_last && !self.pause(self.pacing.failure_delay_secs, "next user").await {
                        return Ok(self.cancelled(summary));
                    }
                }
                Outcome::Cancelled => return Ok(self.cancelled(summary)),
            }
        }

        summary.status = TaskStatus::Complete;
        summary.message = format!(
            "DM sending complete: {} succeeded, {} failed",
            summary.success, summary.failed
        );
        self.log.info(&summary.message);
        Ok(summary)
    }

    /// Returns `None` when cancelled while harvesting.
    async fn collect_candidates(
        &self,
        targets: &[String],
        sent: &HashSet<String>,
    ) -> Option<Vec<String>> {
        let mut candidates = Vec::new();

        for target in targets {
            let followers = match self.followers_of(target).await {
                Ok(followers) => followers,
                Err(Interrupt::Cancelled) => return None,
                Err(Interrupt::Platform(step, e)) => {
                    self.log
                        .warn(format!("Could not fetch followers of {target} ({step}): {e}"));
                    continue;
                }
            };

            let before = candidates.len();
            candidates.extend(
                followers
                    .into_iter()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty() && !sent.contains(name)),
            );
            self.log.info(format!(
                "{target}: {} new followers",
                candidates.len() - before
            ));
        }

        Some(candidates)
    }

    async fn followers_of(&self, target: &str) -> std::result::Result<Vec<String>, Interrupt> {
        let user_id = self
            .guard("user lookup", self.client.user_id_from_username(target))
            .await?;
        let followers = self
            .guard(
                "follower listing",
                self.client
                    .user_followers(&user_id, self.outreach.followers_per_target),
            )
            .await?;
        Ok(followers.into_iter().map(|f| f.username).collect())
    }

    async fn contact(&self, username: &str, body: &str) -> Outcome {
        match self.try_contact(username, body).await {
            Ok(()) => Outcome::Sent,
            Err(interrupt) => interrupt.into(),
        }
    }

    async fn try_contact(&self, username: &str, body: &str) -> std::result::Result<(), Interrupt> {
        let user_id = self
            .guard("user lookup", self.client.user_id_from_username(username))
            .await?;
        let friendship = self
            .guard("friendship check", self.client.friendship(&user_id))
            .await?;

        if friendship.following {
            self.log.info(format!("Already following {username}"));
        } else {
            self.guard("follow", self.client.follow(&user_id)).await?;
            self.log.info(format!("Followed {username}"));
            if !self.pause(self.pacing.follow_delay_secs, "after follow").await {
                return Err(Interrupt::Cancelled);
            }
        }

        let profile = self
            .guard("profile lookup", self.client.user_info_by_username(username))
            .await?;
        let text = compose_message(&self.outreach.greeting, &profile, body);
        self.guard(
            "direct message",
            self.client.direct_send(&text, std::slice::from_ref(&profile.pk)),
        )
        .await
    }

    /// Race a platform call against cancellation.
    async fn guard<T>(
        &self,
        step: &'static str,
        call: impl Future<Output = PlatformResult<T>>,
    ) -> std::result::Result<T, Interrupt> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            result = call => result.map_err(|e| Interrupt::Platform(step, e)),
        }
    }

    /// Sleep for a random delay. Returns `false` if cancelled first.
    async fn pause(&self, range: DelayRange, reason: &str) -> bool {
        let delay = range.sample();
        if !delay.is_zero() {
            self.log
                .info(format!("Waiting {}s ({reason})", delay.as_secs()));
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn report(&self, summary: &OutreachSummary) {
        if let Some(progress) = &self.progress {
            progress.update(summary);
        }
    }

    fn cancelled(&self, mut summary: OutreachSummary) -> OutreachSummary {
        summary.status = TaskStatus::Cancelled;
        summary.message = format!(
            "Cancelled: {} succeeded, {} failed",
            summary.success, summary.failed
        );
        self.log.warn(&summary.message);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::platform::{UserId, UserShort};
    use crate::tasks::TaskRegistry;
    use crate::testing::ScriptedPlatform;

    fn user(pk: &str, username: &str, full_name: &str) -> UserProfile {
        UserProfile {
            pk: UserId::from(pk),
            username: username.to_string(),
            full_name: full_name.to_string(),
        }
    }

    fn follower(username: &str) -> UserShort {
        UserShort {
            pk: UserId(format!("id-{username}")),
            username: username.to_string(),
            full_name: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<SentLedger>,
        log: TaskLog,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Arc::new(SentLedger::new(dir.path().join("sent_users.txt")));
        Fixture {
            _dir: dir,
            ledger,
            log: TaskLog::new("test"),
        }
    }

    fn pipeline(fx: &Fixture, platform: &Arc<ScriptedPlatform>) -> OutreachPipeline {
        OutreachPipeline::new(
            Arc::clone(platform) as ClientHandle,
            Arc::clone(&fx.ledger),
            fx.log.clone(),
        )
        .with_pacing(PacingConfig::immediate())
    }

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    fn three_followers() -> Arc<ScriptedPlatform> {
        Arc::new(ScriptedPlatform::new().with_followers(
            "acct_a",
            vec![follower("u1"), follower("u2"), follower("u3")],
        ))
    }

    #[test]
    fn targets_are_trimmed_and_split() {
        assert_eq!(
            parse_targets(" acct_a, @acct_b ,,  "),
            vec!["acct_a".to_string(), "acct_b".to_string()]
        );
        assert!(parse_targets("").is_empty());
    }

    #[test]
    fn message_uses_display_name_with_fallback() {
        let body = "Hi {username}, love your work.";
        assert_eq!(
            compose_message("{name}様", &user("1", "jane", "Jane Doe"), body),
            "Jane Doe様\n\nHi jane, love your work."
        );
        assert_eq!(
            compose_message("{name}様", &user("2", "bob", ""), "Hello"),
            "bob様\n\nHello"
        );
        assert_eq!(compose_message("", &user("3", "amy", "Amy"), "{name}!"), "Amy!");
    }

    #[tokio::test]
    async fn messages_every_new_follower() {
        let fx = fixture();
        let platform = three_followers();

        let summary = pipeline(&fx, &platform)
            .run(&targets(&["acct_a"]), "hello")
            .await
            .expect("run");

        assert_eq!(summary.status, TaskStatus::Complete);
        assert_eq!((summary.success, summary.failed, summary.attempted), (3, 0, 3));
        assert_eq!(summary.message, "DM sending complete: 3 succeeded, 0 failed");
        assert_eq!(fx.ledger.load().await.expect("ledger").len(), 3);
        assert_eq!(platform.sent_messages().len(), 3);
        assert_eq!(platform.sent_messages()[0].0, "u1様\n\nhello");
    }

    #[tokio::test]
    async fn skips_users_already_in_ledger() {
        let fx = fixture();
        fx.ledger.append("u1").await.expect("seed");
        fx.ledger.append("u3").await.expect("seed");
        let platform = three_followers();

        let summary = pipeline(&fx, &platform)
            .run(&targets(&["acct_a"]), "hello")
            .await
            .expect("run");

        assert_eq!((summary.success, summary.failed), (1, 0));
        assert_eq!(summary.succeeded, vec!["u2".to_string()]);
        let recipients: Vec<_> = platform
            .sent_messages()
            .into_iter()
            .flat_map(|(_, to)| to)
            .collect();
        assert_eq!(recipients, vec![UserId::from("id-u2")]);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_an_error_without_actions() {
        let fx = fixture();
        for name in ["u1", "u2", "u3"] {
            fx.ledger.append(name).await.expect("seed");
        }
        let platform = three_followers();

        let summary = pipeline(&fx, &platform)
            .run(&targets(&["acct_a", "missing"]), "hello")
            .await
            .expect("run");

        assert_eq!(summary.status, TaskStatus::Error);
        assert_eq!(summary.attempted, 0);
        assert!(platform.sent_messages().is_empty());
        assert!(
            !platform
                .calls()
                .iter()
                .any(|c| c.starts_with("follow:") || c.starts_with("direct_send"))
        );
        assert!(fx.log.contents().contains("Could not fetch followers of missing"));
    }

    #[tokio::test]
    async fn failures_are_isolated_and_not_recorded() {
        let fx = fixture();
        let platform = Arc::new(
            ScriptedPlatform::new()
                .with_followers(
                    "acct_a",
                    vec![follower("u1"), follower("u2"), follower("u3"), follower("u4")],
                )
                .with_failing_follow("u2")
                .with_failing_send("u3"),
        );

        let summary = pipeline(&fx, &platform)
            .run(&targets(&["acct_a"]), "hello")
            .await
            .expect("run");

        assert_eq!(summary.status, TaskStatus::Complete);
        assert_eq!((summary.success, summary.failed), (2, 2));
        assert_eq!(summary.success + summary.failed, summary.attempted);
        assert_eq!(summary.failed_users, vec!["u2".to_string(), "u3".to_string()]);

        let ledger = fx.ledger.load().await.expect("ledger");
        assert_eq!(
            ledger,
            ["u1", "u4"].into_iter().map(str::to_string).collect::<HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn already_followed_users_are_not_followed_again() {
        let fx = fixture();
        let platform = Arc::new(
            ScriptedPlatform::new()
                .with_followers("acct_a", vec![follower("u1"), follower("u2")])
                .with_following("u1"),
        );

        pipeline(&fx, &platform)
            .run(&targets(&["acct_a"]), "hello")
            .await
            .expect("run");

        let follows: Vec<_> = platform
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("follow:"))
            .collect();
        assert_eq!(follows, vec!["follow:id-u2".to_string()]);
    }

    #[tokio::test]
    async fn duplicates_across_targets_are_kept() {
        let fx = fixture();
        let platform = Arc::new(
            ScriptedPlatform::new()
                .with_followers("acct_a", vec![follower("u1")])
                .with_followers("acct_b", vec![follower("u1"), follower("u2")]),
        );

        let summary = pipeline(&fx, &platform)
            .run(&targets(&["acct_a", "acct_b"]), "hello")
            .await
            .expect("run");

        assert_eq!(summary.attempted, 3);
    }

    #[tokio::test]
    async fn counters_reach_the_task_record_before_the_run_ends() {
        let fx = fixture();
        let platform = three_followers();
        let registry = Arc::new(TaskRegistry::new(4, Duration::from_secs(3600)));
        let handle = registry.create("me").expect("create");
        registry.mark_processing(&handle.id);

        let summary = pipeline(&fx, &platform)
            .with_progress(TaskProgress::new(Arc::clone(&registry), &handle.id))
            .run(&targets(&["acct_a"]), "hello")
            .await
            .expect("run");

        let snap = registry.snapshot(&handle.id).expect("snapshot");
        assert_eq!(snap.status, TaskStatus::Processing);
        assert_eq!((snap.success, snap.failed, snap.attempted), (3, 0, 3));
        assert_eq!(snap.attempted, summary.attempted);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_candidate() {
        let fx = fixture();
        let platform = three_followers();
        let cancel = CancellationToken::new();
        let pacing = PacingConfig {
            message_delay_secs: DelayRange::fixed(3600),
            ..PacingConfig::immediate()
        };
        let pipeline = pipeline(&fx, &platform)
            .with_pacing(pacing)
            .with_cancellation(cancel.clone());

        let run = tokio::spawn(async move { pipeline.run(&targets(&["acct_a"]), "hello").await });
        while platform.sent_messages().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let summary = run.await.expect("join").expect("run");
        assert_eq!(summary.status, TaskStatus::Cancelled);
        assert_eq!((summary.success, summary.failed), (1, 0));
        assert_eq!(fx.ledger.load().await.expect("ledger").len(), 1);
    }
}
