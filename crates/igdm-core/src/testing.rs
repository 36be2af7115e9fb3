//! Scripted in-memory platform client for tests.
//!
//! Users are identified as `id-<username>`. Every call is recorded in order so
//! tests can assert exactly which platform actions happened.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::platform::{
    ClientFactory, ClientHandle, Friendship, PlatformClient, PlatformError, PlatformResult,
    SessionRecord, UserId, UserProfile, UserShort,
};

fn id_of(username: &str) -> UserId {
    UserId(format!("id-{username}"))
}

/// Platform double driven by a fixed script.
#[derive(Debug)]
pub struct ScriptedPlatform {
    login_results: Mutex<VecDeque<PlatformResult<()>>>,
    verify_result: PlatformResult<()>,
    followers: HashMap<String, Vec<UserShort>>,
    following: HashSet<UserId>,
    failing_follow: HashSet<UserId>,
    failing_send: HashSet<UserId>,
    session: Mutex<Option<SessionRecord>>,
    logins: Mutex<u32>,
    calls: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, Vec<UserId>)>>,
}

impl Default for ScriptedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPlatform {
    /// A platform where every login and action succeeds and nobody has followers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            login_results: Mutex::new(VecDeque::new()),
            verify_result: Ok(()),
            followers: HashMap::new(),
            following: HashSet::new(),
            failing_follow: HashSet::new(),
            failing_send: HashSet::new(),
            session: Mutex::new(None),
            logins: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Results returned by successive `login` calls; `Ok` once exhausted.
    #[must_use]
    pub fn with_login_results(self, results: Vec<PlatformResult<()>>) -> Self {
        *self.login_results.lock() = results.into();
        self
    }

    /// Result returned when a stored session is verified.
    #[must_use]
    pub fn with_verify_result(mut self, result: PlatformResult<()>) -> Self {
        self.verify_result = result;
        self
    }

    /// Followers listed for `target`.
    #[must_use]
    pub fn with_followers(mut self, target: &str, followers: Vec<UserShort>) -> Self {
        self.followers.insert(target.to_string(), followers);
        self
    }

    /// Mark `username` as already followed.
    #[must_use]
    pub fn with_following(mut self, username: &str) -> Self {
        self.following.insert(id_of(username));
        self
    }

    /// Make following `username` fail.
    #[must_use]
    pub fn with_failing_follow(mut self, username: &str) -> Self {
        self.failing_follow.insert(id_of(username));
        self
    }

    /// Make messaging `username` fail.
    #[must_use]
    pub fn with_failing_send(mut self, username: &str) -> Self {
        self.failing_send.insert(id_of(username));
        self
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Messages sent so far with their recipients.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<(String, Vec<UserId>)> {
        self.sent.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn is_known(&self, username: &str) -> bool {
        self.followers.contains_key(username)
            || self
                .followers
                .values()
                .flatten()
                .any(|f| f.username == username)
    }

    fn full_name_of(&self, username: &str) -> String {
        self.followers
            .values()
            .flatten()
            .find(|f| f.username == username)
            .and_then(|f| f.full_name.clone())
            .unwrap_or_default()
    }

    fn establish_session(&self, username: &str) {
        let n = {
            let mut logins = self.logins.lock();
            *logins += 1;
            *logins
        };
        let mut session = self.session.lock();
        let mut record = session.take().unwrap_or_default();
        record.username = username.to_string();
        record.user_id = Some(id_of(username));
        record
            .cookies
            .insert("sessionid".to_string(), format!("fresh-{n}"));
        *session = Some(record);
    }

    fn pending_username(&self) -> String {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.username.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlatformClient for ScriptedPlatform {
    fn load_session(&self, record: &SessionRecord) {
        *self.session.lock() = Some(record.clone());
    }

    fn dump_session(&self) -> PlatformResult<SessionRecord> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| PlatformError::LoginRequired("no session".to_string()))
    }

    async fn login(&self, username: &str, _password: &str) -> PlatformResult<()> {
        self.record(format!("login:{username}"));
        let result = self.login_results.lock().pop_front().unwrap_or(Ok(()));
        match result {
            Ok(()) => {
                self.establish_session(username);
                Ok(())
            }
            Err(e) => {
                self.session
                    .lock()
                    .get_or_insert_with(SessionRecord::default)
                    .username = username.to_string();
                Err(e)
            }
        }
    }

    async fn verify_session(&self) -> PlatformResult<()> {
        self.record("verify_session".to_string());
        if self.session.lock().is_none() {
            return Err(PlatformError::LoginRequired("no session".to_string()));
        }
        self.verify_result.clone()
    }

    async fn submit_challenge_code(&self, code: &str) -> PlatformResult<()> {
        self.record(format!("challenge:{code}"));
        let username = self.pending_username();
        self.establish_session(&username);
        Ok(())
    }

    async fn login_two_factor(
        &self,
        username: &str,
        _password: &str,
        identifier: &str,
        code: &str,
    ) -> PlatformResult<()> {
        self.record(format!("two_factor:{identifier}:{code}"));
        self.establish_session(username);
        Ok(())
    }

    async fn user_id_from_username(&self, username: &str) -> PlatformResult<UserId> {
        self.record(format!("user_id:{username}"));
        if self.is_known(username) {
            Ok(id_of(username))
        } else {
            Err(PlatformError::NotFound(username.to_string()))
        }
    }

    async fn user_followers(
        &self,
        user_id: &UserId,
        amount: u32,
    ) -> PlatformResult<Vec<UserShort>> {
        self.record(format!("followers:{user_id}"));
        let target = user_id.as_str().trim_start_matches("id-");
        Ok(self
            .followers
            .get(target)
            .map(|list| list.iter().take(amount as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn friendship(&self, user_id: &UserId) -> PlatformResult<Friendship> {
        self.record(format!("friendship:{user_id}"));
        Ok(Friendship {
            following: self.following.contains(user_id),
            outgoing_request: false,
        })
    }

    async fn follow(&self, user_id: &UserId) -> PlatformResult<()> {
        self.record(format!("follow:{user_id}"));
        if self.failing_follow.contains(user_id) {
            return Err(PlatformError::RateLimited("follow blocked".to_string()));
        }
        Ok(())
    }

    async fn user_info_by_username(&self, username: &str) -> PlatformResult<UserProfile> {
        self.record(format!("user_info:{username}"));
        if !self.is_known(username) {
            return Err(PlatformError::NotFound(username.to_string()));
        }
        Ok(UserProfile {
            pk: id_of(username),
            username: username.to_string(),
            full_name: self.full_name_of(username),
        })
    }

    async fn direct_send(&self, text: &str, recipients: &[UserId]) -> PlatformResult<()> {
        let ids: Vec<_> = recipients.iter().map(UserId::as_str).collect();
        self.record(format!("direct_send:{}", ids.join(",")));
        if recipients.iter().any(|r| self.failing_send.contains(r)) {
            return Err(PlatformError::Other("feedback_required".to_string()));
        }
        self.sent
            .lock()
            .push((text.to_string(), recipients.to_vec()));
        Ok(())
    }
}

/// Factory handing out the same scripted platform every time.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    platform: Arc<ScriptedPlatform>,
}

impl ScriptedFactory {
    /// Wrap a scripted platform.
    #[must_use]
    pub const fn new(platform: Arc<ScriptedPlatform>) -> Self {
        Self { platform }
    }
}

impl ClientFactory for ScriptedFactory {
    fn create(&self) -> ClientHandle {
        Arc::clone(&self.platform) as ClientHandle
    }
}
