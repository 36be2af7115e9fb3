//! Platform client seam.
//!
//! The social-network protocol itself lives outside this crate. Everything the
//! authenticator and the outreach pipeline need from it goes through the
//! [`PlatformClient`] trait:
//! - session load/dump and validation
//! - credential, challenge, and two-factor login
//! - follower listing, friendship lookup, follow, and direct messages
//!
//! [`GatewayClient`] implements the trait against an external gateway service.

pub mod gateway;
pub mod models;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use gateway::{GatewayClient, GatewayClientFactory};
pub use models::{DeviceIds, Friendship, SessionRecord, UserId, UserProfile, UserShort};

/// Errors reported by a platform client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The session is missing or no longer accepted.
    #[error("login required: {0}")]
    LoginRequired(String),

    /// The platform wants an out-of-band verification code before continuing.
    #[error("challenge required: {0}")]
    ChallengeRequired(String),

    /// The account has two-factor authentication enabled.
    #[error("two-factor authentication required")]
    TwoFactorRequired {
        /// Identifier the platform expects back with the code.
        identifier: String,
    },

    /// Username or password was rejected.
    #[error("bad credentials: {0}")]
    BadCredentials(String),

    /// The platform throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The requested user or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport failure talking to the platform or gateway.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other platform failure.
    #[error("platform error: {0}")]
    Other(String),
}

impl PlatformError {
    /// Whether another login attempt could succeed after a backoff.
    ///
    /// Rejected credentials are permanent; everything else is worth a retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::BadCredentials(_))
    }
}

/// Result alias for platform calls.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Operations the outreach system needs from the social platform.
///
/// Implementations keep their own session state behind `&self` so a handle can
/// be shared as `Arc<dyn PlatformClient>` once authenticated.
#[async_trait]
pub trait PlatformClient: Send + Sync + std::fmt::Debug {
    /// Install a previously saved session.
    fn load_session(&self, record: &SessionRecord);

    /// Snapshot the current session for persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if the client holds no session.
    fn dump_session(&self) -> PlatformResult<SessionRecord>;

    /// Log in with credentials, reusing any installed device identifiers.
    async fn login(&self, username: &str, password: &str) -> PlatformResult<()>;

    /// Issue a lightweight authenticated request to check the installed session.
    async fn verify_session(&self) -> PlatformResult<()>;

    /// Answer a pending challenge with the verification code.
    async fn submit_challenge_code(&self, code: &str) -> PlatformResult<()>;

    /// Complete a two-factor login.
    async fn login_two_factor(
        &self,
        username: &str,
        password: &str,
        identifier: &str,
        code: &str,
    ) -> PlatformResult<()>;

    /// Resolve a handle to a user ID.
    async fn user_id_from_username(&self, username: &str) -> PlatformResult<UserId>;

    /// List up to `amount` followers of a user.
    async fn user_followers(&self, user_id: &UserId, amount: u32) -> PlatformResult<Vec<UserShort>>;

    /// Relationship between the logged-in account and a user.
    async fn friendship(&self, user_id: &UserId) -> PlatformResult<Friendship>;

    /// Follow a user.
    async fn follow(&self, user_id: &UserId) -> PlatformResult<()>;

    /// Fetch profile details by handle.
    async fn user_info_by_username(&self, username: &str) -> PlatformResult<UserProfile>;

    /// Send a direct message to the given users.
    async fn direct_send(&self, text: &str, recipients: &[UserId]) -> PlatformResult<()>;
}

/// Shared handle to an authenticated client.
pub type ClientHandle = Arc<dyn PlatformClient>;

/// Creates fresh, unauthenticated platform clients.
pub trait ClientFactory: Send + Sync + std::fmt::Debug {
    /// Build a new client.
    fn create(&self) -> ClientHandle;
}
