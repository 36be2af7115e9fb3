//! Data models exchanged with the platform client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Numeric platform user identifier, carried as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A follower entry as returned by follower listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserShort {
    /// User ID.
    pub pk: UserId,
    /// Handle, without the leading `@`.
    pub username: String,
    /// Display name, if the user set one.
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Profile details used to personalize a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User ID.
    pub pk: UserId,
    /// Handle, without the leading `@`.
    pub username: String,
    /// Display name; empty when unset.
    #[serde(default)]
    pub full_name: String,
}

impl UserProfile {
    /// Display name, falling back to the handle when none is set.
    #[must_use]
    pub fn display_name(&self) -> &str {
        let name = self.full_name.trim();
        if name.is_empty() { &self.username } else { name }
    }
}

/// Relationship between the logged-in account and another user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friendship {
    /// Whether the logged-in account follows the user.
    pub following: bool,
    /// Whether a follow request is pending (private accounts).
    #[serde(default)]
    pub outgoing_request: bool,
}

/// Device identifiers that must stay stable across logins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIds {
    /// Client UUID.
    pub uuid: String,
    /// Phone identifier.
    pub phone_id: String,
    /// Platform device identifier.
    pub device_id: String,
    /// Advertising identifier.
    pub advertising_id: String,
}

/// Serialized authentication state allowing an account to skip interactive login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Account the session belongs to.
    pub username: String,
    /// Platform user ID of the logged-in account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Session cookies.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// Device identifiers.
    #[serde(default)]
    pub device: DeviceIds,
    /// Authorization header value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    /// Unix seconds when the record was last written.
    #[serde(default)]
    pub saved_at: i64,
    /// Client-specific settings carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionRecord {
    /// Whether the record holds anything that could authenticate a request.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.authorization.is_some() || !self.cookies.is_empty()
    }
}
