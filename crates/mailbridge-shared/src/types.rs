use serde::{Deserialize, Serialize};

use crate::error::IdError;

/// Chat-protocol user identity, `@localpart:server`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| IdError::InvalidUserId(s.to_string()))?;
        match rest.split_once(':') {
            Some((local, server)) if !local.is_empty() && !server.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(IdError::InvalidUserId(s.to_string())),
        }
    }

    pub fn new(localpart: &str, server: &str) -> Self {
        Self(format!("@{localpart}:{server}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn localpart(&self) -> &str {
        self.0[1..].split_once(':').map(|(l, _)| l).unwrap_or("")
    }

    pub fn server(&self) -> &str {
        self.0[1..].split_once(':').map(|(_, s)| s).unwrap_or("")
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `matrix.to` link used in notices pointing at an existing room.
    pub fn matrix_to_url(&self) -> String {
        format!("https://matrix.to/#/{}", self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Natural key of a bridged conversation: the remote thread (the contact's
/// address) and the local user receiving it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortalKey {
    pub thread_id: String,
    pub receiver: String,
}

impl PortalKey {
    pub fn new(thread_id: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            receiver: receiver.into(),
        }
    }
}

impl std::fmt::Display for PortalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.thread_id, self.receiver)
    }
}

/// Normalize a bare mail address (`local@domain`) to lowercase.
///
/// Display-name forms such as `Alice <alice@example.com>` are not accepted
/// here; use [`crate::mail::MailAddress::parse`] for header values.
pub fn normalize_address(raw: &str) -> Result<String, IdError> {
    let addr = raw.trim();
    let invalid = || IdError::InvalidAddress(raw.to_string());

    if addr.chars().any(|c| c.is_whitespace() || matches!(c, '<' | '>' | ',' | '"')) {
        return Err(invalid());
    }
    let (local, domain) = addr.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid());
    }
    Ok(addr.to_lowercase())
}

/// Permission level a chat user has on the bridge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    None = 0,
    Relay = 5,
    User = 10,
    Admin = 100,
}

impl PermissionLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "block" => Some(Self::None),
            "relay" => Some(Self::Relay),
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}
