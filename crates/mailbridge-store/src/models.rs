//! Row types persisted in the bridge database.

use mailbridge_shared::types::{EventId, PortalKey, RoomId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// One local bridge account.
#[derive(Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub mxid: UserId,
    /// Mail address the user is logged in as; `None` while logged out.
    pub email_address: Option<String>,
    /// Sealed mail password (hex), never logged.
    pub credential: Option<String>,
    pub management_room: Option<RoomId>,
    pub space_room: Option<RoomId>,
}

impl UserRecord {
    pub fn new(mxid: UserId) -> Self {
        Self {
            mxid,
            email_address: None,
            credential: None,
            management_room: None,
            space_room: None,
        }
    }
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("mxid", &self.mxid)
            .field("email_address", &self.email_address)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("management_room", &self.management_room)
            .field("space_room", &self.space_room)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Puppet
// ---------------------------------------------------------------------------

/// A remote address represented in the chat network by a ghost.
#[derive(Clone, PartialEq, Eq)]
pub struct PuppetRecord {
    pub email_address: String,
    pub display_name: String,
    /// Whether `display_name` has been pushed to the chat network.
    pub name_set: bool,
    /// Local user this address belongs to (double puppet).
    pub custom_mxid: Option<UserId>,
    pub access_token: Option<String>,
}

impl PuppetRecord {
    pub fn new(email_address: impl Into<String>) -> Self {
        Self {
            email_address: email_address.into(),
            display_name: String::new(),
            name_set: false,
            custom_mxid: None,
            access_token: None,
        }
    }
}

impl std::fmt::Debug for PuppetRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PuppetRecord")
            .field("email_address", &self.email_address)
            .field("display_name", &self.display_name)
            .field("name_set", &self.name_set)
            .field("custom_mxid", &self.custom_mxid)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Portal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortalRecord {
    pub key: PortalKey,
    /// Bound chat room; `None` until the first room is created or bound.
    pub mxid: Option<RoomId>,
    pub name: String,
    pub topic: String,
    pub avatar_hash: String,
    pub avatar_url: String,
    pub name_set: bool,
    pub avatar_set: bool,
    pub topic_set: bool,
    pub revision: u32,
    pub encrypted: bool,
    pub relay_user_id: Option<UserId>,
    /// Disappearing-message timer in seconds; 0 disables it.
    pub expiration_time: u32,
}

impl PortalRecord {
    pub fn new(key: PortalKey) -> Self {
        Self {
            key,
            mxid: None,
            name: String::new(),
            topic: String::new(),
            avatar_hash: String::new(),
            avatar_url: String::new(),
            name_set: false,
            avatar_set: false,
            topic_set: false,
            revision: 0,
            encrypted: false,
            relay_user_id: None,
            expiration_time: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Dedup/edit index entry for one bridged message part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub sender: String,
    /// Remote timestamp in unix milliseconds.
    pub timestamp: i64,
    pub part_index: u32,
    pub thread_id: String,
    pub receiver: String,
    pub mxid: EventId,
    pub room_id: RoomId,
    /// `Message-ID` of the mail, used for reply threading.
    pub remote_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let mut user = UserRecord::new(UserId::new("bob", "hs"));
        user.credential = Some("deadbeef".into());
        let rendered = format!("{user:?}");
        assert!(!rendered.contains("deadbeef"));
        assert!(rendered.contains("<redacted>"));

        let mut puppet = PuppetRecord::new("alice@example.com");
        puppet.access_token = Some("syt_secret".into());
        assert!(!format!("{puppet:?}").contains("syt_secret"));
    }
}
