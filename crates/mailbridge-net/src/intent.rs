//! Chat-network boundary.
//!
//! Every call is made *as* some identity: the bridge bot, a ghost, or a
//! double-puppeted local user. [`ChatTransport`] hands out those handles.

use std::sync::Arc;

use async_trait::async_trait;
use mailbridge_shared::event::MessageContent;
use mailbridge_shared::types::{EventId, RoomId, UserId};
use serde_json::Value;

use crate::error::IntentError;

#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

/// Parameters for creating a room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRoom {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub invite: Vec<UserId>,
    pub is_direct: bool,
    /// `Some("m.space")` creates a space.
    pub room_type: Option<String>,
    pub initial_state: Vec<StateEvent>,
}

#[async_trait]
pub trait Intent: Send + Sync {
    fn user_id(&self) -> &UserId;

    /// Make sure the account behind this intent exists.
    async fn ensure_registered(&self) -> Result<(), IntentError>;

    /// Resolve the identity the credential actually belongs to.
    async fn whoami(&self) -> Result<UserId, IntentError>;

    async fn send_message(
        &self,
        room: &RoomId,
        content: &MessageContent,
    ) -> Result<EventId, IntentError>;

    async fn send_event(
        &self,
        room: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<EventId, IntentError>;

    async fn send_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<EventId, IntentError>;

    async fn get_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, IntentError>;

    /// Invite a user. Fails with [`IntentError::AlreadyInRoom`] if the user
    /// is already joined.
    async fn invite(&self, room: &RoomId, user: &UserId) -> Result<(), IntentError>;

    async fn join(&self, room: &RoomId) -> Result<(), IntentError>;

    async fn leave(&self, room: &RoomId) -> Result<(), IntentError>;

    async fn create_room(&self, request: &CreateRoom) -> Result<RoomId, IntentError>;

    async fn set_display_name(&self, name: &str) -> Result<(), IntentError>;

    async fn redact(
        &self,
        room: &RoomId,
        event: &EventId,
        reason: Option<&str>,
    ) -> Result<EventId, IntentError>;

    /// Upload media and return its `mxc://` URI.
    async fn upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, IntentError>;

    async fn download(&self, mxc: &str) -> Result<Vec<u8>, IntentError>;
}

pub trait ChatTransport: Send + Sync {
    /// The bridge's own service identity.
    fn bot(&self) -> Arc<dyn Intent>;

    /// Intent for a ghost in the bridge's namespace.
    fn intent_for(&self, user: &UserId) -> Arc<dyn Intent>;

    /// Intent acting as a real local user with their own access token.
    fn double_puppet(&self, user: &UserId, access_token: &str) -> Arc<dyn Intent>;
}
