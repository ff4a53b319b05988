//! In-process loopback implementations of both network boundaries.
//!
//! `MemoryMailNetwork` is a tiny post office: accounts, mailboxes and
//! listeners. `MemoryHomeserver` keeps rooms, memberships, state and a
//! timeline per room. Both record what was sent through them, can inject
//! failures, and track how many sends were in flight at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mailbridge_shared::event::{Membership, MessageContent};
use mailbridge_shared::mail::{MailAddress, MailMessage, OutgoingMail};
use mailbridge_shared::types::{EventId, RoomId, UserId};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{IntentError, RemoteError};
use crate::intent::{ChatTransport, CreateRoom, Intent};
use crate::remote::{MailNotification, RemoteClient, RemoteConnector};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks concurrent sends so tests can assert serialization.
#[derive(Debug, Default)]
struct InFlight {
    current: usize,
    max: usize,
}

impl InFlight {
    fn enter(&mut self) {
        self.current += 1;
        self.max = self.max.max(self.current);
    }

    fn exit(&mut self) {
        self.current = self.current.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Mail
// ---------------------------------------------------------------------------

/// A mail handed to the network by one of its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub from: String,
    pub message_id: String,
    pub mail: OutgoingMail,
}

#[derive(Default)]
struct MailState {
    passwords: HashMap<String, String>,
    mailboxes: HashMap<String, Vec<MailMessage>>,
    listeners: HashMap<String, mpsc::Sender<MailNotification>>,
    sent: Vec<SentMail>,
    fail_sends: bool,
    send_delay: Duration,
    in_flight: InFlight,
}

#[derive(Clone, Default)]
pub struct MemoryMailNetwork {
    state: Arc<Mutex<MailState>>,
}

impl MemoryMailNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_account(&self, address: &str, password: &str) {
        lock(&self.state)
            .passwords
            .insert(address.to_string(), password.to_string());
    }

    /// Drop a mail into each recipient's mailbox and notify their listener.
    pub async fn deliver(&self, mail: MailMessage) {
        let listeners: Vec<_> = {
            let mut state = lock(&self.state);
            mail.to
                .iter()
                .filter_map(|rcpt| {
                    state
                        .mailboxes
                        .entry(rcpt.address.clone())
                        .or_default()
                        .push(mail.clone());
                    state.listeners.get(&rcpt.address).cloned()
                })
                .collect()
        };
        for listener in listeners {
            if listener.send(MailNotification::NewMail).await.is_err() {
                debug!("mail listener went away");
            }
        }
    }

    /// Simulate the server dropping an account's connection.
    pub async fn drop_connection(&self, address: &str) {
        let listener = lock(&self.state).listeners.remove(address);
        if let Some(listener) = listener {
            let _ = listener
                .send(MailNotification::Disconnected {
                    reason: "connection reset".into(),
                })
                .await;
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        lock(&self.state).sent.clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        lock(&self.state).send_delay = delay;
    }

    /// Highest number of `send_message` calls observed running at once.
    pub fn max_concurrent_sends(&self) -> usize {
        lock(&self.state).in_flight.max
    }
}

#[async_trait]
impl RemoteConnector for MemoryMailNetwork {
    async fn login(
        &self,
        address: &str,
        credential: &str,
        notifications: mpsc::Sender<MailNotification>,
    ) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        let mut state = lock(&self.state);
        match state.passwords.get(address) {
            Some(expected) if expected != credential => {
                return Err(RemoteError::AuthFailed("invalid credentials".into()));
            }
            Some(_) => {}
            None => {
                // Loopback accounts are created on first login.
                state
                    .passwords
                    .insert(address.to_string(), credential.to_string());
            }
        }
        state
            .listeners
            .insert(address.to_string(), notifications.clone());

        Ok(Arc::new(MemoryMailClient {
            network: self.clone(),
            address: address.to_string(),
            logged_in: AtomicBool::new(true),
            notifications,
        }))
    }
}

struct MemoryMailClient {
    network: MemoryMailNetwork,
    address: String,
    logged_in: AtomicBool,
    notifications: mpsc::Sender<MailNotification>,
}

#[async_trait]
impl RemoteClient for MemoryMailClient {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn send_message(&self, mail: &OutgoingMail) -> Result<String, RemoteError> {
        if !self.is_logged_in() {
            return Err(RemoteError::NotLoggedIn);
        }
        let message_id = format!("<{}@mailbridge.invalid>", uuid::Uuid::new_v4());
        let inbound = MailMessage {
            message_id: message_id.clone(),
            from: MailAddress::new(&self.address)
                .map_err(|e| RemoteError::Send(e.to_string()))?,
            to: vec![MailAddress::new(&mail.to).map_err(|e| RemoteError::Send(e.to_string()))?],
            subject: mail.subject.clone(),
            date: Utc::now(),
            text: mail.text.clone(),
            html: mail.html.clone(),
            attachments: mail.attachments.clone(),
            in_reply_to: mail.in_reply_to.clone(),
        };

        let delay = {
            let mut state = lock(&self.network.state);
            if state.fail_sends {
                return Err(RemoteError::Send("injected failure".into()));
            }
            state.in_flight.enter();
            state.send_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let listener = {
            let mut state = lock(&self.network.state);
            state.in_flight.exit();
            state.sent.push(SentMail {
                from: self.address.clone(),
                message_id: message_id.clone(),
                mail: mail.clone(),
            });
            state
                .mailboxes
                .entry(mail.to.clone())
                .or_default()
                .push(inbound);
            state.listeners.get(&mail.to).cloned()
        };
        if let Some(listener) = listener {
            let _ = listener.try_send(MailNotification::NewMail);
        }
        Ok(message_id)
    }

    async fn fetch_latest(&self) -> Result<MailMessage, RemoteError> {
        if !self.is_logged_in() {
            return Err(RemoteError::NotLoggedIn);
        }
        lock(&self.network.state)
            .mailboxes
            .get(&self.address)
            .and_then(|mailbox| mailbox.last().cloned())
            .ok_or(RemoteError::NoMessages)
    }

    async fn disconnect(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
        let mut state = lock(&self.network.state);
        // A newer session for the same account keeps its listener.
        if state
            .listeners
            .get(&self.address)
            .is_some_and(|l| l.same_channel(&self.notifications))
        {
            state.listeners.remove(&self.address);
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub event_id: EventId,
    pub sender: UserId,
    pub event_type: String,
    pub state_key: Option<String>,
    pub content: Value,
    pub redacted: bool,
}

impl TimelineEvent {
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }
}

#[derive(Default)]
struct Room {
    is_direct: bool,
    members: HashMap<UserId, Membership>,
    state: HashMap<(String, String), Value>,
    timeline: Vec<TimelineEvent>,
}

#[derive(Default)]
struct HomeserverState {
    next_id: u64,
    rooms: HashMap<RoomId, Room>,
    registered: HashSet<UserId>,
    display_names: HashMap<UserId, String>,
    tokens: HashMap<String, UserId>,
    media: HashMap<String, Vec<u8>>,
    fail_invites: bool,
    send_delay: Duration,
    in_flight: InFlight,
}

impl HomeserverState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn room_mut(&mut self, room: &RoomId) -> Result<&mut Room, IntentError> {
        self.rooms
            .get_mut(room)
            .ok_or_else(|| IntentError::NotFound(format!("room {room}")))
    }

    fn push_event(
        &mut self,
        room: &RoomId,
        sender: &UserId,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> Result<EventId, IntentError> {
        let event_id = EventId::new(format!("${}", self.next()));
        let room = self.room_mut(room)?;
        room.timeline.push(TimelineEvent {
            event_id: event_id.clone(),
            sender: sender.clone(),
            event_type: event_type.to_string(),
            state_key: state_key.map(String::from),
            content,
            redacted: false,
        });
        Ok(event_id)
    }

    fn require_joined(&mut self, room: &RoomId, user: &UserId) -> Result<&mut Room, IntentError> {
        let r = self.room_mut(room)?;
        if r.members.get(user) != Some(&Membership::Join) {
            return Err(IntentError::Forbidden(format!("{user} is not in {room}")));
        }
        Ok(r)
    }

    fn set_membership(
        &mut self,
        room: &RoomId,
        sender: &UserId,
        target: &UserId,
        membership: Membership,
    ) -> Result<(), IntentError> {
        self.room_mut(room)?
            .members
            .insert(target.clone(), membership);
        self.push_event(
            room,
            sender,
            "m.room.member",
            Some(target.as_str()),
            json!({ "membership": membership }),
        )?;
        Ok(())
    }
}

/// A homeserver that lives in memory.
#[derive(Clone)]
pub struct MemoryHomeserver {
    server_name: String,
    state: Arc<Mutex<HomeserverState>>,
}

impl MemoryHomeserver {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            state: Arc::default(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn transport(&self, bot: UserId) -> MemoryChatTransport {
        MemoryChatTransport {
            homeserver: self.clone(),
            bot,
        }
    }

    /// Create a room the way a real client would, as `creator`.
    pub fn create_room_as(&self, creator: &UserId, invite: &[UserId], is_direct: bool) -> RoomId {
        let mut state = lock(&self.state);
        let room_id = RoomId::new(format!("!room{}:{}", state.next(), self.server_name));
        state.rooms.insert(
            room_id.clone(),
            Room {
                is_direct,
                ..Room::default()
            },
        );
        // Infallible: the room was inserted above.
        let _ = state.set_membership(&room_id, creator, creator, Membership::Join);
        for user in invite {
            let _ = state.set_membership(&room_id, creator, user, Membership::Invite);
        }
        room_id
    }

    /// Put a state event into a room directly.
    pub fn put_state(&self, room: &RoomId, event_type: &str, state_key: &str, content: Value) {
        if let Some(r) = lock(&self.state).rooms.get_mut(room) {
            r.state
                .insert((event_type.to_string(), state_key.to_string()), content);
        }
    }

    /// Register an access token for a local user (double puppeting).
    pub fn register_token(&self, token: &str, user: &UserId) {
        lock(&self.state)
            .tokens
            .insert(token.to_string(), user.clone());
    }

    pub fn set_fail_invites(&self, fail: bool) {
        lock(&self.state).fail_invites = fail;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        lock(&self.state).send_delay = delay;
    }

    pub fn max_concurrent_sends(&self) -> usize {
        lock(&self.state).in_flight.max
    }

    pub fn room_count(&self) -> usize {
        lock(&self.state).rooms.len()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        lock(&self.state).rooms.keys().cloned().collect()
    }

    pub fn is_direct(&self, room: &RoomId) -> bool {
        lock(&self.state)
            .rooms
            .get(room)
            .map(|r| r.is_direct)
            .unwrap_or(false)
    }

    pub fn timeline(&self, room: &RoomId) -> Vec<TimelineEvent> {
        lock(&self.state)
            .rooms
            .get(room)
            .map(|r| r.timeline.clone())
            .unwrap_or_default()
    }

    /// Non-redacted `m.room.message` events of a room.
    pub fn messages(&self, room: &RoomId) -> Vec<TimelineEvent> {
        self.timeline(room)
            .into_iter()
            .filter(|e| e.event_type == "m.room.message" && !e.redacted)
            .collect()
    }

    pub fn events_of_type(&self, room: &RoomId, event_type: &str) -> Vec<TimelineEvent> {
        self.timeline(room)
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn membership(&self, room: &RoomId, user: &UserId) -> Option<Membership> {
        lock(&self.state)
            .rooms
            .get(room)
            .and_then(|r| r.members.get(user).copied())
    }

    pub fn state(&self, room: &RoomId, event_type: &str, state_key: &str) -> Option<Value> {
        lock(&self.state).rooms.get(room).and_then(|r| {
            r.state
                .get(&(event_type.to_string(), state_key.to_string()))
                .cloned()
        })
    }

    pub fn display_name(&self, user: &UserId) -> Option<String> {
        lock(&self.state).display_names.get(user).cloned()
    }

    pub fn is_registered(&self, user: &UserId) -> bool {
        lock(&self.state).registered.contains(user)
    }
}

#[derive(Clone)]
pub struct MemoryChatTransport {
    homeserver: MemoryHomeserver,
    bot: UserId,
}

impl ChatTransport for MemoryChatTransport {
    fn bot(&self) -> Arc<dyn Intent> {
        Arc::new(MemoryIntent {
            homeserver: self.homeserver.clone(),
            user_id: self.bot.clone(),
            token: None,
        })
    }

    fn intent_for(&self, user: &UserId) -> Arc<dyn Intent> {
        Arc::new(MemoryIntent {
            homeserver: self.homeserver.clone(),
            user_id: user.clone(),
            token: None,
        })
    }

    fn double_puppet(&self, user: &UserId, access_token: &str) -> Arc<dyn Intent> {
        Arc::new(MemoryIntent {
            homeserver: self.homeserver.clone(),
            user_id: user.clone(),
            token: Some(access_token.to_string()),
        })
    }
}

struct MemoryIntent {
    homeserver: MemoryHomeserver,
    user_id: UserId,
    token: Option<String>,
}

impl MemoryIntent {
    fn state(&self) -> MutexGuard<'_, HomeserverState> {
        lock(&self.homeserver.state)
    }
}

#[async_trait]
impl Intent for MemoryIntent {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn ensure_registered(&self) -> Result<(), IntentError> {
        self.state().registered.insert(self.user_id.clone());
        Ok(())
    }

    async fn whoami(&self) -> Result<UserId, IntentError> {
        match &self.token {
            None => Ok(self.user_id.clone()),
            Some(token) => self
                .state()
                .tokens
                .get(token)
                .cloned()
                .ok_or_else(|| IntentError::Forbidden("unknown access token".into())),
        }
    }

    async fn send_message(
        &self,
        room: &RoomId,
        content: &MessageContent,
    ) -> Result<EventId, IntentError> {
        self.send_event(room, "m.room.message", &content.to_event_content())
            .await
    }

    async fn send_event(
        &self,
        room: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<EventId, IntentError> {
        let delay = {
            let mut state = self.state();
            state.require_joined(room, &self.user_id)?;
            state.in_flight.enter();
            state.send_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.in_flight.exit();
        state.push_event(room, &self.user_id, event_type, None, content.clone())
    }

    async fn send_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<EventId, IntentError> {
        let mut state = self.state();
        state
            .require_joined(room, &self.user_id)?
            .state
            .insert((event_type.to_string(), state_key.to_string()), content.clone());
        state.push_event(
            room,
            &self.user_id,
            event_type,
            Some(state_key),
            content.clone(),
        )
    }

    async fn get_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, IntentError> {
        let mut state = self.state();
        let room = state.room_mut(room)?;
        Ok(room
            .state
            .get(&(event_type.to_string(), state_key.to_string()))
            .cloned())
    }

    async fn invite(&self, room: &RoomId, user: &UserId) -> Result<(), IntentError> {
        let mut state = self.state();
        if state.fail_invites {
            warn!(%room, %user, "injected invite failure");
            return Err(IntentError::Forbidden("invites are failing".into()));
        }
        let r = state.require_joined(room, &self.user_id)?;
        if r.members.get(user) == Some(&Membership::Join) {
            return Err(IntentError::AlreadyInRoom);
        }
        state.set_membership(room, &self.user_id, user, Membership::Invite)
    }

    async fn join(&self, room: &RoomId) -> Result<(), IntentError> {
        let mut state = self.state();
        let current = state.room_mut(room)?.members.get(&self.user_id).copied();
        match current {
            Some(Membership::Join) => Ok(()),
            Some(Membership::Invite) => {
                state.set_membership(room, &self.user_id, &self.user_id, Membership::Join)
            }
            _ => Err(IntentError::Forbidden(format!(
                "{} is not invited to {room}",
                self.user_id
            ))),
        }
    }

    async fn leave(&self, room: &RoomId) -> Result<(), IntentError> {
        let mut state = self.state();
        let r = state.room_mut(room)?;
        if !r.members.contains_key(&self.user_id) {
            return Err(IntentError::Forbidden(format!("{} is not in {room}", self.user_id)));
        }
        state.set_membership(room, &self.user_id, &self.user_id, Membership::Leave)
    }

    async fn create_room(&self, request: &CreateRoom) -> Result<RoomId, IntentError> {
        let room_id =
            self.homeserver
                .create_room_as(&self.user_id, &request.invite, request.is_direct);
        let mut state = self.state();
        let room = state.room_mut(&room_id)?;
        if let Some(name) = &request.name {
            room.state
                .insert(("m.room.name".into(), String::new()), json!({ "name": name }));
        }
        if let Some(topic) = &request.topic {
            room.state
                .insert(("m.room.topic".into(), String::new()), json!({ "topic": topic }));
        }
        if let Some(room_type) = &request.room_type {
            room.state
                .insert(("m.room.create".into(), String::new()), json!({ "type": room_type }));
        }
        for initial in &request.initial_state {
            room.state.insert(
                (initial.event_type.clone(), initial.state_key.clone()),
                initial.content.clone(),
            );
        }
        Ok(room_id)
    }

    async fn set_display_name(&self, name: &str) -> Result<(), IntentError> {
        self.state()
            .display_names
            .insert(self.user_id.clone(), name.to_string());
        Ok(())
    }

    async fn redact(
        &self,
        room: &RoomId,
        event: &EventId,
        reason: Option<&str>,
    ) -> Result<EventId, IntentError> {
        let mut state = self.state();
        let target = state
            .require_joined(room, &self.user_id)?
            .timeline
            .iter_mut()
            .find(|e| &e.event_id == event)
            .ok_or_else(|| IntentError::NotFound(format!("event {event}")))?;
        target.redacted = true;
        state.push_event(
            room,
            &self.user_id,
            "m.room.redaction",
            None,
            json!({ "redacts": event, "reason": reason }),
        )
    }

    async fn upload(
        &self,
        data: Vec<u8>,
        _content_type: &str,
        _filename: &str,
    ) -> Result<String, IntentError> {
        let mut state = self.state();
        let mxc = format!("mxc://{}/media{}", self.homeserver.server_name, state.next());
        state.media.insert(mxc.clone(), data);
        Ok(mxc)
    }

    async fn download(&self, mxc: &str) -> Result<Vec<u8>, IntentError> {
        self.state()
            .media
            .get(mxc)
            .cloned()
            .ok_or_else(|| IntentError::NotFound(mxc.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::new(name, "hs")
    }

    fn mail(from: &str, to: &str, text: &str) -> MailMessage {
        MailMessage {
            message_id: format!("<{text}@test>"),
            from: MailAddress::new(from).unwrap(),
            to: vec![MailAddress::new(to).unwrap()],
            subject: String::new(),
            date: Utc::now(),
            text: text.into(),
            html: None,
            attachments: Vec::new(),
            in_reply_to: None,
        }
    }

    #[tokio::test]
    async fn mail_login_deliver_fetch() {
        let network = MemoryMailNetwork::new();
        network.register_account("bob@example.com", "pw");
        let (tx, mut rx) = mpsc::channel(8);

        assert!(network
            .login("bob@example.com", "wrong", tx.clone())
            .await
            .is_err());
        let client = network.login("bob@example.com", "pw", tx).await.unwrap();
        assert!(client.is_logged_in());
        assert_eq!(client.fetch_latest().await, Err(RemoteError::NoMessages));

        network
            .deliver(mail("alice@example.com", "bob@example.com", "hi"))
            .await;
        assert_eq!(rx.recv().await, Some(MailNotification::NewMail));
        assert_eq!(client.fetch_latest().await.unwrap().text, "hi");

        client.disconnect().await;
        assert!(!client.is_logged_in());
        assert_eq!(client.fetch_latest().await, Err(RemoteError::NotLoggedIn));
    }

    #[tokio::test]
    async fn mail_send_records_and_fails_on_demand() {
        let network = MemoryMailNetwork::new();
        let (tx, _rx) = mpsc::channel(8);
        let client = network.login("bob@example.com", "pw", tx).await.unwrap();

        let out = OutgoingMail {
            to: "alice@example.com".into(),
            text: "hello".into(),
            ..OutgoingMail::default()
        };
        let id = client.send_message(&out).await.unwrap();
        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, id);
        assert_eq!(sent[0].from, "bob@example.com");

        network.set_fail_sends(true);
        assert!(client.send_message(&out).await.is_err());
        assert_eq!(network.sent().len(), 1);
    }

    #[tokio::test]
    async fn room_membership_rules() {
        let hs = MemoryHomeserver::new("hs");
        let transport = hs.transport(user("bot"));
        let bob = user("bob");
        let ghost = transport.intent_for(&user("ghost"));

        let room = hs.create_room_as(&bob, &[user("ghost")], true);
        assert!(hs.is_direct(&room));
        assert_eq!(hs.membership(&room, &user("ghost")), Some(Membership::Invite));

        // Not joined yet.
        assert!(ghost.send_message(&room, &MessageContent::text("x")).await.is_err());
        ghost.join(&room).await.unwrap();
        ghost.send_message(&room, &MessageContent::text("hi")).await.unwrap();
        assert_eq!(hs.messages(&room).len(), 1);

        assert!(matches!(
            ghost.invite(&room, &bob).await,
            Err(IntentError::AlreadyInRoom)
        ));
        assert!(transport.bot().join(&room).await.is_err());
        ghost.invite(&room, &user("bot")).await.unwrap();
        transport.bot().join(&room).await.unwrap();

        hs.set_fail_invites(true);
        assert!(matches!(
            ghost.invite(&room, &user("carol")).await,
            Err(IntentError::Forbidden(_))
        ));

        ghost.leave(&room).await.unwrap();
        assert_eq!(hs.membership(&room, &user("ghost")), Some(Membership::Leave));
    }

    #[tokio::test]
    async fn state_redaction_and_media() {
        let hs = MemoryHomeserver::new("hs");
        let bot = hs.transport(user("bot")).bot();
        let room = bot
            .create_room(&CreateRoom {
                name: Some("Alice".into()),
                ..CreateRoom::default()
            })
            .await
            .unwrap();

        assert_eq!(
            bot.get_state(&room, "m.room.name", "").await.unwrap(),
            Some(json!({ "name": "Alice" }))
        );
        bot.send_state(&room, "m.bridge", "k", &json!({ "a": 1 }))
            .await
            .unwrap();
        assert_eq!(hs.state(&room, "m.bridge", "k"), Some(json!({ "a": 1 })));

        let evt = bot
            .send_message(&room, &MessageContent::text("bye"))
            .await
            .unwrap();
        bot.redact(&room, &evt, None).await.unwrap();
        assert!(hs.messages(&room).is_empty());

        let mxc = bot.upload(vec![1, 2, 3], "image/png", "a.png").await.unwrap();
        assert_eq!(bot.download(&mxc).await.unwrap(), vec![1, 2, 3]);
        assert!(bot.download("mxc://hs/missing").await.is_err());
    }

    #[tokio::test]
    async fn double_puppet_whoami() {
        let hs = MemoryHomeserver::new("hs");
        let transport = hs.transport(user("bot"));
        hs.register_token("tok", &user("bob"));

        let good = transport.double_puppet(&user("bob"), "tok");
        assert_eq!(good.whoami().await.unwrap(), user("bob"));
        let bad = transport.double_puppet(&user("bob"), "nope");
        assert!(bad.whoami().await.is_err());
    }
}
