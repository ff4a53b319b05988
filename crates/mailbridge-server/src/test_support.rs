//! A bridge wired to the in-memory mail network and homeserver.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mailbridge_net::{ChatTransport, IntentError, MemoryHomeserver, MemoryMailNetwork};
use mailbridge_shared::event::{ChatEvent, ChatEventContent, Membership, MessageContent};
use mailbridge_shared::mail::{MailAddress, MailMessage};
use mailbridge_shared::types::{EventId, PermissionLevel, PortalKey, RoomId, UserId};
use mailbridge_store::Database;
use tokio::sync::{mpsc, Mutex};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::converter::{Converter, MailConverter};
use crate::dispatch::dispatch;
use crate::portal::Portal;
use crate::puppet::Puppet;
use crate::status::MessageStatus;
use crate::user::User;

/// The remote contact most tests talk to.
pub const CONTACT: &str = "alice@example.com";

const SERVER: &str = "hs";

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        homeserver_domain: SERVER.to_string(),
        as_token: "as-token".to_string(),
        hs_token: "hs-token".to_string(),
        credential_secret: "test-secret".to_string(),
        permissions: BTreeMap::from([("*".to_string(), PermissionLevel::User)]),
        ..BridgeConfig::default()
    }
}

pub struct Harness {
    pub bridge: Arc<Bridge>,
    pub hs: MemoryHomeserver,
    pub mail: MemoryMailNetwork,
    statuses: Mutex<mpsc::Receiver<MessageStatus>>,
    counter: AtomicI64,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(|_| {}, Arc::new(MailConverter)).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        Self::build(configure, Arc::new(MailConverter)).await
    }

    pub async fn build(
        configure: impl FnOnce(&mut BridgeConfig),
        converter: Arc<dyn Converter>,
    ) -> Self {
        let mut config = test_config();
        configure(&mut config);

        let hs = MemoryHomeserver::new(SERVER);
        let mail = MemoryMailNetwork::new();
        let transport = hs.transport(UserId::new(&config.bot_username, SERVER));
        let bridge = Bridge::new(
            config,
            Database::open_in_memory().unwrap(),
            Arc::new(transport),
            Arc::new(mail.clone()),
            converter,
        )
        .unwrap();
        let statuses = bridge.take_status_receiver().unwrap();
        bridge.start().await;

        Self {
            bridge,
            hs,
            mail,
            statuses: Mutex::new(statuses),
            counter: AtomicI64::new(0),
        }
    }

    fn next_id(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn user(&self, name: &str) -> Arc<User> {
        self.bridge.user_by_mxid(&UserId::new(name, SERVER)).unwrap()
    }

    pub async fn login(&self, name: &str, address: &str) -> Arc<User> {
        let user = self.user(name).await;
        user.login(&self.bridge, address, "password").await.unwrap();
        user
    }

    pub fn ghost(&self, address: &str) -> Arc<Puppet> {
        self.bridge.puppet_by_address(address).unwrap()
    }

    /// The user's private portal with [`CONTACT`].
    pub fn portal_for(&self, user: &User) -> Arc<Portal> {
        let key = PortalKey::new(CONTACT, user.mxid().as_str());
        self.bridge.portal_by_key(&key).unwrap()
    }

    /// A mail with a timestamp no other mail from this harness shares.
    pub fn mail_from(&self, from: &str, to: &str, text: &str) -> MailMessage {
        let n = self.next_id();
        MailMessage {
            message_id: format!("<{n}@test.invalid>"),
            from: MailAddress::parse(from).unwrap(),
            to: vec![MailAddress::parse(to).unwrap()],
            subject: "Hello".to_string(),
            date: Utc::now() + chrono::Duration::milliseconds(n),
            text: text.to_string(),
            html: None,
            attachments: Vec::new(),
            in_reply_to: None,
        }
    }

    pub async fn deliver(&self, mail: MailMessage) {
        self.mail.deliver(mail).await;
    }

    pub async fn dispatch(&self, event: ChatEvent) {
        dispatch(&self.bridge, event).await;
    }

    pub async fn next_status(&self) -> MessageStatus {
        let mut statuses = self.statuses.lock().await;
        tokio::time::timeout(Duration::from_secs(10), statuses.recv())
            .await
            .expect("timed out waiting for a message status")
            .expect("status channel closed")
    }

    pub fn try_next_status(&self) -> Option<MessageStatus> {
        self.statuses.try_lock().ok()?.try_recv().ok()
    }

    pub async fn wait_until(&self, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Bring a logged-in user's portal with [`CONTACT`] to life with one mail
    /// and join the user to its room.
    pub async fn bridged_room(&self, user: &User) -> RoomId {
        let address = user.email_address().unwrap();
        self.deliver(self.mail_from(CONTACT, &address, "hi")).await;
        self.next_status().await;
        let room = self.portal_for(user).mxid().unwrap();
        self.hs_join(&room, user).await;
        room
    }

    /// Have the contact's ghost invite `user` and the user accept.
    pub async fn hs_join(&self, room: &RoomId, user: &User) {
        let transport = self.bridge.transport.as_ref();
        let ghost = self.ghost(CONTACT).intent(transport);
        match ghost.invite(room, user.mxid()).await {
            Ok(()) | Err(IntentError::AlreadyInRoom) => {}
            Err(e) => panic!("invite failed: {e}"),
        }
        transport.intent_for(user.mxid()).join(room).await.unwrap();
    }

    fn event(&self, user: &User, room: &RoomId, content: ChatEventContent) -> ChatEvent {
        ChatEvent {
            event_id: EventId::new(format!("$event{}", self.next_id())),
            room_id: room.clone(),
            sender: user.mxid().clone(),
            origin_ts: Utc::now(),
            content,
        }
    }

    pub fn chat_text(&self, user: &User, room: &RoomId, body: &str) -> ChatEvent {
        self.event(user, room, ChatEventContent::Message(MessageContent::text(body)))
    }

    /// Like [`Harness::chat_text`], but the message also exists on the homeserver.
    pub async fn post_text(&self, user: &User, room: &RoomId, body: &str) -> ChatEvent {
        let content = MessageContent::text(body);
        let intent = self.bridge.transport.intent_for(user.mxid());
        let event_id = intent.send_message(room, &content).await.unwrap();
        let mut event = self.event(user, room, ChatEventContent::Message(content));
        event.event_id = event_id;
        event
    }

    pub fn chat_edit(&self, user: &User, room: &RoomId, target: &EventId, body: &str) -> ChatEvent {
        self.event(
            user,
            room,
            ChatEventContent::Edit {
                target: target.clone(),
                content: MessageContent::text(body),
            },
        )
    }

    pub fn chat_redaction(&self, user: &User, room: &RoomId, target: &EventId) -> ChatEvent {
        self.event(
            user,
            room,
            ChatEventContent::Redaction {
                target: target.clone(),
            },
        )
    }

    pub fn invite_event(&self, user: &User, room: &RoomId, target: &UserId, is_direct: bool) -> ChatEvent {
        self.event(
            user,
            room,
            ChatEventContent::Membership {
                target: target.clone(),
                membership: Membership::Invite,
                is_direct,
            },
        )
    }
}
