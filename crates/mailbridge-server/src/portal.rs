//! Portal actor: one per conversation.
//!
//! A portal owns two bounded mailboxes, one for chat-origin events and one for
//! mail-origin messages. A single task drains both with a fair select and
//! handles exactly one item at a time, so nothing in a conversation is ever
//! converted or delivered concurrently. A full mailbox blocks its producer.
//!
//! Every item ends in exactly one [`MessageStatus`]. Failures (and panics) are
//! caught at the item boundary; the loop always moves on to the next item.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use futures::FutureExt;
use mailbridge_net::{CreateRoom, Intent, IntentError, RemoteClient, StateEvent};
use mailbridge_shared::constants::{
    BRIDGE_NAME, CLOSE_TO_TIMEOUT_MILLIS, MEGOLM_ALGORITHM, NETWORK_NAME, PRIVATE_CHAT_TOPIC,
    PROTOCOL_ID, STATE_BRIDGE, STATE_ENCRYPTION, STATE_HALF_SHOT_BRIDGE,
};
use mailbridge_shared::event::{ChatEvent, ChatEventContent, MessageContent, MessageType};
use mailbridge_shared::mail::MailMessage;
use mailbridge_shared::types::{EventId, PortalKey, RoomId, UserId};
use mailbridge_store::{MessageRecord, PortalRecord};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::converter::{ChatContext, RemoteContext};
use crate::dedup::RemoteCheck;
use crate::error::BridgeError;
use crate::puppet::Puppet;
use crate::status::{Direction, MessageStatus, Outcome};
use crate::user::User;

/// A chat event routed to this portal.
pub struct LocalEvent {
    pub event: ChatEvent,
    pub sender: Arc<User>,
}

/// A fetched mail routed to this portal.
pub struct RemoteMail {
    pub mail: MailMessage,
    /// Local user whose mailbox the mail came from.
    pub user: Arc<User>,
    /// The mail was sent from the user's own address.
    pub is_self: bool,
}

struct Inbox {
    local: mpsc::Receiver<LocalEvent>,
    remote: mpsc::Receiver<RemoteMail>,
    shutdown: oneshot::Receiver<()>,
}

pub struct Portal {
    key: PortalKey,
    record: RwLock<PortalRecord>,
    local_tx: mpsc::Sender<LocalEvent>,
    remote_tx: mpsc::Sender<RemoteMail>,
    inbox: Mutex<Option<Inbox>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    /// Held while a room is created or bound for this portal, from either the
    /// invite path or the first incoming mail.
    pub(crate) room_lock: tokio::sync::Mutex<()>,
}

impl Portal {
    pub fn new(record: PortalRecord, buffer: usize) -> Self {
        let (local_tx, local) = mpsc::channel(buffer.max(1));
        let (remote_tx, remote) = mpsc::channel(buffer.max(1));
        let (shutdown_tx, shutdown) = oneshot::channel();
        Self {
            key: record.key.clone(),
            record: RwLock::new(record),
            local_tx,
            remote_tx,
            inbox: Mutex::new(Some(Inbox {
                local,
                remote,
                shutdown,
            })),
            shutdown: Mutex::new(Some(shutdown_tx)),
            room_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PortalRecord> {
        self.record.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> &PortalKey {
        &self.key
    }

    /// Snapshot of the row; may be stale by the time it is acted on.
    pub fn record(&self) -> PortalRecord {
        self.read().clone()
    }

    pub fn mxid(&self) -> Option<RoomId> {
        self.read().mxid.clone()
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn is_encrypted(&self) -> bool {
        self.read().encrypted
    }

    pub fn relay_user_id(&self) -> Option<UserId> {
        self.read().relay_user_id.clone()
    }

    pub fn expiration_time(&self) -> u32 {
        self.read().expiration_time
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut PortalRecord)) -> PortalRecord {
        let mut record = self.record.write().unwrap_or_else(|e| e.into_inner());
        f(&mut record);
        record.clone()
    }

    fn save(&self, bridge: &Bridge) -> Result<(), BridgeError> {
        let record = self.record();
        bridge.store.with(|db| db.update_portal(&record))?;
        Ok(())
    }

    /// Spawn the processing loop. Only the first call has an effect.
    pub fn start(self: &Arc<Self>, bridge: &Arc<Bridge>) {
        let inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(inbox) = inbox {
            tokio::spawn(self.clone().run(bridge.clone(), inbox));
        }
    }

    /// Ask the loop to exit after the item it is working on.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }

    /// Queue a chat event, waiting while the mailbox is full.
    pub async fn enqueue_local(&self, event: LocalEvent) {
        if self.local_tx.send(event).await.is_err() {
            warn!(portal = %self.key, "Portal loop is gone, dropping chat event");
        }
    }

    /// Queue a mail, waiting while the mailbox is full.
    pub async fn enqueue_remote(&self, mail: RemoteMail) {
        if self.remote_tx.send(mail).await.is_err() {
            warn!(portal = %self.key, "Portal loop is gone, dropping mail");
        }
    }

    async fn run(self: Arc<Self>, bridge: Arc<Bridge>, mut inbox: Inbox) {
        debug!(portal = %self.key, "Portal loop started");
        loop {
            let status = tokio::select! {
                _ = &mut inbox.shutdown => break,
                Some(item) = inbox.local.recv() => {
                    let (room, event) = (item.event.room_id.clone(), item.event.event_id.clone());
                    self.guarded(
                        Direction::ToRemote,
                        Some(room),
                        Some(event),
                        self.process_local(&bridge, item),
                    )
                    .await
                }
                Some(item) = inbox.remote.recv() => {
                    self.guarded(Direction::ToChat, self.mxid(), None, self.process_remote(&bridge, item))
                        .await
                }
                else => break,
            };
            bridge.status.report(status);
        }
        debug!(portal = %self.key, "Portal loop stopped");
    }

    async fn guarded(
        &self,
        direction: Direction,
        room: Option<RoomId>,
        event: Option<EventId>,
        handling: impl Future<Output = MessageStatus>,
    ) -> MessageStatus {
        match AssertUnwindSafe(handling).catch_unwind().await {
            Ok(status) => status,
            Err(_) => {
                error!(portal = %self.key, "Panic while handling message");
                let failure = BridgeError::Internal("panic while handling message".into());
                MessageStatus::new(self.key.clone(), direction, Outcome::failed(&failure))
                    .for_event(room, event)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Chat to mail
    // -----------------------------------------------------------------------

    async fn process_local(self: &Arc<Self>, bridge: &Arc<Bridge>, item: LocalEvent) -> MessageStatus {
        let event_id = item.event.event_id.clone();
        let status = |outcome| {
            MessageStatus::new(self.key.clone(), Direction::ToRemote, outcome)
                .for_event(Some(item.event.room_id.clone()), Some(event_id.clone()))
        };

        let age = item.event.age_millis();
        let mut slow_warning = None;
        if let Some(error_after) = bridge.config.message_error_after {
            let budget = i64::try_from(error_after.as_millis()).unwrap_or(i64::MAX);
            if age > budget {
                warn!(portal = %self.key, event_id = %event_id, age_ms = age, "Message is too old, not bridging");
                return status(Outcome::failed(&BridgeError::TimeoutBeforeHandling { age_ms: age }));
            }
            let remaining = budget - age;
            if remaining < CLOSE_TO_TIMEOUT_MILLIS {
                warn!(portal = %self.key, event_id = %event_id, remaining_ms = remaining, "Message is close to timing out");
            }
            let (key, event) = (self.key.clone(), event_id.clone());
            slow_warning = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(remaining.max(0) as u64)).await;
                warn!(portal = %key, event_id = %event, "Still handling message past its error threshold");
            }));
        }

        let handling = self.handle_local(bridge, &item);
        let result = match bridge.config.message_deadline {
            Some(deadline) => tokio::time::timeout(deadline, handling)
                .await
                .unwrap_or(Err(BridgeError::DeadlineExceeded)),
            None => handling.await,
        };
        if let Some(task) = slow_warning {
            task.abort();
        }

        match result {
            Ok(outcome) => {
                debug!(portal = %self.key, event_id = %event_id, outcome = ?outcome, "Handled chat event");
                status(outcome)
            }
            Err(e) => {
                warn!(portal = %self.key, event_id = %event_id, error = %e, "Failed to bridge chat event");
                status(Outcome::failed(&e))
            }
        }
    }

    async fn handle_local(&self, bridge: &Arc<Bridge>, item: &LocalEvent) -> Result<Outcome, BridgeError> {
        // Indexed events were posted by the bridge, e.g. through a double puppet.
        if bridge.dedup.resolve_event(&item.event.event_id)?.is_some() {
            return Ok(Outcome::Ignored("event is already bridged".into()));
        }
        match &item.event.content {
            ChatEventContent::Message(content) => self.send_to_remote(bridge, item, content, None).await,
            ChatEventContent::Edit { target, content } => {
                let original = bridge
                    .dedup
                    .resolve_event(target)?
                    .filter(|m| m.thread_id == self.key.thread_id && m.receiver == self.key.receiver)
                    .ok_or(BridgeError::EditTargetNotFound)?;
                if original.sender != item.event.sender.as_str() {
                    return Err(BridgeError::EditNotOwner);
                }
                self.send_to_remote(bridge, item, content, Some(&original)).await
            }
            ChatEventContent::Redaction { target } => {
                if bridge.dedup.remove_by_event(target)? {
                    Ok(Outcome::Delivered)
                } else {
                    Ok(Outcome::Ignored("redacted event was not bridged".into()))
                }
            }
            ChatEventContent::Reaction { .. } => {
                Ok(Outcome::Ignored("reactions are not bridged to mail".into()))
            }
            ChatEventContent::Membership { .. } => {
                Ok(Outcome::Ignored("membership changes are not bridged".into()))
            }
            ChatEventContent::Typing { .. } => {
                Ok(Outcome::Ignored("typing notifications are not bridged".into()))
            }
        }
    }

    async fn send_to_remote(
        &self,
        bridge: &Arc<Bridge>,
        item: &LocalEvent,
        content: &MessageContent,
        edit_of: Option<&MessageRecord>,
    ) -> Result<Outcome, BridgeError> {
        let config = &bridge.config;
        if content.msgtype == MessageType::Notice && !config.bridge_notices {
            return Err(BridgeError::NoticesDisabled);
        }
        let event = &item.event;
        let (client, relayed) = self.sending_client(bridge, &item.sender)?;

        let mut content = content.clone();
        if relayed && !content.msgtype.is_media() {
            content.body = relay_body(config, &event.sender, &content.body);
            content.formatted_body = None;
        }
        let in_reply_to = match &content.reply_to {
            Some(reply) => bridge.dedup.remote_id_for(reply)?,
            None => None,
        };

        let bot = bridge.bot();
        let ctx = RemoteContext {
            media: bot.as_ref(),
            sender_address: client.address(),
            sender_name: event.sender.localpart(),
            recipient: &self.key.thread_id,
            subject: &config.default_subject,
            max_attachment_size: config.max_attachment_size,
        };
        let mut mail = bridge.converter.to_remote(&ctx, &content).await?;
        mail.in_reply_to = in_reply_to;
        if let Some(original) = edit_of {
            mail.replaces = original.remote_id.clone();
        }

        let message_id = client.send_message(&mail).await?;
        let timestamp = event.origin_ts.timestamp_millis();
        match edit_of {
            Some(original) => {
                bridge.dedup.apply_edit(original, timestamp)?;
            }
            None => bridge.dedup.record(&MessageRecord {
                sender: event.sender.to_string(),
                timestamp,
                part_index: 0,
                thread_id: self.key.thread_id.clone(),
                receiver: self.key.receiver.clone(),
                mxid: event.event_id.clone(),
                room_id: event.room_id.clone(),
                remote_id: Some(message_id),
            })?,
        }
        Ok(Outcome::Delivered)
    }

    /// The sender's own connection, else the portal's relay user's. The
    /// flag tells whether the relay is used.
    fn sending_client(
        &self,
        bridge: &Bridge,
        sender: &User,
    ) -> Result<(Arc<dyn RemoteClient>, bool), BridgeError> {
        if let Some(client) = sender.client().filter(|c| c.is_logged_in()) {
            return Ok((client, false));
        }
        if bridge.config.relay_enabled {
            let relay = self
                .relay_user_id()
                .and_then(|id| bridge.user_by_mxid(&id))
                .and_then(|user| user.client())
                .filter(|c| c.is_logged_in());
            if let Some(client) = relay {
                return Ok((client, true));
            }
        }
        Err(BridgeError::NotLoggedIn)
    }

    // -----------------------------------------------------------------------
    // Mail to chat
    // -----------------------------------------------------------------------

    async fn process_remote(self: &Arc<Self>, bridge: &Arc<Bridge>, item: RemoteMail) -> MessageStatus {
        let message_id = item.mail.message_id.clone();
        match self.handle_remote(bridge, &item).await {
            Ok((outcome, first_event)) => {
                debug!(portal = %self.key, message_id = %message_id, outcome = ?outcome, "Handled mail");
                MessageStatus::new(self.key.clone(), Direction::ToChat, outcome)
                    .for_event(self.mxid(), first_event)
            }
            Err(e) => {
                warn!(portal = %self.key, message_id = %message_id, error = %e, "Failed to bridge mail");
                MessageStatus::new(self.key.clone(), Direction::ToChat, Outcome::failed(&e))
                    .for_event(self.mxid(), None)
            }
        }
    }

    async fn handle_remote(
        self: &Arc<Self>,
        bridge: &Arc<Bridge>,
        item: &RemoteMail,
    ) -> Result<(Outcome, Option<EventId>), BridgeError> {
        let mail = &item.mail;
        let total = mail.part_count();
        if total == 0 {
            return Ok((Outcome::Ignored("mail has no content".into()), None));
        }

        let sender = mail.from.address.as_str();
        let timestamp = mail.timestamp_millis();
        let from_part = match bridge
            .dedup
            .check_remote(sender, timestamp, &self.key.receiver, total)?
        {
            RemoteCheck::Duplicate => return Ok((Outcome::Duplicate, None)),
            RemoteCheck::Deliver { from_part } => from_part,
        };
        if from_part > 0 {
            info!(portal = %self.key, message_id = %mail.message_id, from_part, "Resuming partially bridged mail");
        }

        let contact = bridge.puppet_by_address(&self.key.thread_id).ok_or_else(|| {
            BridgeError::Internal(format!("could not load puppet for {}", self.key.thread_id))
        })?;
        let room_name = if item.is_self {
            contact.display_name()
        } else {
            let (puppet, transport, store) =
                (contact.clone(), bridge.transport.clone(), bridge.store.clone());
            let (template, from) = (bridge.config.displayname_template.clone(), mail.from.clone());
            tokio::spawn(async move {
                puppet
                    .update_name(transport.as_ref(), &store, &template, &from)
                    .await;
            });
            mail.from.display().to_string()
        };

        let room = self.ensure_room(bridge, &contact, &item.user, room_name).await?;
        let intent = self.sending_intent(bridge, &contact, item, &room).await;

        let ctx = ChatContext {
            media: intent.as_ref(),
            max_attachment_size: bridge.config.max_attachment_size,
        };
        let parts = bridge.converter.to_chat(&ctx, mail).await?;

        let mut first_event = None;
        for (index, part) in parts.iter().enumerate().skip(from_part as usize) {
            let event_id = intent.send_message(&room, part).await?;
            bridge.dedup.record(&MessageRecord {
                sender: sender.to_string(),
                timestamp,
                part_index: index as u32,
                thread_id: self.key.thread_id.clone(),
                receiver: self.key.receiver.clone(),
                mxid: event_id.clone(),
                room_id: room.clone(),
                remote_id: Some(mail.message_id.clone()),
            })?;
            self.schedule_disappearing(bridge, &room, &event_id, intent.clone());
            first_event.get_or_insert(event_id);
        }
        Ok((Outcome::Delivered, first_event))
    }

    /// The contact's ghost for incoming mail. Mail the user sent themselves
    /// goes through their double puppet when linked, else through the bot.
    async fn sending_intent(
        &self,
        bridge: &Bridge,
        contact: &Puppet,
        item: &RemoteMail,
        room: &RoomId,
    ) -> Arc<dyn Intent> {
        let transport = bridge.transport.as_ref();
        if !item.is_self {
            return contact.intent(transport);
        }

        let double_puppet = bridge
            .puppet_by_address(&item.mail.from.address)
            .filter(|p| p.custom_mxid().as_ref() == Some(item.user.mxid()))
            .and_then(|p| p.custom_intent(transport));
        if let Some(intent) = double_puppet {
            if let Err(e) = intent.join(room).await {
                debug!(room_id = %room, error = %e, "Double puppet could not join");
            }
            return intent;
        }

        self.invite_bot(bridge, contact.intent(transport).as_ref(), room)
            .await;
        bridge.bot()
    }

    /// Have `inviter` bring the bot into the room. Best effort.
    pub(crate) async fn invite_bot(&self, bridge: &Bridge, inviter: &dyn Intent, room: &RoomId) {
        match inviter.invite(room, bridge.bot_mxid()).await {
            Ok(()) | Err(IntentError::AlreadyInRoom) => {}
            Err(e) => warn!(room_id = %room, error = %e, "Failed to invite bridge bot"),
        }
        if let Err(e) = bridge.bot().join(room).await {
            warn!(room_id = %room, error = %e, "Bridge bot failed to join");
        }
    }

    /// Room of the portal, creating it on first use.
    async fn ensure_room(
        self: &Arc<Self>,
        bridge: &Arc<Bridge>,
        contact: &Puppet,
        user: &User,
        name: String,
    ) -> Result<RoomId, BridgeError> {
        if let Some(room) = self.mxid() {
            return Ok(room);
        }
        let _guard = self.room_lock.lock().await;
        // The invite path may have bound a room while we waited.
        if let Some(room) = self.mxid() {
            return Ok(room);
        }

        let ghost = contact.intent(bridge.transport.as_ref());
        ghost.ensure_registered().await?;

        let encrypted = bridge.config.encryption_default;
        let mut request = CreateRoom {
            name: Some(name.clone()),
            topic: Some(PRIVATE_CHAT_TOPIC.to_string()),
            invite: vec![user.mxid().clone()],
            is_direct: true,
            ..CreateRoom::default()
        };
        if encrypted {
            request.invite.push(bridge.bot_mxid().clone());
            request.initial_state.push(StateEvent {
                event_type: STATE_ENCRYPTION.to_string(),
                state_key: String::new(),
                content: json!({ "algorithm": MEGOLM_ALGORITHM }),
            });
        }
        let room = ghost.create_room(&request).await?;
        if encrypted {
            if let Err(e) = bridge.bot().join(&room).await {
                warn!(room_id = %room, error = %e, "Bridge bot failed to join encrypted portal");
            }
        }

        self.update(|r| {
            r.name = name;
            r.name_set = true;
            r.topic = PRIVATE_CHAT_TOPIC.to_string();
            r.topic_set = true;
            r.encrypted = encrypted;
        });
        bridge.portals.bind_room(self, room.clone())?;
        info!(portal = %self.key, room_id = %room, "Created portal room");

        self.after_bind(bridge, ghost.as_ref(), user, &room).await;
        Ok(room)
    }

    /// Best-effort steps after a room is bound: bridge info state and the
    /// user's personal space.
    pub(crate) async fn after_bind(&self, bridge: &Bridge, ghost: &dyn Intent, user: &User, room: &RoomId) {
        let content = json!({
            "bridgebot": bridge.bot_mxid(),
            "creator": ghost.user_id(),
            "protocol": { "id": PROTOCOL_ID, "displayname": NETWORK_NAME },
            "channel": { "id": self.key.thread_id, "displayname": self.name() },
        });
        let state_key = format!("{BRIDGE_NAME}://{PROTOCOL_ID}/{}", self.key.thread_id);
        for event_type in [STATE_BRIDGE, STATE_HALF_SHOT_BRIDGE] {
            if let Err(e) = ghost.send_state(room, event_type, &state_key, &content).await {
                warn!(room_id = %room, event_type, error = %e, "Failed to update bridge info");
            }
        }
        user.add_to_space(bridge, room).await;
    }

    fn schedule_disappearing(
        &self,
        bridge: &Bridge,
        room: &RoomId,
        event: &EventId,
        intent: Arc<dyn Intent>,
    ) {
        let seconds = self.expiration_time();
        if seconds == 0 {
            return;
        }
        let (dedup, room, event) = (bridge.dedup.clone(), room.clone(), event.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(seconds))).await;
            if let Err(e) = intent.redact(&room, &event, Some("Disappearing message")).await {
                warn!(room_id = %room, event_id = %event, error = %e, "Failed to redact disappearing message");
            }
            if let Err(e) = dedup.remove_by_event(&event) {
                warn!(event_id = %event, error = %e, "Failed to drop disappearing message record");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Settings changed from outside the loop
    // -----------------------------------------------------------------------

    pub async fn set_relay(&self, bridge: &Bridge, relay: Option<UserId>) -> Result<(), BridgeError> {
        let _guard = self.room_lock.lock().await;
        self.update(|r| r.relay_user_id = relay);
        self.save(bridge)
    }

    /// Seconds after which delivered chat events are redacted; 0 disables.
    pub async fn set_expiration_time(&self, bridge: &Bridge, seconds: u32) -> Result<(), BridgeError> {
        let _guard = self.room_lock.lock().await;
        self.update(|r| r.expiration_time = seconds);
        self.save(bridge)
    }
}

fn relay_body(config: &BridgeConfig, sender: &UserId, body: &str) -> String {
    config
        .relay_message_format
        .replace("{sender}", sender.localpart())
        .replace("{message}", body)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use mailbridge_shared::mail::OutgoingMail;

    use super::*;
    use crate::converter::{ConversionError, Converter, MailConverter};
    use crate::error::ErrorCategory;
    use crate::test_support::{Harness, CONTACT};

    #[tokio::test]
    async fn redelivered_mail_is_bridged_once() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let mail = h.mail_from(CONTACT, "bob@example.org", "hello bob");

        let portal = h.portal_for(&bob);
        let item = |mail: &MailMessage| RemoteMail {
            mail: mail.clone(),
            user: bob.clone(),
            is_self: false,
        };
        portal.enqueue_remote(item(&mail)).await;
        portal.enqueue_remote(item(&mail)).await;

        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        assert_eq!(h.next_status().await.outcome, Outcome::Duplicate);

        let room = portal.mxid().unwrap();
        let messages = h.hs.messages(&room);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body(), Some("hello bob"));
        assert_eq!(&messages[0].sender, h.ghost(CONTACT).mxid());
        assert!(h.hs.is_direct(&room));
        assert!(h.hs.state(&room, STATE_BRIDGE, &format!("mailbridge://email/{CONTACT}")).is_some());
    }

    #[tokio::test]
    async fn edit_updates_timestamp_and_sends_one_replacement() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;

        let original = h.chat_text(&bob, &room, "first draft");
        h.dispatch(original.clone()).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);

        let edit = h.chat_edit(&bob, &room, &original.event_id, "final");
        let edit_ts = edit.origin_ts.timestamp_millis();
        h.dispatch(edit).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);

        let sent = h.mail.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].mail.text, "final");
        assert_eq!(sent[1].mail.replaces.as_deref(), Some(sent[0].message_id.as_str()));

        let record = h.bridge.dedup.resolve_event(&original.event_id).unwrap().unwrap();
        assert_eq!(record.timestamp, edit_ts);
        let parts = h
            .bridge
            .store
            .with(|db| db.get_all_message_parts(bob.mxid().as_str(), edit_ts, bob.mxid().as_str()))
            .unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[tokio::test]
    async fn edit_of_someone_elses_message_is_rejected() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let carol = h.login("carol", "carol@example.org").await;
        let room = h.bridged_room(&bob).await;
        h.hs_join(&room, &carol).await;

        let original = h.chat_text(&bob, &room, "mine");
        h.dispatch(original.clone()).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let before = h.bridge.dedup.resolve_event(&original.event_id).unwrap();

        h.dispatch(h.chat_edit(&carol, &room, &original.event_id, "hijacked")).await;
        let status = h.next_status().await;
        assert!(matches!(
            status.outcome,
            Outcome::Failed { category: ErrorCategory::Declined, .. }
        ));
        assert_eq!(h.bridge.dedup.resolve_event(&original.event_id).unwrap(), before);
        assert_eq!(h.mail.sent().len(), 1);

        h.dispatch(h.chat_edit(&bob, &room, &EventId::new("$unknown"), "x")).await;
        assert!(matches!(
            h.next_status().await.outcome,
            Outcome::Failed { category: ErrorCategory::Declined, .. }
        ));
    }

    #[tokio::test]
    async fn stale_message_is_not_attempted() {
        let h = Harness::with_config(|c| c.message_error_after = Some(Duration::from_secs(5))).await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;

        let mut stale = h.chat_text(&bob, &room, "from the past");
        stale.origin_ts = Utc::now() - chrono::Duration::seconds(60);
        h.dispatch(stale.clone()).await;

        let status = h.next_status().await;
        assert_eq!(status.event_id.as_ref(), Some(&stale.event_id));
        match status.outcome {
            Outcome::Failed { category, reason } => {
                assert_eq!(category, ErrorCategory::Timeout);
                assert!(reason.contains("too old"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(h.mail.sent().is_empty());

        // A fresh message still goes through.
        h.dispatch(h.chat_text(&bob, &room, "now")).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
    }

    #[tokio::test]
    async fn deadline_aborts_delivery_but_not_the_loop() {
        let h = Harness::with_config(|c| c.message_deadline = Some(Duration::from_millis(50))).await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;

        h.mail.set_send_delay(Duration::from_millis(500));
        h.dispatch(h.chat_text(&bob, &room, "slow")).await;
        assert!(matches!(
            h.next_status().await.outcome,
            Outcome::Failed { category: ErrorCategory::Timeout, .. }
        ));

        h.mail.set_send_delay(Duration::ZERO);
        h.dispatch(h.chat_text(&bob, &room, "fast")).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
    }

    #[tokio::test]
    async fn relay_and_notice_policy() {
        let h = Harness::with_config(|c| {
            c.relay_enabled = true;
            c.bridge_notices = false;
        })
        .await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;
        let dave = h.user("dave").await;
        h.hs_join(&room, &dave).await;

        // Not logged in and no relay configured.
        h.dispatch(h.chat_text(&dave, &room, "hi")).await;
        assert!(matches!(
            h.next_status().await.outcome,
            Outcome::Failed { category: ErrorCategory::Declined, .. }
        ));

        let portal = h.portal_for(&bob);
        portal.set_relay(&h.bridge, Some(bob.mxid().clone())).await.unwrap();
        h.dispatch(h.chat_text(&dave, &room, "hi")).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let sent = h.mail.sent();
        assert_eq!(sent[0].from, "bob@example.org");
        assert_eq!(sent[0].mail.text, "dave: hi");

        let mut notice = h.chat_text(&bob, &room, "automated");
        if let ChatEventContent::Message(content) = &mut notice.content {
            content.msgtype = MessageType::Notice;
        }
        h.dispatch(notice).await;
        assert!(matches!(
            h.next_status().await.outcome,
            Outcome::Failed { category: ErrorCategory::Declined, .. }
        ));
    }

    #[tokio::test]
    async fn replies_and_redactions() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        h.deliver(h.mail_from(CONTACT, "bob@example.org", "question?")).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let portal = h.portal_for(&bob);
        let room = portal.mxid().unwrap();
        let incoming = h.hs.messages(&room)[0].event_id.clone();
        let remote_id = h.bridge.dedup.remote_id_for(&incoming).unwrap().unwrap();

        let mut reply = h.chat_text(&bob, &room, "answer");
        if let ChatEventContent::Message(content) = &mut reply.content {
            content.reply_to = Some(incoming.clone());
        }
        h.dispatch(reply.clone()).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        assert_eq!(h.mail.sent()[0].mail.in_reply_to.as_deref(), Some(remote_id.as_str()));

        h.dispatch(h.chat_redaction(&bob, &room, &reply.event_id)).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        assert!(h.bridge.dedup.resolve_event(&reply.event_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn own_mail_goes_through_double_puppet_or_bot() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        h.deliver(h.mail_from(CONTACT, "bob@example.org", "hi")).await;
        h.next_status().await;
        let room = h.portal_for(&bob).mxid().unwrap();

        // Sent from another client: From is bob's own address.
        let own = h.mail_from("bob@example.org", CONTACT, "sent elsewhere");
        bob.handle_mail(&h.bridge, own).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let last = h.hs.messages(&room).pop().unwrap();
        assert_eq!(&last.sender, h.bridge.bot_mxid());

        h.hs_join(&room, &bob).await;
        h.hs.register_token("bob-token", bob.mxid());
        let own_puppet = h.bridge.puppet_by_address("bob@example.org").unwrap();
        h.bridge
            .puppets
            .link(&own_puppet, Some((bob.mxid().clone(), "bob-token".into())))
            .unwrap();

        let own = h.mail_from("bob@example.org", CONTACT, "again");
        bob.handle_mail(&h.bridge, own).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let last = h.hs.messages(&room).pop().unwrap();
        assert_eq!(&last.sender, bob.mxid());
    }

    #[tokio::test]
    async fn own_mail_pushed_back_by_the_homeserver_is_not_resent() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;

        // Posted by the bot: the echo never reaches the portal.
        bob.handle_mail(&h.bridge, h.mail_from("bob@example.org", CONTACT, "via bot")).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let by_bot = h.hs.messages(&room).pop().unwrap();
        assert_eq!(&by_bot.sender, h.bridge.bot_mxid());
        let mut echo = h.chat_text(&bob, &room, "via bot");
        echo.sender = by_bot.sender.clone();
        echo.event_id = by_bot.event_id.clone();
        h.dispatch(echo).await;
        assert!(h.try_next_status().is_none());

        // Posted as bob himself: the echo is bob's event, already indexed.
        h.hs.register_token("bob-token", bob.mxid());
        let own_puppet = h.bridge.puppet_by_address("bob@example.org").unwrap();
        h.bridge
            .puppets
            .link(&own_puppet, Some((bob.mxid().clone(), "bob-token".into())))
            .unwrap();
        bob.handle_mail(&h.bridge, h.mail_from("bob@example.org", CONTACT, "as bob")).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let as_bob = h.hs.messages(&room).pop().unwrap();
        assert_eq!(&as_bob.sender, bob.mxid());

        let mut echo = h.chat_text(&bob, &room, "as bob");
        echo.event_id = as_bob.event_id.clone();
        h.dispatch(echo).await;
        let status = h.next_status().await;
        assert!(matches!(status.outcome, Outcome::Ignored(_)), "{:?}", status.outcome);
        assert!(h.mail.sent().is_empty());
        assert_eq!(
            h.bridge.dedup.resolve_event(&as_bob.event_id).unwrap().unwrap().sender,
            "bob@example.org"
        );
    }

    #[tokio::test]
    async fn partially_bridged_mail_resumes() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let mut mail = h.mail_from(CONTACT, "bob@example.org", "two parts");
        mail.attachments.push(mailbridge_shared::mail::MailAttachment {
            filename: "a.txt".into(),
            content_type: "text/plain".into(),
            data: b"a".to_vec(),
        });

        // Pretend part 0 was delivered before a crash.
        let portal = h.portal_for(&bob);
        let contact = h.ghost(CONTACT);
        let room = portal
            .ensure_room(&h.bridge, &contact, &bob, "Alice".into())
            .await
            .unwrap();
        h.bridge
            .dedup
            .record(&MessageRecord {
                sender: CONTACT.into(),
                timestamp: mail.timestamp_millis(),
                part_index: 0,
                thread_id: CONTACT.into(),
                receiver: bob.mxid().to_string(),
                mxid: EventId::new("$earlier"),
                room_id: room.clone(),
                remote_id: Some(mail.message_id.clone()),
            })
            .unwrap();

        h.deliver(mail).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        let messages = h.hs.messages(&room);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body(), Some("a.txt"));
    }

    #[tokio::test(start_paused = true)]
    async fn disappearing_messages_are_redacted() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let portal = h.portal_for(&bob);
        portal.set_expiration_time(&h.bridge, 1).await.unwrap();

        h.deliver(h.mail_from(CONTACT, "bob@example.org", "self-destruct")).await;
        let status = h.next_status().await;
        let event = status.event_id.unwrap();
        let room = portal.mxid().unwrap();
        assert_eq!(h.hs.messages(&room).len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        h.wait_until(|| h.hs.messages(&room).is_empty()).await;
        assert!(h.bridge.dedup.resolve_event(&event).unwrap().is_none());
    }

    /// Converter wrapper that records how many conversions overlap.
    struct Tracking {
        inner: MailConverter,
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl Tracking {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Converter for Tracking {
        async fn to_remote(
            &self,
            ctx: &RemoteContext<'_>,
            content: &MessageContent,
        ) -> Result<OutgoingMail, ConversionError> {
            self.enter();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let result = self.inner.to_remote(ctx, content).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn to_chat(
            &self,
            ctx: &ChatContext<'_>,
            mail: &MailMessage,
        ) -> Result<Vec<MessageContent>, ConversionError> {
            self.enter();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let result = self.inner.to_chat(ctx, mail).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn portal_never_handles_two_items_at_once() {
        let tracking = Arc::new(Tracking {
            inner: MailConverter,
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        });
        let h = Harness::build(|_| {}, tracking.clone()).await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;
        h.mail.set_send_delay(Duration::from_millis(2));
        h.hs.set_send_delay(Duration::from_millis(2));

        const N: usize = 12;
        const M: usize = 12;
        let portal = h.portal_for(&bob);
        let mut producers = Vec::new();
        for i in 0..N {
            let (portal, event) = (portal.clone(), h.chat_text(&bob, &room, &format!("local {i}")));
            let sender = bob.clone();
            producers.push(tokio::spawn(async move {
                portal.enqueue_local(LocalEvent { event, sender }).await;
            }));
        }
        for i in 0..M {
            let mail = h.mail_from(CONTACT, "bob@example.org", &format!("remote {i}"));
            let (portal, user) = (portal.clone(), bob.clone());
            producers.push(tokio::spawn(async move {
                portal
                    .enqueue_remote(RemoteMail { mail, user, is_self: false })
                    .await;
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut to_remote = 0;
        let mut to_chat = 0;
        for _ in 0..N + M {
            let status = h.next_status().await;
            assert_eq!(status.outcome, Outcome::Delivered);
            match status.direction {
                Direction::ToRemote => to_remote += 1,
                Direction::ToChat => to_chat += 1,
            }
        }
        assert_eq!((to_remote, to_chat), (N, M));
        assert_eq!(tracking.max.load(Ordering::SeqCst), 1);
        assert_eq!(h.mail.max_concurrent_sends(), 1);
        assert_eq!(h.hs.max_concurrent_sends(), 1);
        assert!(h.try_next_status().is_none());
    }
}
