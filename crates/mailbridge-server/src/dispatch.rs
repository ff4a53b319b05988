//! Routes decoded chat events: invites, commands and portal traffic.

use std::sync::Arc;

use mailbridge_shared::event::{ChatEvent, ChatEventContent, Membership, MessageContent, MessageType};
use mailbridge_shared::types::{PermissionLevel, RoomId, UserId};
use tracing::{debug, info, trace, warn};

use crate::bridge::Bridge;
use crate::commands;
use crate::error::BridgeError;
use crate::portal::LocalEvent;
use crate::private_chat;
use crate::status::{Direction, MessageStatus, Outcome};
use crate::user::User;

const WELCOME: &str = "This room is now your email bridge management room. \
    Send `help` for a list of commands.";

/// Handle one chat event. Waits while the target portal's mailbox is full.
pub async fn dispatch(bridge: &Arc<Bridge>, event: ChatEvent) {
    if matches!(event.content, ChatEventContent::Typing { .. }) {
        trace!(room_id = %event.room_id, "Ignoring typing notification");
        return;
    }
    if &event.sender == bridge.bot_mxid() || bridge.ghosts.is_ghost(&event.sender) {
        return;
    }
    let Some(user) = bridge.user_by_mxid(&event.sender) else {
        warn!(sender = %event.sender, "Could not load user for chat event");
        return;
    };

    if let ChatEventContent::Membership {
        target,
        membership: Membership::Invite,
        is_direct,
    } = &event.content
    {
        handle_invite(bridge, &user, &event.room_id, target, *is_direct).await;
        return;
    }

    if let ChatEventContent::Message(content) = &event.content {
        if let Some(command) = command_text(bridge, &user, &event.room_id, content) {
            commands::handle(bridge, &user, &event, command).await;
            return;
        }
    }

    let Some(portal) = bridge.portal_by_mxid(&event.room_id) else {
        trace!(room_id = %event.room_id, kind = event.content.kind(), "Event outside any portal");
        return;
    };

    let level = user.permission();
    let relayed = bridge.config.relay_enabled && portal.relay_user_id().is_some();
    let allowed = level >= PermissionLevel::User || (relayed && level >= PermissionLevel::Relay);
    if !allowed {
        debug!(portal = %portal.key(), sender = %user.mxid(), "Sender may not use this portal");
        let status = MessageStatus::new(
            portal.key().clone(),
            Direction::ToRemote,
            Outcome::failed(&BridgeError::Forbidden),
        )
        .for_event(Some(event.room_id.clone()), Some(event.event_id.clone()));
        bridge.status.report(status);
        return;
    }

    portal.enqueue_local(LocalEvent { event, sender: user }).await;
}

/// Body of a command message: everything in the management room, prefixed
/// text elsewhere.
fn command_text<'a>(
    bridge: &Bridge,
    user: &User,
    room: &RoomId,
    content: &'a MessageContent,
) -> Option<&'a str> {
    if content.msgtype != MessageType::Text {
        return None;
    }
    let body = content.body.trim();
    if user.management_room().as_ref() == Some(room) {
        return Some(body.strip_prefix(bridge.config.command_prefix.as_str()).unwrap_or(body).trim());
    }
    let rest = body.strip_prefix(bridge.config.command_prefix.as_str())?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

async fn handle_invite(
    bridge: &Arc<Bridge>,
    user: &Arc<User>,
    room: &RoomId,
    target: &UserId,
    is_direct: bool,
) {
    if target == bridge.bot_mxid() {
        handle_bot_invite(bridge, user, room, is_direct).await;
        return;
    }
    if !bridge.ghosts.is_ghost(target) || !is_direct {
        return;
    }
    if user.permission() < PermissionLevel::User {
        debug!(user = %user.mxid(), room_id = %room, "Ignoring private chat invite from unprivileged user");
        return;
    }
    let Some(puppet) = bridge.puppet_by_mxid(target) else {
        warn!(ghost = %target, "Could not load puppet for invite");
        return;
    };
    if let Err(e) = private_chat::handle_invite(bridge, user, &puppet, room).await {
        warn!(user = %user.mxid(), room_id = %room, error = %e, "Failed to set up private chat portal");
    }
}

async fn handle_bot_invite(bridge: &Bridge, user: &User, room: &RoomId, is_direct: bool) {
    if user.permission() < PermissionLevel::Relay {
        debug!(user = %user.mxid(), room_id = %room, "Ignoring bot invite from unprivileged user");
        return;
    }
    let bot = bridge.bot();
    if let Err(e) = bot.join(room).await {
        warn!(room_id = %room, error = %e, "Bridge bot failed to accept invite");
        return;
    }
    if !is_direct || user.permission() < PermissionLevel::User {
        return;
    }

    if let Err(e) = bridge.users.clear_management_room(room) {
        warn!(room_id = %room, error = %e, "Failed to release management room");
    }
    if let Err(e) = user.set_management_room(bridge, Some(room.clone())) {
        warn!(user = %user.mxid(), room_id = %room, error = %e, "Failed to save management room");
        return;
    }
    info!(user = %user.mxid(), room_id = %room, "Management room set");
    if let Err(e) = bot.send_message(room, &MessageContent::notice(WELCOME)).await {
        warn!(room_id = %room, error = %e, "Failed to send welcome notice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::test_support::{Harness, CONTACT};

    #[tokio::test]
    async fn bot_invite_sets_management_room() {
        let h = Harness::new().await;
        let bob = h.user("bob").await;
        let carol = h.user("carol").await;
        let bot = h.bridge.bot_mxid().clone();

        let room = h.hs.create_room_as(bob.mxid(), &[bot.clone()], true);
        h.dispatch(h.invite_event(&bob, &room, &bot, true)).await;
        assert_eq!(bob.management_room().as_ref(), Some(&room));
        assert_eq!(h.hs.messages(&room)[0].body(), Some(WELCOME));

        // The same room claimed by someone else moves over.
        h.dispatch(h.invite_event(&carol, &room, &bot, true)).await;
        assert_eq!(carol.management_room().as_ref(), Some(&room));
        assert!(bob.management_room().is_none());
    }

    #[tokio::test]
    async fn ghost_and_bot_senders_are_ignored() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;

        let mut echo = h.chat_text(&bob, &room, "echo");
        echo.sender = h.ghost(CONTACT).mxid().clone();
        h.dispatch(echo).await;
        echo = h.chat_text(&bob, &room, "echo");
        echo.sender = h.bridge.bot_mxid().clone();
        h.dispatch(echo).await;

        h.dispatch(h.chat_text(&bob, &room, "real")).await;
        let status = h.next_status().await;
        assert_eq!(status.outcome, Outcome::Delivered);
        assert_eq!(h.mail.sent().len(), 1);
        assert_eq!(h.mail.sent()[0].mail.text, "real");
    }

    #[tokio::test]
    async fn relay_level_needs_a_relay() {
        let h = Harness::with_config(|c| {
            c.relay_enabled = true;
            c.permissions.insert("@eve:hs".into(), PermissionLevel::Relay);
        })
        .await;
        let bob = h.login("bob", "bob@example.org").await;
        let room = h.bridged_room(&bob).await;
        let eve = h.user("eve").await;

        let event = h.chat_text(&eve, &room, "hello");
        h.dispatch(event.clone()).await;
        let status = h.next_status().await;
        assert_eq!(status.event_id.as_ref(), Some(&event.event_id));
        assert!(matches!(
            status.outcome,
            Outcome::Failed { category: ErrorCategory::Declined, .. }
        ));

        h.portal_for(&bob)
            .set_relay(&h.bridge, Some(bob.mxid().clone()))
            .await
            .unwrap();
        h.dispatch(h.chat_text(&eve, &room, "hello")).await;
        assert_eq!(h.next_status().await.outcome, Outcome::Delivered);
        assert_eq!(h.mail.sent()[0].mail.text, "eve: hello");
    }

    #[tokio::test]
    async fn prefixed_text_is_a_command() {
        let h = Harness::new().await;
        let bob = h.user("bob").await;
        let room = h.hs.create_room_as(bob.mxid(), &[], false);
        let content = |body: &str| MessageContent::text(body);

        assert_eq!(command_text(&h.bridge, &bob, &room, &content("!email ping")), Some("ping"));
        assert_eq!(command_text(&h.bridge, &bob, &room, &content("!emailping")), None);
        assert_eq!(command_text(&h.bridge, &bob, &room, &content("ping")), None);

        bob.set_management_room(&h.bridge, Some(room.clone())).unwrap();
        assert_eq!(command_text(&h.bridge, &bob, &room, &content("ping")), Some("ping"));
        assert_eq!(command_text(&h.bridge, &bob, &room, &content("!email ping")), Some("ping"));
        assert_eq!(
            command_text(&h.bridge, &bob, &room, &MessageContent::notice("ping")),
            None
        );
    }
}
