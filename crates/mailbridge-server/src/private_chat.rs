//! Private portals created from the chat side: a user invites a ghost into a
//! direct room.

use std::sync::Arc;

use mailbridge_net::{Intent, IntentError};
use mailbridge_shared::constants::{MEGOLM_ALGORITHM, PRIVATE_CHAT_TOPIC, STATE_ENCRYPTION};
use mailbridge_shared::event::MessageContent;
use mailbridge_shared::types::{PortalKey, RoomId};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::portal::Portal;
use crate::puppet::Puppet;
use crate::user::User;

/// What an invite ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    /// The invite room is now the portal's room.
    Bound,
    /// The invite room is the portal's room already.
    AlreadyBound,
    /// The portal lives in `existing`; the invite room was left.
    Existing { existing: RoomId },
}

/// Bind `room` as the private portal between `user` and `puppet`, or point
/// the user at the portal they already have.
pub async fn handle_invite(
    bridge: &Arc<Bridge>,
    user: &Arc<User>,
    puppet: &Arc<Puppet>,
    room: &RoomId,
) -> Result<InviteOutcome, BridgeError> {
    let key = PortalKey::new(puppet.address(), user.mxid().as_str());
    let portal = bridge
        .portal_by_key(&key)
        .ok_or_else(|| BridgeError::Internal(format!("could not load portal {key}")))?;

    let ghost = puppet.intent(bridge.transport.as_ref());
    ghost.ensure_registered().await?;
    ghost.join(room).await?;

    let _guard = portal.room_lock.lock().await;
    if let Some(existing) = portal.mxid() {
        if &existing == room {
            debug!(portal = %key, room_id = %room, "Invite room is already the portal");
            return Ok(InviteOutcome::AlreadyBound);
        }
        match ghost.invite(&existing, user.mxid()).await {
            Ok(()) | Err(IntentError::AlreadyInRoom) => {
                let notice = MessageContent::notice(format!(
                    "You already have a private chat portal with me at {}",
                    existing.matrix_to_url()
                ));
                if let Err(e) = ghost.send_message(room, &notice).await {
                    warn!(room_id = %room, error = %e, "Failed to send existing portal notice");
                }
                if let Err(e) = ghost.leave(room).await {
                    warn!(room_id = %room, error = %e, "Failed to leave duplicate room");
                }
                info!(portal = %key, existing = %existing, room_id = %room, "Pointed user at existing private chat");
                return Ok(InviteOutcome::Existing { existing });
            }
            Err(e) => {
                // The old room stays as it is; the portal moves to the new one.
                warn!(portal = %key, existing = %existing, error = %e,
                    "Failed to re-invite user to existing portal, binding new room instead");
            }
        }
    }

    bind(bridge, &portal, ghost.as_ref(), user, room).await?;
    Ok(InviteOutcome::Bound)
}

async fn bind(
    bridge: &Arc<Bridge>,
    portal: &Arc<Portal>,
    ghost: &dyn Intent,
    user: &User,
    room: &RoomId,
) -> Result<(), BridgeError> {
    let already_encrypted = room_is_encrypted(ghost, room).await;
    let encrypted = already_encrypted || bridge.config.encryption_default;
    if encrypted {
        portal.invite_bot(bridge, ghost, room).await;
    }
    if encrypted && !already_encrypted {
        let content = json!({ "algorithm": MEGOLM_ALGORITHM });
        if let Err(e) = ghost.send_state(room, STATE_ENCRYPTION, "", &content).await {
            warn!(room_id = %room, error = %e, "Failed to enable encryption in private chat");
        }
    }

    let name = ghost_name(bridge, portal);
    portal.update(|r| {
        r.name = name;
        r.topic = PRIVATE_CHAT_TOPIC.to_string();
        r.encrypted = encrypted;
    });
    bridge.portals.bind_room(portal, room.clone())?;
    info!(portal = %portal.key(), room_id = %room, encrypted, "Bound private chat portal");

    portal.after_bind(bridge, ghost, user, room).await;

    let notice = MessageContent::notice("Private chat portal created");
    if let Err(e) = ghost.send_message(room, &notice).await {
        warn!(room_id = %room, error = %e, "Failed to send portal created notice");
    }
    Ok(())
}

async fn room_is_encrypted(intent: &dyn Intent, room: &RoomId) -> bool {
    match intent.get_state(room, STATE_ENCRYPTION, "").await {
        Ok(Some(content)) => content.get("algorithm").and_then(|a| a.as_str()) == Some(MEGOLM_ALGORITHM),
        Ok(None) => false,
        Err(e) => {
            debug!(room_id = %room, error = %e, "Could not read encryption state");
            false
        }
    }
}

fn ghost_name(bridge: &Bridge, portal: &Portal) -> String {
    bridge
        .puppet_by_address(&portal.key().thread_id)
        .map(|p| p.display_name())
        .unwrap_or_else(|| portal.key().thread_id.clone())
}

#[cfg(test)]
mod tests {
    use mailbridge_shared::event::Membership;

    use super::*;
    use crate::test_support::{Harness, CONTACT};

    fn notices(h: &Harness, room: &RoomId) -> Vec<String> {
        h.hs.messages(room)
            .iter()
            .filter_map(|e| e.body().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn invite_binds_fresh_room() {
        let h = Harness::new().await;
        let bob = h.user("bob").await;
        let ghost = h.ghost(CONTACT);
        let room = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);

        h.dispatch(h.invite_event(&bob, &room, ghost.mxid(), true)).await;

        let portal = h.bridge.portals.by_mxid(&room).expect("portal bound");
        assert_eq!(portal.key(), &PortalKey::new(CONTACT, bob.mxid().as_str()));
        assert_eq!(notices(&h, &room), vec!["Private chat portal created".to_string()]);
        assert_eq!(h.hs.membership(&room, ghost.mxid()), Some(Membership::Join));
        assert_eq!(h.hs.room_count(), 1);

        let stored = h
            .bridge
            .store
            .with(|db| db.get_portal_by_key(portal.key()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.mxid.as_ref(), Some(&room));
        assert_eq!(stored.topic, PRIVATE_CHAT_TOPIC);
    }

    #[tokio::test]
    async fn second_invite_points_at_existing_portal() {
        let h = Harness::new().await;
        let bob = h.user("bob").await;
        let ghost = h.ghost(CONTACT);
        let first = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);
        h.dispatch(h.invite_event(&bob, &first, ghost.mxid(), true)).await;
        let before = h.hs.timeline(&first);

        let second = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);
        h.dispatch(h.invite_event(&bob, &second, ghost.mxid(), true)).await;

        let body = notices(&h, &second);
        assert_eq!(body.len(), 1);
        assert!(body[0].starts_with("You already have a private chat portal with me at"));
        assert!(body[0].contains(first.as_str()));
        assert_eq!(h.hs.membership(&second, ghost.mxid()), Some(Membership::Leave));

        assert_eq!(h.hs.timeline(&first), before);
        let portal = h.bridge.portals.by_mxid(&first).unwrap();
        assert_eq!(portal.mxid().as_ref(), Some(&first));
        assert!(h.bridge.portals.by_mxid(&second).is_none());
    }

    #[tokio::test]
    async fn failed_reinvite_moves_portal_to_new_room() {
        let h = Harness::new().await;
        let bob = h.user("bob").await;
        let ghost = h.ghost(CONTACT);
        let first = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);
        h.dispatch(h.invite_event(&bob, &first, ghost.mxid(), true)).await;

        let second = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);
        h.hs.set_fail_invites(true);
        let outcome = handle_invite(&h.bridge, &bob, &ghost, &second).await.unwrap();
        assert_eq!(outcome, InviteOutcome::Bound);

        let portal = h.bridge.portals.by_mxid(&second).unwrap();
        assert_eq!(portal.mxid().as_ref(), Some(&second));
        // The old room is kept, just no longer bound.
        assert_eq!(h.hs.membership(&first, ghost.mxid()), Some(Membership::Join));
        assert!(h.bridge.portals.by_mxid(&first).is_none());
    }

    #[tokio::test]
    async fn encrypted_room_brings_in_the_bot() {
        let h = Harness::new().await;
        let bob = h.user("bob").await;
        let ghost = h.ghost(CONTACT);
        let room = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);
        h.hs.put_state(&room, STATE_ENCRYPTION, "", json!({ "algorithm": MEGOLM_ALGORITHM }));

        handle_invite(&h.bridge, &bob, &ghost, &room).await.unwrap();

        assert!(h.bridge.portals.by_mxid(&room).unwrap().is_encrypted());
        assert_eq!(h.hs.membership(&room, h.bridge.bot_mxid()), Some(Membership::Join));
    }

    #[tokio::test]
    async fn default_encryption_is_applied_to_the_room() {
        let h = Harness::with_config(|c| c.encryption_default = true).await;
        let bob = h.user("bob").await;
        let ghost = h.ghost(CONTACT);
        let room = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);

        handle_invite(&h.bridge, &bob, &ghost, &room).await.unwrap();

        assert!(h.bridge.portals.by_mxid(&room).unwrap().is_encrypted());
        assert_eq!(
            h.hs.state(&room, STATE_ENCRYPTION, ""),
            Some(json!({ "algorithm": MEGOLM_ALGORITHM }))
        );
        assert_eq!(h.hs.membership(&room, h.bridge.bot_mxid()), Some(Membership::Join));
    }

    #[tokio::test]
    async fn invite_and_first_mail_create_one_room() {
        let h = Harness::new().await;
        let bob = h.login("bob", "bob@example.org").await;
        let ghost = h.ghost(CONTACT);
        let room = h.hs.create_room_as(bob.mxid(), &[ghost.mxid().clone()], true);

        let (invite, _) = tokio::join!(
            handle_invite(&h.bridge, &bob, &ghost, &room),
            h.deliver(h.mail_from(CONTACT, "bob@example.org", "racing"))
        );
        let status = h.next_status().await;

        let portal = h.portal_for(&bob);
        let bound = portal.mxid().unwrap();
        match invite.unwrap() {
            InviteOutcome::Bound => {
                assert_eq!(bound, room);
                assert_eq!(h.hs.room_count(), 1);
            }
            InviteOutcome::Existing { existing } => {
                assert_eq!(existing, bound);
                assert_eq!(h.hs.room_count(), 2);
            }
            InviteOutcome::AlreadyBound => panic!("room was never bound before"),
        }
        assert_eq!(status.room_id.as_ref(), Some(&bound));
        assert!(h.hs.messages(&bound).iter().any(|e| e.body() == Some("racing")));
    }
}
