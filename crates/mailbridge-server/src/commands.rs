//! Text commands sent to the bridge bot.

use std::sync::Arc;

use mailbridge_shared::event::{ChatEvent, MessageContent};
use mailbridge_shared::types::{PermissionLevel, RoomId};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::user::{ConnectionState, User};

const HELP: &str = "\
Available commands:
* login <address> <password> - Log in to your email account
* logout - Log out of your email account
* ping - Check your login status
* login-matrix <access token> - Show your own mail as sent by your account
* set-relay - Relay messages of logged out users in this room through your account
* unset-relay - Stop relaying messages in this room
* set-timer <seconds> - Redact bridged messages in this room after a delay, 0 turns it off
* help - Show this message";

/// Run one command and reply with a notice in the room it came from.
pub async fn handle(bridge: &Arc<Bridge>, user: &Arc<User>, event: &ChatEvent, text: &str) {
    let mut args = text.split_whitespace();
    let command = args.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = args.collect();
    debug!(user = %user.mxid(), command = %command, "Handling command");

    let reply = match command.as_str() {
        "login" => login(bridge, user, event, &args).await,
        "logout" => logout(bridge, user).await,
        "ping" => ping(user),
        "login-matrix" => login_matrix(bridge, user, event, &args).await,
        "set-relay" => set_relay(bridge, user, &event.room_id, true).await,
        "unset-relay" => set_relay(bridge, user, &event.room_id, false).await,
        "set-timer" => set_timer(bridge, user, &event.room_id, &args).await,
        "help" | "" => HELP.to_string(),
        _ => "Unknown command, use `help` for a list of commands.".to_string(),
    };

    if let Err(e) = bridge
        .bot()
        .send_message(&event.room_id, &MessageContent::notice(reply))
        .await
    {
        warn!(room_id = %event.room_id, error = %e, "Failed to send command reply");
    }
}

/// Commands carrying secrets are removed from the room. Best effort.
async fn redact_secret(bridge: &Bridge, event: &ChatEvent) {
    if let Err(e) = bridge
        .bot()
        .redact(&event.room_id, &event.event_id, Some("Contains credentials"))
        .await
    {
        warn!(room_id = %event.room_id, error = %e, "Failed to redact command with credentials");
    }
}

async fn login(bridge: &Arc<Bridge>, user: &Arc<User>, event: &ChatEvent, args: &[&str]) -> String {
    if user.permission() < PermissionLevel::User {
        return "You don't have permission to log in.".to_string();
    }
    let [address, password] = args else {
        return "Usage: login <address> <password>".to_string();
    };
    redact_secret(bridge, event).await;
    if let ConnectionState::LoggedIn { address } = user.connection_state() {
        return format!("You're already logged in as {address}, log out first.");
    }

    match user.login(bridge, address, password).await {
        Ok(address) => {
            info!(user = %user.mxid(), address = %address, "User logged in");
            format!("Successfully logged in as {address}")
        }
        Err(e) => {
            warn!(user = %user.mxid(), error = %e, "Login failed");
            format!("Failed to log in: {e}")
        }
    }
}

async fn logout(bridge: &Arc<Bridge>, user: &Arc<User>) -> String {
    match user.logout(bridge).await {
        Ok(true) => "Logged out.".to_string(),
        Ok(false) => "You're not logged in.".to_string(),
        Err(e) => format!("Failed to log out: {e}"),
    }
}

fn ping(user: &User) -> String {
    match user.connection_state() {
        ConnectionState::NotLoggedIn => "You're not logged in.".to_string(),
        ConnectionState::Disconnected { address } => {
            format!("You were logged in as {address}, but the connection is down.")
        }
        ConnectionState::LoggedIn { address } => format!("You're logged in as {address}."),
    }
}

async fn login_matrix(bridge: &Bridge, user: &User, event: &ChatEvent, args: &[&str]) -> String {
    let [token] = args else {
        return "Usage: login-matrix <access token>".to_string();
    };
    redact_secret(bridge, event).await;

    let Some(address) = user.email_address() else {
        return "You must log in to email first.".to_string();
    };
    let intent = bridge.transport.double_puppet(user.mxid(), token);
    match intent.whoami().await {
        Ok(owner) if &owner == user.mxid() => {}
        Ok(owner) => {
            warn!(user = %user.mxid(), owner = %owner, "Double puppet token belongs to someone else");
            return "That access token belongs to a different account.".to_string();
        }
        Err(e) => return format!("Invalid access token: {e}"),
    }

    let Some(puppet) = bridge.puppet_by_address(&address) else {
        return "Failed to load your puppet, try again later.".to_string();
    };
    match bridge
        .puppets
        .link(&puppet, Some((user.mxid().clone(), token.to_string())))
    {
        Ok(()) => {
            info!(user = %user.mxid(), address = %address, "Double puppeting enabled");
            "Double puppeting enabled: mail you send elsewhere now shows up as sent by you.".to_string()
        }
        Err(e) => format!("Failed to save access token: {e}"),
    }
}

async fn set_relay(bridge: &Arc<Bridge>, user: &User, room: &RoomId, enable: bool) -> String {
    if !bridge.config.relay_enabled {
        return "Relaying is not enabled on this bridge.".to_string();
    }
    if user.permission() < PermissionLevel::User {
        return "You don't have permission to manage the relay.".to_string();
    }
    let Some(portal) = bridge.portal_by_mxid(room) else {
        return "This is not a portal room.".to_string();
    };
    // The bot replies in the portal room, so make sure it is there.
    if let Some(contact) = bridge.puppet_by_address(&portal.key().thread_id) {
        let ghost = contact.intent(bridge.transport.as_ref());
        portal.invite_bot(bridge, ghost.as_ref(), room).await;
    }

    if enable {
        if !user.is_logged_in() {
            return "You must be logged in to relay messages.".to_string();
        }
        match portal.set_relay(bridge, Some(user.mxid().clone())).await {
            Ok(()) => "Messages from users who aren't logged in will be sent through your account.".to_string(),
            Err(e) => format!("Failed to set relay: {e}"),
        }
    } else {
        match portal.set_relay(bridge, None).await {
            Ok(()) => "Messages from users who aren't logged in will no longer be bridged.".to_string(),
            Err(e) => format!("Failed to unset relay: {e}"),
        }
    }
}

async fn set_timer(bridge: &Arc<Bridge>, user: &User, room: &RoomId, args: &[&str]) -> String {
    let Some(seconds) = args.first().and_then(|a| a.parse::<u32>().ok()) else {
        return "Usage: set-timer <seconds>".to_string();
    };
    if user.permission() < PermissionLevel::User {
        return "You don't have permission to change the timer.".to_string();
    }
    let Some(portal) = bridge.portal_by_mxid(room) else {
        return "This is not a portal room.".to_string();
    };
    if let Some(contact) = bridge.puppet_by_address(&portal.key().thread_id) {
        let ghost = contact.intent(bridge.transport.as_ref());
        portal.invite_bot(bridge, ghost.as_ref(), room).await;
    }

    match portal.set_expiration_time(bridge, seconds).await {
        Ok(()) if seconds == 0 => "Disappearing messages turned off.".to_string(),
        Ok(()) => format!("Bridged messages will now be redacted after {seconds} seconds."),
        Err(e) => format!("Failed to set timer: {e}"),
    }
}
