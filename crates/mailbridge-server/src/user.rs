//! Local bridge accounts and their mail connections.

use std::sync::{Arc, Mutex, MutexGuard};

use mailbridge_net::{CreateRoom, MailNotification, RemoteClient, RemoteError};
use mailbridge_shared::constants::{NETWORK_NAME, STATE_SPACE_CHILD};
use mailbridge_shared::mail::MailMessage;
use mailbridge_shared::types::{normalize_address, PermissionLevel, PortalKey, RoomId, UserId};
use mailbridge_store::UserRecord;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::portal::RemoteMail;

/// Capacity of the notification channel handed to the mail connector.
const NOTIFICATION_BUFFER: usize = 64;

/// What `ping` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    NotLoggedIn,
    /// An address is stored but no live connection exists.
    Disconnected { address: String },
    LoggedIn { address: String },
}

pub struct User {
    mxid: UserId,
    permission: PermissionLevel,
    record: Mutex<UserRecord>,
    client: Mutex<Option<Arc<dyn RemoteClient>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Serializes lazy creation of the personal space.
    space_lock: tokio::sync::Mutex<()>,
}

impl User {
    pub fn new(record: UserRecord, permission: PermissionLevel) -> Self {
        Self {
            mxid: record.mxid.clone(),
            permission,
            record: Mutex::new(record),
            client: Mutex::new(None),
            listener: Mutex::new(None),
            space_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UserRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mxid(&self) -> &UserId {
        &self.mxid
    }

    pub fn permission(&self) -> PermissionLevel {
        self.permission
    }

    pub fn record(&self) -> UserRecord {
        self.lock().clone()
    }

    pub fn email_address(&self) -> Option<String> {
        self.lock().email_address.clone()
    }

    pub fn management_room(&self) -> Option<RoomId> {
        self.lock().management_room.clone()
    }

    pub fn client(&self) -> Option<Arc<dyn RemoteClient>> {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.client().is_some_and(|c| c.is_logged_in())
    }

    pub fn connection_state(&self) -> ConnectionState {
        if let Some(client) = self.client() {
            if client.is_logged_in() {
                return ConnectionState::LoggedIn {
                    address: client.address().to_string(),
                };
            }
        }
        match self.email_address() {
            Some(address) => ConnectionState::Disconnected { address },
            None => ConnectionState::NotLoggedIn,
        }
    }

    /// Update the record in place and persist it.
    fn save(
        &self,
        bridge: &Bridge,
        update: impl FnOnce(&mut UserRecord),
    ) -> Result<UserRecord, BridgeError> {
        let record = {
            let mut record = self.lock();
            update(&mut record);
            record.clone()
        };
        bridge.store.with(|db| db.update_user(&record))?;
        Ok(record)
    }

    pub(crate) fn set_management_room(
        &self,
        bridge: &Bridge,
        room: Option<RoomId>,
    ) -> Result<(), BridgeError> {
        self.save(bridge, |r| r.management_room = room)?;
        Ok(())
    }

    /// Drop the cached management room after the row was cleared elsewhere.
    pub(crate) fn forget_management_room(&self) {
        self.lock().management_room = None;
    }

    /// Log in to the mail account, store the sealed credential and start
    /// listening for mail. Returns the normalized address.
    pub async fn login(
        self: &Arc<Self>,
        bridge: &Arc<Bridge>,
        address: &str,
        password: &str,
    ) -> Result<String, BridgeError> {
        let address = normalize_address(address)
            .map_err(|e| RemoteError::AuthFailed(e.to_string()))?;
        let (client, notifications) = open_session(bridge, &address, password).await?;

        let sealed = bridge
            .credential_key()
            .seal(password)
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        let previous = self.email_address();
        self.save(bridge, |r| {
            r.email_address = Some(address.clone());
            r.credential = Some(sealed);
        })?;
        bridge.users.reindex_email(self, previous.as_deref());
        self.attach(bridge, client, notifications).await;

        info!(user = %self.mxid, address = %address, "User logged in");
        Ok(address)
    }

    /// Reconnect with the stored credential. Used at startup.
    pub async fn connect(self: &Arc<Self>, bridge: &Arc<Bridge>) -> Result<(), BridgeError> {
        let record = self.record();
        let (Some(address), Some(sealed)) = (record.email_address, record.credential) else {
            return Err(BridgeError::NotLoggedIn);
        };
        let password = bridge
            .credential_key()
            .open(&sealed)
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        let (client, notifications) = open_session(bridge, &address, &password).await?;
        self.attach(bridge, client, notifications).await;
        Ok(())
    }

    /// Make `client` the live connection and start its listener.
    async fn attach(
        self: &Arc<Self>,
        bridge: &Arc<Bridge>,
        client: Arc<dyn RemoteClient>,
        notifications: mpsc::Receiver<MailNotification>,
    ) {
        let old = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(client.clone());
        if let Some(old) = old {
            old.disconnect().await;
        }

        let handle = tokio::spawn(listen(bridge.clone(), self.clone(), client, notifications));
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Drop the connection and forget the stored address and credential.
    /// Returns `false` when the user was not logged in.
    pub async fn logout(self: &Arc<Self>, bridge: &Arc<Bridge>) -> Result<bool, BridgeError> {
        let previous = self.email_address();
        let was_connected = self.disconnect().await;
        if previous.is_none() && !was_connected {
            return Ok(false);
        }
        self.save(bridge, |r| {
            r.email_address = None;
            r.credential = None;
        })?;
        bridge.users.reindex_email(self, previous.as_deref());
        info!(user = %self.mxid, "User logged out");
        Ok(true)
    }

    /// Stop the listener and close the connection, keeping the stored login.
    pub async fn disconnect(&self) -> bool {
        if let Some(handle) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        match client {
            Some(client) => {
                client.disconnect().await;
                true
            }
            None => false,
        }
    }

    fn drop_client(&self, client: &Arc<dyn RemoteClient>) {
        let mut current = self.client.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, client)) {
            *current = None;
        }
    }

    /// Route a fetched mail to its portal. Mail sent from the user's own
    /// address belongs to the thread of its first recipient.
    pub async fn handle_mail(self: &Arc<Self>, bridge: &Arc<Bridge>, mail: MailMessage) {
        let Some(own) = self.email_address() else {
            debug!(user = %self.mxid, "Dropping mail for logged out user");
            return;
        };
        let is_self = mail.from.address == own;
        let thread = if is_self {
            match mail.to.first() {
                Some(to) => to.address.clone(),
                None => {
                    warn!(user = %self.mxid, message_id = %mail.message_id, "Own mail has no recipient");
                    return;
                }
            }
        } else {
            mail.from.address.clone()
        };

        let key = PortalKey::new(thread, self.mxid.as_str());
        let Some(portal) = bridge.portal_by_key(&key) else {
            warn!(portal = %key, "Could not load portal for incoming mail");
            return;
        };
        portal
            .enqueue_remote(RemoteMail {
                mail,
                user: self.clone(),
                is_self,
            })
            .await;
    }

    /// The user's personal space, created on first use.
    pub async fn ensure_space(&self, bridge: &Bridge) -> Option<RoomId> {
        if !bridge.config.personal_filtering_spaces {
            return None;
        }
        let _guard = self.space_lock.lock().await;
        if let Some(space) = self.lock().space_room.clone() {
            return Some(space);
        }

        let request = CreateRoom {
            name: Some(NETWORK_NAME.to_string()),
            topic: Some(format!("Your {NETWORK_NAME} bridged chats")),
            invite: vec![self.mxid.clone()],
            room_type: Some("m.space".to_string()),
            ..CreateRoom::default()
        };
        let space = match bridge.bot().create_room(&request).await {
            Ok(space) => space,
            Err(e) => {
                warn!(user = %self.mxid, error = %e, "Failed to create personal space");
                return None;
            }
        };
        if let Err(e) = self.save(bridge, |r| r.space_room = Some(space.clone())) {
            warn!(user = %self.mxid, error = %e, "Failed to save personal space");
        }
        info!(user = %self.mxid, space = %space, "Created personal space");
        Some(space)
    }

    pub async fn add_to_space(&self, bridge: &Bridge, room: &RoomId) {
        let Some(space) = self.ensure_space(bridge).await else {
            return;
        };
        let content = json!({ "via": [bridge.config.homeserver_domain] });
        if let Err(e) = bridge
            .bot()
            .send_state(&space, STATE_SPACE_CHILD, room.as_str(), &content)
            .await
        {
            warn!(space = %space, room_id = %room, error = %e, "Failed to add room to space");
        }
    }
}

async fn open_session(
    bridge: &Bridge,
    address: &str,
    password: &str,
) -> Result<(Arc<dyn RemoteClient>, mpsc::Receiver<MailNotification>), BridgeError> {
    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let client = bridge.connector.login(address, password, tx).await?;
    Ok((client, rx))
}

async fn listen(
    bridge: Arc<Bridge>,
    user: Arc<User>,
    client: Arc<dyn RemoteClient>,
    mut notifications: mpsc::Receiver<MailNotification>,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            MailNotification::NewMail => match client.fetch_latest().await {
                Ok(mail) => user.handle_mail(&bridge, mail).await,
                Err(e) => warn!(user = %user.mxid, error = %e, "Failed to fetch new mail"),
            },
            MailNotification::Disconnected { reason } => {
                warn!(user = %user.mxid, reason = %reason, "Mail connection lost");
                user.drop_client(&client);
                break;
            }
        }
    }
    debug!(user = %user.mxid, "Mail listener stopped");
}
