//! Mail-network boundary.
//!
//! A [`RemoteConnector`] logs an address in and hands back a connected
//! [`RemoteClient`]. Inbound mail is announced through [`MailNotification`]s
//! on the channel given at login; the listener then materializes the message
//! with [`RemoteClient::fetch_latest`].

use std::sync::Arc;

use async_trait::async_trait;
use mailbridge_shared::mail::{MailMessage, OutgoingMail};
use tokio::sync::mpsc;

use crate::error::RemoteError;

/// Notifications sent *from* a mail connection to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailNotification {
    /// New mail arrived in the watched mailbox.
    NewMail,
    /// The connection dropped and will not deliver further notifications.
    Disconnected { reason: String },
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Address this client is logged in as.
    fn address(&self) -> &str;

    fn is_logged_in(&self) -> bool;

    /// Send a mail and return the `Message-ID` it was sent with.
    async fn send_message(&self, mail: &OutgoingMail) -> Result<String, RemoteError>;

    /// Fetch the most recent message in the mailbox.
    async fn fetch_latest(&self) -> Result<MailMessage, RemoteError>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn login(
        &self,
        address: &str,
        credential: &str,
        notifications: mpsc::Sender<MailNotification>,
    ) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}
