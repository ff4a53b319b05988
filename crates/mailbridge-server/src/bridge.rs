//! Bridge root: owns the registries, the transports and the status channel.

use std::sync::{Arc, Mutex};

use mailbridge_net::{ChatTransport, Intent, RemoteConnector};
use mailbridge_shared::crypto::CredentialKey;
use mailbridge_shared::ghost::GhostIdFormat;
use mailbridge_shared::types::{PortalKey, RoomId, UserId};
use mailbridge_store::Database;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, ConfigError};
use crate::converter::Converter;
use crate::dedup::DedupIndex;
use crate::portal::Portal;
use crate::puppet::Puppet;
use crate::registry::{PortalRegistry, PuppetRegistry, UserRegistry};
use crate::status::{run_collector, CollectorOptions, MessageStatus, StatusReporter};
use crate::store::Store;
use crate::user::User;

pub struct Bridge {
    pub config: Arc<BridgeConfig>,
    pub ghosts: GhostIdFormat,
    pub store: Store,
    pub transport: Arc<dyn ChatTransport>,
    pub connector: Arc<dyn RemoteConnector>,
    pub converter: Arc<dyn Converter>,
    pub users: UserRegistry,
    pub puppets: PuppetRegistry,
    pub portals: PortalRegistry,
    pub dedup: DedupIndex,
    pub status: StatusReporter,
    status_rx: Mutex<Option<mpsc::Receiver<MessageStatus>>>,
    credential_key: CredentialKey,
    bot_mxid: UserId,
    bot: Arc<dyn Intent>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        db: Database,
        transport: Arc<dyn ChatTransport>,
        connector: Arc<dyn RemoteConnector>,
        converter: Arc<dyn Converter>,
    ) -> Result<Arc<Self>, ConfigError> {
        let ghosts = config.validate()?;
        let bot_mxid = config.bot_mxid()?;
        let config = Arc::new(config);
        let store = Store::new(db);
        let (status, status_rx) = StatusReporter::channel(config.status_buffer);
        let bot = transport.bot();

        Ok(Arc::new(Self {
            credential_key: CredentialKey::derive(&config.credential_secret),
            users: UserRegistry::new(store.clone(), config.clone()),
            puppets: PuppetRegistry::new(store.clone(), ghosts.clone()),
            portals: PortalRegistry::new(store.clone(), config.portal_message_buffer),
            dedup: DedupIndex::new(store.clone()),
            status,
            status_rx: Mutex::new(Some(status_rx)),
            config,
            ghosts,
            store,
            transport,
            connector,
            converter,
            bot_mxid,
            bot,
        }))
    }

    pub fn credential_key(&self) -> &CredentialKey {
        &self.credential_key
    }

    pub fn bot(&self) -> Arc<dyn Intent> {
        self.bot.clone()
    }

    pub fn bot_mxid(&self) -> &UserId {
        &self.bot_mxid
    }

    pub fn user_by_mxid(&self, mxid: &UserId) -> Option<Arc<User>> {
        self.users.by_mxid(mxid)
    }

    pub fn user_by_email(&self, address: &str) -> Option<Arc<User>> {
        self.users.by_email(address)
    }

    pub fn puppet_by_address(&self, address: &str) -> Option<Arc<Puppet>> {
        self.puppets.by_address(address)
    }

    pub fn puppet_by_mxid(&self, mxid: &UserId) -> Option<Arc<Puppet>> {
        self.puppets.by_mxid(mxid)
    }

    pub fn puppet_by_custom_mxid(&self, mxid: &UserId) -> Option<Arc<Puppet>> {
        self.puppets.by_custom_mxid(mxid)
    }

    /// Portal of a conversation with its loop running, created on first use.
    pub fn portal_by_key(self: &Arc<Self>, key: &PortalKey) -> Option<Arc<Portal>> {
        let portal = self.portals.by_key(key)?;
        portal.start(self);
        Some(portal)
    }

    pub fn portal_by_mxid(self: &Arc<Self>, room: &RoomId) -> Option<Arc<Portal>> {
        let portal = self.portals.by_mxid(room)?;
        portal.start(self);
        Some(portal)
    }

    /// Take the status receiver so something other than the built-in
    /// collector consumes it. `start` skips the collector afterwards.
    pub fn take_status_receiver(&self) -> Option<mpsc::Receiver<MessageStatus>> {
        self.status_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Register the bot, start the status collector and reconnect every user
    /// with stored credentials.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.bot.ensure_registered().await {
            warn!(bot = %self.bot_mxid, error = %e, "Failed to register bridge bot");
        }

        if let Some(rx) = self.take_status_receiver() {
            let options = CollectorOptions {
                status_events: self.config.message_status_events,
                error_notices: self.config.message_error_notices,
            };
            tokio::spawn(run_collector(rx, self.bot(), options));
        }

        let users = self.users.logged_in();
        info!(count = users.len(), "Reconnecting users");
        for user in users {
            if let Err(e) = user.connect(self).await {
                warn!(user = %user.mxid(), error = %e, "Failed to reconnect user");
            }
        }

        match self.puppets.linked() {
            Ok(linked) => {
                for puppet in &linked {
                    debug!(address = %puppet.email_address, custom_mxid = ?puppet.custom_mxid, "Double puppet link");
                }
                info!(count = linked.len(), "Loaded double puppet links");
            }
            Err(e) => warn!(error = %e, "Failed to load double puppet links"),
        }
    }

    /// Disconnect every user and stop every cached portal loop.
    pub async fn stop(&self) {
        for user in self.users.all() {
            user.disconnect().await;
        }
        for portal in self.portals.cached() {
            portal.stop();
        }
        info!("Bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use mailbridge_net::{MemoryHomeserver, MemoryMailNetwork};

    use super::*;
    use crate::converter::MailConverter;
    use crate::test_support::test_config;

    #[tokio::test]
    async fn start_reconnects_stored_users() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");
        let hs = MemoryHomeserver::new("hs");
        let mail = MemoryMailNetwork::new();
        let bot = UserId::new("emailbot", "hs");

        let build = || {
            Bridge::new(
                test_config(),
                Database::open_at(&path).unwrap(),
                Arc::new(hs.transport(bot.clone())),
                Arc::new(mail.clone()),
                Arc::new(MailConverter),
            )
            .unwrap()
        };

        let first = build();
        let bob = first.user_by_mxid(&UserId::new("bob", "hs")).unwrap();
        bob.login(&first, "bob@example.org", "hunter2").await.unwrap();
        first.stop().await;
        assert!(!bob.is_logged_in());

        let second = build();
        second.start().await;
        assert!(hs.is_registered(&bot));
        let bob = second.user_by_email("bob@example.org").unwrap();
        assert!(bob.is_logged_in());
    }

    #[test]
    fn rejects_config_without_secrets() {
        let mut config = test_config();
        config.credential_secret.clear();
        let hs = MemoryHomeserver::new("hs");
        let result = Bridge::new(
            config,
            Database::open_in_memory().unwrap(),
            Arc::new(hs.transport(UserId::new("emailbot", "hs"))),
            Arc::new(MemoryMailNetwork::new()),
            Arc::new(MailConverter),
        );
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }
}
