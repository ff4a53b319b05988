//! Identity registries: in-memory caches of users, puppets and portals backed
//! by the database.
//!
//! Each registry guards its maps with one mutex. The primary lookup is
//! get-or-create and runs its database round trip inside the critical
//! section, so a first reference creates exactly one row and one instance.
//! Secondary lookups never create anything. A persistence failure yields
//! `None` after logging; callers treat that as "cannot proceed now".
//!
//! Lock order: registry mutex, then the store mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use mailbridge_shared::ghost::GhostIdFormat;
use mailbridge_shared::types::{normalize_address, PortalKey, RoomId, UserId};
use mailbridge_store::{PortalRecord, PuppetRecord, StoreError, UserRecord};
use tracing::{debug, error, warn};

use crate::config::BridgeConfig;
use crate::portal::Portal;
use crate::puppet::Puppet;
use crate::store::Store;
use crate::user::User;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UserMaps {
    by_mxid: HashMap<UserId, Arc<User>>,
    by_email: HashMap<String, Arc<User>>,
}

impl UserMaps {
    fn cache(&mut self, user: Arc<User>) -> Arc<User> {
        if let Some(address) = user.email_address() {
            self.by_email.insert(address, user.clone());
        }
        self.by_mxid.insert(user.mxid().clone(), user.clone());
        user
    }
}

pub struct UserRegistry {
    store: Store,
    config: Arc<BridgeConfig>,
    maps: Mutex<UserMaps>,
}

impl UserRegistry {
    pub fn new(store: Store, config: Arc<BridgeConfig>) -> Self {
        Self {
            store,
            config,
            maps: Mutex::new(UserMaps::default()),
        }
    }

    fn build(&self, record: UserRecord) -> Arc<User> {
        let permission = self.config.permission_for(&record.mxid);
        Arc::new(User::new(record, permission))
    }

    /// Get or create the user for a chat id.
    pub fn by_mxid(&self, mxid: &UserId) -> Option<Arc<User>> {
        let mut maps = lock(&self.maps);
        if let Some(user) = maps.by_mxid.get(mxid) {
            return Some(user.clone());
        }

        let loaded = self.store.with(|db| match db.get_user_by_mxid(mxid)? {
            Some(record) => Ok(record),
            None => {
                let record = UserRecord::new(mxid.clone());
                db.insert_user(&record)?;
                debug!(user = %mxid, "Created user");
                Ok(record)
            }
        });
        match loaded {
            Ok(record) => Some(maps.cache(self.build(record))),
            Err(e) => {
                error!(user = %mxid, error = %e, "Failed to load user");
                None
            }
        }
    }

    /// Look up the user logged in as `address`. Never creates a user.
    pub fn by_email(&self, address: &str) -> Option<Arc<User>> {
        let mut maps = lock(&self.maps);
        if let Some(user) = maps.by_email.get(address) {
            return Some(user.clone());
        }

        match self.store.with(|db| db.get_user_by_email(address)) {
            Ok(Some(record)) => {
                // The chat-id entry may already be cached without the address.
                if let Some(user) = maps.by_mxid.get(&record.mxid).cloned() {
                    if user.email_address().as_deref() == Some(address) {
                        maps.by_email.insert(address.to_string(), user.clone());
                        return Some(user);
                    }
                    return None;
                }
                Some(maps.cache(self.build(record)))
            }
            Ok(None) => None,
            Err(e) => {
                error!(address, error = %e, "Failed to look up user by address");
                None
            }
        }
    }

    /// Keep the address index in line after a login or logout.
    pub fn reindex_email(&self, user: &Arc<User>, previous: Option<&str>) {
        let mut maps = lock(&self.maps);
        if let Some(previous) = previous {
            if maps
                .by_email
                .get(previous)
                .is_some_and(|u| Arc::ptr_eq(u, user))
            {
                maps.by_email.remove(previous);
            }
        }
        if let Some(current) = user.email_address() {
            maps.by_email.insert(current, user.clone());
        }
    }

    /// Users with a stored login, loaded into the cache.
    pub fn logged_in(&self) -> Vec<Arc<User>> {
        let records = match self.store.with(|db| db.get_logged_in_users()) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to load logged in users");
                return Vec::new();
            }
        };
        let mut maps = lock(&self.maps);
        records
            .into_iter()
            .map(|record| match maps.by_mxid.get(&record.mxid) {
                Some(user) => user.clone(),
                None => maps.cache(self.build(record)),
            })
            .collect()
    }

    /// Unset `room` as management room of every user that had it.
    pub fn clear_management_room(&self, room: &RoomId) -> Result<usize, StoreError> {
        let maps = lock(&self.maps);
        let cleared = self.store.with(|db| db.clear_management_room(room))?;
        for user in maps.by_mxid.values() {
            if user.management_room().as_ref() == Some(room) {
                user.forget_management_room();
            }
        }
        Ok(cleared)
    }

    pub fn all(&self) -> Vec<Arc<User>> {
        lock(&self.maps).by_mxid.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.maps).by_mxid.len()
    }
}

// ---------------------------------------------------------------------------
// Puppets
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PuppetMaps {
    by_address: HashMap<String, Arc<Puppet>>,
    by_custom_mxid: HashMap<UserId, Arc<Puppet>>,
}

impl PuppetMaps {
    fn cache(&mut self, puppet: Arc<Puppet>) -> Arc<Puppet> {
        if let Some(custom) = puppet.custom_mxid() {
            self.by_custom_mxid.insert(custom, puppet.clone());
        }
        self.by_address.insert(puppet.address(), puppet.clone());
        puppet
    }
}

pub struct PuppetRegistry {
    store: Store,
    ghosts: GhostIdFormat,
    maps: Mutex<PuppetMaps>,
}

impl PuppetRegistry {
    pub fn new(store: Store, ghosts: GhostIdFormat) -> Self {
        Self {
            store,
            ghosts,
            maps: Mutex::new(PuppetMaps::default()),
        }
    }

    fn build(&self, record: PuppetRecord) -> Arc<Puppet> {
        let mxid = self.ghosts.format(&record.email_address);
        Arc::new(Puppet::new(record, mxid))
    }

    /// Get or create the puppet of a mail address.
    pub fn by_address(&self, address: &str) -> Option<Arc<Puppet>> {
        let address = match normalize_address(address) {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, "Refusing puppet for invalid address");
                return None;
            }
        };

        let mut maps = lock(&self.maps);
        if let Some(puppet) = maps.by_address.get(&address) {
            return Some(puppet.clone());
        }

        let loaded = self.store.with(|db| match db.get_puppet_by_address(&address)? {
            Some(record) => Ok(record),
            None => {
                let record = PuppetRecord::new(address.clone());
                db.insert_puppet(&record)?;
                debug!(address = %address, "Created puppet");
                Ok(record)
            }
        });
        match loaded {
            Ok(record) => Some(maps.cache(self.build(record))),
            Err(e) => {
                error!(address = %address, error = %e, "Failed to load puppet");
                None
            }
        }
    }

    /// Puppet behind a ghost id. `None` for ids that are not ghosts.
    pub fn by_mxid(&self, mxid: &UserId) -> Option<Arc<Puppet>> {
        let address = self.ghosts.parse(mxid)?;
        self.by_address(&address)
    }

    /// Puppet double-puppeted by a local user. Never creates a puppet.
    pub fn by_custom_mxid(&self, mxid: &UserId) -> Option<Arc<Puppet>> {
        let mut maps = lock(&self.maps);
        if let Some(puppet) = maps.by_custom_mxid.get(mxid) {
            return Some(puppet.clone());
        }

        match self.store.with(|db| db.get_puppet_by_custom_mxid(mxid)) {
            Ok(Some(record)) => match maps.by_address.get(&record.email_address).cloned() {
                Some(puppet) => {
                    // Cached copy is authoritative; only index it if it agrees.
                    if puppet.custom_mxid().as_ref() == Some(mxid) {
                        maps.by_custom_mxid.insert(mxid.clone(), puppet.clone());
                        Some(puppet)
                    } else {
                        None
                    }
                }
                None => Some(maps.cache(self.build(record))),
            },
            Ok(None) => None,
            Err(e) => {
                error!(user = %mxid, error = %e, "Failed to look up double puppet");
                None
            }
        }
    }

    /// Link (or with `None`, unlink) a puppet to a local user's own account.
    pub fn link(
        &self,
        puppet: &Arc<Puppet>,
        link: Option<(UserId, String)>,
    ) -> Result<(), StoreError> {
        let mut maps = lock(&self.maps);
        let previous = puppet.custom_mxid();
        let record = puppet.set_link(link);
        self.store.with(|db| db.update_puppet(&record))?;

        if let Some(previous) = previous {
            maps.by_custom_mxid.remove(&previous);
        }
        if let Some(current) = record.custom_mxid {
            maps.by_custom_mxid.insert(current, puppet.clone());
        }
        Ok(())
    }

    /// Stored double-puppet links.
    pub fn linked(&self) -> Result<Vec<PuppetRecord>, StoreError> {
        self.store.with(|db| db.get_puppets_with_custom_mxid())
    }

    pub fn len(&self) -> usize {
        lock(&self.maps).by_address.len()
    }
}

// ---------------------------------------------------------------------------
// Portals
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PortalMaps {
    by_key: HashMap<PortalKey, Arc<Portal>>,
    by_mxid: HashMap<RoomId, Arc<Portal>>,
}

impl PortalMaps {
    fn cache(&mut self, portal: Arc<Portal>) -> Arc<Portal> {
        if let Some(room) = portal.mxid() {
            self.by_mxid.insert(room, portal.clone());
        }
        self.by_key.insert(portal.key().clone(), portal.clone());
        portal
    }

    /// Reuse the cached instance of a loaded row when there is one.
    fn adopt(&mut self, record: PortalRecord, buffer: usize) -> Arc<Portal> {
        match self.by_key.get(&record.key) {
            Some(portal) => portal.clone(),
            None => self.cache(Arc::new(Portal::new(record, buffer))),
        }
    }
}

pub struct PortalRegistry {
    store: Store,
    buffer: usize,
    maps: Mutex<PortalMaps>,
}

impl PortalRegistry {
    pub fn new(store: Store, buffer: usize) -> Self {
        Self {
            store,
            buffer,
            maps: Mutex::new(PortalMaps::default()),
        }
    }

    /// Get or create the portal of a conversation.
    pub fn by_key(&self, key: &PortalKey) -> Option<Arc<Portal>> {
        let mut maps = lock(&self.maps);
        if let Some(portal) = maps.by_key.get(key) {
            return Some(portal.clone());
        }

        let loaded = self.store.with(|db| match db.get_portal_by_key(key)? {
            Some(record) => Ok(record),
            None => {
                let record = PortalRecord::new(key.clone());
                db.insert_portal(&record)?;
                debug!(portal = %key, "Created portal");
                Ok(record)
            }
        });
        match loaded {
            Ok(record) => Some(maps.cache(Arc::new(Portal::new(record, self.buffer)))),
            Err(e) => {
                error!(portal = %key, error = %e, "Failed to load portal");
                None
            }
        }
    }

    /// Portal bound to a room. Never creates a portal.
    pub fn by_mxid(&self, room: &RoomId) -> Option<Arc<Portal>> {
        let mut maps = lock(&self.maps);
        if let Some(portal) = maps.by_mxid.get(room) {
            return Some(portal.clone());
        }

        match self.store.with(|db| db.get_portal_by_mxid(room)) {
            Ok(Some(record)) => {
                let portal = maps.adopt(record, self.buffer);
                // A cached instance may have moved on to another room.
                if portal.mxid().as_ref() == Some(room) {
                    maps.by_mxid.insert(room.clone(), portal.clone());
                    Some(portal)
                } else {
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                error!(room_id = %room, error = %e, "Failed to look up portal by room");
                None
            }
        }
    }

    /// Bind `portal` to `room`, replacing any previous binding, and persist
    /// the portal. The previous room is left alone; it just stops routing.
    /// Callers hold the portal's room lock.
    pub fn bind_room(&self, portal: &Arc<Portal>, room: RoomId) -> Result<(), StoreError> {
        let mut maps = lock(&self.maps);
        let previous = portal.mxid();
        let record = portal.update(|r| r.mxid = Some(room.clone()));
        if let Err(e) = self.store.with(|db| db.update_portal(&record)) {
            portal.update(|r| r.mxid = previous);
            return Err(e);
        }

        if let Some(previous) = previous.filter(|p| p != &room) {
            maps.by_mxid.remove(&previous);
            debug!(portal = %portal.key(), old = %previous, new = %room, "Portal moved to new room");
        }
        maps.by_mxid.insert(room, portal.clone());
        Ok(())
    }

    /// Unbridge: delete the portal row and stop its loop.
    pub fn remove(&self, key: &PortalKey) -> Result<bool, StoreError> {
        let mut maps = lock(&self.maps);
        let deleted = self.store.with(|db| db.delete_portal(key))?;
        if let Some(portal) = maps.by_key.remove(key) {
            if let Some(room) = portal.mxid() {
                maps.by_mxid.remove(&room);
            }
            portal.stop();
        }
        Ok(deleted)
    }

    /// Portals with a bound room.
    pub fn with_room(&self) -> Vec<Arc<Portal>> {
        self.load_many(|store| store.with(|db| db.get_portals_with_mxid()))
    }

    /// Private chats held by a local user.
    pub fn private_chats_of(&self, receiver: &UserId) -> Vec<Arc<Portal>> {
        self.load_many(|store| store.with(|db| db.find_private_chats_of(receiver.as_str())))
    }

    /// Private chats with one mail address across all users.
    pub fn private_chats_with(&self, address: &str) -> Vec<Arc<Portal>> {
        self.load_many(|store| store.with(|db| db.find_private_chats_with(address)))
    }

    fn load_many(
        &self,
        query: impl FnOnce(&Store) -> Result<Vec<PortalRecord>, StoreError>,
    ) -> Vec<Arc<Portal>> {
        let mut maps = lock(&self.maps);
        match query(&self.store) {
            Ok(records) => records
                .into_iter()
                .map(|record| maps.adopt(record, self.buffer))
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to load portals");
                Vec::new()
            }
        }
    }

    pub fn cached(&self) -> Vec<Arc<Portal>> {
        lock(&self.maps).by_key.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.maps).by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use mailbridge_store::Database;

    use super::*;

    fn store() -> Store {
        Store::new(Database::open_in_memory().unwrap())
    }

    fn ghosts() -> GhostIdFormat {
        GhostIdFormat::new("email_{{.}}", "hs").unwrap()
    }

    fn portal_rows(store: &Store) -> usize {
        store
            .with(|db| db.find_private_chats_of("@bob:hs"))
            .unwrap()
            .len()
    }

    #[test]
    fn portal_get_or_create_is_idempotent() {
        let store = store();
        let portals = PortalRegistry::new(store.clone(), 8);
        let key = PortalKey::new("alice@example.com", "@bob:hs");

        let first = portals.by_key(&key).unwrap();
        let second = portals.by_key(&key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(portal_rows(&store), 1);

        // A fresh registry over the same store loads instead of inserting.
        let again = PortalRegistry::new(store.clone(), 8).by_key(&key).unwrap();
        assert_eq!(again.key(), &key);
        assert_eq!(portal_rows(&store), 1);
    }

    #[test]
    fn portal_room_index() {
        let store = store();
        let portals = PortalRegistry::new(store.clone(), 8);
        let key = PortalKey::new("alice@example.com", "@bob:hs");
        let room = RoomId::new("!one:hs");

        assert!(portals.by_mxid(&room).is_none());
        let portal = portals.by_key(&key).unwrap();
        portals.bind_room(&portal, room.clone()).unwrap();
        assert!(Arc::ptr_eq(&portals.by_mxid(&room).unwrap(), &portal));

        // Rebinding moves the index; the old room no longer resolves.
        let second = RoomId::new("!two:hs");
        portals.bind_room(&portal, second.clone()).unwrap();
        assert!(portals.by_mxid(&room).is_none());
        assert!(Arc::ptr_eq(&portals.by_mxid(&second).unwrap(), &portal));

        // Secondary lookup from the database on a cold registry.
        let cold = PortalRegistry::new(store.clone(), 8);
        assert_eq!(cold.by_mxid(&second).unwrap().key(), &key);
        assert_eq!(cold.with_room().len(), 1);
        assert_eq!(cold.private_chats_with("alice@example.com").len(), 1);
        assert_eq!(cold.private_chats_of(&UserId::new("bob", "hs")).len(), 1);

        assert!(cold.remove(&key).unwrap());
        assert!(cold.by_mxid(&second).is_none());
        assert_eq!(portal_rows(&store), 0);
    }

    #[test]
    fn puppet_lookups() {
        let store = store();
        let puppets = PuppetRegistry::new(store.clone(), ghosts());

        let alice = puppets.by_address("Alice@Example.com").unwrap();
        assert_eq!(alice.address(), "alice@example.com");
        assert_eq!(alice.mxid().as_str(), "@email_alice@example.com:hs");
        assert!(Arc::ptr_eq(&puppets.by_mxid(alice.mxid()).unwrap(), &alice));
        assert!(puppets.by_mxid(&UserId::new("bob", "hs")).is_none());
        assert!(puppets.by_address("not an address").is_none());

        let bob = UserId::new("bob", "hs");
        assert!(puppets.by_custom_mxid(&bob).is_none());
        puppets
            .link(&alice, Some((bob.clone(), "token".into())))
            .unwrap();
        assert!(Arc::ptr_eq(&puppets.by_custom_mxid(&bob).unwrap(), &alice));

        let cold = PuppetRegistry::new(store.clone(), ghosts());
        assert_eq!(cold.by_custom_mxid(&bob).unwrap().address(), "alice@example.com");
        assert_eq!(cold.linked().unwrap().len(), 1);

        puppets.link(&alice, None).unwrap();
        assert!(puppets.by_custom_mxid(&bob).is_none());
    }

    #[test]
    fn user_lookups() {
        let store = store();
        let mut config = BridgeConfig::default();
        config
            .permissions
            .insert("hs".into(), mailbridge_shared::types::PermissionLevel::User);
        let users = UserRegistry::new(store.clone(), Arc::new(config));

        let bob_id = UserId::new("bob", "hs");
        let bob = users.by_mxid(&bob_id).unwrap();
        assert!(Arc::ptr_eq(&users.by_mxid(&bob_id).unwrap(), &bob));
        assert_eq!(bob.permission(), mailbridge_shared::types::PermissionLevel::User);
        assert!(users.by_email("bob@example.org").is_none());

        let mut record = bob.record();
        record.email_address = Some("bob@example.org".into());
        record.credential = Some("00".into());
        store.with(|db| db.update_user(&record)).unwrap();

        let cold = UserRegistry::new(store.clone(), Arc::new(BridgeConfig::default()));
        let found = cold.by_email("bob@example.org").unwrap();
        assert_eq!(found.mxid(), &bob_id);
        assert_eq!(cold.logged_in().len(), 1);
        assert_eq!(cold.len(), 1);
    }
}
