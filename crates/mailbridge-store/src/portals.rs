use mailbridge_shared::types::{PortalKey, RoomId, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::PortalRecord;
use crate::users::parse_user_id;

const PORTAL_COLUMNS: &str = "thread_id, receiver, mxid, name, topic, avatar_hash, avatar_url, \
     name_set, avatar_set, topic_set, revision, encrypted, relay_user_id, expiration_time";

impl Database {
    pub fn insert_portal(&self, portal: &PortalRecord) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO portals ({PORTAL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                portal.key.thread_id,
                portal.key.receiver,
                portal.mxid.as_ref().map(RoomId::as_str),
                portal.name,
                portal.topic,
                portal.avatar_hash,
                portal.avatar_url,
                portal.name_set,
                portal.avatar_set,
                portal.topic_set,
                portal.revision,
                portal.encrypted,
                portal.relay_user_id.as_ref().map(UserId::as_str),
                portal.expiration_time,
            ],
        )?;
        Ok(())
    }

    pub fn update_portal(&self, portal: &PortalRecord) -> Result<()> {
        self.conn().execute(
            "UPDATE portals SET
                mxid = ?3, name = ?4, topic = ?5, avatar_hash = ?6, avatar_url = ?7,
                name_set = ?8, avatar_set = ?9, topic_set = ?10, revision = ?11,
                encrypted = ?12, relay_user_id = ?13, expiration_time = ?14
             WHERE thread_id = ?1 AND receiver = ?2",
            params![
                portal.key.thread_id,
                portal.key.receiver,
                portal.mxid.as_ref().map(RoomId::as_str),
                portal.name,
                portal.topic,
                portal.avatar_hash,
                portal.avatar_url,
                portal.name_set,
                portal.avatar_set,
                portal.topic_set,
                portal.revision,
                portal.encrypted,
                portal.relay_user_id.as_ref().map(UserId::as_str),
                portal.expiration_time,
            ],
        )?;
        Ok(())
    }

    pub fn delete_portal(&self, key: &PortalKey) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM portals WHERE thread_id = ?1 AND receiver = ?2",
            params![key.thread_id, key.receiver],
        )?;
        Ok(affected > 0)
    }

    pub fn get_portal_by_key(&self, key: &PortalKey) -> Result<Option<PortalRecord>> {
        let portal = self
            .conn()
            .query_row(
                &format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE thread_id = ?1 AND receiver = ?2"),
                params![key.thread_id, key.receiver],
                row_to_portal,
            )
            .optional()?;
        Ok(portal)
    }

    pub fn get_portal_by_mxid(&self, room: &RoomId) -> Result<Option<PortalRecord>> {
        let portal = self
            .conn()
            .query_row(
                &format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE mxid = ?1"),
                params![room.as_str()],
                row_to_portal,
            )
            .optional()?;
        Ok(portal)
    }

    pub fn get_portals_with_mxid(&self) -> Result<Vec<PortalRecord>> {
        self.query_portals("WHERE mxid IS NOT NULL", params![])
    }

    /// Private chats held by one local user.
    pub fn find_private_chats_of(&self, receiver: &str) -> Result<Vec<PortalRecord>> {
        self.query_portals("WHERE receiver = ?1", params![receiver])
    }

    /// Private chats with one remote address, across all local users.
    pub fn find_private_chats_with(&self, thread_id: &str) -> Result<Vec<PortalRecord>> {
        self.query_portals("WHERE thread_id = ?1", params![thread_id])
    }

    fn query_portals(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<PortalRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portals {filter} ORDER BY thread_id, receiver"
        ))?;
        let rows = stmt.query_map(args, row_to_portal)?;

        let mut portals = Vec::new();
        for row in rows {
            portals.push(row?);
        }
        Ok(portals)
    }
}

fn row_to_portal(row: &rusqlite::Row<'_>) -> rusqlite::Result<PortalRecord> {
    let mxid: Option<String> = row.get(2)?;
    let relay: Option<String> = row.get(12)?;

    Ok(PortalRecord {
        key: PortalKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        mxid: mxid.map(RoomId::new),
        name: row.get(3)?,
        topic: row.get(4)?,
        avatar_hash: row.get(5)?,
        avatar_url: row.get(6)?,
        name_set: row.get(7)?,
        avatar_set: row.get(8)?,
        topic_set: row.get(9)?,
        revision: row.get(10)?,
        encrypted: row.get(11)?,
        relay_user_id: relay.map(|s| parse_user_id(12, &s)).transpose()?,
        expiration_time: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(thread: &str, receiver: &str) -> PortalKey {
        PortalKey::new(thread, receiver)
    }

    #[test]
    fn crud_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("portals.db")).unwrap();
        let k = key("alice@example.com", "@bob:hs");
        assert!(db.get_portal_by_key(&k).unwrap().is_none());

        let mut portal = PortalRecord::new(k.clone());
        db.insert_portal(&portal).unwrap();
        assert_eq!(db.get_portal_by_key(&k).unwrap(), Some(portal.clone()));
        assert!(db.get_portals_with_mxid().unwrap().is_empty());

        portal.mxid = Some(RoomId::new("!room:hs"));
        portal.name = "Alice".into();
        portal.encrypted = true;
        portal.relay_user_id = Some(UserId::new("relay", "hs"));
        portal.expiration_time = 30;
        db.update_portal(&portal).unwrap();

        assert_eq!(
            db.get_portal_by_mxid(&RoomId::new("!room:hs")).unwrap(),
            Some(portal.clone())
        );
        assert_eq!(db.get_portals_with_mxid().unwrap(), vec![portal]);

        assert!(db.delete_portal(&k).unwrap());
        assert!(!db.delete_portal(&k).unwrap());
        assert!(db.get_portal_by_key(&k).unwrap().is_none());
    }

    #[test]
    fn key_is_unique() {
        let db = Database::open_in_memory().unwrap();
        let portal = PortalRecord::new(key("alice@example.com", "@bob:hs"));
        db.insert_portal(&portal).unwrap();
        assert!(db.insert_portal(&portal).is_err());
    }

    #[test]
    fn room_binding_is_unique() {
        let db = Database::open_in_memory().unwrap();
        let mut a = PortalRecord::new(key("alice@example.com", "@bob:hs"));
        let mut b = PortalRecord::new(key("carol@example.com", "@bob:hs"));
        a.mxid = Some(RoomId::new("!same:hs"));
        b.mxid = Some(RoomId::new("!same:hs"));
        db.insert_portal(&a).unwrap();
        assert!(db.insert_portal(&b).is_err());
    }

    #[test]
    fn private_chat_queries() {
        let db = Database::open_in_memory().unwrap();
        for (thread, receiver) in [
            ("alice@example.com", "@bob:hs"),
            ("carol@example.com", "@bob:hs"),
            ("alice@example.com", "@dave:hs"),
        ] {
            db.insert_portal(&PortalRecord::new(key(thread, receiver))).unwrap();
        }

        assert_eq!(db.find_private_chats_of("@bob:hs").unwrap().len(), 2);
        let with_alice = db.find_private_chats_with("alice@example.com").unwrap();
        assert_eq!(with_alice.len(), 2);
        assert!(with_alice.iter().all(|p| p.key.thread_id == "alice@example.com"));
    }
}
