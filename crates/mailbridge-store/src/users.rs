use mailbridge_shared::types::{RoomId, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::UserRecord;

const USER_COLUMNS: &str = "mxid, email_address, credential, management_room, space_room";

impl Database {
    pub fn insert_user(&self, user: &UserRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (mxid, email_address, credential, management_room, space_room)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.mxid.as_str(),
                user.email_address,
                user.credential,
                user.management_room.as_ref().map(RoomId::as_str),
                user.space_room.as_ref().map(RoomId::as_str),
            ],
        )?;
        Ok(())
    }

    pub fn update_user(&self, user: &UserRecord) -> Result<()> {
        self.conn().execute(
            "UPDATE users
             SET email_address = ?2, credential = ?3, management_room = ?4, space_room = ?5
             WHERE mxid = ?1",
            params![
                user.mxid.as_str(),
                user.email_address,
                user.credential,
                user.management_room.as_ref().map(RoomId::as_str),
                user.space_room.as_ref().map(RoomId::as_str),
            ],
        )?;
        Ok(())
    }

    pub fn get_user_by_mxid(&self, mxid: &UserId) -> Result<Option<UserRecord>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE mxid = ?1"),
                params![mxid.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_email(&self, address: &str) -> Result<Option<UserRecord>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email_address = ?1"),
                params![address],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Users with a stored remote address, i.e. the ones to reconnect at startup.
    pub fn get_logged_in_users(&self) -> Result<Vec<UserRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email_address IS NOT NULL ORDER BY mxid"
        ))?;
        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Clear the management room from whichever user currently owns it.
    pub fn clear_management_room(&self, room: &RoomId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE users SET management_room = NULL WHERE management_room = ?1",
            params![room.as_str()],
        )?;
        Ok(affected)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let mxid: String = row.get(0)?;
    let management_room: Option<String> = row.get(3)?;
    let space_room: Option<String> = row.get(4)?;

    Ok(UserRecord {
        mxid: parse_user_id(0, &mxid)?,
        email_address: row.get(1)?,
        credential: row.get(2)?,
        management_room: management_room.map(RoomId::new),
        space_room: space_room.map(RoomId::new),
    })
}

pub(crate) fn parse_user_id(column: usize, raw: &str) -> rusqlite::Result<UserId> {
    UserId::parse(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}
