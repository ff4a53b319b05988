use mailbridge_shared::types::{EventId, RoomId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::MessageRecord;

const MESSAGE_COLUMNS: &str =
    "sender, timestamp, part_index, thread_id, receiver, mxid, room_id, remote_id";

impl Database {
    /// Record a bridged message part. Fails if the
    /// `(sender, timestamp, part_index, receiver)` key already exists.
    pub fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                message.sender,
                message.timestamp,
                message.part_index,
                message.thread_id,
                message.receiver,
                message.mxid.as_str(),
                message.room_id.as_str(),
                message.remote_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_message_by_mxid(&self, mxid: &EventId) -> Result<Option<MessageRecord>> {
        let message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE mxid = ?1"),
                params![mxid.as_str()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn get_message_part(
        &self,
        sender: &str,
        timestamp: i64,
        part_index: u32,
        receiver: &str,
    ) -> Result<Option<MessageRecord>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE sender = ?1 AND timestamp = ?2 AND part_index = ?3 AND receiver = ?4"
                ),
                params![sender, timestamp, part_index, receiver],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Highest recorded part of a message, used to skip or resume redeliveries.
    pub fn get_last_message_part(
        &self,
        sender: &str,
        timestamp: i64,
        receiver: &str,
    ) -> Result<Option<MessageRecord>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE sender = ?1 AND timestamp = ?2 AND receiver = ?3
                     ORDER BY part_index DESC LIMIT 1"
                ),
                params![sender, timestamp, receiver],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn get_all_message_parts(
        &self,
        sender: &str,
        timestamp: i64,
        receiver: &str,
    ) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sender = ?1 AND timestamp = ?2 AND receiver = ?3
             ORDER BY part_index ASC"
        ))?;
        let rows = stmt.query_map(params![sender, timestamp, receiver], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Move every part of a message to a new timestamp. Returns the number of
    /// parts updated.
    pub fn update_message_timestamp(&self, message: &MessageRecord, new_timestamp: i64) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET timestamp = ?4
             WHERE sender = ?1 AND timestamp = ?2 AND receiver = ?3",
            params![message.sender, message.timestamp, message.receiver, new_timestamp],
        )?;
        Ok(affected)
    }

    pub fn delete_message(&self, message: &MessageRecord) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages
             WHERE sender = ?1 AND timestamp = ?2 AND part_index = ?3 AND receiver = ?4",
            params![message.sender, message.timestamp, message.part_index, message.receiver],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        sender: row.get(0)?,
        timestamp: row.get(1)?,
        part_index: row.get(2)?,
        thread_id: row.get(3)?,
        receiver: row.get(4)?,
        mxid: EventId::new(row.get::<_, String>(5)?),
        room_id: RoomId::new(row.get::<_, String>(6)?),
        remote_id: row.get(7)?,
    })
}
