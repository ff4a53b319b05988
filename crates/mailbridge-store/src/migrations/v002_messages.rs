//! v002 -- Message dedup index.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    sender     TEXT NOT NULL,      -- remote address or chat user id
    timestamp  INTEGER NOT NULL,   -- unix millis
    part_index INTEGER NOT NULL,
    thread_id  TEXT NOT NULL,
    receiver   TEXT NOT NULL,
    mxid       TEXT NOT NULL UNIQUE,
    room_id    TEXT NOT NULL,
    remote_id  TEXT,               -- Message-ID header of the mail

    PRIMARY KEY (sender, timestamp, part_index, receiver)
);

CREATE INDEX IF NOT EXISTS idx_messages_thread_ts
    ON messages(thread_id, receiver, timestamp);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
