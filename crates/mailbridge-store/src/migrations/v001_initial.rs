//! v001 -- Initial schema creation.
//!
//! Creates the identity tables: `users`, `puppets` and `portals`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (local bridge accounts)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    mxid            TEXT PRIMARY KEY NOT NULL,
    email_address   TEXT,                      -- NULL until login
    credential      TEXT,                      -- hex(nonce || ciphertext)
    management_room TEXT,
    space_room      TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_address ON users(email_address);

-- ----------------------------------------------------------------
-- Puppets (ghosts of remote addresses)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS puppets (
    email_address TEXT PRIMARY KEY NOT NULL,
    display_name  TEXT NOT NULL DEFAULT '',
    name_set      INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    custom_mxid   TEXT,                        -- double puppet link
    access_token  TEXT
);

CREATE INDEX IF NOT EXISTS idx_puppets_custom_mxid ON puppets(custom_mxid);

-- ----------------------------------------------------------------
-- Portals (bridged conversations)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS portals (
    thread_id       TEXT NOT NULL,
    receiver        TEXT NOT NULL,
    mxid            TEXT UNIQUE,               -- bound room, NULL until created
    name            TEXT NOT NULL DEFAULT '',
    topic           TEXT NOT NULL DEFAULT '',
    avatar_hash     TEXT NOT NULL DEFAULT '',
    avatar_url      TEXT NOT NULL DEFAULT '',
    name_set        INTEGER NOT NULL DEFAULT 0,
    avatar_set      INTEGER NOT NULL DEFAULT 0,
    topic_set       INTEGER NOT NULL DEFAULT 0,
    revision        INTEGER NOT NULL DEFAULT 0,
    encrypted       INTEGER NOT NULL DEFAULT 0,
    relay_user_id   TEXT,
    expiration_time INTEGER NOT NULL DEFAULT 0, -- seconds, 0 = never

    PRIMARY KEY (thread_id, receiver)
);

CREATE INDEX IF NOT EXISTS idx_portals_receiver ON portals(receiver);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
