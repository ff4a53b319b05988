//! The SQLite handle behind every table module.
//!
//! A [`Database`] only exists once the schema is at
//! [`CURRENT_VERSION`](crate::migrations::CURRENT_VERSION), whichever way it
//! was opened.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

const FILE_NAME: &str = "mailbridge.db";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database in the platform data directory, e.g.
    /// `~/.local/share/mailbridge/mailbridge.db` on Linux.
    pub fn new() -> Result<Self> {
        let dirs = ProjectDirs::from("org", "mailbridge", "mailbridge")
            .ok_or(StoreError::NoDataDir)?;
        let path = dirs.data_dir().join(FILE_NAME);
        tracing::info!(path = %path.display(), "opening database");
        Self::open_at(&path)
    }

    /// Open a database file, creating it and its parent directories if needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::prepare(conn)
    }

    /// A throwaway database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// File backing this database, `None` when in memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}
