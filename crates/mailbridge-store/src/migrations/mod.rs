//! Schema migrations, tracked with SQLite's `user_version` pragma.
//!
//! Step `n` in [`STEPS`] upgrades a database at version `n` to `n + 1`.

pub mod v001_initial;
pub mod v002_messages;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = (&'static str, fn(&Connection) -> rusqlite::Result<()>);

const STEPS: &[Step] = &[
    ("v001_initial", v001_initial::up),
    ("v002_messages", v002_messages::up),
];

pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if found > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{found} is newer than this build (v{CURRENT_VERSION})"
        )));
    }
    if found == CURRENT_VERSION {
        tracing::debug!(version = found, "database schema up to date");
        return Ok(());
    }

    for (version, (name, up)) in STEPS.iter().enumerate().skip(found as usize) {
        tracing::info!(migration = %name, "applying database migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version as u32 + 1)?;
    }
    Ok(())
}
