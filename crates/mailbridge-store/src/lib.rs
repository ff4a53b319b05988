//! # mailbridge-store
//!
//! Persistence for the bridge, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for users, puppets,
//! portals and message dedup records. Lookups that find nothing return
//! `Ok(None)`; only real database failures are errors.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod portals;
pub mod puppets;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
