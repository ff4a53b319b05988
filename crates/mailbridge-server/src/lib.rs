//! # mailbridge-server
//!
//! The bridge itself: configuration, identity registries, portal actors,
//! the dedup index, the private chat protocol, bot commands, message status
//! reporting and the HTTP API the homeserver pushes events to.

pub mod api;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod converter;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod portal;
pub mod private_chat;
pub mod puppet;
pub mod registry;
pub mod status;
pub mod store;
pub mod user;

#[cfg(test)]
mod test_support;
