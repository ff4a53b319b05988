pub mod constants;
pub mod crypto;
pub mod error;
pub mod event;
pub mod ghost;
pub mod mail;
pub mod types;
