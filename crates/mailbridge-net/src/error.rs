use thiserror::Error;

/// Failures talking to the mail network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Mailbox is empty")]
    NoMessages,

    #[error("Failed to send mail: {0}")]
    Send(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Failures of a chat-network call made through an [`crate::Intent`].
#[derive(Error, Debug)]
pub enum IntentError {
    /// The invitee is already joined to the room.
    #[error("User is already in the room")]
    AlreadyInRoom,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Homeserver returned {status} {errcode}: {message}")]
    Api {
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
