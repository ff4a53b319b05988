use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Sealed value is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Invalid mail address: {0}")]
    InvalidAddress(String),
}

#[derive(Error, Debug)]
pub enum GhostIdError {
    #[error("Username template is missing the {{{{.}}}} placeholder")]
    MissingPlaceholder,

    #[error("Username template must contain the placeholder exactly once")]
    RepeatedPlaceholder,

    #[error("Homeserver domain is empty")]
    EmptyDomain,

    #[error("Username template does not round-trip: {0}")]
    RoundTrip(String),

    #[error("Failed to compile ghost id pattern: {0}")]
    Pattern(#[from] regex::Error),
}
