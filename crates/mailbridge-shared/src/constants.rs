/// Bridge name used in bridge-info state and status events
pub const BRIDGE_NAME: &str = "mailbridge";

/// Protocol identifier advertised in `m.bridge` state
pub const PROTOCOL_ID: &str = "email";

/// Human-readable network name
pub const NETWORK_NAME: &str = "Email";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Placeholder substituted by the username and displayname templates
pub const TEMPLATE_PLACEHOLDER: &str = "{{.}}";

/// Value round-tripped through the username template at config load
pub const GHOST_TEMPLATE_SENTINEL: &str = "1234567890@sentinel.invalid";

/// Default capacity of each portal mailbox
pub const DEFAULT_PORTAL_BUFFER: usize = 128;

/// Default maximum attachment size in bytes (25 MiB)
pub const DEFAULT_MAX_ATTACHMENT_SIZE: u64 = 25 * 1024 * 1024;

/// Remaining budget below which a chat message is logged as close to timing out
pub const CLOSE_TO_TIMEOUT_MILLIS: i64 = 1_000;

/// Topic set on newly bridged private chats
pub const PRIVATE_CHAT_TOPIC: &str = "Bridged from Email";

/// State event types
pub const STATE_BRIDGE: &str = "m.bridge";
pub const STATE_HALF_SHOT_BRIDGE: &str = "uk.half-shot.bridge";
pub const STATE_ENCRYPTION: &str = "m.room.encryption";
pub const STATE_SPACE_CHILD: &str = "m.space.child";
pub const STATE_ROOM_TOPIC: &str = "m.room.topic";
pub const STATE_ROOM_NAME: &str = "m.room.name";

/// Event type used for message send status reports
pub const EVENT_MESSAGE_STATUS: &str = "com.beeper.message_send_status";

/// Megolm algorithm identifier expected in `m.room.encryption`
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Key derivation context for sealing stored credentials (BLAKE3)
pub const KDF_CONTEXT_CREDENTIAL_KEY: &str = "mailbridge-credential-key-v1";
