//! Bridge configuration loaded from environment variables.
//!
//! Every setting has a default so a development instance only needs the
//! handful of values that identify the homeserver and who may use the bridge.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use mailbridge_shared::constants::{
    DEFAULT_MAX_ATTACHMENT_SIZE, DEFAULT_PORTAL_BUFFER, TEMPLATE_PLACEHOLDER,
};
use mailbridge_shared::error::GhostIdError;
use mailbridge_shared::ghost::GhostIdFormat;
use mailbridge_shared::types::{PermissionLevel, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("BRIDGE_PERMISSIONS is not configured")]
    NoPermissions,

    #[error("Invalid username template: {0}")]
    UsernameTemplate(#[from] GhostIdError),

    #[error("Invalid bot username: {0}")]
    BotUsername(String),
}

/// Bridge configuration.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Env: `HOMESERVER_URL`. Default: `http://localhost:8008`
    pub homeserver_url: String,

    /// Server name ghosts and the bot live on.
    /// Env: `HOMESERVER_DOMAIN`. Default: `localhost`
    pub homeserver_domain: String,

    /// Token the bridge presents to the homeserver. Env: `AS_TOKEN`
    pub as_token: String,

    /// Token the homeserver presents to the bridge. Env: `HS_TOKEN`
    pub hs_token: String,

    /// Env: `BOT_USERNAME`. Default: `emailbot`
    pub bot_username: String,

    /// Env: `HTTP_ADDR`. Default: `0.0.0.0:29340`
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH`. Default: platform data directory.
    pub database_path: Option<PathBuf>,

    /// Ghost localpart template, `{{.}}` is replaced by the mail address.
    /// Env: `USERNAME_TEMPLATE`. Default: `email_{{.}}`
    pub username_template: String,

    /// Env: `DISPLAYNAME_TEMPLATE`. Default: `{{.}} (Email)`
    pub displayname_template: String,

    /// Capacity of each portal mailbox.
    /// Env: `PORTAL_MESSAGE_BUFFER`. Default: 128
    pub portal_message_buffer: usize,

    /// Chat messages older than this when picked up are failed without an
    /// attempt. Env: `MESSAGE_ERROR_AFTER_SECS` (0 disables). Default: disabled
    pub message_error_after: Option<Duration>,

    /// Hard limit on handling one chat message.
    /// Env: `MESSAGE_DEADLINE_SECS` (0 disables). Default: disabled
    pub message_deadline: Option<Duration>,

    /// Env: `ENCRYPTION_DEFAULT`. Default: `false`
    pub encryption_default: bool,

    /// Whether `m.notice` messages are bridged. Env: `BRIDGE_NOTICES`. Default: `true`
    pub bridge_notices: bool,

    /// Env: `MESSAGE_STATUS_EVENTS`. Default: `false`
    pub message_status_events: bool,

    /// Env: `MESSAGE_ERROR_NOTICES`. Default: `true`
    pub message_error_notices: bool,

    /// Env: `MAX_ATTACHMENT_SIZE` (bytes). Default: 25 MiB
    pub max_attachment_size: u64,

    /// Env: `COMMAND_PREFIX`. Default: `!email`
    pub command_prefix: String,

    /// Env: `PERSONAL_FILTERING_SPACES`. Default: `false`
    pub personal_filtering_spaces: bool,

    /// Env: `RELAY_ENABLED`. Default: `false`
    pub relay_enabled: bool,

    /// Env: `RELAY_MESSAGE_FORMAT`. Default: `{sender}: {message}`
    pub relay_message_format: String,

    /// Env: `BRIDGE_PERMISSIONS`, e.g. `*=relay,example.com=user,@admin:example.com=admin`
    pub permissions: BTreeMap<String, PermissionLevel>,

    /// Secret the mail credential sealing key is derived from.
    /// Env: `CREDENTIAL_SECRET`
    pub credential_secret: String,

    /// Capacity of the message status side channel.
    /// Env: `STATUS_BUFFER`. Default: 1024
    pub status_buffer: usize,

    /// Subject used for mails sent from chat. Env: `DEFAULT_SUBJECT`
    pub default_subject: String,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("homeserver_url", &self.homeserver_url)
            .field("homeserver_domain", &self.homeserver_domain)
            .field("bot_username", &self.bot_username)
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("username_template", &self.username_template)
            .field("portal_message_buffer", &self.portal_message_buffer)
            .field("message_error_after", &self.message_error_after)
            .field("message_deadline", &self.message_deadline)
            .field("encryption_default", &self.encryption_default)
            .field("relay_enabled", &self.relay_enabled)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            homeserver_url: "http://localhost:8008".to_string(),
            homeserver_domain: "localhost".to_string(),
            as_token: String::new(),
            hs_token: String::new(),
            bot_username: "emailbot".to_string(),
            http_addr: ([0, 0, 0, 0], 29340).into(),
            database_path: None,
            username_template: format!("email_{TEMPLATE_PLACEHOLDER}"),
            displayname_template: format!("{TEMPLATE_PLACEHOLDER} (Email)"),
            portal_message_buffer: DEFAULT_PORTAL_BUFFER,
            message_error_after: None,
            message_deadline: None,
            encryption_default: false,
            bridge_notices: true,
            message_status_events: false,
            message_error_notices: true,
            max_attachment_size: DEFAULT_MAX_ATTACHMENT_SIZE,
            command_prefix: "!email".to_string(),
            personal_filtering_spaces: false,
            relay_enabled: false,
            relay_message_format: "{sender}: {message}".to_string(),
            permissions: BTreeMap::new(),
            credential_secret: String::new(),
            status_buffer: 1024,
            default_subject: String::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let string = |key: &str, target: &mut String| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };
        string("HOMESERVER_URL", &mut config.homeserver_url);
        string("HOMESERVER_DOMAIN", &mut config.homeserver_domain);
        string("AS_TOKEN", &mut config.as_token);
        string("HS_TOKEN", &mut config.hs_token);
        string("BOT_USERNAME", &mut config.bot_username);
        string("USERNAME_TEMPLATE", &mut config.username_template);
        string("DISPLAYNAME_TEMPLATE", &mut config.displayname_template);
        string("COMMAND_PREFIX", &mut config.command_prefix);
        string("RELAY_MESSAGE_FORMAT", &mut config.relay_message_format);
        string("CREDENTIAL_SECRET", &mut config.credential_secret);
        string("DEFAULT_SUBJECT", &mut config.default_subject);

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(n) = parse_number::<usize>(&lookup, "PORTAL_MESSAGE_BUFFER") {
            config.portal_message_buffer = n.max(1);
        }
        if let Some(n) = parse_number::<usize>(&lookup, "STATUS_BUFFER") {
            config.status_buffer = n.max(1);
        }
        if let Some(n) = parse_number::<u64>(&lookup, "MAX_ATTACHMENT_SIZE") {
            config.max_attachment_size = n;
        }
        if let Some(secs) = parse_number::<u64>(&lookup, "MESSAGE_ERROR_AFTER_SECS") {
            config.message_error_after = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_number::<u64>(&lookup, "MESSAGE_DEADLINE_SECS") {
            config.message_deadline = (secs > 0).then(|| Duration::from_secs(secs));
        }

        let flag = |key: &str, target: &mut bool| {
            if let Some(val) = lookup(key) {
                *target = val != "false" && val != "0";
            }
        };
        flag("ENCRYPTION_DEFAULT", &mut config.encryption_default);
        flag("BRIDGE_NOTICES", &mut config.bridge_notices);
        flag("MESSAGE_STATUS_EVENTS", &mut config.message_status_events);
        flag("MESSAGE_ERROR_NOTICES", &mut config.message_error_notices);
        flag("PERSONAL_FILTERING_SPACES", &mut config.personal_filtering_spaces);
        flag("RELAY_ENABLED", &mut config.relay_enabled);

        if let Some(raw) = lookup("BRIDGE_PERMISSIONS") {
            config.permissions = parse_permissions(&raw);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Check the settings the bridge cannot run without and build the ghost
    /// id format (which round-trips a sentinel through the template).
    pub fn validate(&self) -> Result<GhostIdFormat, ConfigError> {
        if self.as_token.is_empty() {
            return Err(ConfigError::Missing("AS_TOKEN"));
        }
        if self.hs_token.is_empty() {
            return Err(ConfigError::Missing("HS_TOKEN"));
        }
        if self.credential_secret.is_empty() {
            return Err(ConfigError::Missing("CREDENTIAL_SECRET"));
        }
        if self.permissions.is_empty() {
            return Err(ConfigError::NoPermissions);
        }
        self.bot_mxid()?;
        Ok(GhostIdFormat::new(
            &self.username_template,
            &self.homeserver_domain,
        )?)
    }

    pub fn bot_mxid(&self) -> Result<UserId, ConfigError> {
        UserId::parse(&format!("@{}:{}", self.bot_username, self.homeserver_domain))
            .map_err(|e| ConfigError::BotUsername(e.to_string()))
    }

    /// Permission of a chat user: an exact user entry wins over a domain
    /// entry, which wins over `*`.
    pub fn permission_for(&self, user: &UserId) -> PermissionLevel {
        self.permissions
            .get(user.as_str())
            .or_else(|| self.permissions.get(user.server()))
            .or_else(|| self.permissions.get("*"))
            .copied()
            .unwrap_or(PermissionLevel::None)
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}

/// Parse `key=level` pairs separated by commas. Bad entries are skipped with
/// a warning.
fn parse_permissions(raw: &str) -> BTreeMap<String, PermissionLevel> {
    let mut permissions = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry
            .split_once('=')
            .and_then(|(key, level)| Some((key.trim(), PermissionLevel::parse(level)?)));
        match parsed {
            Some((key, level)) if !key.is_empty() => {
                permissions.insert(key.to_string(), level);
            }
            _ => tracing::warn!(entry, "Ignoring invalid BRIDGE_PERMISSIONS entry"),
        }
    }
    permissions
}
