use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IdError;
use crate::types::normalize_address;

/// A header address: optional display name plus a normalized bare address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl MailAddress {
    pub fn new(address: &str) -> Result<Self, IdError> {
        Ok(Self {
            name: None,
            address: normalize_address(address)?,
        })
    }

    /// Parse `alice@example.com`, `<alice@example.com>` or
    /// `"Alice Liddell" <alice@example.com>`.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let raw = raw.trim();
        let Some(open) = raw.rfind('<') else {
            return Self::new(raw);
        };
        let close = raw[open..]
            .find('>')
            .map(|i| open + i)
            .ok_or_else(|| IdError::InvalidAddress(raw.to_string()))?;

        let address = normalize_address(&raw[open + 1..close])?;
        let name = raw[..open].trim().trim_matches('"').trim();
        Ok(Self {
            name: (!name.is_empty()).then(|| name.to_string()),
            address,
        })
    }

    /// The display name if present, otherwise the address itself.
    pub fn display(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl std::fmt::Display for MailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "\"{}\" <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A fully fetched inbound mail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailMessage {
    pub message_id: String,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<MailAttachment>,
    pub in_reply_to: Option<String>,
}

impl MailMessage {
    /// Number of chat events this mail turns into: one for the body (skipped
    /// when it is blank and attachments carry the content) plus one per
    /// attachment.
    pub fn part_count(&self) -> usize {
        let body = if self.text.trim().is_empty() && !self.attachments.is_empty() {
            0
        } else {
            1
        };
        body + self.attachments.len()
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.date.timestamp_millis()
    }
}

/// Payload handed to the remote client for sending.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    /// Message id of the mail this one answers.
    pub in_reply_to: Option<String>,
    /// Message id of the mail this one supersedes (edits).
    pub replaces: Option<String>,
    pub attachments: Vec<MailAttachment>,
}
