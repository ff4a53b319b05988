//! Conversion between chat message content and mail payloads.
//!
//! The converter is stateless: the portal hands it read-only context and gets
//! back either a payload or a typed [`ConversionError`]. Nothing is retried
//! here.

use async_trait::async_trait;
use mailbridge_net::Intent;
use mailbridge_shared::event::{MessageContent, MessageType};
use mailbridge_shared::mail::{MailAttachment, MailMessage, OutgoingMail};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("Failed to download media: {0}")]
    MediaDownloadFailed(String),

    #[error("Media is too large ({size} bytes, limit {max})")]
    MediaTooLarge { size: u64, max: u64 },

    #[error("Failed to convert media: {0}")]
    MediaTransformFailed(String),

    #[error("Failed to upload media: {0}")]
    MediaUploadFailed(String),

    #[error("Malformed location: {0}")]
    InvalidGeoUri(String),
}

/// Read-only context for a chat-to-mail conversion.
pub struct RemoteContext<'a> {
    /// Intent used to fetch media referenced by the event.
    pub media: &'a dyn Intent,
    /// Address of the mail account the message is sent from.
    pub sender_address: &'a str,
    /// Display name of the chat sender, used for emotes.
    pub sender_name: &'a str,
    pub recipient: &'a str,
    pub subject: &'a str,
    pub max_attachment_size: u64,
}

/// Read-only context for a mail-to-chat conversion.
pub struct ChatContext<'a> {
    /// Intent used to upload attachments; the one that will send the parts.
    pub media: &'a dyn Intent,
    pub max_attachment_size: u64,
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn to_remote(
        &self,
        ctx: &RemoteContext<'_>,
        content: &MessageContent,
    ) -> Result<OutgoingMail, ConversionError>;

    /// Returns exactly [`MailMessage::part_count`] contents, body first.
    async fn to_chat(
        &self,
        ctx: &ChatContext<'_>,
        mail: &MailMessage,
    ) -> Result<Vec<MessageContent>, ConversionError>;
}

/// Plain-text/HTML mail converter with attachments.
#[derive(Debug, Default, Clone, Copy)]
pub struct MailConverter;

#[async_trait]
impl Converter for MailConverter {
    async fn to_remote(
        &self,
        ctx: &RemoteContext<'_>,
        content: &MessageContent,
    ) -> Result<OutgoingMail, ConversionError> {
        let mut mail = OutgoingMail {
            to: ctx.recipient.to_string(),
            subject: ctx.subject.to_string(),
            ..OutgoingMail::default()
        };

        match content.msgtype {
            MessageType::Text | MessageType::Notice => {
                mail.text = content.body.clone();
                mail.html = content.formatted_body.clone();
            }
            MessageType::Emote => {
                mail.text = format!("* {} {}", ctx.sender_name, content.body);
            }
            MessageType::Location => {
                let geo = content.geo_uri.as_deref().unwrap_or_default();
                let (lat, lon) = parse_geo_uri(geo)?;
                mail.text = format!(
                    "{}\nhttps://www.openstreetmap.org/?mlat={lat}&mlon={lon}",
                    content.body
                );
            }
            MessageType::Image | MessageType::Video | MessageType::Audio | MessageType::File => {
                let url = content
                    .url
                    .as_deref()
                    .ok_or_else(|| ConversionError::UnsupportedContent("media without url".into()))?;
                if let Some(size) = content.size {
                    check_size(size, ctx.max_attachment_size)?;
                }
                let data = ctx
                    .media
                    .download(url)
                    .await
                    .map_err(|e| ConversionError::MediaDownloadFailed(e.to_string()))?;
                if data.is_empty() {
                    return Err(ConversionError::MediaTransformFailed("empty media".into()));
                }
                check_size(data.len() as u64, ctx.max_attachment_size)?;

                let filename = content
                    .filename
                    .clone()
                    .unwrap_or_else(|| content.body.clone());
                // A caption differs from the file name.
                if content.filename.is_some() && content.body != filename {
                    mail.text = content.body.clone();
                }
                mail.attachments.push(MailAttachment {
                    filename,
                    content_type: content
                        .mimetype
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".into()),
                    data,
                });
            }
        }

        Ok(mail)
    }

    async fn to_chat(
        &self,
        ctx: &ChatContext<'_>,
        mail: &MailMessage,
    ) -> Result<Vec<MessageContent>, ConversionError> {
        let mut parts = Vec::with_capacity(mail.part_count());

        if mail.part_count() > mail.attachments.len() {
            let mut body = MessageContent::text(mail.text.trim_end());
            body.formatted_body = mail.html.clone();
            parts.push(body);
        }

        for attachment in &mail.attachments {
            let size = attachment.data.len() as u64;
            check_size(size, ctx.max_attachment_size)?;
            if attachment.data.is_empty() {
                return Err(ConversionError::MediaTransformFailed(format!(
                    "{} is empty",
                    attachment.filename
                )));
            }
            let url = ctx
                .media
                .upload(
                    attachment.data.clone(),
                    &attachment.content_type,
                    &attachment.filename,
                )
                .await
                .map_err(|e| ConversionError::MediaUploadFailed(e.to_string()))?;

            let mut part = MessageContent::with_type(
                MessageType::for_mime(&attachment.content_type),
                attachment.filename.clone(),
            );
            part.url = Some(url);
            part.filename = Some(attachment.filename.clone());
            part.mimetype = Some(attachment.content_type.clone());
            part.size = Some(size);
            parts.push(part);
        }

        Ok(parts)
    }
}

fn check_size(size: u64, max: u64) -> Result<(), ConversionError> {
    if size > max {
        Err(ConversionError::MediaTooLarge { size, max })
    } else {
        Ok(())
    }
}

/// Parse `geo:<lat>,<lon>[;params]`.
fn parse_geo_uri(uri: &str) -> Result<(f64, f64), ConversionError> {
    let invalid = || ConversionError::InvalidGeoUri(uri.to_string());
    let coords = uri.strip_prefix("geo:").ok_or_else(invalid)?;
    let coords = coords.split(';').next().unwrap_or_default();
    let mut parts = coords.split(',');
    let lat: f64 = parts.next().and_then(|s| s.trim().parse().ok()).ok_or_else(invalid)?;
    let lon: f64 = parts.next().and_then(|s| s.trim().parse().ok()).ok_or_else(invalid)?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(invalid());
    }
    Ok((lat, lon))
}
