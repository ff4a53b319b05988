use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{EventId, RoomId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageType {
    #[serde(rename = "m.text")]
    Text,
    #[serde(rename = "m.notice")]
    Notice,
    #[serde(rename = "m.emote")]
    Emote,
    #[serde(rename = "m.image")]
    Image,
    #[serde(rename = "m.video")]
    Video,
    #[serde(rename = "m.audio")]
    Audio,
    #[serde(rename = "m.file")]
    File,
    #[serde(rename = "m.location")]
    Location,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "m.text",
            Self::Notice => "m.notice",
            Self::Emote => "m.emote",
            Self::Image => "m.image",
            Self::Video => "m.video",
            Self::Audio => "m.audio",
            Self::File => "m.file",
            Self::Location => "m.location",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Audio | Self::File)
    }

    /// Pick the media kind for an attachment from its MIME type.
    pub fn for_mime(mime: &str) -> Self {
        match mime.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::File,
        }
    }
}

/// Body of a room message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    pub msgtype: MessageType,
    pub body: String,
    pub formatted_body: Option<String>,
    /// `mxc://` URI of uploaded media.
    pub url: Option<String>,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
    pub geo_uri: Option<String>,
    pub reply_to: Option<EventId>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::with_type(MessageType::Text, body)
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self::with_type(MessageType::Notice, body)
    }

    pub fn with_type(msgtype: MessageType, body: impl Into<String>) -> Self {
        Self {
            msgtype,
            body: body.into(),
            formatted_body: None,
            url: None,
            filename: None,
            mimetype: None,
            size: None,
            geo_uri: None,
            reply_to: None,
        }
    }

    /// Wire form of the content object of an `m.room.message` event.
    pub fn to_event_content(&self) -> Value {
        let mut content = json!({
            "msgtype": self.msgtype.as_str(),
            "body": self.body,
        });
        if let Some(html) = &self.formatted_body {
            content["format"] = json!("org.matrix.custom.html");
            content["formatted_body"] = json!(html);
        }
        if let Some(url) = &self.url {
            content["url"] = json!(url);
        }
        if let Some(filename) = &self.filename {
            content["filename"] = json!(filename);
        }
        if self.mimetype.is_some() || self.size.is_some() {
            content["info"] = json!({ "mimetype": self.mimetype, "size": self.size });
        }
        if let Some(geo) = &self.geo_uri {
            content["geo_uri"] = json!(geo);
        }
        if let Some(reply) = &self.reply_to {
            content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": reply } });
        }
        content
    }

    pub fn from_event_content(content: &Value) -> Option<Self> {
        let msgtype = MessageType::parse(content.get("msgtype")?.as_str()?)?;
        let body = content.get("body")?.as_str()?.to_string();
        let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(String::from);
        let info = content.get("info").cloned().unwrap_or(Value::Null);

        Some(Self {
            msgtype,
            body,
            formatted_body: str_field(content, "formatted_body"),
            url: str_field(content, "url"),
            filename: str_field(content, "filename"),
            mimetype: str_field(&info, "mimetype"),
            size: info.get("size").and_then(Value::as_u64),
            geo_uri: str_field(content, "geo_uri"),
            reply_to: content
                .pointer("/m.relates_to/m.in_reply_to/event_id")
                .and_then(Value::as_str)
                .map(EventId::new),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

/// Closed set of chat event kinds the bridge reacts to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatEventContent {
    Message(MessageContent),
    Edit {
        target: EventId,
        content: MessageContent,
    },
    Reaction {
        target: EventId,
        key: String,
    },
    Redaction {
        target: EventId,
    },
    Membership {
        target: UserId,
        membership: Membership,
        is_direct: bool,
    },
    Typing {
        user_ids: Vec<UserId>,
    },
}

impl ChatEventContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Edit { .. } => "edit",
            Self::Reaction { .. } => "reaction",
            Self::Redaction { .. } => "redaction",
            Self::Membership { .. } => "membership",
            Self::Typing { .. } => "typing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub sender: UserId,
    pub origin_ts: DateTime<Utc>,
    pub content: ChatEventContent,
}

impl ChatEvent {
    /// Decode a client-server API event. Returns `None` for event types the
    /// bridge does not handle or for malformed events.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let event_type = raw.get("type")?.as_str()?;
        let room_id = RoomId::new(raw.get("room_id")?.as_str()?);
        let content = raw.get("content")?;

        if event_type == "m.typing" {
            let user_ids = content
                .get("user_ids")?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| UserId::parse(s).ok())
                .collect();
            // Ephemeral events carry no id or sender.
            return Some(Self {
                event_id: EventId::new(""),
                room_id,
                sender: UserId::new("typing", "ephemeral.invalid"),
                origin_ts: Utc::now(),
                content: ChatEventContent::Typing { user_ids },
            });
        }

        let event_id = EventId::new(raw.get("event_id")?.as_str()?);
        let sender = UserId::parse(raw.get("sender")?.as_str()?).ok()?;
        let origin_ts = raw
            .get("origin_server_ts")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let relates_to = content.get("m.relates_to");

        let content = match event_type {
            "m.room.message" => {
                let is_replace = relates_to
                    .and_then(|r| r.get("rel_type"))
                    .and_then(Value::as_str)
                    == Some("m.replace");
                if is_replace {
                    let target = relates_to?.get("event_id")?.as_str()?;
                    let new_content = content.get("m.new_content").unwrap_or(content);
                    ChatEventContent::Edit {
                        target: EventId::new(target),
                        content: MessageContent::from_event_content(new_content)?,
                    }
                } else {
                    ChatEventContent::Message(MessageContent::from_event_content(content)?)
                }
            }
            "m.reaction" => {
                let relates_to = relates_to?;
                ChatEventContent::Reaction {
                    target: EventId::new(relates_to.get("event_id")?.as_str()?),
                    key: relates_to.get("key")?.as_str()?.to_string(),
                }
            }
            "m.room.redaction" => {
                let target = raw
                    .get("redacts")
                    .or_else(|| content.get("redacts"))?
                    .as_str()?;
                ChatEventContent::Redaction {
                    target: EventId::new(target),
                }
            }
            "m.room.member" => ChatEventContent::Membership {
                target: UserId::parse(raw.get("state_key")?.as_str()?).ok()?,
                membership: Membership::parse(content.get("membership")?.as_str()?)?,
                is_direct: content
                    .get("is_direct")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            _ => return None,
        };

        Some(Self {
            event_id,
            room_id,
            sender,
            origin_ts,
            content,
        })
    }

    /// Milliseconds elapsed since the event was sent, never negative.
    pub fn age_millis(&self) -> i64 {
        (Utc::now() - self.origin_ts).num_milliseconds().max(0)
    }
}
