//! Message outcome reporting.
//!
//! Portals report one [`MessageStatus`] per processed item. Reporting never
//! blocks: counters are bumped in place and the status is offered to the
//! collector with `try_send`, dropping it when the collector falls behind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mailbridge_net::Intent;
use mailbridge_shared::constants::{EVENT_MESSAGE_STATUS, NETWORK_NAME};
use mailbridge_shared::event::MessageContent;
use mailbridge_shared::types::{EventId, PortalKey, RoomId};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{BridgeError, ErrorCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Chat event bridged to mail.
    ToRemote,
    /// Mail bridged into the chat room.
    ToChat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Duplicate,
    Ignored(String),
    Failed {
        category: ErrorCategory,
        reason: String,
    },
}

impl Outcome {
    pub fn failed(error: &BridgeError) -> Self {
        Outcome::Failed {
            category: error.category(),
            reason: error.to_string(),
        }
    }

    fn counter_key(&self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Duplicate => "duplicate",
            Outcome::Ignored(_) => "ignored",
            Outcome::Failed { category, .. } => category.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageStatus {
    pub portal: PortalKey,
    pub direction: Direction,
    /// Chat event the status refers to (the source event for chat-origin
    /// messages, the first delivered part for mail-origin ones).
    pub event_id: Option<EventId>,
    pub room_id: Option<RoomId>,
    pub outcome: Outcome,
    pub at: DateTime<Utc>,
}

impl MessageStatus {
    pub fn new(portal: PortalKey, direction: Direction, outcome: Outcome) -> Self {
        Self {
            portal,
            direction,
            event_id: None,
            room_id: None,
            outcome,
            at: Utc::now(),
        }
    }

    pub fn for_event(mut self, room_id: Option<RoomId>, event_id: Option<EventId>) -> Self {
        self.room_id = room_id;
        self.event_id = event_id;
        self
    }
}

/// Snapshot served by `GET /status`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub to_remote: BTreeMap<&'static str, u64>,
    pub to_chat: BTreeMap<&'static str, u64>,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    to_remote: BTreeMap<&'static str, u64>,
    to_chat: BTreeMap<&'static str, u64>,
}

/// Producer side of the status channel, cloned into every portal.
#[derive(Clone)]
pub struct StatusReporter {
    tx: mpsc::Sender<MessageStatus>,
    counters: Arc<Mutex<Counters>>,
    dropped: Arc<AtomicU64>,
}

impl StatusReporter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MessageStatus>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let reporter = Self {
            tx,
            counters: Arc::new(Mutex::new(Counters::default())),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (reporter, rx)
    }

    pub fn report(&self, status: MessageStatus) {
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let map = match status.direction {
                Direction::ToRemote => &mut counters.to_remote,
                Direction::ToChat => &mut counters.to_chat,
            };
            *map.entry(status.outcome.counter_key()).or_default() += 1;
        }

        if self.tx.try_send(status).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping message status, collector is not keeping up");
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        StatusSnapshot {
            to_remote: counters.to_remote.clone(),
            to_chat: counters.to_chat.clone(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// What the collector pushes back into chat rooms.
#[derive(Debug, Clone, Copy)]
pub struct CollectorOptions {
    pub status_events: bool,
    pub error_notices: bool,
}

/// Consume statuses until every reporter is gone, sending status events and
/// error notices for chat-origin messages as configured.
pub async fn run_collector(
    mut rx: mpsc::Receiver<MessageStatus>,
    bot: Arc<dyn Intent>,
    options: CollectorOptions,
) {
    while let Some(status) = rx.recv().await {
        debug!(
            portal = %status.portal,
            direction = ?status.direction,
            outcome = ?status.outcome,
            "Message status"
        );

        if status.direction != Direction::ToRemote {
            continue;
        }
        let (Some(room), Some(event)) = (&status.room_id, &status.event_id) else {
            continue;
        };

        if options.status_events {
            let content = status_event_content(event, &status.outcome);
            if let Err(e) = bot.send_event(room, EVENT_MESSAGE_STATUS, &content).await {
                warn!(room_id = %room, error = %e, "Failed to send message status event");
            }
        }

        if let Outcome::Failed { reason, .. } = &status.outcome {
            if options.error_notices {
                let mut notice = MessageContent::notice(format!(
                    "\u{26a0} Your message was not bridged: {reason}"
                ));
                notice.reply_to = Some(event.clone());
                if let Err(e) = bot.send_message(room, &notice).await {
                    warn!(room_id = %room, error = %e, "Failed to send error notice");
                }
            }
        }
    }
}

fn status_event_content(event: &EventId, outcome: &Outcome) -> serde_json::Value {
    let mut content = json!({
        "network": NETWORK_NAME.to_lowercase(),
        "m.relates_to": { "rel_type": "m.reference", "event_id": event },
    });
    match outcome {
        Outcome::Delivered | Outcome::Duplicate => {
            content["status"] = json!("SUCCESS");
        }
        Outcome::Ignored(reason) => {
            content["status"] = json!("FAIL_PERMANENT");
            content["reason"] = json!("m.event_unsupported");
            content["message"] = json!(reason);
        }
        Outcome::Failed { category, reason } => {
            let retriable = matches!(category, ErrorCategory::Timeout | ErrorCategory::Transport);
            content["status"] = json!(if retriable { "FAIL_RETRIABLE" } else { "FAIL_PERMANENT" });
            content["reason"] = json!(match category {
                ErrorCategory::Timeout => "m.event_too_old",
                ErrorCategory::Conversion => "m.event_unsupported",
                ErrorCategory::Declined => "m.no_permission",
                _ => "m.foreign_network_error",
            });
            content["message"] = json!(reason);
        }
    }
    content
}
