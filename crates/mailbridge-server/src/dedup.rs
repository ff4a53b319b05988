//! Dedup and edit index over the `messages` table.
//!
//! Remote messages are keyed by `(sender, timestamp, part_index, receiver)`.
//! Chat-origin messages are recorded with the chat sender id as `sender`,
//! part 0 and the event's origin timestamp, so an edit can be traced back to
//! the event it replaces.

use mailbridge_shared::types::EventId;
use mailbridge_store::{MessageRecord, StoreError};

use crate::store::Store;

/// Result of checking a remote message against the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCheck {
    /// Deliver parts starting at `from_part`; non-zero when an earlier
    /// delivery was interrupted.
    Deliver { from_part: u32 },
    /// Every part is already bridged.
    Duplicate,
}

#[derive(Clone)]
pub struct DedupIndex {
    store: Store,
}

impl DedupIndex {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn check_remote(
        &self,
        sender: &str,
        timestamp: i64,
        receiver: &str,
        total_parts: usize,
    ) -> Result<RemoteCheck, StoreError> {
        let last = self
            .store
            .with(|db| db.get_last_message_part(sender, timestamp, receiver))?;
        Ok(match last {
            None => RemoteCheck::Deliver { from_part: 0 },
            Some(last) if last.part_index as usize + 1 >= total_parts => RemoteCheck::Duplicate,
            Some(last) => RemoteCheck::Deliver {
                from_part: last.part_index + 1,
            },
        })
    }

    pub fn record(&self, message: &MessageRecord) -> Result<(), StoreError> {
        self.store.with(|db| db.insert_message(message))
    }

    /// The record an edit or redaction of `event` refers to.
    pub fn resolve_event(&self, event: &EventId) -> Result<Option<MessageRecord>, StoreError> {
        self.store.with(|db| db.get_message_by_mxid(event))
    }

    /// Move an edited message to its new effective time. Existing records are
    /// updated in place; nothing is inserted.
    pub fn apply_edit(&self, original: &MessageRecord, new_timestamp: i64) -> Result<usize, StoreError> {
        self.store
            .with(|db| db.update_message_timestamp(original, new_timestamp))
    }

    pub fn remove_by_event(&self, event: &EventId) -> Result<bool, StoreError> {
        self.store.with(|db| match db.get_message_by_mxid(event)? {
            Some(record) => db.delete_message(&record),
            None => Ok(false),
        })
    }

    /// `Message-ID` of the mail behind a bridged chat event, for threading.
    pub fn remote_id_for(&self, event: &EventId) -> Result<Option<String>, StoreError> {
        Ok(self.resolve_event(event)?.and_then(|m| m.remote_id))
    }
}
