//! Ghost users standing in for mail addresses.

use std::sync::{Arc, Mutex, MutexGuard};

use mailbridge_net::{ChatTransport, Intent};
use mailbridge_shared::ghost::format_display_name;
use mailbridge_shared::mail::MailAddress;
use mailbridge_shared::types::UserId;
use mailbridge_store::PuppetRecord;
use tracing::{debug, warn};

use crate::store::Store;

pub struct Puppet {
    mxid: UserId,
    record: Mutex<PuppetRecord>,
}

impl Puppet {
    pub fn new(record: PuppetRecord, mxid: UserId) -> Self {
        Self {
            mxid,
            record: Mutex::new(record),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PuppetRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn address(&self) -> String {
        self.lock().email_address.clone()
    }

    /// Ghost user id of this address.
    pub fn mxid(&self) -> &UserId {
        &self.mxid
    }

    pub fn record(&self) -> PuppetRecord {
        self.lock().clone()
    }

    pub fn display_name(&self) -> String {
        let record = self.lock();
        if record.display_name.is_empty() {
            record.email_address.clone()
        } else {
            record.display_name.clone()
        }
    }

    pub fn custom_mxid(&self) -> Option<UserId> {
        self.lock().custom_mxid.clone()
    }

    pub(crate) fn set_link(&self, link: Option<(UserId, String)>) -> PuppetRecord {
        let mut record = self.lock();
        match link {
            Some((mxid, token)) => {
                record.custom_mxid = Some(mxid);
                record.access_token = Some(token);
            }
            None => {
                record.custom_mxid = None;
                record.access_token = None;
            }
        }
        record.clone()
    }

    pub fn intent(&self, transport: &dyn ChatTransport) -> Arc<dyn Intent> {
        transport.intent_for(&self.mxid)
    }

    /// Intent of the linked local user, when double puppeting is set up.
    pub fn custom_intent(&self, transport: &dyn ChatTransport) -> Option<Arc<dyn Intent>> {
        let record = self.lock();
        match (&record.custom_mxid, &record.access_token) {
            (Some(mxid), Some(token)) => Some(transport.double_puppet(mxid, token)),
            _ => None,
        }
    }

    /// Push the display name derived from a mail header, if it changed.
    pub async fn update_name(
        &self,
        transport: &dyn ChatTransport,
        store: &Store,
        template: &str,
        contact: &MailAddress,
    ) {
        let name = format_display_name(template, contact);
        {
            let record = self.lock();
            if record.name_set && record.display_name == name {
                return;
            }
        }

        let intent = self.intent(transport);
        let pushed = match intent.ensure_registered().await {
            Ok(()) => intent.set_display_name(&name).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &pushed {
            warn!(ghost = %self.mxid, error = %e, "Failed to set ghost display name");
        }

        let record = {
            let mut record = self.lock();
            record.display_name = name;
            record.name_set = pushed.is_ok();
            record.clone()
        };
        if let Err(e) = store.with(|db| db.update_puppet(&record)) {
            warn!(ghost = %self.mxid, error = %e, "Failed to save ghost profile");
        } else {
            debug!(ghost = %self.mxid, name = %record.display_name, "Updated ghost profile");
        }
    }
}
