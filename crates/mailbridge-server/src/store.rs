//! Shared handle to the bridge database.

use std::sync::{Arc, Mutex};

use mailbridge_store::{Database, StoreError};

/// Cloneable handle that serializes access to one SQLite connection.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` with exclusive access to the database.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        f(&db)
    }
}
