//! Per-(bank, indicator) write locks.

use crate::domain::error::CamelsError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Key = (String, String);

/// Lazily created mutex per history key. Writers to different keys never
/// contend; writers to the same key are serialized.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `(bank_id, indicator)`.
    pub fn lock_for(&self, bank_id: &str, indicator: &str) -> Result<Arc<Mutex<()>>, CamelsError> {
        let mut locks = self.locks.lock().map_err(|_| CamelsError::Database {
            reason: "history lock table poisoned".into(),
        })?;
        Ok(locks
            .entry((bank_id.to_string(), indicator.to_string()))
            .or_default()
            .clone())
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
