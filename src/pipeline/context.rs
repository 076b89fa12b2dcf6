//! Run context passed to every stage.

use crate::domain::audit::{AuditEvent, RunStamp};
use crate::domain::error::CamelsError;
use crate::domain::quarter::Quarter;
use crate::domain::reference::IndicatorCatalog;
use crate::domain::settings::EngineSettings;
use crate::ports::store_port::IndicatorStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Run-wide cancellation signal. Tasks check it before they start; tasks
/// already running finish their commits.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// Quarter being processed; `None` means each bank's latest quarter.
    pub period: Option<Quarter>,
    pub settings: Arc<EngineSettings>,
    pub store: Arc<dyn IndicatorStore>,
    pub catalog: Arc<IndicatorCatalog>,
    pub cancel: CancellationFlag,
    normalized: Mutex<Option<BTreeSet<String>>>,
}

impl RunContext {
    pub fn new(
        settings: Arc<EngineSettings>,
        store: Arc<dyn IndicatorStore>,
        catalog: Arc<IndicatorCatalog>,
        period: Option<Quarter>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            period,
            settings,
            store,
            catalog,
            cancel: CancellationFlag::new(),
            normalized: Mutex::new(None),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stamp(&self) -> RunStamp {
        RunStamp::new(&self.run_id, self.started_at)
    }

    pub fn audit(&self, event: AuditEvent) -> Result<(), CamelsError> {
        self.store.record_audit(&event)
    }

    /// Note that `bank_id`'s normalization committed in this run.
    pub fn mark_normalized(&self, bank_id: &str) {
        if let Ok(mut guard) = self.normalized.lock() {
            guard
                .get_or_insert_with(BTreeSet::new)
                .insert(bank_id.to_string());
        }
    }

    /// Start tracking normalization, so that banks that fail it are held
    /// back from scoring even when none succeed.
    pub fn begin_normalization(&self) {
        if let Ok(mut guard) = self.normalized.lock() {
            guard.get_or_insert_with(BTreeSet::new);
        }
    }

    /// Banks whose normalization committed, or `None` if normalization did
    /// not run in this run.
    pub fn normalized_banks(&self) -> Option<BTreeSet<String>> {
        self.normalized.lock().ok().and_then(|g| g.clone())
    }
}
