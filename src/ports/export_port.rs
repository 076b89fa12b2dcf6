//! Export/audit publication port.

use crate::domain::audit::{AuditEvent, LogEntry};
use crate::domain::error::CamelsError;
use crate::domain::reference::Bank;
use crate::domain::scoring::ScoreRecord;
use std::path::PathBuf;

/// Port for publishing a run's results. Consumers only read from the store.
pub trait ExportPort {
    /// Write the portfolio summary and per-indicator detail for a run.
    fn write_scores(
        &self,
        run_id: &str,
        banks: &[Bank],
        records: &[ScoreRecord],
    ) -> Result<Vec<PathBuf>, CamelsError>;

    fn write_audit(
        &self,
        run_id: &str,
        events: &[AuditEvent],
        log: &[LogEntry],
    ) -> Result<Vec<PathBuf>, CamelsError>;
}
