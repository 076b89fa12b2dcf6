//! Indicator Store port trait.
//!
//! The store is shared by every bank-level task, so implementations must be
//! `Send + Sync`. Raw observations, score records and log entries are
//! append-only; history for a (bank, indicator) is replaced as a unit by one
//! writer at a time.

use crate::domain::audit::{AuditEvent, Decision, LogEntry, RunStamp};
use crate::domain::error::CamelsError;
use crate::domain::history::{CoverageSummary, HistoryEntry};
use crate::domain::normalization::NormalizedSeries;
use crate::domain::observation::{NewObservation, ObservationId, ObservationRecord, RawObservation};
use crate::domain::quarter::Quarter;
use crate::domain::reference::{Bank, IndicatorCatalog};
use crate::domain::scoring::{BankHistory, ScoreRecord};
use crate::domain::scoring_config::ScoringConfig;

pub const INGEST_STAGE: &str = "ingest";

/// Outcome of appending a batch of ingested rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub accepted: Vec<ObservationId>,
    /// Zero-based row index and the reason the row was rejected.
    pub rejected: Vec<(usize, String)>,
}

pub trait IndicatorStore: Send + Sync {
    /// Insert new banks; existing ones may only have their name corrected.
    fn seed_banks(&self, banks: &[Bank]) -> Result<usize, CamelsError>;
    fn sync_indicators(&self, catalog: &IndicatorCatalog) -> Result<usize, CamelsError>;
    fn banks(&self) -> Result<Vec<Bank>, CamelsError>;
    fn indicator_codes(&self) -> Result<Vec<String>, CamelsError>;

    /// Append one validated observation. Unknown bank or indicator is an
    /// `InvalidObservation`.
    fn append_observation(&self, obs: &NewObservation) -> Result<ObservationId, CamelsError>;
    fn observations_for(
        &self,
        bank_id: &str,
        indicator: &str,
    ) -> Result<Vec<RawObservation>, CamelsError>;
    fn observations_for_bank(&self, bank_id: &str) -> Result<Vec<RawObservation>, CamelsError>;

    /// Atomically replace the history of (bank, indicator) with `series`,
    /// appending its log entries in the same transaction.
    fn replace_history(
        &self,
        bank_id: &str,
        indicator: &str,
        series: &NormalizedSeries,
    ) -> Result<(), CamelsError>;
    fn history(
        &self,
        bank_id: &str,
        indicator: &str,
        from: Option<Quarter>,
        to: Option<Quarter>,
    ) -> Result<Vec<HistoryEntry>, CamelsError>;
    fn history_for_bank(&self, bank_id: &str) -> Result<BankHistory, CamelsError>;
    fn coverage(
        &self,
        bank_id: &str,
        indicator: &str,
    ) -> Result<Option<CoverageSummary>, CamelsError>;

    fn append_log(&self, entries: &[LogEntry]) -> Result<(), CamelsError>;
    fn log_for_bank(&self, bank_id: &str) -> Result<Vec<LogEntry>, CamelsError>;
    fn log_for_run(&self, run_id: &str) -> Result<Vec<LogEntry>, CamelsError>;

    /// Record the config version; a known version with other content is an
    /// `InvalidScoringConfig`.
    fn pin_scoring_config(&self, config: &ScoringConfig) -> Result<(), CamelsError>;
    /// Append a Score Record with its pillar and indicator rows.
    fn append_score(&self, record: &ScoreRecord) -> Result<i64, CamelsError>;
    fn latest_score(
        &self,
        bank_id: &str,
        period: Quarter,
    ) -> Result<Option<ScoreRecord>, CamelsError>;
    fn scores_for_run(&self, run_id: &str) -> Result<Vec<ScoreRecord>, CamelsError>;

    fn record_audit(&self, event: &AuditEvent) -> Result<(), CamelsError>;
    fn audit_for_run(&self, run_id: &str) -> Result<Vec<AuditEvent>, CamelsError>;

    /// Validate and append a batch at the store boundary. Rejected rows are
    /// logged as `observation_rejected`, never dropped silently.
    fn append_observations(
        &self,
        stamp: &RunStamp,
        records: Vec<ObservationRecord>,
    ) -> Result<IngestReport, CamelsError> {
        let mut report = IngestReport::default();
        let mut rejections = Vec::new();

        for (row, record) in records.into_iter().enumerate() {
            let bank_id = record.bank_id.clone().unwrap_or_default();
            let indicator = record.indicator.clone();
            let period = record.period.clone();

            let appended = record
                .validate()
                .and_then(|obs| self.append_observation(&obs));
            match appended {
                Ok(id) => report.accepted.push(id),
                Err(err @ CamelsError::InvalidObservation { .. }) => {
                    log::warn!("rejected observation row {row}: {err}");
                    let mut entry = LogEntry::new(
                        stamp,
                        INGEST_STAGE,
                        bank_id.trim(),
                        Decision::ObservationRejected,
                    )
                    .detail(format!("row {row}: {err}"));
                    entry.indicator = indicator;
                    entry.period = period;
                    rejections.push(entry);
                    report.rejected.push((row, err.to_string()));
                }
                Err(err) => {
                    if !rejections.is_empty() {
                        self.append_log(&rejections)?;
                    }
                    return Err(err);
                }
            }
        }

        if !rejections.is_empty() {
            self.append_log(&rejections)?;
        }
        Ok(report)
    }
}
