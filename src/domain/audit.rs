//! Normalization/audit log records.
//!
//! Every decision the engine takes about an observation, a quarter, or a
//! whole bank task is written as a `LogEntry`. Stage-level milestones go to
//! the separate audit trail as `AuditEvent`s.

use crate::domain::error::CamelsError;
use crate::domain::observation::ObservationId;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Run identity stamped on everything a run writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStamp {
    pub run_id: String,
    pub at: DateTime<Utc>,
}

impl RunStamp {
    pub fn new(run_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    DuplicateResolved,
    DuplicateTieBroken,
    OutlierFlagged,
    OutlierExcluded,
    GapDetected,
    CoverageInsufficient,
    RangeWarning,
    UnitConversionFailed,
    MalformedPeriod,
    ObservationRejected,
    MissingThresholdConfig,
    StageTimeout,
    TaskFailed,
    TaskCancelled,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::DuplicateResolved => "duplicate_resolved",
            Decision::DuplicateTieBroken => "duplicate_tie_broken",
            Decision::OutlierFlagged => "outlier_flagged",
            Decision::OutlierExcluded => "outlier_excluded",
            Decision::GapDetected => "gap_detected",
            Decision::CoverageInsufficient => "coverage_insufficient",
            Decision::RangeWarning => "range_warning",
            Decision::UnitConversionFailed => "unit_conversion_error",
            Decision::MalformedPeriod => "malformed_period",
            Decision::ObservationRejected => "observation_rejected",
            Decision::MissingThresholdConfig => "missing_threshold_config",
            Decision::StageTimeout => "stage_timeout",
            Decision::TaskFailed => "task_failed",
            Decision::TaskCancelled => "task_cancelled",
        }
    }

    /// Map a failure onto the decision recorded for it.
    pub fn for_error(err: &CamelsError) -> Self {
        match err {
            CamelsError::UnitConversion { .. } => Decision::UnitConversionFailed,
            CamelsError::MalformedPeriod { .. } => Decision::MalformedPeriod,
            CamelsError::InvalidObservation { .. } => Decision::ObservationRejected,
            CamelsError::MissingThresholdConfig { .. } => Decision::MissingThresholdConfig,
            CamelsError::StageTimeout { .. } => Decision::StageTimeout,
            CamelsError::Cancelled => Decision::TaskCancelled,
            _ => Decision::TaskFailed,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            Decision::DuplicateResolved,
            Decision::DuplicateTieBroken,
            Decision::OutlierFlagged,
            Decision::OutlierExcluded,
            Decision::GapDetected,
            Decision::CoverageInsufficient,
            Decision::RangeWarning,
            Decision::UnitConversionFailed,
            Decision::MalformedPeriod,
            Decision::ObservationRejected,
            Decision::MissingThresholdConfig,
            Decision::StageTimeout,
            Decision::TaskFailed,
            Decision::TaskCancelled,
        ];
        all.into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown decision '{s}'"))
    }
}

/// One row of the normalization/audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub run_id: String,
    pub stage: String,
    pub bank_id: String,
    pub indicator: Option<String>,
    pub period: Option<String>,
    pub decision: Decision,
    /// Observation the decision is about (e.g. the discarded duplicate).
    pub observation_id: Option<ObservationId>,
    /// Observation it was weighed against (e.g. the canonical winner).
    pub related_observation_id: Option<ObservationId>,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(stamp: &RunStamp, stage: &str, bank_id: &str, decision: Decision) -> Self {
        Self {
            run_id: stamp.run_id.clone(),
            stage: stage.to_string(),
            bank_id: bank_id.to_string(),
            indicator: None,
            period: None,
            decision,
            observation_id: None,
            related_observation_id: None,
            detail: String::new(),
            recorded_at: stamp.at,
        }
    }

    pub fn indicator(mut self, code: &str) -> Self {
        self.indicator = Some(code.to_string());
        self
    }

    pub fn period(mut self, period: impl ToString) -> Self {
        self.period = Some(period.to_string());
        self
    }

    pub fn observation(mut self, id: ObservationId) -> Self {
        self.observation_id = Some(id);
        self
    }

    pub fn related(mut self, id: ObservationId) -> Self {
        self.related_observation_id = Some(id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Record an error against the affected scope.
    pub fn from_error(
        stamp: &RunStamp,
        stage: &str,
        bank_id: &str,
        indicator: Option<&str>,
        err: &CamelsError,
    ) -> Self {
        let mut entry = Self::new(stamp, stage, bank_id, Decision::for_error(err))
            .detail(format!("{}: {}", err.kind(), err));
        entry.indicator = indicator.map(str::to_string);
        if let CamelsError::MalformedPeriod { value } = err {
            entry.period = Some(value.clone());
        }
        entry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Started,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::TimedOut => "timed_out",
            AuditStatus::Cancelled => "cancelled",
            AuditStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(AuditStatus::Started),
            "completed" => Ok(AuditStatus::Completed),
            "failed" => Ok(AuditStatus::Failed),
            "timed_out" => Ok(AuditStatus::TimedOut),
            "cancelled" => Ok(AuditStatus::Cancelled),
            "skipped" => Ok(AuditStatus::Skipped),
            other => Err(format!("unknown audit status '{other}'")),
        }
    }
}

/// Stage or bank-task milestone in the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub run_id: String,
    pub stage: String,
    pub bank_id: Option<String>,
    pub status: AuditStatus,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn stage(run_id: &str, stage: &str, status: AuditStatus, detail: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            bank_id: None,
            status,
            detail: detail.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn bank(
        run_id: &str,
        stage: &str,
        bank_id: &str,
        status: AuditStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            bank_id: Some(bank_id.to_string()),
            ..Self::stage(run_id, stage, status, detail)
        }
    }
}
