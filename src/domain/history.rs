//! Quarter-aligned indicator history.
//!
//! One `HistoryEntry` exists per (bank, indicator, quarter). Entries are
//! produced by normalization and replaced wholesale when it re-runs.

use crate::domain::observation::ObservationId;
use crate::domain::quarter::Quarter;
use std::fmt;
use std::str::FromStr;

/// Resolution status, ordered by precedence (highest last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HistoryStatus {
    Ok,
    DuplicateResolved,
    OutlierFlagged,
    Gap,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Ok => "ok",
            HistoryStatus::DuplicateResolved => "duplicate_resolved",
            HistoryStatus::OutlierFlagged => "outlier_flagged",
            HistoryStatus::Gap => "gap",
        }
    }

    /// Keep whichever of the two statuses has precedence.
    pub fn escalate(self, other: HistoryStatus) -> HistoryStatus {
        self.max(other)
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(HistoryStatus::Ok),
            "duplicate_resolved" => Ok(HistoryStatus::DuplicateResolved),
            "outlier_flagged" => Ok(HistoryStatus::OutlierFlagged),
            "gap" => Ok(HistoryStatus::Gap),
            other => Err(format!("unknown history status '{other}'")),
        }
    }
}

/// Which raw observations fed an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    /// The observation whose value was kept. `None` for gaps.
    pub canonical: Option<ObservationId>,
    /// Observations superseded by the canonical one, or excluded in strict mode.
    pub discarded: Vec<ObservationId>,
}

impl Provenance {
    pub fn is_empty(&self) -> bool {
        self.canonical.is_none() && self.discarded.is_empty()
    }

    /// All contributing observation ids, canonical first.
    pub fn observation_ids(&self) -> Vec<ObservationId> {
        self.canonical
            .iter()
            .chain(self.discarded.iter())
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub bank_id: String,
    pub indicator: String,
    pub quarter: Quarter,
    /// Value in the indicator's canonical unit; `None` for gaps.
    pub value: Option<f64>,
    pub status: HistoryStatus,
    pub provenance: Provenance,
}

impl HistoryEntry {
    pub fn gap(bank_id: &str, indicator: &str, quarter: Quarter) -> Self {
        Self {
            bank_id: bank_id.to_string(),
            indicator: indicator.to_string(),
            quarter,
            value: None,
            status: HistoryStatus::Gap,
            provenance: Provenance::default(),
        }
    }

    pub fn is_gap(&self) -> bool {
        self.status == HistoryStatus::Gap || self.value.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageStatus {
    Sufficient,
    Insufficient,
}

impl CoverageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageStatus::Sufficient => "sufficient",
            CoverageStatus::Insufficient => "coverage_insufficient",
        }
    }
}

impl FromStr for CoverageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sufficient" => Ok(CoverageStatus::Sufficient),
            "coverage_insufficient" | "insufficient" => Ok(CoverageStatus::Insufficient),
            other => Err(format!("unknown coverage status '{other}'")),
        }
    }
}

/// Coverage of one (bank, indicator) over the trailing window ending at `as_of`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageSummary {
    pub bank_id: String,
    pub indicator: String,
    pub as_of: Quarter,
    pub window_quarters: usize,
    pub minimum_coverage: usize,
    /// Non-gap entries inside the window.
    pub present: usize,
    pub gaps: usize,
    /// Consecutive non-gap quarters counting back from `as_of`.
    pub consecutive: usize,
    pub status: CoverageStatus,
}

impl CoverageSummary {
    pub fn is_sufficient(&self) -> bool {
        self.status == CoverageStatus::Sufficient
    }
}

/// Measure coverage of `entries` over the window ending at `as_of`.
///
/// Quarters in the window with no entry at all count as gaps.
pub fn assess_coverage(
    bank_id: &str,
    indicator: &str,
    entries: &[HistoryEntry],
    as_of: Quarter,
    window_quarters: usize,
    minimum_coverage: usize,
) -> CoverageSummary {
    let window = as_of.window_start(window_quarters).through(as_of);
    let present_in = |q: &Quarter| {
        entries
            .iter()
            .any(|e| e.quarter == *q && !e.is_gap())
    };

    let present = window.iter().filter(|q| present_in(q)).count();
    let consecutive = window.iter().rev().take_while(|q| present_in(q)).count();
    let status = if present >= minimum_coverage {
        CoverageStatus::Sufficient
    } else {
        CoverageStatus::Insufficient
    };

    CoverageSummary {
        bank_id: bank_id.to_string(),
        indicator: indicator.to_string(),
        as_of,
        window_quarters: window.len(),
        minimum_coverage,
        present,
        gaps: window.len() - present,
        consecutive,
        status,
    }
}
