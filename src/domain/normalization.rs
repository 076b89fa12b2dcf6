//! Normalization engine.
//!
//! Turns the raw observations of one (bank, indicator) into a quarter-aligned
//! history. Per quarter bucket:
//!
//! 1. unit conversion into the indicator's canonical unit
//! 2. duplicate resolution: latest `ingested_at` wins, then the larger
//!    content hash, then the lower observation id
//! 3. outlier screening against the bank's own prior quarters
//! 4. gap detection over the expected window
//!
//! The function is pure: the same observations and parameters always yield
//! the same entries and log, apart from the run stamp.

use crate::domain::audit::{Decision, LogEntry, RunStamp};
use crate::domain::error::CamelsError;
use crate::domain::history::{
    assess_coverage, CoverageSummary, HistoryEntry, HistoryStatus, Provenance,
};
use crate::domain::observation::RawObservation;
use crate::domain::quarter::Quarter;
use crate::domain::reference::IndicatorDefinition;
use crate::domain::robust_stats::{check_outlier, OutlierMethod};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const STAGE: &str = "normalize";

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationParams {
    pub window_quarters: usize,
    pub minimum_coverage: usize,
    pub outlier_method: OutlierMethod,
    pub outlier_threshold: f64,
    /// Prior quarters used as the outlier reference sample.
    pub outlier_lookback: usize,
    /// Reference values required before a value is screened at all.
    pub outlier_min_history: usize,
    /// Exclude flagged values instead of only flagging them.
    pub strict: bool,
}

impl Default for NormalizationParams {
    fn default() -> Self {
        Self {
            window_quarters: 12,
            minimum_coverage: 8,
            outlier_method: OutlierMethod::RobustZ,
            outlier_threshold: 3.0,
            outlier_lookback: 12,
            outlier_min_history: 4,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSeries {
    pub entries: Vec<HistoryEntry>,
    pub log: Vec<LogEntry>,
    pub coverage: CoverageSummary,
}

/// An observation after period parsing and unit conversion.
#[derive(Debug, Clone)]
struct Candidate<'a> {
    obs: &'a RawObservation,
    quarter: Quarter,
    value: f64,
}

/// Canonical ordering of competing observations: best first.
fn candidate_order(a: &RawObservation, b: &RawObservation) -> Ordering {
    b.ingested_at
        .cmp(&a.ingested_at)
        .then_with(|| b.content_hash.cmp(&a.content_hash))
        .then_with(|| a.id.cmp(&b.id))
}

/// Latest quarter among observations with a parseable period.
pub fn latest_quarter<'a>(observations: impl IntoIterator<Item = &'a RawObservation>) -> Option<Quarter> {
    observations
        .into_iter()
        .filter_map(|o| Quarter::parse(&o.period).ok())
        .max()
}

fn prepare<'a>(
    bank_id: &str,
    definition: &IndicatorDefinition,
    observations: &'a [RawObservation],
) -> Result<Vec<Candidate<'a>>, CamelsError> {
    let mut candidates = Vec::with_capacity(observations.len());
    for obs in observations {
        let quarter = Quarter::parse(&obs.period)?;
        let factor = definition
            .conversion_factor(&obs.unit)
            .ok_or_else(|| CamelsError::UnitConversion {
                bank_id: bank_id.to_string(),
                indicator: definition.code.clone(),
                unit: obs.unit.clone(),
            })?;
        candidates.push(Candidate {
            obs,
            quarter,
            value: obs.value * factor,
        });
    }
    Ok(candidates)
}

/// Normalize one (bank, indicator) up to and including `as_of`.
///
/// Fails without producing anything on a malformed period or an
/// unconvertible unit anywhere in the batch.
pub fn normalize_series(
    bank_id: &str,
    definition: &IndicatorDefinition,
    observations: &[RawObservation],
    as_of: Quarter,
    params: &NormalizationParams,
    stamp: &RunStamp,
) -> Result<NormalizedSeries, CamelsError> {
    let code = definition.code.as_str();
    let candidates = prepare(bank_id, definition, observations)?;

    let mut buckets: BTreeMap<Quarter, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates.into_iter().filter(|c| c.quarter <= as_of) {
        buckets.entry(candidate.quarter).or_default().push(candidate);
    }

    let window_start = as_of.window_start(params.window_quarters);
    let first = buckets
        .keys()
        .next()
        .copied()
        .map_or(window_start, |q| q.min(window_start));

    let log_entry = |decision: Decision, quarter: Quarter| {
        LogEntry::new(stamp, STAGE, bank_id, decision)
            .indicator(code)
            .period(quarter)
    };

    let mut entries: Vec<HistoryEntry> = Vec::new();
    let mut log: Vec<LogEntry> = Vec::new();

    for quarter in first.through(as_of) {
        let Some(mut bucket) = buckets.remove(&quarter) else {
            log.push(log_entry(Decision::GapDetected, quarter).detail("no observation for quarter"));
            entries.push(HistoryEntry::gap(bank_id, code, quarter));
            continue;
        };

        bucket.sort_by(|a, b| candidate_order(a.obs, b.obs));
        let winner = &bucket[0];
        let mut status = HistoryStatus::Ok;
        let mut provenance = Provenance {
            canonical: Some(winner.obs.id),
            discarded: Vec::new(),
        };

        for loser in &bucket[1..] {
            status = status.escalate(HistoryStatus::DuplicateResolved);
            provenance.discarded.push(loser.obs.id);
            log.push(
                log_entry(Decision::DuplicateResolved, quarter)
                    .observation(loser.obs.id)
                    .related(winner.obs.id)
                    .detail(format!(
                        "discarded value {} ingested {} in favour of {} ingested {}",
                        loser.value,
                        loser.obs.ingested_at.to_rfc3339(),
                        winner.value,
                        winner.obs.ingested_at.to_rfc3339()
                    )),
            );
        }
        if let Some(runner_up) = bucket.get(1) {
            if runner_up.obs.ingested_at == winner.obs.ingested_at {
                log.push(
                    log_entry(Decision::DuplicateTieBroken, quarter)
                        .observation(runner_up.obs.id)
                        .related(winner.obs.id)
                        .detail(format!(
                            "ingestion timestamps tie; kept content hash '{}' over '{}'",
                            winner.obs.content_hash, runner_up.obs.content_hash
                        )),
                );
            }
        }

        let value = winner.value;
        if !definition.in_expected_range(value) {
            log.push(
                log_entry(Decision::RangeWarning, quarter)
                    .observation(winner.obs.id)
                    .detail(format!(
                        "value {value} outside expected range [{}, {}]",
                        bound(definition.min_value),
                        bound(definition.max_value)
                    )),
            );
        }

        let reference = reference_values(&entries, quarter, params.outlier_lookback);
        let check = if reference.len() >= params.outlier_min_history {
            check_outlier(value, &reference, params.outlier_method, params.outlier_threshold)
        } else {
            None
        };

        match check {
            Some(check) if check.flagged && params.strict => {
                provenance.discarded.insert(0, winner.obs.id);
                provenance.canonical = None;
                log.push(
                    log_entry(Decision::OutlierExcluded, quarter)
                        .observation(winner.obs.id)
                        .detail(format!(
                            "value {value} excluded ({} score {:.4} > {}, median {})",
                            params.outlier_method, check.score, params.outlier_threshold, check.center
                        )),
                );
                log.push(
                    log_entry(Decision::GapDetected, quarter)
                        .observation(winner.obs.id)
                        .detail("strict mode excluded outlier"),
                );
                entries.push(HistoryEntry {
                    provenance,
                    ..HistoryEntry::gap(bank_id, code, quarter)
                });
                continue;
            }
            Some(check) if check.flagged => {
                status = status.escalate(HistoryStatus::OutlierFlagged);
                log.push(
                    log_entry(Decision::OutlierFlagged, quarter)
                        .observation(winner.obs.id)
                        .detail(format!(
                            "value {value} flagged ({} score {:.4} > {}, median {})",
                            params.outlier_method, check.score, params.outlier_threshold, check.center
                        )),
                );
            }
            _ => {}
        }

        entries.push(HistoryEntry {
            bank_id: bank_id.to_string(),
            indicator: code.to_string(),
            quarter,
            value: Some(value),
            status,
            provenance,
        });
    }

    let coverage = assess_coverage(
        bank_id,
        code,
        &entries,
        as_of,
        params.window_quarters,
        params.minimum_coverage,
    );
    if !coverage.is_sufficient() {
        log.push(log_entry(Decision::CoverageInsufficient, as_of).detail(format!(
            "{} of {} quarters present, minimum {}",
            coverage.present, coverage.window_quarters, coverage.minimum_coverage
        )));
    }

    Ok(NormalizedSeries {
        entries,
        log,
        coverage,
    })
}

/// Resolved values of up to `lookback` quarters before `quarter`.
fn reference_values(entries: &[HistoryEntry], quarter: Quarter, lookback: usize) -> Vec<f64> {
    let earliest = quarter.offset(-(lookback as i64));
    entries
        .iter()
        .filter(|e| e.quarter >= earliest && e.quarter < quarter)
        .filter_map(|e| e.value)
        .collect()
}

fn bound(limit: Option<f64>) -> String {
    limit.map_or_else(|| "-".to_string(), |v| v.to_string())
}
