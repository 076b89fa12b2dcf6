//! Scoring engine.
//!
//! Indicator sub-scores come from the threshold bands; pillar and composite
//! scores are weighted averages re-normalized over the members that could
//! be rated, so an unrated indicator never counts as zero.

use crate::domain::audit::{Decision, LogEntry, RunStamp};
use crate::domain::bands::TrafficLight;
use crate::domain::error::CamelsError;
use crate::domain::history::{assess_coverage, HistoryEntry, HistoryStatus};
use crate::domain::observation::ObservationId;
use crate::domain::quarter::Quarter;
use crate::domain::reference::{IndicatorCatalog, Pillar};
use crate::domain::scoring_config::ScoringConfig;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const STAGE: &str = "score";

/// History of every indicator for one bank, keyed by indicator code.
pub type BankHistory = BTreeMap<String, Vec<HistoryEntry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnratedReason {
    CoverageInsufficient,
    Gap,
    MissingThresholdConfig,
}

impl UnratedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnratedReason::CoverageInsufficient => "coverage_insufficient",
            UnratedReason::Gap => "gap",
            UnratedReason::MissingThresholdConfig => "missing_threshold_config",
        }
    }
}

impl FromStr for UnratedReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coverage_insufficient" => Ok(UnratedReason::CoverageInsufficient),
            "gap" => Ok(UnratedReason::Gap),
            "missing_threshold_config" => Ok(UnratedReason::MissingThresholdConfig),
            other => Err(format!("unknown unrated reason '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rating {
    Rated { score: f64, class: TrafficLight },
    Unrated(UnratedReason),
}

impl Rating {
    pub fn score(&self) -> Option<f64> {
        match self {
            Rating::Rated { score, .. } => Some(*score),
            Rating::Unrated(_) => None,
        }
    }

    pub fn class(&self) -> Option<TrafficLight> {
        match self {
            Rating::Rated { class, .. } => Some(*class),
            Rating::Unrated(_) => None,
        }
    }

    pub fn is_rated(&self) -> bool {
        matches!(self, Rating::Rated { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorScore {
    pub indicator: String,
    pub pillar: Pillar,
    /// Weight within the pillar; 0 when there is no threshold configuration.
    pub weight: f64,
    pub value: Option<f64>,
    pub rating: Rating,
    /// The scored value was flagged as an outlier during normalization.
    pub outlier: bool,
    pub coverage_present: usize,
    /// Raw observation behind the scored value.
    pub observation_id: Option<ObservationId>,
    /// Source document of that observation, when the store could resolve it.
    pub source_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PillarScore {
    pub pillar: Pillar,
    pub weight: f64,
    pub score: Option<f64>,
    /// Pillar score mapped through the composite band table.
    pub classification: Classification,
    pub expected_weight: f64,
    pub available_weight: f64,
    /// Member indicators that could not be rated.
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Light(TrafficLight),
    InsufficientData,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Light(light) => light.as_str(),
            Classification::InsufficientData => "insufficient_data",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "insufficient_data" {
            return Ok(Classification::InsufficientData);
        }
        s.parse::<TrafficLight>().map(Classification::Light)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub bank_id: String,
    pub period: Quarter,
    pub run_id: String,
    pub scored_at: DateTime<Utc>,
    pub config_version: String,
    pub config_fingerprint: String,
    pub indicators: Vec<IndicatorScore>,
    pub pillars: Vec<PillarScore>,
    pub composite: Option<f64>,
    pub classification: Classification,
    pub expected_weight: f64,
    pub available_weight: f64,
    pub missing_pillars: Vec<Pillar>,
    /// At least one indicator was unrated for lack of coverage.
    pub insufficient_coverage: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringOutcome {
    pub record: ScoreRecord,
    pub log: Vec<LogEntry>,
}

/// Coverage parameters applied when deciding whether an indicator is ratable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageRule {
    pub window_quarters: usize,
    pub minimum_coverage: usize,
}

/// Weighted mean over `(weight, score)` pairs; `None` if nothing is rated.
fn weighted_mean(pairs: &[(f64, f64)]) -> Option<(f64, f64)> {
    let total: f64 = pairs.iter().map(|(w, _)| w).sum();
    if pairs.is_empty() || total <= 0.0 {
        return None;
    }
    let sum: f64 = pairs.iter().map(|(w, s)| w * s).sum();
    Some((sum / total, total))
}

struct Assessment {
    value: Option<f64>,
    rating: Rating,
    outlier: bool,
    coverage_present: usize,
    observation_id: Option<ObservationId>,
}

impl Assessment {
    fn unrated(reason: UnratedReason, value: Option<f64>, coverage_present: usize) -> Self {
        Self {
            value,
            rating: Rating::Unrated(reason),
            outlier: false,
            coverage_present,
            observation_id: None,
        }
    }
}

fn rate_indicator(
    code: &str,
    entries: Option<&Vec<HistoryEntry>>,
    period: Quarter,
    rule: CoverageRule,
    config: &ScoringConfig,
) -> Assessment {
    let current = entries.and_then(|e| e.iter().find(|h| h.quarter == period));
    let Some(threshold) = config.threshold(code) else {
        return Assessment::unrated(
            UnratedReason::MissingThresholdConfig,
            current.and_then(|h| h.value),
            0,
        );
    };
    // No entries at all is zero quarters of coverage.
    let entries = match entries {
        Some(e) if !e.is_empty() => e,
        _ => return Assessment::unrated(UnratedReason::CoverageInsufficient, None, 0),
    };

    let coverage = assess_coverage(
        "",
        code,
        entries,
        period,
        rule.window_quarters,
        rule.minimum_coverage,
    );
    let value = current.and_then(|e| e.value);
    let outlier = current.is_some_and(|e| e.status == HistoryStatus::OutlierFlagged);
    let observation_id = current.and_then(|e| e.provenance.canonical);

    if !coverage.is_sufficient() {
        return Assessment {
            value,
            rating: Rating::Unrated(UnratedReason::CoverageInsufficient),
            outlier,
            coverage_present: coverage.present,
            observation_id,
        };
    }
    let Some(value) = value else {
        return Assessment::unrated(UnratedReason::Gap, None, coverage.present);
    };
    let rating = match threshold.bands.classify(value) {
        Some(band) => Rating::Rated {
            score: band.score.unwrap_or(0.0),
            class: band.class,
        },
        None => Rating::Unrated(UnratedReason::MissingThresholdConfig),
    };
    Assessment {
        value: Some(value),
        rating,
        outlier,
        coverage_present: coverage.present,
        observation_id,
    }
}

fn classify(config: &ScoringConfig, score: Option<f64>) -> Classification {
    score
        .and_then(|s| config.composite_bands.classify(s))
        .map_or(Classification::InsufficientData, |band| {
            Classification::Light(band.class)
        })
}

/// Score one bank for `period` from its normalized history.
///
/// Indicators configured for scoring but absent from the history have zero
/// quarters of coverage: they are unrated and logged as
/// `coverage_insufficient`. Indicators with history but no thresholds are
/// unrated and logged as `missing_threshold_config`.
pub fn score_bank(
    bank_id: &str,
    period: Quarter,
    history: &BankHistory,
    catalog: &IndicatorCatalog,
    config: &ScoringConfig,
    rule: CoverageRule,
    stamp: &RunStamp,
) -> ScoringOutcome {
    let mut decisions = Vec::new();
    let mut indicators = Vec::new();

    let mut codes: Vec<&str> = config.indicators.keys().map(String::as_str).collect();
    for code in history.keys() {
        if !config.indicators.contains_key(code) && catalog.contains(code) {
            codes.push(code.as_str());
        }
    }
    codes.sort_unstable();

    for code in codes {
        let pillar = match (config.threshold(code), catalog.get(code)) {
            (Some(t), _) => t.pillar,
            (None, Some(d)) => d.pillar,
            (None, None) => continue,
        };
        let entries = history.get(code);
        let assessed = rate_indicator(code, entries, period, rule, config);
        if assessed.rating == Rating::Unrated(UnratedReason::MissingThresholdConfig) {
            let err = CamelsError::MissingThresholdConfig {
                indicator: code.to_string(),
            };
            log::warn!("{bank_id}: {err}");
            decisions.push(
                LogEntry::from_error(stamp, STAGE, bank_id, Some(code), &err).period(period),
            );
        } else if entries.is_none_or(Vec::is_empty) {
            log::warn!("{bank_id}/{code}: no normalized history");
            decisions.push(
                LogEntry::new(stamp, STAGE, bank_id, Decision::CoverageInsufficient)
                    .indicator(code)
                    .period(period)
                    .detail(format!(
                        "no observations: 0 of {} required quarters present",
                        rule.minimum_coverage
                    )),
            );
        }
        indicators.push(IndicatorScore {
            indicator: code.to_string(),
            pillar,
            weight: config.threshold(code).map_or(0.0, |t| t.weight),
            value: assessed.value,
            rating: assessed.rating,
            outlier: assessed.outlier,
            coverage_present: assessed.coverage_present,
            observation_id: assessed.observation_id,
            source_ref: None,
        });
    }

    let mut pillars = Vec::new();
    for pillar in Pillar::ALL {
        let members: Vec<&IndicatorScore> = indicators
            .iter()
            .filter(|s| s.pillar == pillar && s.weight > 0.0)
            .collect();
        if members.is_empty() {
            continue;
        }
        let rated: Vec<(f64, f64)> = members
            .iter()
            .filter_map(|s| s.rating.score().map(|score| (s.weight, score)))
            .collect();
        let averaged = weighted_mean(&rated);
        let score = averaged.map(|(score, _)| score);
        pillars.push(PillarScore {
            pillar,
            weight: config.pillar_weight(pillar),
            score,
            classification: classify(config, score),
            expected_weight: members.iter().map(|s| s.weight).sum(),
            available_weight: averaged.map_or(0.0, |(_, w)| w),
            missing: members
                .iter()
                .filter(|s| !s.rating.is_rated())
                .map(|s| s.indicator.clone())
                .collect(),
        });
    }

    let rated_pillars: Vec<(f64, f64)> = pillars
        .iter()
        .filter_map(|p| p.score.map(|score| (p.weight, score)))
        .collect();
    let composite = weighted_mean(&rated_pillars);
    let classification = classify(config, composite.map(|(score, _)| score));

    let insufficient_coverage = indicators
        .iter()
        .any(|s| s.rating == Rating::Unrated(UnratedReason::CoverageInsufficient));

    let record = ScoreRecord {
        bank_id: bank_id.to_string(),
        period,
        run_id: stamp.run_id.clone(),
        scored_at: stamp.at,
        config_version: config.version.clone(),
        config_fingerprint: config.fingerprint(),
        expected_weight: pillars.iter().map(|p| p.weight).sum(),
        available_weight: composite.map_or(0.0, |(_, w)| w),
        missing_pillars: pillars
            .iter()
            .filter(|p| p.score.is_none())
            .map(|p| p.pillar)
            .collect(),
        indicators,
        pillars,
        composite: composite.map(|(score, _)| score),
        classification,
        insufficient_coverage,
    };

    ScoringOutcome {
        record,
        log: decisions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use crate::domain::audit::Decision;
    use crate::domain::history::Provenance;
    use crate::domain::reference::{IndicatorDefinition, Polarity};
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    const CONFIG: &str = "[scoring]
version = v1
composite_bands = [0,2) red | [2,3.5) yellow | [3.5,5] green

[pillar.asset_quality]
weight = 2

[indicator.npl]
weight = 1
bands = [0,2) green 5 | [2,5) yellow 3 | [5,inf] red 1

[indicator.coverage_ratio]
weight = 3
bands = [-inf,50) red 1 | [50,100) yellow 3 | [100,inf] green 5

[indicator.cet1]
bands = [-inf,8) red 1 | [8,12) yellow 3 | [12,inf] green 5
";

    fn catalog() -> IndicatorCatalog {
        IndicatorCatalog::new([
            IndicatorDefinition::new("npl", "NPL", Pillar::AssetQuality, "percent", Polarity::LowerIsBetter),
            IndicatorDefinition::new(
                "coverage_ratio",
                "Provision coverage",
                Pillar::AssetQuality,
                "percent",
                Polarity::HigherIsBetter,
            ),
            IndicatorDefinition::new("cet1", "CET1", Pillar::Capital, "percent", Polarity::HigherIsBetter),
            IndicatorDefinition::new("roe", "ROE", Pillar::Earnings, "percent", Polarity::HigherIsBetter),
        ])
    }

    fn config() -> ScoringConfig {
        let adapter = FileConfigAdapter::from_string(CONFIG).unwrap();
        ScoringConfig::from_config(&adapter, &catalog()).unwrap()
    }

    fn q(year: i32, quarter: u8) -> Quarter {
        Quarter::new(year, quarter).unwrap()
    }

    fn stamp() -> RunStamp {
        RunStamp::new("run-9", Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap())
    }

    const RULE: CoverageRule = CoverageRule {
        window_quarters: 8,
        minimum_coverage: 8,
    };

    /// Eight quarters ending 2024Q4; `None` marks a gap.
    fn series(code: &str, values: [Option<f64>; 8]) -> Vec<HistoryEntry> {
        q(2023, 1)
            .through(q(2024, 4))
            .into_iter()
            .zip(values)
            .map(|(quarter, value)| match value {
                Some(v) => HistoryEntry {
                    value: Some(v),
                    status: HistoryStatus::Ok,
                    provenance: Provenance {
                        canonical: Some(1),
                        discarded: vec![],
                    },
                    ..HistoryEntry::gap("B", code, quarter)
                },
                None => HistoryEntry::gap("B", code, quarter),
            })
            .collect()
    }

    fn full(code: &str, v: f64) -> Vec<HistoryEntry> {
        series(code, [Some(v); 8])
    }

    fn score(history: &BankHistory) -> ScoringOutcome {
        score_bank("B", q(2024, 4), history, &catalog(), &config(), RULE, &stamp())
    }

    #[test]
    fn fully_rated_bank() {
        let mut history = BankHistory::new();
        history.insert("npl".into(), full("npl", 1.0));
        history.insert("coverage_ratio".into(), full("coverage_ratio", 60.0));
        history.insert("cet1".into(), full("cet1", 15.0));

        let outcome = score(&history);
        let record = &outcome.record;
        let aq = record
            .pillars
            .iter()
            .find(|p| p.pillar == Pillar::AssetQuality)
            .unwrap();
        // (1*5 + 3*3) / 4
        assert_relative_eq!(aq.score.unwrap(), 3.5);
        assert_relative_eq!(aq.expected_weight, 4.0);
        // (2*3.5 + 1*5) / 3
        assert_relative_eq!(record.composite.unwrap(), 4.0);
        assert_eq!(record.classification, Classification::Light(TrafficLight::Green));
        assert!(!record.insufficient_coverage);
        assert_eq!(record.config_version, "v1");
        assert!(outcome.log.is_empty());
    }

    #[test]
    fn insufficient_coverage_is_excluded_and_renormalized() {
        let mut history = BankHistory::new();
        history.insert("npl".into(), full("npl", 1.0));
        // 5 of 8 quarters present
        history.insert(
            "coverage_ratio".into(),
            series(
                "coverage_ratio",
                [None, None, None, Some(10.0), Some(10.0), Some(10.0), Some(10.0), Some(10.0)],
            ),
        );

        let record = score(&history).record;
        let coverage = record
            .indicators
            .iter()
            .find(|s| s.indicator == "coverage_ratio")
            .unwrap();
        assert_eq!(
            coverage.rating,
            Rating::Unrated(UnratedReason::CoverageInsufficient)
        );
        assert_eq!(coverage.coverage_present, 5);

        let aq = record
            .pillars
            .iter()
            .find(|p| p.pillar == Pillar::AssetQuality)
            .unwrap();
        assert_relative_eq!(aq.score.unwrap(), 5.0);
        assert_relative_eq!(aq.available_weight, 1.0);
        assert_eq!(aq.missing, vec!["coverage_ratio".to_string()]);
        assert!(record.insufficient_coverage);
    }

    #[test]
    fn gap_at_period_is_unrated() {
        let mut values = [Some(15.0); 8];
        values[7] = None;
        let mut history = BankHistory::new();
        // minimum 8 would fail coverage first, so relax it
        history.insert("cet1".into(), series("cet1", values));
        let outcome = score_bank(
            "B",
            q(2024, 4),
            &history,
            &catalog(),
            &config(),
            CoverageRule {
                window_quarters: 8,
                minimum_coverage: 6,
            },
            &stamp(),
        );
        let cet1 = &outcome
            .record
            .indicators
            .iter()
            .find(|s| s.indicator == "cet1")
            .unwrap();
        assert_eq!(cet1.rating, Rating::Unrated(UnratedReason::Gap));
    }

    #[test]
    fn nothing_rated_is_insufficient_data() {
        let record = score(&BankHistory::new()).record;
        assert_eq!(record.composite, None);
        assert_eq!(record.classification, Classification::InsufficientData);
        assert!(record
            .indicators
            .iter()
            .all(|s| s.rating == Rating::Unrated(UnratedReason::CoverageInsufficient)
                && s.coverage_present == 0));
        assert!(record.insufficient_coverage);
        assert_eq!(record.missing_pillars.len(), 2);
        assert!(record
            .pillars
            .iter()
            .all(|p| p.classification == Classification::InsufficientData));
    }

    #[test]
    fn history_without_thresholds_is_logged_not_fatal() {
        let mut history = BankHistory::new();
        history.insert("roe".into(), full("roe", 12.0));
        history.insert("cet1".into(), full("cet1", 15.0));

        let outcome = score(&history);
        let roe = outcome
            .record
            .indicators
            .iter()
            .find(|s| s.indicator == "roe")
            .unwrap();
        assert_eq!(
            roe.rating,
            Rating::Unrated(UnratedReason::MissingThresholdConfig)
        );
        let missing: Vec<_> = outcome
            .log
            .iter()
            .filter(|e| e.decision == Decision::MissingThresholdConfig)
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].indicator.as_deref(), Some("roe"));
        // earnings has no configured members so it does not enter the composite
        assert!(outcome.record.pillars.iter().all(|p| p.pillar != Pillar::Earnings));
        assert_relative_eq!(outcome.record.composite.unwrap(), 5.0);
    }

    #[test]
    fn absent_indicator_counts_as_insufficient_coverage() {
        let mut history = BankHistory::new();
        history.insert("cet1".into(), full("cet1", 15.0));

        let outcome = score(&history);
        let npl = outcome
            .record
            .indicators
            .iter()
            .find(|s| s.indicator == "npl")
            .unwrap();
        assert_eq!(npl.rating, Rating::Unrated(UnratedReason::CoverageInsufficient));
        assert_eq!(npl.coverage_present, 0);
        assert!(outcome.record.insufficient_coverage);

        let logged: Vec<&str> = outcome
            .log
            .iter()
            .filter(|e| e.decision == Decision::CoverageInsufficient)
            .filter_map(|e| e.indicator.as_deref())
            .collect();
        assert_eq!(logged, ["coverage_ratio", "npl"]);
    }

    #[test]
    fn pillars_carry_a_class_and_scores_their_observation() {
        let mut history = BankHistory::new();
        history.insert("npl".into(), full("npl", 3.0));
        history.insert("coverage_ratio".into(), full("coverage_ratio", 40.0));
        history.insert("cet1".into(), full("cet1", 15.0));

        let record = score(&history).record;
        let aq = record
            .pillars
            .iter()
            .find(|p| p.pillar == Pillar::AssetQuality)
            .unwrap();
        // (1*3 + 3*1) / 4
        assert_relative_eq!(aq.score.unwrap(), 1.5);
        assert_eq!(aq.classification, Classification::Light(TrafficLight::Red));
        let capital = record
            .pillars
            .iter()
            .find(|p| p.pillar == Pillar::Capital)
            .unwrap();
        assert_eq!(capital.classification, Classification::Light(TrafficLight::Green));

        let cet1 = record.indicators.iter().find(|s| s.indicator == "cet1").unwrap();
        assert_eq!(cet1.observation_id, Some(1));
        assert_eq!(cet1.source_ref, None);
    }

    #[test]
    fn outlier_is_scored_and_marked() {
        let mut entries = full("cet1", 15.0);
        entries[7].status = HistoryStatus::OutlierFlagged;
        let mut history = BankHistory::new();
        history.insert("cet1".into(), entries);
        let record = score(&history).record;
        let cet1 = record.indicators.iter().find(|s| s.indicator == "cet1").unwrap();
        assert!(cet1.outlier);
        assert!(cet1.rating.is_rated());
    }

    #[test]
    fn classification_names() {
        assert_eq!(
            "insufficient_data".parse::<Classification>().unwrap(),
            Classification::InsufficientData
        );
        assert_eq!(
            "amber".parse::<Classification>().unwrap(),
            Classification::Light(TrafficLight::Yellow)
        );
    }
}
