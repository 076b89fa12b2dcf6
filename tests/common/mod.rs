#![allow(dead_code)]

use camels::adapters::file_config_adapter::FileConfigAdapter;
use camels::domain::audit::{AuditEvent, LogEntry, RunStamp};
use camels::domain::error::CamelsError;
use camels::domain::observation::{ObservationRecord, RawObservation};
use camels::domain::quarter::Quarter;
use camels::domain::reference::{Bank, IndicatorCatalog, IndicatorDefinition, Pillar, Polarity};
use camels::domain::scoring::ScoreRecord;
use camels::domain::scoring_config::ScoringConfig;
use camels::ports::export_port::ExportPort;
use camels::ports::source_port::ObservationSource;
use chrono::{TimeZone, Utc};
use std::path::PathBuf;
use std::sync::Mutex;

pub const SCORING_INI: &str = "[scoring]
version = 2024.1
composite_bands = [0,2) red | [2,3.5) yellow | [3.5,5] green

[pillar.asset_quality]
weight = 2

[indicator.NPL_ratio]
weight = 2
bands = [0,2) green 5 | [2,5) yellow 3 | [5,inf] red 1

[indicator.provision_coverage]
weight = 1
bands = [-inf,50) red 1 | [50,100) yellow 3 | [100,inf] green 5

[indicator.cet1_rwa]
bands = [-inf,8) red 1 | [8,12) yellow 3 | [12,inf] green 5

[indicator.roe]
bands = [-inf,5) red 1 | [5,15) yellow 3 | [15,inf] green 5
";

pub const CATALOG_INI: &str = "[indicator.NPL_ratio]
name = Non-performing loans
pillar = asset_quality
unit = percent
polarity = lower_is_better
conversions = ratio:100, bps:0.01

[indicator.provision_coverage]
pillar = asset_quality
unit = percent
polarity = higher_is_better

[indicator.cet1_rwa]
pillar = capital
unit = percent
polarity = higher_is_better
conversions = ratio:100

[indicator.roe]
pillar = earnings
unit = percent
polarity = higher_is_better
min_value = -100
max_value = 100
";

pub fn q(year: i32, quarter: u8) -> Quarter {
    Quarter::new(year, quarter).unwrap()
}

pub fn catalog() -> IndicatorCatalog {
    IndicatorCatalog::new([
        IndicatorDefinition::new(
            "NPL_ratio",
            "Non-performing loans",
            Pillar::AssetQuality,
            "percent",
            Polarity::LowerIsBetter,
        )
        .with_conversion("ratio", 100.0)
        .with_conversion("bps", 0.01),
        IndicatorDefinition::new(
            "provision_coverage",
            "Provision coverage",
            Pillar::AssetQuality,
            "percent",
            Polarity::HigherIsBetter,
        ),
        IndicatorDefinition::new("cet1_rwa", "CET1", Pillar::Capital, "percent", Polarity::HigherIsBetter)
            .with_conversion("ratio", 100.0),
        IndicatorDefinition::new("roe", "ROE", Pillar::Earnings, "percent", Polarity::HigherIsBetter)
            .with_range(Some(-100.0), Some(100.0)),
    ])
}

pub fn scoring_config(content: &str) -> Result<ScoringConfig, CamelsError> {
    let adapter = FileConfigAdapter::from_string(content).unwrap();
    ScoringConfig::from_config(&adapter, &catalog())
}

pub fn stamp(run_id: &str) -> RunStamp {
    RunStamp::new(run_id, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
}

pub fn bank(id: &str) -> Bank {
    Bank {
        bank_id: id.to_string(),
        name: format!("{id} Bank Plc"),
        country: "KE".to_string(),
        regulator: "CBK".to_string(),
    }
}

/// Raw observation with the ingestion time given as day-of-April 2024.
pub fn raw(
    id: i64,
    indicator: &str,
    period: &str,
    value: f64,
    ingested_day: u32,
    hash: &str,
) -> RawObservation {
    RawObservation {
        id,
        bank_id: "B".to_string(),
        indicator: indicator.to_string(),
        period: period.to_string(),
        value,
        unit: "percent".to_string(),
        source_ref: format!("filings/{period}.pdf"),
        content_hash: hash.to_string(),
        ingested_at: Utc.with_ymd_and_hms(2024, 4, ingested_day, 9, 0, 0).unwrap(),
    }
}

/// An extracted row as the ingestion collaborator delivers it.
pub fn row(bank_id: &str, indicator: &str, period: &str, value: &str, unit: &str) -> ObservationRecord {
    ObservationRecord {
        bank_id: Some(bank_id.to_string()),
        indicator: Some(indicator.to_string()),
        period: Some(period.to_string()),
        value: Some(value.to_string()),
        unit: Some(unit.to_string()),
        source_ref: Some(format!("filings/{bank_id}/{period}.pdf")),
        content_hash: Some(format!("{bank_id}-{indicator}-{period}-{value}")),
        ingested_at: Some("2024-05-01T08:00:00Z".to_string()),
    }
}

/// Eight consecutive quarters 2022Q2..=2024Q1 of `indicator` for `bank_id`.
pub fn eight_quarters(bank_id: &str, indicator: &str, values: [f64; 8]) -> Vec<ObservationRecord> {
    q(2022, 2)
        .through(q(2024, 1))
        .into_iter()
        .zip(values)
        .map(|(quarter, v)| row(bank_id, indicator, &quarter.to_string(), &v.to_string(), "percent"))
        .collect()
}

pub struct MemorySource {
    pub banks: Vec<Bank>,
    pub rows: Vec<ObservationRecord>,
}

impl ObservationSource for MemorySource {
    fn load_banks(&self) -> Result<Vec<Bank>, CamelsError> {
        Ok(self.banks.clone())
    }

    fn load_observations(&self) -> Result<Vec<ObservationRecord>, CamelsError> {
        Ok(self.rows.clone())
    }
}

/// Exporter that keeps what it was asked to publish.
#[derive(Default)]
pub struct MemoryExporter {
    pub scores: Mutex<Vec<ScoreRecord>>,
    pub events: Mutex<Vec<AuditEvent>>,
    pub log: Mutex<Vec<LogEntry>>,
}

impl ExportPort for MemoryExporter {
    fn write_scores(
        &self,
        run_id: &str,
        _banks: &[Bank],
        records: &[ScoreRecord],
    ) -> Result<Vec<PathBuf>, CamelsError> {
        self.scores.lock().unwrap().extend_from_slice(records);
        Ok(vec![PathBuf::from(format!("camels_portfolio_{run_id}.csv"))])
    }

    fn write_audit(
        &self,
        run_id: &str,
        events: &[AuditEvent],
        log: &[LogEntry],
    ) -> Result<Vec<PathBuf>, CamelsError> {
        self.events.lock().unwrap().extend_from_slice(events);
        self.log.lock().unwrap().extend_from_slice(log);
        Ok(vec![PathBuf::from(format!("audit_trail_{run_id}.csv"))])
    }
}
