//! CSV adapter: reads the bank registry and extracted observation rows,
//! writes the export and audit files of a run.

use crate::domain::audit::{AuditEvent, LogEntry};
use crate::domain::error::CamelsError;
use crate::domain::observation::ObservationRecord;
use crate::domain::reference::{Bank, Pillar};
use crate::domain::scoring::{Rating, ScoreRecord};
use crate::ports::export_port::ExportPort;
use crate::ports::source_port::ObservationSource;
use chrono::SecondsFormat;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub struct CsvAdapter {
    banks_path: PathBuf,
    observations_path: PathBuf,
    output_dir: PathBuf,
}

impl CsvAdapter {
    pub fn new(banks_path: PathBuf, observations_path: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            banks_path,
            observations_path,
            output_dir,
        }
    }

    fn output_path(&self, stem: &str, run_id: &str) -> PathBuf {
        self.output_dir.join(format!("{stem}_{run_id}.csv"))
    }

    fn write_rows<T: Serialize>(&self, path: &Path, rows: &[T]) -> Result<(), CamelsError> {
        fs::create_dir_all(&self.output_dir)?;
        let mut writer = csv::Writer::from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        log::info!("wrote {} rows to {}", rows.len(), path.display());
        Ok(())
    }
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, CamelsError> {
    let content = fs::read_to_string(path).map_err(|e| {
        CamelsError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read {}: {e}", path.display()),
        ))
    })?;
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    rdr.deserialize()
        .map(|row| {
            row.map_err(|e| CamelsError::Csv {
                reason: format!("{}: {e}", path.display()),
            })
        })
        .collect()
}

impl ObservationSource for CsvAdapter {
    fn load_banks(&self) -> Result<Vec<Bank>, CamelsError> {
        read_rows(&self.banks_path)
    }

    fn load_observations(&self) -> Result<Vec<ObservationRecord>, CamelsError> {
        read_rows(&self.observations_path)
    }
}

#[derive(Debug, Serialize)]
struct PortfolioRow<'a> {
    run_id: &'a str,
    bank_id: &'a str,
    bank_name: &'a str,
    country: &'a str,
    regulator: &'a str,
    period: String,
    composite: Option<f64>,
    classification: &'static str,
    capital: Option<f64>,
    capital_class: &'static str,
    asset_quality: Option<f64>,
    asset_quality_class: &'static str,
    management: Option<f64>,
    management_class: &'static str,
    earnings: Option<f64>,
    earnings_class: &'static str,
    liquidity: Option<f64>,
    liquidity_class: &'static str,
    sensitivity: Option<f64>,
    sensitivity_class: &'static str,
    expected_weight: f64,
    available_weight: f64,
    missing_pillars: String,
    insufficient_coverage: bool,
    config_version: &'a str,
    config_fingerprint: &'a str,
    scored_at: String,
}

#[derive(Debug, Serialize)]
struct IndicatorRow<'a> {
    run_id: &'a str,
    bank_id: &'a str,
    period: String,
    pillar: &'static str,
    indicator: &'a str,
    value: Option<f64>,
    sub_score: Option<f64>,
    class: Option<&'static str>,
    unrated_reason: Option<&'static str>,
    weight: f64,
    outlier: bool,
    coverage_present: usize,
    observation_id: Option<i64>,
    source_ref: &'a str,
}

#[derive(Debug, Serialize)]
struct AuditRow<'a> {
    run_id: &'a str,
    stage: &'a str,
    bank_id: &'a str,
    status: &'static str,
    detail: &'a str,
    recorded_at: String,
}

#[derive(Debug, Serialize)]
struct LogRow<'a> {
    run_id: &'a str,
    stage: &'a str,
    bank_id: &'a str,
    indicator: &'a str,
    period: &'a str,
    decision: &'static str,
    observation_id: Option<i64>,
    related_observation_id: Option<i64>,
    detail: &'a str,
    recorded_at: String,
}

fn portfolio_row<'a>(record: &'a ScoreRecord, bank: Option<&'a Bank>) -> PortfolioRow<'a> {
    let find = |p: Pillar| record.pillars.iter().find(|s| s.pillar == p);
    let pillar = |p: Pillar| find(p).and_then(|s| s.score);
    // Pillars without configured indicators leave both cells empty.
    let class = |p: Pillar| find(p).map_or("", |s| s.classification.as_str());
    PortfolioRow {
        run_id: &record.run_id,
        bank_id: &record.bank_id,
        bank_name: bank.map_or("", |b| b.name.as_str()),
        country: bank.map_or("", |b| b.country.as_str()),
        regulator: bank.map_or("", |b| b.regulator.as_str()),
        period: record.period.to_string(),
        composite: record.composite,
        classification: record.classification.as_str(),
        capital: pillar(Pillar::Capital),
        capital_class: class(Pillar::Capital),
        asset_quality: pillar(Pillar::AssetQuality),
        asset_quality_class: class(Pillar::AssetQuality),
        management: pillar(Pillar::Management),
        management_class: class(Pillar::Management),
        earnings: pillar(Pillar::Earnings),
        earnings_class: class(Pillar::Earnings),
        liquidity: pillar(Pillar::Liquidity),
        liquidity_class: class(Pillar::Liquidity),
        sensitivity: pillar(Pillar::Sensitivity),
        sensitivity_class: class(Pillar::Sensitivity),
        expected_weight: record.expected_weight,
        available_weight: record.available_weight,
        missing_pillars: record
            .missing_pillars
            .iter()
            .map(Pillar::as_str)
            .collect::<Vec<_>>()
            .join(";"),
        insufficient_coverage: record.insufficient_coverage,
        config_version: &record.config_version,
        config_fingerprint: &record.config_fingerprint,
        scored_at: record.scored_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

impl ExportPort for CsvAdapter {
    fn write_scores(
        &self,
        run_id: &str,
        banks: &[Bank],
        records: &[ScoreRecord],
    ) -> Result<Vec<PathBuf>, CamelsError> {
        let by_id: HashMap<&str, &Bank> = banks.iter().map(|b| (b.bank_id.as_str(), b)).collect();

        let portfolio: Vec<PortfolioRow> = records
            .iter()
            .map(|r| portfolio_row(r, by_id.get(r.bank_id.as_str()).copied()))
            .collect();
        let indicators: Vec<IndicatorRow> = records
            .iter()
            .flat_map(|r| {
                r.indicators.iter().map(move |s| {
                    let (sub_score, class, unrated_reason) = match s.rating {
                        Rating::Rated { score, class } => (Some(score), Some(class.as_str()), None),
                        Rating::Unrated(reason) => (None, None, Some(reason.as_str())),
                    };
                    IndicatorRow {
                        run_id: &r.run_id,
                        bank_id: &r.bank_id,
                        period: r.period.to_string(),
                        pillar: s.pillar.as_str(),
                        indicator: &s.indicator,
                        value: s.value,
                        sub_score,
                        class,
                        unrated_reason,
                        weight: s.weight,
                        outlier: s.outlier,
                        coverage_present: s.coverage_present,
                        observation_id: s.observation_id,
                        source_ref: s.source_ref.as_deref().unwrap_or(""),
                    }
                })
            })
            .collect();

        let portfolio_path = self.output_path("camels_portfolio", run_id);
        let indicators_path = self.output_path("camels_indicators", run_id);
        self.write_rows(&portfolio_path, &portfolio)?;
        self.write_rows(&indicators_path, &indicators)?;
        Ok(vec![portfolio_path, indicators_path])
    }

    fn write_audit(
        &self,
        run_id: &str,
        events: &[AuditEvent],
        log: &[LogEntry],
    ) -> Result<Vec<PathBuf>, CamelsError> {
        let audit: Vec<AuditRow> = events
            .iter()
            .map(|e| AuditRow {
                run_id: &e.run_id,
                stage: &e.stage,
                bank_id: e.bank_id.as_deref().unwrap_or(""),
                status: e.status.as_str(),
                detail: &e.detail,
                recorded_at: e.recorded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect();
        let decisions: Vec<LogRow> = log
            .iter()
            .map(|l| LogRow {
                run_id: &l.run_id,
                stage: &l.stage,
                bank_id: &l.bank_id,
                indicator: l.indicator.as_deref().unwrap_or(""),
                period: l.period.as_deref().unwrap_or(""),
                decision: l.decision.as_str(),
                observation_id: l.observation_id,
                related_observation_id: l.related_observation_id,
                detail: &l.detail,
                recorded_at: l.recorded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect();

        let audit_path = self.output_path("audit_trail", run_id);
        let log_path = self.output_path("normalization_log", run_id);
        self.write_rows(&audit_path, &audit)?;
        self.write_rows(&log_path, &decisions)?;
        Ok(vec![audit_path, log_path])
    }
}
