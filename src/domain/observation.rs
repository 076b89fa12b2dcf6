//! Raw indicator observations as delivered by ingestion.
//!
//! An `ObservationRecord` is the loosely-typed row handed over by the
//! ingestion collaborator. It becomes a `NewObservation` only after every
//! mandatory field has been checked; the store assigns the id on append.

use crate::domain::error::CamelsError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

pub type ObservationId = i64;

/// An observation row before validation. Every field may be absent.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ObservationRecord {
    pub bank_id: Option<String>,
    #[serde(alias = "indicator_code")]
    pub indicator: Option<String>,
    pub period: Option<String>,
    pub value: Option<String>,
    pub unit: Option<String>,
    #[serde(alias = "source")]
    pub source_ref: Option<String>,
    #[serde(alias = "checksum")]
    pub content_hash: Option<String>,
    pub ingested_at: Option<String>,
}

/// A validated observation awaiting storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub bank_id: String,
    pub indicator: String,
    /// Period exactly as reported; parsed during normalization.
    pub period: String,
    pub value: f64,
    pub unit: String,
    pub source_ref: String,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

/// A stored, append-only observation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub id: ObservationId,
    pub bank_id: String,
    pub indicator: String,
    pub period: String,
    pub value: f64,
    pub unit: String,
    pub source_ref: String,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

impl RawObservation {
    pub fn from_new(id: ObservationId, obs: NewObservation) -> Self {
        Self {
            id,
            bank_id: obs.bank_id,
            indicator: obs.indicator,
            period: obs.period,
            value: obs.value,
            unit: obs.unit,
            source_ref: obs.source_ref,
            content_hash: obs.content_hash,
            ingested_at: obs.ingested_at,
        }
    }
}

impl ObservationRecord {
    /// Check mandatory fields and types.
    pub fn validate(self) -> Result<NewObservation, CamelsError> {
        let bank_id = mandatory(self.bank_id, "bank_id")?;
        let indicator = mandatory(self.indicator, "indicator")?;
        let period = mandatory(self.period, "period")?;
        let raw_value = mandatory(self.value, "value")?;
        let unit = mandatory(self.unit, "unit")?;
        let source_ref = mandatory(self.source_ref, "source_ref")?;
        let content_hash = mandatory(self.content_hash, "content_hash")?;
        let raw_ingested = mandatory(self.ingested_at, "ingested_at")?;

        let value = parse_value(&raw_value).ok_or_else(|| CamelsError::InvalidObservation {
            field: "value".into(),
            reason: format!("'{raw_value}' is not a finite number"),
        })?;
        let ingested_at =
            parse_timestamp(&raw_ingested).ok_or_else(|| CamelsError::InvalidObservation {
                field: "ingested_at".into(),
                reason: format!("'{raw_ingested}' is not a recognised timestamp"),
            })?;

        Ok(NewObservation {
            bank_id,
            indicator,
            period,
            value,
            unit,
            source_ref,
            content_hash,
            ingested_at,
        })
    }
}

fn mandatory(value: Option<String>, field: &str) -> Result<String, CamelsError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CamelsError::InvalidObservation {
            field: field.to_string(),
            reason: "is missing".into(),
        }),
    }
}

/// Parse a reported value, tolerating thousands separators.
pub fn parse_value(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
