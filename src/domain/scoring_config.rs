//! Versioned scoring configuration: weights and threshold bands.
//!
//! ```ini
//! [scoring]
//! version = 2024.1
//! composite_bands = [0,2) red | [2,3.5) yellow | [3.5,5] green
//!
//! [pillar.asset_quality]
//! weight = 1.5
//!
//! [indicator.NPL_ratio]
//! weight = 2
//! bands = [0,2) green 5 | [2,5) yellow 3 | [5,inf] red 1
//! ```
//!
//! Any defect here is an `InvalidScoringConfig`, raised before scoring starts.

use crate::domain::bands::BandTable;
use crate::domain::error::CamelsError;
use crate::domain::reference::{IndicatorCatalog, Pillar, Polarity, INDICATOR_SECTION_PREFIX};
use crate::ports::config_port::ConfigPort;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const PILLAR_SECTION_PREFIX: &str = "pillar.";

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorThreshold {
    pub code: String,
    pub pillar: Pillar,
    pub weight: f64,
    pub polarity: Polarity,
    pub bands: BandTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub version: String,
    pub composite_bands: BandTable,
    pub pillar_weights: BTreeMap<Pillar, f64>,
    pub indicators: BTreeMap<String, IndicatorThreshold>,
}

fn invalid(reason: impl Into<String>) -> CamelsError {
    CamelsError::InvalidScoringConfig {
        reason: reason.into(),
    }
}

fn weight(config: &dyn ConfigPort, section: &str) -> Result<f64, CamelsError> {
    let Some(raw) = config.get_string(section, "weight") else {
        return Ok(1.0);
    };
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid(format!("[{section}] weight '{raw}' is not a number")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(format!("[{section}] weight must be finite and positive")));
    }
    Ok(value)
}

impl ScoringConfig {
    /// Load and validate against the indicator catalog.
    pub fn from_config(
        config: &dyn ConfigPort,
        catalog: &IndicatorCatalog,
    ) -> Result<Self, CamelsError> {
        let version = config
            .get_string("scoring", "version")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| invalid("[scoring] version is required"))?;

        let composite_raw = config
            .get_string("scoring", "composite_bands")
            .ok_or_else(|| invalid("[scoring] composite_bands is required"))?;
        let composite_bands = BandTable::parse(&composite_raw, Polarity::HigherIsBetter, false)
            .map_err(|e| invalid(format!("composite_bands: {e}")))?;

        let mut pillar_weights: BTreeMap<Pillar, f64> =
            Pillar::ALL.iter().map(|p| (*p, 1.0)).collect();
        let mut indicators = BTreeMap::new();

        for section in config.sections() {
            if let Some(name) = section.strip_prefix(PILLAR_SECTION_PREFIX) {
                let pillar = name.parse::<Pillar>().map_err(invalid)?;
                pillar_weights.insert(pillar, weight(config, &section)?);
            } else if let Some(code) = section.strip_prefix(INDICATOR_SECTION_PREFIX) {
                let threshold = parse_indicator(config, &section, code, catalog)?;
                indicators.insert(threshold.code.clone(), threshold);
            }
        }

        if indicators.is_empty() {
            return Err(invalid("no [indicator.<code>] threshold sections"));
        }

        Ok(Self {
            version,
            composite_bands,
            pillar_weights,
            indicators,
        })
    }

    pub fn threshold(&self, code: &str) -> Option<&IndicatorThreshold> {
        self.indicators.get(code)
    }

    pub fn pillar_weight(&self, pillar: Pillar) -> f64 {
        self.pillar_weights.get(&pillar).copied().unwrap_or(1.0)
    }

    /// Deterministic rendering of every value that affects a score.
    pub fn canonical_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "version={}", self.version);
        let _ = writeln!(out, "composite_bands={}", self.composite_bands);
        for (pillar, weight) in &self.pillar_weights {
            let _ = writeln!(out, "pillar.{pillar}.weight={weight}");
        }
        for (code, t) in &self.indicators {
            let _ = writeln!(
                out,
                "indicator.{code}.pillar={};weight={};polarity={};bands={}",
                t.pillar,
                t.weight,
                t.polarity.as_str(),
                t.bands
            );
        }
        out
    }

    /// SHA-256 of the canonical rendering, lowercase hex.
    pub fn fingerprint(&self) -> String {
        format!("{:x}", Sha256::digest(self.canonical_text().as_bytes()))
    }
}

fn parse_indicator(
    config: &dyn ConfigPort,
    section: &str,
    code: &str,
    catalog: &IndicatorCatalog,
) -> Result<IndicatorThreshold, CamelsError> {
    let definition = catalog
        .get(code)
        .ok_or_else(|| invalid(format!("thresholds given for unknown indicator '{code}'")))?;
    let pillar = match config.get_string(section, "pillar") {
        Some(raw) => raw.parse::<Pillar>().map_err(invalid)?,
        None => definition.pillar,
    };
    let bands_raw = config
        .get_string(section, "bands")
        .ok_or_else(|| invalid(format!("[{section}] bands is required")))?;
    let bands = BandTable::parse(&bands_raw, definition.polarity, true)
        .map_err(|e| invalid(format!("[{section}] bands: {e}")))?;

    Ok(IndicatorThreshold {
        code: code.to_string(),
        pillar,
        weight: weight(config, section)?,
        polarity: definition.polarity,
        bands,
    })
}
