//! Bank and indicator reference data.
//!
//! Banks come from the seed registry, indicator definitions from the catalog
//! file. Both are read-only while a run executes.

use crate::domain::error::CamelsError;
use crate::ports::config_port::ConfigPort;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const INDICATOR_SECTION_PREFIX: &str = "indicator.";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Bank {
    pub bank_id: String,
    pub name: String,
    pub country: String,
    pub regulator: String,
}

/// The six CAMELS risk dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Pillar {
    Capital,
    AssetQuality,
    Management,
    Earnings,
    Liquidity,
    Sensitivity,
}

impl Pillar {
    pub const ALL: [Pillar; 6] = [
        Pillar::Capital,
        Pillar::AssetQuality,
        Pillar::Management,
        Pillar::Earnings,
        Pillar::Liquidity,
        Pillar::Sensitivity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pillar::Capital => "capital",
            Pillar::AssetQuality => "asset_quality",
            Pillar::Management => "management",
            Pillar::Earnings => "earnings",
            Pillar::Liquidity => "liquidity",
            Pillar::Sensitivity => "sensitivity",
        }
    }
}

impl fmt::Display for Pillar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pillar {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "capital" | "capital_adequacy" => Ok(Pillar::Capital),
            "a" | "assets" | "asset_quality" => Ok(Pillar::AssetQuality),
            "m" | "management" => Ok(Pillar::Management),
            "e" | "earnings" => Ok(Pillar::Earnings),
            "l" | "liquidity" => Ok(Pillar::Liquidity),
            "s" | "sensitivity" | "sensitivity_to_market_risk" => Ok(Pillar::Sensitivity),
            other => Err(format!("unknown pillar '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    HigherIsBetter,
    LowerIsBetter,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::HigherIsBetter => "higher_is_better",
            Polarity::LowerIsBetter => "lower_is_better",
        }
    }
}

impl FromStr for Polarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "higher_is_better" | "higher" | "+" => Ok(Polarity::HigherIsBetter),
            "lower_is_better" | "lower" | "-" => Ok(Polarity::LowerIsBetter),
            other => Err(format!("unknown polarity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorDefinition {
    pub code: String,
    pub name: String,
    pub pillar: Pillar,
    /// Canonical unit every observation is converted into.
    pub unit: String,
    pub polarity: Polarity,
    /// Factor applied to a value reported in the keyed unit.
    pub conversions: BTreeMap<String, f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl IndicatorDefinition {
    pub fn new(code: &str, name: &str, pillar: Pillar, unit: &str, polarity: Polarity) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            pillar,
            unit: unit.to_string(),
            polarity,
            conversions: BTreeMap::new(),
            min_value: None,
            max_value: None,
        }
    }

    pub fn with_conversion(mut self, unit: &str, factor: f64) -> Self {
        self.conversions.insert(unit.to_string(), factor);
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    /// Factor converting a value declared in `unit` into the canonical unit.
    pub fn conversion_factor(&self, unit: &str) -> Option<f64> {
        let unit = unit.trim();
        if unit.eq_ignore_ascii_case(&self.unit) {
            return Some(1.0);
        }
        self.conversions
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(unit))
            .map(|(_, factor)| *factor)
    }

    pub fn in_expected_range(&self, value: f64) -> bool {
        self.min_value.is_none_or(|min| value >= min) && self.max_value.is_none_or(|max| value <= max)
    }
}

/// Lookup of indicator definitions by code.
#[derive(Debug, Clone, Default)]
pub struct IndicatorCatalog {
    definitions: BTreeMap<String, IndicatorDefinition>,
}

impl IndicatorCatalog {
    pub fn new(definitions: impl IntoIterator<Item = IndicatorDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.code.clone(), d))
                .collect(),
        }
    }

    /// Build the catalog from `[indicator.<code>]` sections.
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, CamelsError> {
        let mut definitions = Vec::new();
        for section in config.sections() {
            let Some(code) = section.strip_prefix(INDICATOR_SECTION_PREFIX) else {
                continue;
            };
            definitions.push(parse_definition(config, &section, code)?);
        }
        if definitions.is_empty() {
            return Err(CamelsError::ConfigMissing {
                section: "indicator.*".into(),
                key: "pillar".into(),
            });
        }
        Ok(Self::new(definitions))
    }

    pub fn get(&self, code: &str) -> Option<&IndicatorDefinition> {
        self.definitions.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.definitions.contains_key(code)
    }

    /// Definitions ordered by code.
    pub fn definitions(&self) -> impl Iterator<Item = &IndicatorDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn parse_definition(
    config: &dyn ConfigPort,
    section: &str,
    code: &str,
) -> Result<IndicatorDefinition, CamelsError> {
    let invalid = |key: &str, reason: String| CamelsError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason,
    };
    let required = |key: &str| {
        config
            .get_string(section, key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CamelsError::ConfigMissing {
                section: section.to_string(),
                key: key.to_string(),
            })
    };

    if code.trim().is_empty() {
        return Err(invalid("code", "indicator code must not be empty".into()));
    }

    let pillar = required("pillar")?
        .parse::<Pillar>()
        .map_err(|e| invalid("pillar", e))?;
    let unit = required("unit")?.trim().to_string();
    let polarity = match config.get_string(section, "polarity") {
        Some(raw) => raw.parse::<Polarity>().map_err(|e| invalid("polarity", e))?,
        None => Polarity::HigherIsBetter,
    };
    let name = config
        .get_string(section, "name")
        .map(|n| n.trim().to_string())
        .unwrap_or_else(|| code.to_string());

    let mut definition = IndicatorDefinition::new(code, &name, pillar, &unit, polarity);
    if let Some(raw) = config.get_string(section, "conversions") {
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (from_unit, factor) = pair
                .split_once(':')
                .ok_or_else(|| invalid("conversions", format!("expected unit:factor, got '{pair}'")))?;
            let factor: f64 = factor
                .trim()
                .parse()
                .map_err(|_| invalid("conversions", format!("invalid factor in '{pair}'")))?;
            if !factor.is_finite() || factor == 0.0 {
                return Err(invalid(
                    "conversions",
                    format!("factor for '{}' must be finite and non-zero", from_unit.trim()),
                ));
            }
            definition = definition.with_conversion(from_unit.trim(), factor);
        }
    }

    let min_value = optional_float(config, section, "min_value")?;
    let max_value = optional_float(config, section, "max_value")?;
    if let (Some(min), Some(max)) = (min_value, max_value) {
        if min > max {
            return Err(invalid("min_value", "min_value must not exceed max_value".into()));
        }
    }
    Ok(definition.with_range(min_value, max_value))
}

fn optional_float(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<f64>, CamelsError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| CamelsError::ConfigInvalid {
                section: section.to_string(),
                key: key.to_string(),
                reason: format!("'{raw}' is not a number"),
            }),
    }
}
