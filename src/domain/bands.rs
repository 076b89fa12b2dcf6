//! Threshold bands mapping a numeric value to a traffic-light class.
//!
//! A band table is written as `|`-separated intervals, each followed by a
//! class and (for indicator tables) a sub-score:
//!
//! ```text
//! [0,2) red 1 | [2,3.5) yellow 3 | [3.5,5] green 5
//! ```
//!
//! `[`/`]` close an end, `(`/`)` open it; `inf` and `-inf` are accepted.

use crate::domain::reference::Polarity;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrafficLight {
    Red,
    Yellow,
    Green,
}

impl TrafficLight {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficLight::Red => "red",
            TrafficLight::Yellow => "yellow",
            TrafficLight::Green => "green",
        }
    }
}

impl fmt::Display for TrafficLight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrafficLight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "red" => Ok(TrafficLight::Red),
            "yellow" | "amber" => Ok(TrafficLight::Yellow),
            "green" => Ok(TrafficLight::Green),
            other => Err(format!("unknown class '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub lower: f64,
    pub lower_inclusive: bool,
    pub upper: f64,
    pub upper_inclusive: bool,
    pub class: TrafficLight,
    pub score: Option<f64>,
}

impl Band {
    pub fn contains(&self, value: f64) -> bool {
        let above = if self.lower_inclusive {
            value >= self.lower
        } else {
            value > self.lower
        };
        let below = if self.upper_inclusive {
            value <= self.upper
        } else {
            value < self.upper
        };
        above && below
    }

    /// Distance from `value` to the nearest edge; 0 inside the band.
    pub fn distance(&self, value: f64) -> f64 {
        if self.contains(value) {
            0.0
        } else if value <= self.lower {
            self.lower - value
        } else {
            value - self.upper
        }
    }

    fn rank(&self) -> (f64, TrafficLight) {
        (self.score.unwrap_or(0.0), self.class)
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{},{}{} {}",
            if self.lower_inclusive { '[' } else { '(' },
            self.lower,
            self.upper,
            if self.upper_inclusive { ']' } else { ')' },
            self.class
        )?;
        if let Some(score) = self.score {
            write!(f, " {score}")?;
        }
        Ok(())
    }
}

fn parse_bound(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid band bound '{}'", raw.trim()))?;
    if value.is_nan() {
        return Err("band bound must be a number".into());
    }
    Ok(value)
}

impl FromStr for Band {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let lower_inclusive = match text.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(format!("band '{text}' must start with '[' or '('")),
        };
        let close = text
            .find([']', ')'])
            .ok_or_else(|| format!("band '{text}' has no closing bracket"))?;
        let upper_inclusive = text[close..].starts_with(']');
        let (lo, hi) = text[1..close]
            .split_once(',')
            .ok_or_else(|| format!("band '{text}' needs lower,upper"))?;

        let mut rest = text[close + 1..].split_whitespace();
        let class = rest
            .next()
            .ok_or_else(|| format!("band '{text}' has no class"))?
            .parse::<TrafficLight>()?;
        let score = match rest.next() {
            Some(raw) => {
                let score: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid sub-score '{raw}' in band '{text}'"))?;
                if !score.is_finite() {
                    return Err(format!("sub-score in band '{text}' must be finite"));
                }
                Some(score)
            }
            None => None,
        };
        if rest.next().is_some() {
            return Err(format!("unexpected trailing text in band '{text}'"));
        }

        Ok(Band {
            lower: parse_bound(lo)?,
            lower_inclusive,
            upper: parse_bound(hi)?,
            upper_inclusive,
            class,
            score,
        })
    }
}

/// Ordered, non-overlapping bands.
#[derive(Debug, Clone, PartialEq)]
pub struct BandTable {
    bands: Vec<Band>,
}

impl BandTable {
    /// Parse and validate a table. `polarity` fixes the direction in which
    /// classes and sub-scores must improve as the value rises.
    pub fn parse(raw: &str, polarity: Polarity, require_scores: bool) -> Result<Self, String> {
        let bands = raw
            .split('|')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::parse::<Band>)
            .collect::<Result<Vec<_>, _>>()?;
        let table = Self { bands };
        table.validate(polarity, require_scores)?;
        Ok(table)
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn validate(&self, polarity: Polarity, require_scores: bool) -> Result<(), String> {
        if self.bands.is_empty() {
            return Err("band table is empty".into());
        }
        for band in &self.bands {
            if require_scores && band.score.is_none() {
                return Err(format!("band '{band}' has no sub-score"));
            }
            match band.lower.partial_cmp(&band.upper) {
                Some(Ordering::Less) => {}
                Some(Ordering::Equal) if band.lower_inclusive && band.upper_inclusive => {}
                _ => return Err(format!("band '{band}' is empty or reversed")),
            }
        }
        for pair in self.bands.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let overlaps = a.upper > b.lower
                || (a.upper == b.lower && a.upper_inclusive && b.lower_inclusive);
            if overlaps {
                return Err(format!("bands '{a}' and '{b}' overlap or are out of order"));
            }
            let improves = match polarity {
                Polarity::HigherIsBetter => b.rank_cmp(a),
                Polarity::LowerIsBetter => a.rank_cmp(b),
            };
            if !improves {
                return Err(format!(
                    "bands '{a}' and '{b}' are not monotonic for {}",
                    polarity.as_str()
                ));
            }
        }
        Ok(())
    }

    /// The band for `value`: the containing band, else the nearest one.
    /// Equidistant neighbours resolve to the lower sub-score.
    pub fn classify(&self, value: f64) -> Option<&Band> {
        if let Some(band) = self.bands.iter().find(|b| b.contains(value)) {
            return Some(band);
        }
        self.bands.iter().min_by(|a, b| {
            a.distance(value)
                .total_cmp(&b.distance(value))
                .then_with(|| a.rank().0.total_cmp(&b.rank().0))
                .then_with(|| a.class.cmp(&b.class))
        })
    }

    pub fn lowest_score(&self) -> Option<f64> {
        self.bands.iter().filter_map(|b| b.score).reduce(f64::min)
    }

    pub fn highest_score(&self) -> Option<f64> {
        self.bands.iter().filter_map(|b| b.score).reduce(f64::max)
    }
}

impl Band {
    /// Whether `self` is at least as good as `other` in both class and sub-score.
    fn rank_cmp(&self, other: &Band) -> bool {
        let score_ok = match (self.score, other.score) {
            (Some(a), Some(b)) => a >= b,
            _ => true,
        };
        score_ok && self.class >= other.class
    }
}

impl fmt::Display for BandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.bands.iter().map(Band::to_string).collect();
        f.write_str(&rendered.join(" | "))
    }
}
