//! Calendar quarters.
//!
//! Every history entry and score is keyed by a `Quarter`. Raw periods arrive
//! from filings in several spellings (`2024Q1`, `Q1-2024`, `2024-03-31`, ...)
//! and are folded into the canonical `YYYYQn` label here.

use crate::domain::error::CamelsError;
use chrono::{Datelike, NaiveDate};
use std::fmt;
use std::str::FromStr;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quarter {
    year: i32,
    quarter: u8,
}

impl Quarter {
    pub fn new(year: i32, quarter: u8) -> Option<Self> {
        if (1..=4).contains(&quarter) && (1000..=9999).contains(&year) {
            Some(Self { year, quarter })
        } else {
            None
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            quarter: (date.month0() / 3 + 1) as u8,
        }
    }

    /// Parse a raw period identifier as reported by a filing.
    pub fn parse(raw: &str) -> Result<Self, CamelsError> {
        let malformed = || CamelsError::MalformedPeriod {
            value: raw.to_string(),
        };
        let text = raw.trim();
        if text.is_empty() {
            return Err(malformed());
        }

        let upper = text.to_ascii_uppercase();
        if let Some(q_pos) = upper.find('Q') {
            let quarter = upper[q_pos + 1..]
                .chars()
                .next()
                .and_then(|c| c.to_digit(10))
                .ok_or_else(malformed)? as u8;
            let mut rest = String::with_capacity(upper.len());
            rest.push_str(&upper[..q_pos]);
            rest.push_str(&upper[q_pos + 2..]);
            let year_digits: String = rest
                .chars()
                .filter(|c| !matches!(c, '-' | '/' | ' ' | '_' | '.'))
                .collect();
            if year_digits.len() != 4 || !year_digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(malformed());
            }
            let year: i32 = year_digits.parse().map_err(|_| malformed())?;
            return Self::new(year, quarter).ok_or_else(malformed);
        }

        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
            .map(Self::from_date)
            .ok_or_else(malformed)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn quarter(&self) -> u8 {
        self.quarter
    }

    fn ordinal(&self) -> i64 {
        self.year as i64 * 4 + (self.quarter as i64 - 1)
    }

    fn from_ordinal(ordinal: i64) -> Self {
        Self {
            year: ordinal.div_euclid(4) as i32,
            quarter: (ordinal.rem_euclid(4) + 1) as u8,
        }
    }

    /// Shift by `n` quarters (negative moves backwards).
    pub fn offset(&self, n: i64) -> Self {
        Self::from_ordinal(self.ordinal() + n)
    }

    pub fn next(&self) -> Self {
        self.offset(1)
    }

    pub fn prev(&self) -> Self {
        self.offset(-1)
    }

    /// Number of quarters from `self` to `other` (positive when `other` is later).
    pub fn distance_to(&self, other: Quarter) -> i64 {
        other.ordinal() - self.ordinal()
    }

    /// First quarter of a trailing window of `size` quarters ending at `self`.
    pub fn window_start(&self, size: usize) -> Self {
        self.offset(-(size.max(1) as i64 - 1))
    }

    pub fn start_date(&self) -> NaiveDate {
        let month = (self.quarter as u32 - 1) * 3 + 1;
        NaiveDate::from_ymd_opt(self.year, month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn end_date(&self) -> NaiveDate {
        self.next()
            .start_date()
            .pred_opt()
            .unwrap_or(NaiveDate::MAX)
    }

    /// Inclusive range of quarters from `self` to `end`; empty if `end < self`.
    pub fn through(&self, end: Quarter) -> Vec<Quarter> {
        let span = self.distance_to(end);
        if span < 0 {
            return Vec::new();
        }
        (0..=span).map(|i| self.offset(i)).collect()
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Q{}", self.year, self.quarter)
    }
}

impl FromStr for Quarter {
    type Err = CamelsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quarter::parse(s)
    }
}
