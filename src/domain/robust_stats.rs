//! Robust location/dispersion statistics for outlier screening.
//!
//! median(x), MAD(x) = median(|x_i - median(x)|)
//! robust z = 0.6745 * |x - median| / MAD
//! When MAD is 0, the mean absolute deviation is used with factor 0.7979
//! (1 / 1.2533), matching the modified z-score convention.

use std::fmt;
use std::str::FromStr;

const MAD_SCALE: f64 = 0.6745;
const MEAN_AD_SCALE: f64 = 1.2533;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierMethod {
    RobustZ,
    Iqr,
}

impl OutlierMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutlierMethod::RobustZ => "robust_z",
            OutlierMethod::Iqr => "iqr",
        }
    }
}

impl fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutlierMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "robust_z" | "mad" | "zscore" | "z_score" => Ok(OutlierMethod::RobustZ),
            "iqr" => Ok(OutlierMethod::Iqr),
            other => Err(format!("unknown outlier method '{other}'")),
        }
    }
}

/// Result of screening one candidate value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierCheck {
    pub flagged: bool,
    /// Robust z-score, or distance beyond the nearest fence in IQR units.
    pub score: f64,
    pub center: f64,
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(f64::total_cmp);
    v
}

pub fn median(values: &[f64]) -> Option<f64> {
    let v = sorted(values);
    let n = v.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(v[n / 2])
    } else {
        Some((v[n / 2 - 1] + v[n / 2]) / 2.0)
    }
}

/// Median absolute deviation around the median.
pub fn mad(values: &[f64]) -> Option<f64> {
    let m = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|x| (x - m).abs()).collect();
    median(&deviations)
}

/// Mean absolute deviation around the median.
pub fn mean_abs_deviation(values: &[f64]) -> Option<f64> {
    let m = median(values)?;
    let v = sorted(values);
    Some(v.iter().map(|x| (x - m).abs()).sum::<f64>() / v.len() as f64)
}

/// Linearly interpolated quantile, `p` in [0, 1].
pub fn quantile(values: &[f64], p: f64) -> Option<f64> {
    let v = sorted(values);
    if v.is_empty() || !(0.0..=1.0).contains(&p) {
        return None;
    }
    let pos = p * (v.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(v[lower] + (v[upper] - v[lower]) * frac)
}

/// Robust z-score of `x` against `reference`. `None` when the reference has
/// no dispersion at all.
pub fn robust_z(x: f64, reference: &[f64]) -> Option<f64> {
    let m = median(reference)?;
    let mad = mad(reference)?;
    if mad > 0.0 {
        return Some(MAD_SCALE * (x - m).abs() / mad);
    }
    let mean_ad = mean_abs_deviation(reference)?;
    if mean_ad > 0.0 {
        Some((x - m).abs() / (MEAN_AD_SCALE * mean_ad))
    } else {
        None
    }
}

/// Screen `x` against `reference` with the given method and threshold.
pub fn check_outlier(
    x: f64,
    reference: &[f64],
    method: OutlierMethod,
    threshold: f64,
) -> Option<OutlierCheck> {
    let center = median(reference)?;
    match method {
        OutlierMethod::RobustZ => {
            let score = robust_z(x, reference)?;
            Some(OutlierCheck {
                flagged: score > threshold,
                score,
                center,
            })
        }
        OutlierMethod::Iqr => {
            let q1 = quantile(reference, 0.25)?;
            let q3 = quantile(reference, 0.75)?;
            let iqr = q3 - q1;
            if iqr <= 0.0 {
                return None;
            }
            let lower = q1 - threshold * iqr;
            let upper = q3 + threshold * iqr;
            let beyond = if x < lower {
                (lower - x) / iqr
            } else if x > upper {
                (x - upper) / iqr
            } else {
                0.0
            };
            Some(OutlierCheck {
                flagged: x < lower || x > upper,
                score: beyond,
                center,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn mad_of_known_sample() {
        // deviations from median 3: 2,1,0,1,6 -> median 1
        assert_eq!(mad(&[1.0, 2.0, 3.0, 4.0, 9.0]), Some(1.0));
    }

    #[test]
    fn quantile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_relative_eq!(quantile(&v, 0.25).unwrap(), 2.0);
        assert_relative_eq!(quantile(&v, 0.5).unwrap(), 3.0);
        assert_relative_eq!(quantile(&[1.0, 2.0], 0.5).unwrap(), 1.5);
        assert!(quantile(&v, 1.5).is_none());
    }

    #[test]
    fn robust_z_flags_spike() {
        let reference = [4.0, 4.1, 4.2, 4.0, 4.3, 4.1];
        let check = check_outlier(9.0, &reference, OutlierMethod::RobustZ, 3.0).unwrap();
        assert!(check.flagged);
        let check = check_outlier(4.2, &reference, OutlierMethod::RobustZ, 3.0).unwrap();
        assert!(!check.flagged);
    }

    #[test]
    fn zero_mad_falls_back_to_mean_deviation() {
        // median 1, MAD 0, mean abs deviation 0.6
        let reference = [1.0, 1.0, 1.0, 2.0, 3.0];
        let z = robust_z(2.0, &reference).unwrap();
        assert_relative_eq!(z, 1.0 / (1.2533 * 0.6), epsilon = 1e-9);
    }

    #[test]
    fn constant_reference_is_not_screened() {
        assert!(robust_z(5.0, &[1.0, 1.0, 1.0, 1.0]).is_none());
        assert!(check_outlier(5.0, &[1.0, 1.0, 1.0, 1.0], OutlierMethod::Iqr, 1.5).is_none());
    }

    #[test]
    fn iqr_fences() {
        let reference = [1.0, 2.0, 3.0, 4.0, 5.0];
        // q1 2, q3 4, iqr 2, fences [-1, 7] at k = 1.5
        assert!(!check_outlier(7.0, &reference, OutlierMethod::Iqr, 1.5).unwrap().flagged);
        let far = check_outlier(9.0, &reference, OutlierMethod::Iqr, 1.5).unwrap();
        assert!(far.flagged);
        assert_relative_eq!(far.score, 1.0);
    }

    #[test]
    fn method_names() {
        assert_eq!("IQR".parse::<OutlierMethod>().unwrap(), OutlierMethod::Iqr);
        assert_eq!("robust_z".parse::<OutlierMethod>().unwrap(), OutlierMethod::RobustZ);
        assert!("zz".parse::<OutlierMethod>().is_err());
    }
}
