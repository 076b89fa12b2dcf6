//! Engine settings, read once at process start.
//!
//! Every component receives the settings it needs explicitly; nothing in the
//! engine looks at the environment.

use crate::domain::error::CamelsError;
use crate::domain::normalization::NormalizationParams;
use crate::domain::robust_stats::OutlierMethod;
use crate::ports::config_port::ConfigPort;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct PathSettings {
    pub database: PathBuf,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub catalog: PathBuf,
    pub banks: PathBuf,
    pub scoring_config: PathBuf,
    pub observations: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            database: PathBuf::from("camels.sqlite"),
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("artifacts"),
            catalog: PathBuf::from("config/catalog.ini"),
            banks: PathBuf::from("data/reference/banks.csv"),
            scoring_config: PathBuf::from("config/camels_thresholds.ini"),
            observations: PathBuf::from("data/observations.csv"),
        }
    }
}

impl PathSettings {
    /// Anchor relative paths at `base` (usually the settings file's directory).
    pub fn resolved_against(&self, base: &Path) -> Self {
        let anchor = |p: &PathBuf| {
            if p.is_absolute() || p.as_os_str() == ":memory:" {
                p.clone()
            } else {
                base.join(p)
            }
        };
        Self {
            database: anchor(&self.database),
            data_dir: anchor(&self.data_dir),
            output_dir: anchor(&self.output_dir),
            catalog: anchor(&self.catalog),
            banks: anchor(&self.banks),
            scoring_config: anchor(&self.scoring_config),
            observations: anchor(&self.observations),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub parallelism: usize,
    pub task_timeout_secs: u64,
    pub pool_size: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            task_timeout_secs: 300,
            pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineSettings {
    pub paths: PathSettings,
    pub normalization: NormalizationParams,
    pub runtime: RuntimeSettings,
    pub log_level: String,
}

impl EngineSettings {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, CamelsError> {
        let defaults = PathSettings::default();
        let path = |key: &str, fallback: &PathBuf| {
            config
                .get_string("paths", key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| PathBuf::from(v.trim()))
                .unwrap_or_else(|| fallback.clone())
        };
        let paths = PathSettings {
            database: path("database", &defaults.database),
            data_dir: path("data_dir", &defaults.data_dir),
            output_dir: path("output_dir", &defaults.output_dir),
            catalog: path("catalog", &defaults.catalog),
            banks: path("banks", &defaults.banks),
            scoring_config: path("scoring_config", &defaults.scoring_config),
            observations: path("observations", &defaults.observations),
        };

        let normalization = read_normalization(config)?;
        let runtime = read_runtime(config)?;
        let log_level = config
            .get_string("logging", "level")
            .map(|l| l.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "info".to_string());
        validate_log_level(&log_level)?;

        Ok(Self {
            paths,
            normalization,
            runtime,
            log_level,
        })
    }

    pub fn with_paths_resolved(mut self, base: &Path) -> Self {
        self.paths = self.paths.resolved_against(base);
        self
    }
}

fn invalid(section: &str, key: &str, reason: &str) -> CamelsError {
    CamelsError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn positive_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<i64, CamelsError> {
    let value = config.get_int(section, key, default);
    if value <= 0 {
        return Err(invalid(section, key, &format!("{key} must be positive")));
    }
    Ok(value)
}

fn read_normalization(config: &dyn ConfigPort) -> Result<NormalizationParams, CamelsError> {
    let defaults = NormalizationParams::default();
    let section = "normalization";

    let window_quarters =
        positive_int(config, section, "window_quarters", defaults.window_quarters as i64)? as usize;
    let minimum_coverage =
        positive_int(config, section, "minimum_coverage", defaults.minimum_coverage as i64)? as usize;
    if minimum_coverage > window_quarters {
        return Err(invalid(
            section,
            "minimum_coverage",
            "minimum_coverage must not exceed window_quarters",
        ));
    }

    let outlier_method = match config.get_string(section, "outlier_method") {
        Some(raw) => raw
            .parse::<OutlierMethod>()
            .map_err(|e| invalid(section, "outlier_method", &e))?,
        None => defaults.outlier_method,
    };

    let outlier_threshold = config.get_double(section, "outlier_threshold", defaults.outlier_threshold);
    if !outlier_threshold.is_finite() || outlier_threshold <= 0.0 {
        return Err(invalid(
            section,
            "outlier_threshold",
            "outlier_threshold must be positive",
        ));
    }

    let outlier_lookback =
        positive_int(config, section, "outlier_lookback", defaults.outlier_lookback as i64)? as usize;
    let outlier_min_history = positive_int(
        config,
        section,
        "outlier_min_history",
        defaults.outlier_min_history as i64,
    )? as usize;
    if outlier_min_history > outlier_lookback {
        return Err(invalid(
            section,
            "outlier_min_history",
            "outlier_min_history must not exceed outlier_lookback",
        ));
    }

    Ok(NormalizationParams {
        window_quarters,
        minimum_coverage,
        outlier_method,
        outlier_threshold,
        outlier_lookback,
        outlier_min_history,
        strict: config.get_bool(section, "strict", defaults.strict),
    })
}

fn read_runtime(config: &dyn ConfigPort) -> Result<RuntimeSettings, CamelsError> {
    let defaults = RuntimeSettings::default();
    let parallelism = positive_int(config, "runtime", "parallelism", defaults.parallelism as i64)?;
    let timeout = positive_int(
        config,
        "runtime",
        "task_timeout_secs",
        defaults.task_timeout_secs as i64,
    )?;
    let pool_size = positive_int(config, "runtime", "pool_size", defaults.pool_size as i64)?;
    Ok(RuntimeSettings {
        parallelism: parallelism as usize,
        task_timeout_secs: timeout as u64,
        pool_size: u32::try_from(pool_size)
            .map_err(|_| invalid("runtime", "pool_size", "pool_size is too large"))?,
    })
}

fn validate_log_level(level: &str) -> Result<(), CamelsError> {
    match level {
        "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
        _ => Err(invalid(
            "logging",
            "level",
            "level must be one of off, error, warn, info, debug, trace",
        )),
    }
}
