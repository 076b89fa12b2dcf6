//! Domain error types.

/// Top-level error type for camels.
#[derive(Debug, thiserror::Error)]
pub enum CamelsError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("reference data conflict for bank {bank_id}: {field} cannot change once seeded")]
    ReferenceConflict { bank_id: String, field: String },

    #[error("invalid observation: {field} {reason}")]
    InvalidObservation { field: String, reason: String },

    #[error("no conversion from unit '{unit}' for {bank_id}/{indicator}")]
    UnitConversion {
        bank_id: String,
        indicator: String,
        unit: String,
    },

    #[error("malformed period identifier '{value}'")]
    MalformedPeriod { value: String },

    #[error("no threshold configuration for indicator {indicator}")]
    MissingThresholdConfig { indicator: String },

    #[error("invalid scoring configuration: {reason}")]
    InvalidScoringConfig { reason: String },

    #[error("{stage} task for bank {bank_id} exceeded {seconds}s")]
    StageTimeout {
        bank_id: String,
        stage: String,
        seconds: u64,
    },

    #[error("{stage} task for bank {bank_id} failed: {reason}")]
    TaskFailed {
        bank_id: String,
        stage: String,
        reason: String,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("unknown stage(s): {names}")]
    UnknownStage { names: String },

    #[error("stage '{name}' is already registered")]
    DuplicateStage { name: String },

    #[error("csv error: {reason}")]
    Csv { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CamelsError {
    /// Stable snake_case kind used when the error is written to the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            CamelsError::Database { .. } | CamelsError::DatabaseQuery { .. } => "database",
            CamelsError::ConfigParse { .. }
            | CamelsError::ConfigMissing { .. }
            | CamelsError::ConfigInvalid { .. } => "config",
            CamelsError::ReferenceConflict { .. } => "reference_conflict",
            CamelsError::InvalidObservation { .. } => "invalid_observation",
            CamelsError::UnitConversion { .. } => "unit_conversion_error",
            CamelsError::MalformedPeriod { .. } => "malformed_period",
            CamelsError::MissingThresholdConfig { .. } => "missing_threshold_config",
            CamelsError::InvalidScoringConfig { .. } => "invalid_scoring_config",
            CamelsError::StageTimeout { .. } => "stage_timeout",
            CamelsError::TaskFailed { .. } => "task_failed",
            CamelsError::Cancelled => "cancelled",
            CamelsError::UnknownStage { .. } | CamelsError::DuplicateStage { .. } => "stage",
            CamelsError::Csv { .. } => "csv",
            CamelsError::Io(_) => "io",
        }
    }
}

impl From<csv::Error> for CamelsError {
    fn from(err: csv::Error) -> Self {
        CamelsError::Csv {
            reason: err.to_string(),
        }
    }
}

impl From<&CamelsError> for std::process::ExitCode {
    fn from(err: &CamelsError) -> Self {
        let code: u8 = match err {
            CamelsError::Io(_) | CamelsError::Csv { .. } | CamelsError::TaskFailed { .. } => 1,
            CamelsError::ConfigParse { .. }
            | CamelsError::ConfigMissing { .. }
            | CamelsError::ConfigInvalid { .. }
            | CamelsError::UnknownStage { .. }
            | CamelsError::DuplicateStage { .. } => 2,
            CamelsError::Database { .. }
            | CamelsError::DatabaseQuery { .. }
            | CamelsError::ReferenceConflict { .. } => 3,
            CamelsError::InvalidScoringConfig { .. }
            | CamelsError::MissingThresholdConfig { .. } => 4,
            CamelsError::InvalidObservation { .. }
            | CamelsError::UnitConversion { .. }
            | CamelsError::MalformedPeriod { .. } => 5,
            CamelsError::StageTimeout { .. } | CamelsError::Cancelled => 6,
        };
        std::process::ExitCode::from(code)
    }
}
