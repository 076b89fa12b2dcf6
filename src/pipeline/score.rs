//! Score stage.
//!
//! The scoring configuration is loaded, validated and pinned before any bank
//! task is scheduled, so a defective configuration writes no Score Record.

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::audit::RunStamp;
use crate::domain::error::CamelsError;
use crate::domain::observation::ObservationId;
use crate::domain::quarter::Quarter;
use crate::domain::reference::IndicatorCatalog;
use crate::domain::scoring::{score_bank, CoverageRule, ScoreRecord, STAGE};
use crate::domain::scoring_config::ScoringConfig;
use crate::pipeline::context::RunContext;
use crate::pipeline::runtime::{TaskGuard, TaskRuntime};
use crate::pipeline::stage::{settle_bank_outcomes, Stage, StageReport};
use crate::ports::store_port::IndicatorStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub enum ScoringConfigSource {
    File(PathBuf),
    Loaded(ScoringConfig),
}

impl ScoringConfigSource {
    pub fn load(&self, catalog: &IndicatorCatalog) -> Result<ScoringConfig, CamelsError> {
        match self {
            ScoringConfigSource::Loaded(config) => Ok(config.clone()),
            ScoringConfigSource::File(path) => {
                let adapter =
                    FileConfigAdapter::from_file(path).map_err(|e| CamelsError::ConfigParse {
                        file: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                ScoringConfig::from_config(&adapter, catalog)
            }
        }
    }
}

pub struct ScoreStage {
    config: ScoringConfigSource,
}

impl ScoreStage {
    pub fn new(config: ScoringConfigSource) -> Self {
        Self { config }
    }
}

/// Score one bank and append the record with its log entries. Returns
/// `None` when the bank has no history to score.
///
/// Each indicator score is traced to the source document of the observation
/// it was computed from.
pub fn score_and_store(
    store: &dyn IndicatorStore,
    catalog: &IndicatorCatalog,
    config: &ScoringConfig,
    rule: CoverageRule,
    bank_id: &str,
    period: Option<Quarter>,
    stamp: &RunStamp,
    guard: &TaskGuard,
) -> Result<Option<ScoreRecord>, CamelsError> {
    let history = store.history_for_bank(bank_id)?;
    let latest = history.values().flatten().map(|e| e.quarter).max();
    let Some(period) = period.or(latest) else {
        return Ok(None);
    };

    let mut outcome = score_bank(bank_id, period, &history, catalog, config, rule, stamp);
    let sources: HashMap<ObservationId, String> = store
        .observations_for_bank(bank_id)?
        .into_iter()
        .map(|obs| (obs.id, obs.source_ref))
        .collect();
    for score in &mut outcome.record.indicators {
        score.source_ref = score.observation_id.and_then(|id| sources.get(&id).cloned());
    }
    guard.ensure_active()?;
    store.append_score(&outcome.record)?;
    if !outcome.log.is_empty() {
        store.append_log(&outcome.log)?;
    }
    Ok(Some(outcome.record))
}

impl Stage for ScoreStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn execute(&self, ctx: &RunContext, runtime: &TaskRuntime) -> Result<StageReport, CamelsError> {
        let config = Arc::new(self.config.load(&ctx.catalog)?);
        ctx.store.pin_scoring_config(&config)?;
        log::info!(
            "scoring with config {} ({})",
            config.version,
            &config.fingerprint()[..12]
        );

        let banks: Vec<String> = match ctx.normalized_banks() {
            Some(committed) => committed.into_iter().collect(),
            None => ctx.store.banks()?.into_iter().map(|b| b.bank_id).collect(),
        };

        let store = Arc::clone(&ctx.store);
        let catalog = Arc::clone(&ctx.catalog);
        let rule = CoverageRule {
            window_quarters: ctx.settings.normalization.window_quarters,
            minimum_coverage: ctx.settings.normalization.minimum_coverage,
        };
        let stamp = ctx.stamp();
        let period = ctx.period;
        let outcomes = runtime.run_bank_tasks(STAGE, banks, &ctx.cancel, move |bank_id, guard| {
            score_and_store(
                store.as_ref(),
                &catalog,
                &config,
                rule,
                bank_id,
                period,
                &stamp,
                guard,
            )
        });

        let mut unscored = 0;
        let mut report = settle_bank_outcomes(ctx, STAGE, outcomes, |bank_id, record| match record {
            Some(r) => format!(
                "{} composite={} class={}",
                r.period,
                r.composite.map_or_else(|| "-".to_string(), |c| format!("{c:.3}")),
                r.classification
            ),
            None => {
                log::warn!("bank {bank_id} has no normalized history to score");
                unscored += 1;
                "no history".to_string()
            }
        })?;
        report.processed -= unscored;
        report.skipped += unscored;
        Ok(report)
    }
}
