//! Normalize stage: one isolated task per bank.

use crate::domain::audit::{LogEntry, RunStamp};
use crate::domain::error::CamelsError;
use crate::domain::normalization::{latest_quarter, normalize_series, NormalizationParams, STAGE};
use crate::domain::observation::RawObservation;
use crate::domain::quarter::Quarter;
use crate::domain::reference::IndicatorCatalog;
use crate::pipeline::context::RunContext;
use crate::pipeline::runtime::{TaskGuard, TaskRuntime};
use crate::pipeline::stage::{settle_bank_outcomes, Stage, StageReport};
use crate::ports::store_port::IndicatorStore;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct NormalizeStage;

/// What one bank task committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankNormalization {
    pub as_of: Option<Quarter>,
    pub committed: usize,
    pub failed: usize,
}

/// Normalize every catalog indicator the bank has observations for and
/// commit each series. A unit or period error fails only its own
/// (bank, indicator) batch.
pub fn normalize_bank(
    store: &dyn IndicatorStore,
    catalog: &IndicatorCatalog,
    bank_id: &str,
    period: Option<Quarter>,
    params: &NormalizationParams,
    stamp: &RunStamp,
    guard: &TaskGuard,
) -> Result<BankNormalization, CamelsError> {
    let observations = store.observations_for_bank(bank_id)?;
    let as_of = match period.or_else(|| latest_quarter(&observations)) {
        Some(q) => q,
        None => {
            log::info!("bank {bank_id} has no observations to normalize");
            return Ok(BankNormalization::default());
        }
    };

    let mut by_indicator: BTreeMap<&str, Vec<RawObservation>> = BTreeMap::new();
    for obs in &observations {
        by_indicator
            .entry(obs.indicator.as_str())
            .or_default()
            .push(obs.clone());
    }

    let mut result = BankNormalization {
        as_of: Some(as_of),
        ..Default::default()
    };
    for definition in catalog.definitions() {
        let Some(series_obs) = by_indicator.get(definition.code.as_str()) else {
            continue;
        };
        match normalize_series(bank_id, definition, series_obs, as_of, params, stamp) {
            Ok(series) => {
                guard.ensure_active()?;
                store.replace_history(bank_id, &definition.code, &series)?;
                log::debug!(
                    "{bank_id}/{}: {} entries, {} decisions, coverage {}",
                    definition.code,
                    series.entries.len(),
                    series.log.len(),
                    series.coverage.status.as_str()
                );
                result.committed += 1;
            }
            Err(err @ (CamelsError::UnitConversion { .. } | CamelsError::MalformedPeriod { .. })) => {
                log::warn!("{bank_id}/{}: {err}", definition.code);
                guard.ensure_active()?;
                store.append_log(&[LogEntry::from_error(
                    stamp,
                    STAGE,
                    bank_id,
                    Some(&definition.code),
                    &err,
                )])?;
                result.failed += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(result)
}

impl Stage for NormalizeStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn execute(&self, ctx: &RunContext, runtime: &TaskRuntime) -> Result<StageReport, CamelsError> {
        let banks: Vec<String> = ctx.store.banks()?.into_iter().map(|b| b.bank_id).collect();
        ctx.begin_normalization();

        let store = Arc::clone(&ctx.store);
        let catalog = Arc::clone(&ctx.catalog);
        let params = ctx.settings.normalization.clone();
        let stamp = ctx.stamp();
        let period = ctx.period;
        let outcomes = runtime.run_bank_tasks(STAGE, banks, &ctx.cancel, move |bank_id, guard| {
            normalize_bank(store.as_ref(), &catalog, bank_id, period, &params, &stamp, guard)
        });

        settle_bank_outcomes(ctx, STAGE, outcomes, |bank_id, done| {
            ctx.mark_normalized(bank_id);
            let as_of = done.as_of.map_or_else(|| "-".to_string(), |q| q.to_string());
            format!(
                "as_of={as_of} committed={} failed={}",
                done.committed, done.failed
            )
        })
    }
}
