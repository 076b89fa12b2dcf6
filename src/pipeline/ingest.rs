//! Ingest stage: reference data sync and observation append.

use crate::domain::error::CamelsError;
use crate::pipeline::context::RunContext;
use crate::pipeline::runtime::TaskRuntime;
use crate::pipeline::stage::{Stage, StageReport};
use crate::ports::source_port::ObservationSource;
use crate::ports::store_port::INGEST_STAGE;

/// A complete seed registry lists at least this many banks.
const EXPECTED_MIN_BANKS: usize = 50;

fn is_partial_registry(banks: usize) -> bool {
    banks < EXPECTED_MIN_BANKS
}

pub struct IngestStage {
    source: Box<dyn ObservationSource + Send + Sync>,
}

impl IngestStage {
    pub fn new(source: Box<dyn ObservationSource + Send + Sync>) -> Self {
        Self { source }
    }
}

impl Stage for IngestStage {
    fn name(&self) -> &'static str {
        INGEST_STAGE
    }

    fn execute(&self, ctx: &RunContext, _runtime: &TaskRuntime) -> Result<StageReport, CamelsError> {
        let banks = self.source.load_banks()?;
        if is_partial_registry(banks.len()) {
            log::warn!(
                "seed bank registry contains {} entries; expected at least {EXPECTED_MIN_BANKS}",
                banks.len()
            );
        }
        let changed = ctx.store.seed_banks(&banks)?;
        let indicators = ctx.store.sync_indicators(&ctx.catalog)?;
        log::info!("reference data: {changed} bank rows changed, {indicators} indicators synced");

        let rows = self.source.load_observations()?;
        let total = rows.len();
        let report = ctx.store.append_observations(&ctx.stamp(), rows)?;
        log::info!(
            "ingested {} of {total} observation rows ({} rejected)",
            report.accepted.len(),
            report.rejected.len()
        );
        Ok(StageReport {
            processed: report.accepted.len(),
            failed: report.rejected.len(),
            skipped: 0,
        })
    }
}
