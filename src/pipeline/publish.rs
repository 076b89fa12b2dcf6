//! Export and audit stages. Both only read from the store.

use crate::domain::error::CamelsError;
use crate::pipeline::context::RunContext;
use crate::pipeline::runtime::TaskRuntime;
use crate::pipeline::stage::{Stage, StageReport};
use crate::ports::export_port::ExportPort;
use std::sync::Arc;

pub const EXPORT_STAGE: &str = "export";
pub const AUDIT_STAGE: &str = "audit";

pub struct ExportStage {
    exporter: Arc<dyn ExportPort + Send + Sync>,
}

impl ExportStage {
    pub fn new(exporter: Arc<dyn ExportPort + Send + Sync>) -> Self {
        Self { exporter }
    }
}

impl Stage for ExportStage {
    fn name(&self) -> &'static str {
        EXPORT_STAGE
    }

    fn execute(&self, ctx: &RunContext, _runtime: &TaskRuntime) -> Result<StageReport, CamelsError> {
        let records = ctx.store.scores_for_run(&ctx.run_id)?;
        if records.is_empty() {
            log::warn!("run {} produced no score records to export", ctx.run_id);
        }
        let banks = ctx.store.banks()?;
        let paths = self.exporter.write_scores(&ctx.run_id, &banks, &records)?;
        for path in &paths {
            log::info!("exported {}", path.display());
        }
        Ok(StageReport {
            processed: records.len(),
            ..Default::default()
        })
    }
}

pub struct AuditStage {
    exporter: Arc<dyn ExportPort + Send + Sync>,
}

impl AuditStage {
    pub fn new(exporter: Arc<dyn ExportPort + Send + Sync>) -> Self {
        Self { exporter }
    }
}

impl Stage for AuditStage {
    fn name(&self) -> &'static str {
        AUDIT_STAGE
    }

    fn execute(&self, ctx: &RunContext, _runtime: &TaskRuntime) -> Result<StageReport, CamelsError> {
        let events = ctx.store.audit_for_run(&ctx.run_id)?;
        let decisions = ctx.store.log_for_run(&ctx.run_id)?;
        let paths = self.exporter.write_audit(&ctx.run_id, &events, &decisions)?;
        for path in &paths {
            log::info!("wrote audit file {}", path.display());
        }
        Ok(StageReport {
            processed: events.len() + decisions.len(),
            ..Default::default()
        })
    }
}
