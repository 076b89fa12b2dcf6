//! Stage trait, registry and runner.

use crate::domain::audit::{AuditEvent, AuditStatus, LogEntry};
use crate::domain::error::CamelsError;
use crate::pipeline::context::RunContext;
use crate::pipeline::runtime::{TaskOutcome, TaskRuntime};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Counts reported by one stage execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} failed={} skipped={}",
            self.processed, self.failed, self.skipped
        )
    }
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, ctx: &RunContext, runtime: &TaskRuntime) -> Result<StageReport, CamelsError>;
}

/// Stages in execution order, addressable by name.
#[derive(Default)]
pub struct StageRegistry {
    stages: Vec<Box<dyn Stage>>,
    index: HashMap<&'static str, usize>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Box<dyn Stage>) -> Result<(), CamelsError> {
        let name = stage.name();
        if self.index.contains_key(name) {
            return Err(CamelsError::DuplicateStage {
                name: name.to_string(),
            });
        }
        self.index.insert(name, self.stages.len());
        self.stages.push(stage);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Stage> {
        self.index.get(name).map(|&i| self.stages[i].as_ref())
    }

    /// Validate requested names; duplicates are dropped, request order kept.
    /// An empty request selects every stage in registration order.
    pub fn resolve(&self, requested: &[String]) -> Result<Vec<&'static str>, CamelsError> {
        if requested.is_empty() {
            return Ok(self.names());
        }
        let unknown: Vec<&str> = requested
            .iter()
            .map(String::as_str)
            .filter(|name| !self.index.contains_key(*name))
            .collect();
        if !unknown.is_empty() {
            return Err(CamelsError::UnknownStage {
                names: unknown.join(", "),
            });
        }
        let mut resolved: Vec<&'static str> = Vec::new();
        for name in requested {
            let stage_name = self.stages[self.index[name.as_str()]].name();
            if !resolved.contains(&stage_name) {
                resolved.push(stage_name);
            }
        }
        Ok(resolved)
    }
}

pub struct StageRunner<'a> {
    registry: &'a StageRegistry,
    runtime: &'a TaskRuntime,
}

impl<'a> StageRunner<'a> {
    pub fn new(registry: &'a StageRegistry, runtime: &'a TaskRuntime) -> Self {
        Self { registry, runtime }
    }

    /// Run the requested stages in order. A stage error stops the run; the
    /// stages before it stay committed.
    pub fn run(
        &self,
        ctx: &RunContext,
        requested: &[String],
    ) -> Result<Vec<(&'static str, StageReport)>, CamelsError> {
        let names = self.registry.resolve(requested)?;
        log::info!("run {} starting stages: {}", ctx.run_id, names.join(" -> "));

        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let Some(stage) = self.registry.get(name) else {
                continue;
            };
            if ctx.cancel.is_cancelled() {
                log::warn!("run {} cancelled before stage {name}", ctx.run_id);
                ctx.audit(AuditEvent::stage(
                    &ctx.run_id,
                    name,
                    AuditStatus::Cancelled,
                    "run cancelled",
                ))?;
                return Err(CamelsError::Cancelled);
            }

            log::info!("stage {name} started");
            ctx.audit(AuditEvent::stage(&ctx.run_id, name, AuditStatus::Started, ""))?;
            let started = Instant::now();
            match stage.execute(ctx, self.runtime) {
                Ok(report) => {
                    log::info!(
                        "stage {name} completed in {:.2?} ({report})",
                        started.elapsed()
                    );
                    ctx.audit(AuditEvent::stage(
                        &ctx.run_id,
                        name,
                        AuditStatus::Completed,
                        report.to_string(),
                    ))?;
                    reports.push((name, report));
                }
                Err(err) => {
                    log::error!("stage {name} failed after {:.2?}: {err}", started.elapsed());
                    ctx.audit(AuditEvent::stage(
                        &ctx.run_id,
                        name,
                        AuditStatus::Failed,
                        format!("{}: {err}", err.kind()),
                    ))?;
                    return Err(err);
                }
            }
        }
        Ok(reports)
    }
}

/// Audit each bank outcome and count it. Completed values are handed to
/// `on_completed`; everything else is written to the log as well.
pub(crate) fn settle_bank_outcomes<T>(
    ctx: &RunContext,
    stage: &str,
    outcomes: Vec<(String, TaskOutcome<T>)>,
    mut on_completed: impl FnMut(&str, T) -> String,
) -> Result<StageReport, CamelsError> {
    let stamp = ctx.stamp();
    let mut report = StageReport::default();
    for (bank_id, outcome) in outcomes {
        let (status, detail, failure) = match outcome {
            TaskOutcome::Completed(value) => {
                report.processed += 1;
                (AuditStatus::Completed, on_completed(&bank_id, value), None)
            }
            TaskOutcome::Failed(err) => {
                report.failed += 1;
                log::warn!("{stage} failed for bank {bank_id}: {err}");
                (AuditStatus::Failed, format!("{}: {err}", err.kind()), Some(err))
            }
            TaskOutcome::TimedOut => {
                report.failed += 1;
                let err = CamelsError::StageTimeout {
                    bank_id: bank_id.clone(),
                    stage: stage.to_string(),
                    seconds: ctx.settings.runtime.task_timeout_secs,
                };
                log::warn!("{err}");
                (AuditStatus::TimedOut, err.to_string(), Some(err))
            }
            TaskOutcome::Cancelled => {
                report.skipped += 1;
                (AuditStatus::Cancelled, "not started".to_string(), Some(CamelsError::Cancelled))
            }
        };
        if let Some(err) = failure {
            ctx.store
                .append_log(&[LogEntry::from_error(&stamp, stage, &bank_id, None, &err)])?;
        }
        ctx.audit(AuditEvent::bank(&ctx.run_id, stage, &bank_id, status, detail))?;
    }
    Ok(report)
}
