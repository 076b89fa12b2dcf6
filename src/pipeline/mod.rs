//! Orchestration runtime: ingest -> normalize -> score -> export -> audit.

pub mod context;
pub mod ingest;
pub mod normalize;
pub mod publish;
pub mod runtime;
pub mod score;
pub mod stage;

use crate::domain::error::CamelsError;
use crate::ports::export_port::ExportPort;
use crate::ports::source_port::ObservationSource;
use std::sync::Arc;

/// The five standard stages in execution order.
pub fn standard_registry(
    source: Box<dyn ObservationSource + Send + Sync>,
    exporter: Arc<dyn ExportPort + Send + Sync>,
    scoring: score::ScoringConfigSource,
) -> Result<stage::StageRegistry, CamelsError> {
    let mut registry = stage::StageRegistry::new();
    registry.register(Box::new(ingest::IngestStage::new(source)))?;
    registry.register(Box::new(normalize::NormalizeStage))?;
    registry.register(Box::new(score::ScoreStage::new(scoring)))?;
    registry.register(Box::new(publish::ExportStage::new(Arc::clone(&exporter))))?;
    registry.register(Box::new(publish::AuditStage::new(exporter)))?;
    Ok(registry)
}
