//! Stage orchestration against an in-memory SQLite store.
#![cfg(feature = "sqlite")]

mod common;

use camels::adapters::sqlite_adapter::SqliteStore;
use camels::domain::audit::{AuditStatus, Decision};
use camels::domain::bands::TrafficLight;
use camels::domain::error::CamelsError;
use camels::domain::history::HistoryStatus;
use camels::domain::reference::Pillar;
use camels::domain::scoring::{Classification, Rating, UnratedReason};
use camels::domain::settings::EngineSettings;
use camels::pipeline::context::RunContext;
use camels::pipeline::runtime::TaskRuntime;
use camels::pipeline::score::{ScoreStage, ScoringConfigSource};
use camels::pipeline::stage::{StageRegistry, StageRunner};
use camels::pipeline::standard_registry;
use camels::ports::store_port::IndicatorStore;
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn store() -> Arc<dyn IndicatorStore> {
    let store = SqliteStore::in_memory().unwrap();
    store.initialize_schema().unwrap();
    Arc::new(store)
}

fn runtime() -> TaskRuntime {
    TaskRuntime::with_limits(2, Duration::from_secs(30)).unwrap()
}

fn context(store: &Arc<dyn IndicatorStore>) -> RunContext {
    RunContext::new(
        Arc::new(EngineSettings::default()),
        Arc::clone(store),
        Arc::new(catalog()),
        Some(q(2024, 1)),
    )
}

/// Three banks: B1 complete with a restated NPL figure, B2 with one
/// unconvertible NPL row, B3 with one unreadable row. Plus a row for an
/// unknown bank.
fn portfolio() -> MemorySource {
    let mut rows = Vec::new();
    rows.extend(eight_quarters("B1", "NPL_ratio", [1.5, 1.6, 1.7, 1.6, 1.5, 1.6, 1.7, 1.6]));
    rows.extend(eight_quarters("B1", "provision_coverage", [120.0; 8]));
    rows.extend(eight_quarters("B1", "cet1_rwa", [10.0; 8]));
    rows.extend(eight_quarters("B1", "roe", [12.0; 8]));
    let mut restated = row("B1", "NPL_ratio", "2024Q1", "1.65", "percent");
    restated.ingested_at = Some("2024-05-03T08:00:00Z".into());
    rows.push(restated);

    rows.extend(eight_quarters("B2", "cet1_rwa", [14.0; 8]));
    rows.push(row("B2", "NPL_ratio", "2024Q1", "2.1", "EUR"));

    rows.extend(eight_quarters("B3", "roe", [18.0; 8]));
    rows.push(row("B3", "roe", "2023Q3", "n/a", "percent"));
    rows.push(row("ZZ", "roe", "2024Q1", "4.0", "percent"));

    MemorySource {
        banks: vec![bank("B1"), bank("B2"), bank("B3")],
        rows,
    }
}

fn registry(exporter: &Arc<MemoryExporter>) -> StageRegistry {
    standard_registry(
        Box::new(portfolio()),
        exporter.clone(),
        ScoringConfigSource::Loaded(scoring_config(SCORING_INI).unwrap()),
    )
    .unwrap()
}

mod full_run {
    use super::*;

    #[test]
    fn all_stages_run_in_order() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let ctx = context(&store);

        let reports = StageRunner::new(&registry, &runtime).run(&ctx, &[]).unwrap();
        let names: Vec<&str> = reports.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["ingest", "normalize", "score", "export", "audit"]);

        let ingest = reports[0].1;
        assert_eq!(ingest.processed, 50);
        assert_eq!(ingest.failed, 2);
        assert_eq!(reports[1].1.processed, 3);
        assert_eq!(reports[2].1.processed, 3);
        assert_eq!(exporter.scores.lock().unwrap().len(), 3);
        assert!(!exporter.log.lock().unwrap().is_empty());
    }

    #[test]
    fn restated_figure_wins_and_is_scored() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let ctx = context(&store);
        StageRunner::new(&registry, &runtime).run(&ctx, &[]).unwrap();

        let history = store
            .history("B1", "NPL_ratio", Some(q(2024, 1)), Some(q(2024, 1)))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, Some(1.65));
        assert_eq!(history[0].status, HistoryStatus::DuplicateResolved);
        assert_eq!(history[0].provenance.discarded.len(), 1);

        let coverage = store.coverage("B1", "NPL_ratio").unwrap().unwrap();
        assert_eq!(coverage.present, 8);
        assert!(coverage.is_sufficient());

        let record = store.latest_score("B1", q(2024, 1)).unwrap().unwrap();
        assert_eq!(record.run_id, ctx.run_id);
        assert_eq!(record.composite, Some(4.0));
        assert_eq!(record.classification, Classification::Light(TrafficLight::Green));
        assert_eq!(record.config_version, "2024.1");

        let npl = record
            .indicators
            .iter()
            .find(|s| s.indicator == "NPL_ratio")
            .unwrap();
        assert_eq!(npl.observation_id, history[0].provenance.canonical);
        assert_eq!(npl.source_ref.as_deref(), Some("filings/B1/2024Q1.pdf"));
        let aq = record
            .pillars
            .iter()
            .find(|p| p.pillar == Pillar::AssetQuality)
            .unwrap();
        assert_eq!(aq.classification, Classification::Light(TrafficLight::Green));

        let resolved: Vec<_> = store
            .log_for_bank("B1")
            .unwrap()
            .into_iter()
            .filter(|e| e.decision == Decision::DuplicateResolved)
            .collect();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].related_observation_id, history[0].provenance.canonical);
    }

    #[test]
    fn unit_failure_is_isolated_to_its_indicator() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let ctx = context(&store);
        StageRunner::new(&registry, &runtime).run(&ctx, &[]).unwrap();

        let failures: Vec<_> = store
            .log_for_bank("B2")
            .unwrap()
            .into_iter()
            .filter(|e| e.decision == Decision::UnitConversionFailed)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].indicator.as_deref(), Some("NPL_ratio"));

        assert!(store.history("B2", "NPL_ratio", None, None).unwrap().is_empty());
        assert!(!store.history("B2", "cet1_rwa", None, None).unwrap().is_empty());

        let record = store.latest_score("B2", q(2024, 1)).unwrap().unwrap();
        let npl = record
            .indicators
            .iter()
            .find(|s| s.indicator == "NPL_ratio")
            .unwrap();
        assert_eq!(npl.rating, Rating::Unrated(UnratedReason::CoverageInsufficient));
        assert_eq!(npl.coverage_present, 0);
        assert!(record.insufficient_coverage);
        assert_eq!(record.composite, Some(5.0));

        let insufficient: Vec<_> = store
            .log_for_bank("B2")
            .unwrap()
            .into_iter()
            .filter(|e| e.stage == "score" && e.decision == Decision::CoverageInsufficient)
            .filter_map(|e| e.indicator)
            .collect();
        assert!(insufficient.contains(&"NPL_ratio".to_string()));
    }

    #[test]
    fn rejected_rows_are_logged_for_the_run() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let ctx = context(&store);
        StageRunner::new(&registry, &runtime).run(&ctx, &[]).unwrap();

        let rejected: Vec<_> = store
            .log_for_run(&ctx.run_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.decision == Decision::ObservationRejected)
            .collect();
        assert_eq!(rejected.len(), 2);
        let banks: Vec<&str> = rejected.iter().map(|e| e.bank_id.as_str()).collect();
        assert!(banks.contains(&"B3"));
        assert!(banks.contains(&"ZZ"));
    }

    #[test]
    fn audit_trail_records_stage_and_bank_events() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let ctx = context(&store);
        StageRunner::new(&registry, &runtime).run(&ctx, &[]).unwrap();

        let events = store.audit_for_run(&ctx.run_id).unwrap();
        for stage in ["ingest", "normalize", "score", "export", "audit"] {
            assert!(
                events
                    .iter()
                    .any(|e| e.stage == stage && e.bank_id.is_none() && e.status == AuditStatus::Started),
                "{stage} start not audited"
            );
        }
        let scored: Vec<_> = events
            .iter()
            .filter(|e| e.stage == "score" && e.bank_id.is_some())
            .collect();
        assert_eq!(scored.len(), 3);
        assert!(scored.iter().all(|e| e.status == AuditStatus::Completed));
    }

    #[test]
    fn renormalizing_replaces_history() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let first = context(&store);
        StageRunner::new(&registry, &runtime)
            .run(&first, &["ingest".into(), "normalize".into()])
            .unwrap();
        let before = store.history("B1", "roe", None, None).unwrap();

        let second = context(&store);
        StageRunner::new(&registry, &runtime)
            .run(&second, &["normalize".into()])
            .unwrap();
        assert_eq!(store.history("B1", "roe", None, None).unwrap(), before);
    }
}

mod stage_selection {
    use super::*;

    #[test]
    fn only_banks_normalized_in_the_run_are_scored() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        StageRunner::new(&registry, &runtime)
            .run(&context(&store), &["ingest".into(), "normalize".into()])
            .unwrap();

        let ctx = context(&store);
        ctx.begin_normalization();
        ctx.mark_normalized("B3");
        StageRunner::new(&registry, &runtime)
            .run(&ctx, &["score".into()])
            .unwrap();

        let scored: Vec<String> = store
            .scores_for_run(&ctx.run_id)
            .unwrap()
            .into_iter()
            .map(|r| r.bank_id)
            .collect();
        assert_eq!(scored, ["B3"]);
    }

    #[test]
    fn score_alone_uses_every_bank_with_history() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        StageRunner::new(&registry, &runtime)
            .run(&context(&store), &["ingest".into(), "normalize".into()])
            .unwrap();

        let ctx = context(&store);
        let reports = StageRunner::new(&registry, &runtime)
            .run(&ctx, &["score".into()])
            .unwrap();
        assert_eq!(reports[0].1.processed, 3);
    }

    #[test]
    fn unknown_stage_is_rejected_before_anything_runs() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let ctx = context(&store);
        let err = StageRunner::new(&registry, &runtime)
            .run(&ctx, &["ingest".into(), "publish".into()])
            .unwrap_err();
        assert!(matches!(err, CamelsError::UnknownStage { ref names } if names == "publish"));
        assert!(store.banks().unwrap().is_empty());
        assert!(store.audit_for_run(&ctx.run_id).unwrap().is_empty());
    }

    #[test]
    fn cancelled_run_stops_before_next_stage() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = runtime();
        let ctx = context(&store);
        ctx.cancel.cancel();

        let err = StageRunner::new(&registry, &runtime).run(&ctx, &[]).unwrap_err();
        assert!(matches!(err, CamelsError::Cancelled));
        let events = store.audit_for_run(&ctx.run_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AuditStatus::Cancelled);
        assert_eq!(events[0].stage, "ingest");
    }
}

mod scoring_config_guard {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const OVERLAPPING: &str = "[scoring]
version = broken
composite_bands = [0,2) red | [2,3.5) yellow | [3.5,5] green

[indicator.NPL_ratio]
bands = [0,3) green 5 | [2,5) yellow 3 | [5,inf] red 1
";

    #[test]
    fn overlapping_bands_abort_before_any_score() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let runtime = runtime();
        StageRunner::new(&registry(&exporter), &runtime)
            .run(&context(&store), &["ingest".into(), "normalize".into()])
            .unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thresholds.ini");
        fs::write(&path, OVERLAPPING).unwrap();
        let mut broken = StageRegistry::new();
        broken
            .register(Box::new(ScoreStage::new(ScoringConfigSource::File(path))))
            .unwrap();

        let ctx = context(&store);
        let err = StageRunner::new(&broken, &runtime)
            .run(&ctx, &["score".into()])
            .unwrap_err();
        assert!(matches!(err, CamelsError::InvalidScoringConfig { .. }));
        assert!(store.scores_for_run(&ctx.run_id).unwrap().is_empty());
        assert!(store.latest_score("B1", q(2024, 1)).unwrap().is_none());

        let events = store.audit_for_run(&ctx.run_id).unwrap();
        assert!(events
            .iter()
            .any(|e| e.stage == "score" && e.status == AuditStatus::Failed));
    }

    #[test]
    fn version_cannot_be_reused_with_other_content() {
        let store = store();
        let pinned = scoring_config(SCORING_INI).unwrap();
        store.pin_scoring_config(&pinned).unwrap();
        store.pin_scoring_config(&pinned).unwrap();

        let reweighted = SCORING_INI.replace(
            "weight = 2\n\n[indicator.NPL",
            "weight = 3\n\n[indicator.NPL",
        );
        let altered = scoring_config(&reweighted).unwrap();
        assert_eq!(altered.version, pinned.version);
        assert_ne!(altered.fingerprint(), pinned.fingerprint());
        let err = store.pin_scoring_config(&altered).unwrap_err();
        assert!(matches!(err, CamelsError::InvalidScoringConfig { .. }));
    }

    #[test]
    fn catalog_is_synced_on_ingest() {
        let store = store();
        let exporter = Arc::new(MemoryExporter::default());
        let runtime = runtime();
        StageRunner::new(&registry(&exporter), &runtime)
            .run(&context(&store), &["ingest".into()])
            .unwrap();
        let mut codes = store.indicator_codes().unwrap();
        codes.sort();
        let mut expected: Vec<String> = catalog().definitions().map(|d| d.code.clone()).collect();
        expected.sort();
        assert_eq!(codes, expected);
    }
}

mod timeouts {
    use super::*;
    use camels::domain::audit::{AuditEvent, LogEntry};
    use camels::domain::history::{CoverageSummary, HistoryEntry};
    use camels::domain::normalization::NormalizedSeries;
    use camels::domain::observation::{NewObservation, ObservationId, RawObservation};
    use camels::domain::quarter::Quarter;
    use camels::domain::reference::{Bank, IndicatorCatalog};
    use camels::domain::scoring::{BankHistory, ScoreRecord};
    use camels::domain::scoring_config::ScoringConfig;
    use std::thread;

    /// Store whose reads of one bank's observations take `stall`.
    struct StallingStore {
        inner: Arc<dyn IndicatorStore>,
        slow_bank: &'static str,
        stall: Duration,
    }

    impl IndicatorStore for StallingStore {
        fn seed_banks(&self, banks: &[Bank]) -> Result<usize, CamelsError> {
            self.inner.seed_banks(banks)
        }

        fn sync_indicators(&self, catalog: &IndicatorCatalog) -> Result<usize, CamelsError> {
            self.inner.sync_indicators(catalog)
        }

        fn banks(&self) -> Result<Vec<Bank>, CamelsError> {
            self.inner.banks()
        }

        fn indicator_codes(&self) -> Result<Vec<String>, CamelsError> {
            self.inner.indicator_codes()
        }

        fn append_observation(&self, obs: &NewObservation) -> Result<ObservationId, CamelsError> {
            self.inner.append_observation(obs)
        }

        fn observations_for(
            &self,
            bank_id: &str,
            indicator: &str,
        ) -> Result<Vec<RawObservation>, CamelsError> {
            self.inner.observations_for(bank_id, indicator)
        }

        fn observations_for_bank(&self, bank_id: &str) -> Result<Vec<RawObservation>, CamelsError> {
            if bank_id == self.slow_bank {
                thread::sleep(self.stall);
            }
            self.inner.observations_for_bank(bank_id)
        }

        fn replace_history(
            &self,
            bank_id: &str,
            indicator: &str,
            series: &NormalizedSeries,
        ) -> Result<(), CamelsError> {
            self.inner.replace_history(bank_id, indicator, series)
        }

        fn history(
            &self,
            bank_id: &str,
            indicator: &str,
            from: Option<Quarter>,
            to: Option<Quarter>,
        ) -> Result<Vec<HistoryEntry>, CamelsError> {
            self.inner.history(bank_id, indicator, from, to)
        }

        fn history_for_bank(&self, bank_id: &str) -> Result<BankHistory, CamelsError> {
            self.inner.history_for_bank(bank_id)
        }

        fn coverage(
            &self,
            bank_id: &str,
            indicator: &str,
        ) -> Result<Option<CoverageSummary>, CamelsError> {
            self.inner.coverage(bank_id, indicator)
        }

        fn append_log(&self, entries: &[LogEntry]) -> Result<(), CamelsError> {
            self.inner.append_log(entries)
        }

        fn log_for_bank(&self, bank_id: &str) -> Result<Vec<LogEntry>, CamelsError> {
            self.inner.log_for_bank(bank_id)
        }

        fn log_for_run(&self, run_id: &str) -> Result<Vec<LogEntry>, CamelsError> {
            self.inner.log_for_run(run_id)
        }

        fn pin_scoring_config(&self, config: &ScoringConfig) -> Result<(), CamelsError> {
            self.inner.pin_scoring_config(config)
        }

        fn append_score(&self, record: &ScoreRecord) -> Result<i64, CamelsError> {
            self.inner.append_score(record)
        }

        fn latest_score(
            &self,
            bank_id: &str,
            period: Quarter,
        ) -> Result<Option<ScoreRecord>, CamelsError> {
            self.inner.latest_score(bank_id, period)
        }

        fn scores_for_run(&self, run_id: &str) -> Result<Vec<ScoreRecord>, CamelsError> {
            self.inner.scores_for_run(run_id)
        }

        fn record_audit(&self, event: &AuditEvent) -> Result<(), CamelsError> {
            self.inner.record_audit(event)
        }

        fn audit_for_run(&self, run_id: &str) -> Result<Vec<AuditEvent>, CamelsError> {
            self.inner.audit_for_run(run_id)
        }
    }

    #[test]
    fn slow_bank_times_out_without_stopping_its_siblings() {
        let inner = store();
        let slow: Arc<dyn IndicatorStore> = Arc::new(StallingStore {
            inner: Arc::clone(&inner),
            slow_bank: "B2",
            stall: Duration::from_millis(800),
        });
        let exporter = Arc::new(MemoryExporter::default());
        let registry = registry(&exporter);
        let runtime = TaskRuntime::with_limits(2, Duration::from_millis(200)).unwrap();
        let ctx = context(&slow);

        let reports = StageRunner::new(&registry, &runtime)
            .run(&ctx, &["ingest".into(), "normalize".into(), "score".into()])
            .unwrap();
        let normalize = reports[1].1;
        assert_eq!(normalize.processed, 2);
        assert_eq!(normalize.failed, 1);
        assert_eq!(reports[2].1.processed, 2);

        let timeouts: Vec<_> = inner
            .log_for_run(&ctx.run_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.decision == Decision::StageTimeout)
            .collect();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].bank_id, "B2");
        assert_eq!(timeouts[0].stage, "normalize");

        let events = inner.audit_for_run(&ctx.run_id).unwrap();
        assert!(events.iter().any(|e| e.stage == "normalize"
            && e.bank_id.as_deref() == Some("B2")
            && e.status == AuditStatus::TimedOut));

        let scored: Vec<String> = inner
            .scores_for_run(&ctx.run_id)
            .unwrap()
            .into_iter()
            .map(|r| r.bank_id)
            .collect();
        assert_eq!(scored, ["B1", "B3"]);

        // the abandoned task wakes up after the stall and must not commit
        thread::sleep(Duration::from_millis(1200));
        assert!(inner.history("B2", "cet1_rwa", None, None).unwrap().is_empty());
        assert!(!inner.history("B1", "cet1_rwa", None, None).unwrap().is_empty());
    }
}
