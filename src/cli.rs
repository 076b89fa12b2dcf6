//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::error::CamelsError;
use crate::domain::quarter::Quarter;
use crate::domain::reference::IndicatorCatalog;
use crate::domain::scoring::{Rating, ScoreRecord};
use crate::domain::scoring_config::ScoringConfig;
use crate::domain::settings::EngineSettings;
use crate::pipeline::context::RunContext;
use crate::pipeline::runtime::TaskRuntime;
use crate::pipeline::score::ScoringConfigSource;
use crate::pipeline::stage::{StageRegistry, StageRunner};
use crate::pipeline::standard_registry;
use crate::ports::store_port::IndicatorStore;

#[derive(Parser, Debug)]
#[command(name = "camels", about = "CAMELS normalization and scoring engine")]
pub struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = "camels.ini")]
    pub config: PathBuf,
    /// Quarter to process, e.g. 2024Q1 (default: each bank's latest quarter)
    #[arg(short, long, global = true)]
    pub period: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run stages in order (all stages when none are named)
    Run { stages: Vec<String> },
    /// List registered stages
    Stages,
    /// Load banks, catalog and observation rows into the store
    Ingest,
    /// Rebuild quarter-aligned history for every bank
    Normalize,
    /// Score every bank against the scoring configuration
    Score,
    /// Write portfolio and indicator CSVs for a new scoring run
    Export,
    /// Write the audit trail and normalization log of a new run
    Audit,
    /// Validate settings, indicator catalog and scoring configuration
    Validate,
    /// Show normalized history for one bank and indicator
    History {
        #[arg(long)]
        bank: String,
        #[arg(long)]
        indicator: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Show the latest score record of a bank for a quarter
    ScoreOf {
        #[arg(long)]
        bank: String,
        /// Quarter of the score record, e.g. 2024Q1
        #[arg(value_name = "PERIOD")]
        quarter: String,
    },
    /// Show the normalization/audit log of a bank or a run
    Log {
        #[arg(long, conflicts_with = "run", required_unless_present = "run")]
        bank: Option<String>,
        #[arg(long)]
        run: Option<String>,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// Dispatch a parsed command line.
pub fn execute(cli: Cli) -> Result<(), CamelsError> {
    match cli.command {
        Command::Stages => {
            let settings = load_settings(&cli.config)?;
            for name in build_registry(&settings)?.names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Run { stages } => run_stages(&cli.config, cli.period.as_deref(), &stages),
        Command::Ingest => run_stages(&cli.config, cli.period.as_deref(), &["ingest".into()]),
        Command::Normalize => {
            run_stages(&cli.config, cli.period.as_deref(), &["normalize".into()])
        }
        Command::Score => run_stages(&cli.config, cli.period.as_deref(), &["score".into()]),
        Command::Export => run_stages(
            &cli.config,
            cli.period.as_deref(),
            &["score".into(), "export".into()],
        ),
        Command::Audit => run_stages(&cli.config, cli.period.as_deref(), &["audit".into()]),
        Command::Validate => run_validate(&cli.config),
        Command::History {
            bank,
            indicator,
            from,
            to,
        } => run_history(&cli.config, &bank, &indicator, from.as_deref(), to.as_deref()),
        Command::ScoreOf { bank, quarter } => run_score_of(&cli.config, &bank, &quarter),
        Command::Log { bank, run } => run_log(&cli.config, bank.as_deref(), run.as_deref()),
    }
}

/// Read the settings file and anchor its relative paths at its directory.
pub fn load_settings(path: &Path) -> Result<EngineSettings, CamelsError> {
    let adapter = FileConfigAdapter::from_file(path).map_err(|e| CamelsError::ConfigParse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(EngineSettings::from_config(&adapter)?.with_paths_resolved(base))
}

pub fn load_catalog(path: &Path) -> Result<IndicatorCatalog, CamelsError> {
    let adapter = FileConfigAdapter::from_file(path).map_err(|e| CamelsError::ConfigParse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;
    IndicatorCatalog::from_config(&adapter)
}

/// Initialise logging once; `RUST_LOG` overrides the configured level.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::new()
        .parse_filters(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

fn parse_period(raw: Option<&str>) -> Result<Option<Quarter>, CamelsError> {
    raw.map(Quarter::parse).transpose()
}

#[cfg(feature = "sqlite")]
pub fn open_store(settings: &EngineSettings) -> Result<Arc<dyn IndicatorStore>, CamelsError> {
    use crate::adapters::sqlite_adapter::SqliteStore;

    let store = SqliteStore::from_settings(settings)?;
    store.initialize_schema()?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
pub fn open_store(_settings: &EngineSettings) -> Result<Arc<dyn IndicatorStore>, CamelsError> {
    Err(CamelsError::Database {
        reason: "built without the sqlite feature".into(),
    })
}

/// The standard stages wired to the CSV files and scoring config named in
/// `settings`. Nothing is read until a stage runs.
pub fn build_registry(settings: &EngineSettings) -> Result<StageRegistry, CamelsError> {
    let csv = || {
        CsvAdapter::new(
            settings.paths.banks.clone(),
            settings.paths.observations.clone(),
            settings.paths.output_dir.clone(),
        )
    };
    standard_registry(
        Box::new(csv()),
        Arc::new(csv()),
        ScoringConfigSource::File(settings.paths.scoring_config.clone()),
    )
}

fn run_stages(config: &Path, period: Option<&str>, stages: &[String]) -> Result<(), CamelsError> {
    let settings = load_settings(config)?;
    init_logging(&settings.log_level);
    let period = parse_period(period)?;
    let catalog = Arc::new(load_catalog(&settings.paths.catalog)?);
    let store = open_store(&settings)?;

    let registry = build_registry(&settings)?;
    let runtime = TaskRuntime::new(&settings.runtime)?;
    let ctx = RunContext::new(Arc::new(settings), store, catalog, period);
    runtime.cancel_on_ctrl_c(ctx.cancel.clone());

    eprintln!("run {}", ctx.run_id);
    let reports = StageRunner::new(&registry, &runtime).run(&ctx, stages)?;
    for (name, report) in reports {
        eprintln!("  {name:<10} {report}");
    }
    Ok(())
}

fn run_validate(config: &Path) -> Result<(), CamelsError> {
    let settings = load_settings(config)?;
    init_logging(&settings.log_level);
    eprintln!("settings: ok ({})", config.display());

    let catalog = load_catalog(&settings.paths.catalog)?;
    eprintln!(
        "catalog: ok, {} indicators ({})",
        catalog.len(),
        settings.paths.catalog.display()
    );

    let scoring = ScoringConfigSource::File(settings.paths.scoring_config.clone());
    let config: ScoringConfig = scoring.load(&catalog)?;
    eprintln!(
        "scoring config: ok, version {} with {} indicators, fingerprint {}",
        config.version,
        config.indicators.len(),
        config.fingerprint()
    );
    for definition in catalog.definitions() {
        if config.threshold(&definition.code).is_none() {
            log::warn!("indicator {} has no thresholds and will be unrated", definition.code);
        }
    }
    Ok(())
}

fn open_for_query(config: &Path) -> Result<Arc<dyn IndicatorStore>, CamelsError> {
    let settings = load_settings(config)?;
    init_logging(&settings.log_level);
    open_store(&settings)
}

fn run_history(
    config: &Path,
    bank: &str,
    indicator: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<(), CamelsError> {
    let store = open_for_query(config)?;
    let entries = store.history(bank, indicator, parse_period(from)?, parse_period(to)?)?;
    if entries.is_empty() {
        eprintln!("no history for {bank}/{indicator}");
    }
    println!("{:<8} {:>14} {:<20} provenance", "period", "value", "status");
    for e in &entries {
        let value = e.value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
        let discarded: Vec<String> = e.provenance.discarded.iter().map(i64::to_string).collect();
        let canonical = e
            .provenance
            .canonical
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "{:<8} {:>14} {:<20} {canonical} [{}]",
            e.quarter.to_string(),
            value,
            e.status.as_str(),
            discarded.join(",")
        );
    }
    if let Some(coverage) = store.coverage(bank, indicator)? {
        println!(
            "coverage at {}: {}/{} present, {} consecutive, {}",
            coverage.as_of,
            coverage.present,
            coverage.window_quarters,
            coverage.consecutive,
            coverage.status.as_str()
        );
    }
    Ok(())
}

fn print_score(record: &ScoreRecord) {
    let fmt = |v: Option<f64>| v.map_or_else(|| "unrated".to_string(), |s| format!("{s:.3}"));
    println!(
        "{} {} run {} (config {}, scored {})",
        record.bank_id, record.period, record.run_id, record.config_version, record.scored_at
    );
    println!(
        "composite: {} [{}] weight {}/{}",
        fmt(record.composite),
        record.classification,
        record.available_weight,
        record.expected_weight
    );
    for p in &record.pillars {
        println!(
            "  {:<14} {:>8} [{}]  weight {:<5} missing: {}",
            p.pillar.as_str(),
            fmt(p.score),
            p.classification,
            p.weight,
            p.missing.join(", ")
        );
    }
    for s in &record.indicators {
        let rating = match s.rating {
            Rating::Rated { score, class } => format!("{score} {class}"),
            Rating::Unrated(reason) => reason.as_str().to_string(),
        };
        let lineage = match (s.observation_id, s.source_ref.as_deref()) {
            (Some(id), Some(source)) => format!("  obs {id} {source}"),
            (Some(id), None) => format!("  obs {id}"),
            _ => String::new(),
        };
        println!(
            "    {:<20} {:>12} {rating}{}{lineage}",
            s.indicator,
            s.value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}")),
            if s.outlier { " (outlier)" } else { "" }
        );
    }
    if record.insufficient_coverage {
        println!("  note: insufficient_coverage");
    }
}

fn run_score_of(config: &Path, bank: &str, quarter: &str) -> Result<(), CamelsError> {
    let period = Quarter::parse(quarter)?;
    let store = open_for_query(config)?;
    match store.latest_score(bank, period)? {
        Some(record) => print_score(&record),
        None => eprintln!("no score for {bank} at {period}"),
    }
    Ok(())
}

fn run_log(config: &Path, bank: Option<&str>, run: Option<&str>) -> Result<(), CamelsError> {
    let store = open_for_query(config)?;
    let entries = match (bank, run) {
        (Some(bank), _) => store.log_for_bank(bank)?,
        (None, Some(run)) => store.log_for_run(run)?,
        (None, None) => Vec::new(),
    };
    for e in &entries {
        println!(
            "{} {:<9} {:<8} {:<16} {:<8} {:<22} {}",
            e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            e.stage,
            e.bank_id,
            e.indicator.as_deref().unwrap_or("-"),
            e.period.as_deref().unwrap_or("-"),
            e.decision.as_str(),
            e.detail
        );
    }
    eprintln!("{} entries", entries.len());
    Ok(())
}
