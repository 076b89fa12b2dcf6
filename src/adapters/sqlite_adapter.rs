//! SQLite Indicator Store.
//!
//! Timestamps are stored as RFC 3339 with microseconds, periods as `YYYYQn`
//! (which sorts chronologically), id lists as comma-separated text.

use crate::adapters::key_locks::KeyLocks;
use crate::domain::audit::{AuditEvent, AuditStatus, Decision, LogEntry};
use crate::domain::bands::TrafficLight;
use crate::domain::error::CamelsError;
use crate::domain::history::{
    CoverageStatus, CoverageSummary, HistoryEntry, HistoryStatus, Provenance,
};
use crate::domain::normalization::NormalizedSeries;
use crate::domain::observation::{NewObservation, ObservationId, RawObservation};
use crate::domain::quarter::Quarter;
use crate::domain::reference::{Bank, IndicatorCatalog, Pillar};
use crate::domain::scoring::{
    BankHistory, Classification, IndicatorScore, PillarScore, Rating, ScoreRecord, UnratedReason,
};
use crate::domain::scoring_config::ScoringConfig;
use crate::domain::settings::EngineSettings;
use crate::ports::store_port::IndicatorStore;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

const CONNECTION_PRAGMAS: &str =
    "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS banks (
    bank_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    country TEXT NOT NULL,
    regulator TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS indicators (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    pillar TEXT NOT NULL,
    unit TEXT NOT NULL,
    polarity TEXT NOT NULL,
    min_value REAL,
    max_value REAL
);
CREATE TABLE IF NOT EXISTS indicator_conversions (
    code TEXT NOT NULL REFERENCES indicators(code),
    unit TEXT NOT NULL,
    factor REAL NOT NULL,
    PRIMARY KEY (code, unit)
);
CREATE TABLE IF NOT EXISTS raw_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bank_id TEXT NOT NULL REFERENCES banks(bank_id),
    indicator TEXT NOT NULL REFERENCES indicators(code),
    period TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    source_ref TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    ingested_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_raw_observations_key ON raw_observations(bank_id, indicator);
CREATE TABLE IF NOT EXISTS indicator_history (
    bank_id TEXT NOT NULL REFERENCES banks(bank_id),
    indicator TEXT NOT NULL REFERENCES indicators(code),
    period TEXT NOT NULL,
    value REAL,
    status TEXT NOT NULL,
    canonical_observation_id INTEGER REFERENCES raw_observations(id),
    discarded_observation_ids TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (bank_id, indicator, period)
);
CREATE TABLE IF NOT EXISTS indicator_coverage (
    bank_id TEXT NOT NULL REFERENCES banks(bank_id),
    indicator TEXT NOT NULL REFERENCES indicators(code),
    as_of TEXT NOT NULL,
    window_quarters INTEGER NOT NULL,
    minimum_coverage INTEGER NOT NULL,
    present INTEGER NOT NULL,
    gaps INTEGER NOT NULL,
    consecutive INTEGER NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (bank_id, indicator)
);
CREATE TABLE IF NOT EXISTS normalization_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    bank_id TEXT NOT NULL,
    indicator TEXT,
    period TEXT,
    decision TEXT NOT NULL,
    observation_id INTEGER,
    related_observation_id INTEGER,
    detail TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_normalization_log_bank ON normalization_log(bank_id);
CREATE INDEX IF NOT EXISTS idx_normalization_log_run ON normalization_log(run_id);
CREATE TABLE IF NOT EXISTS scoring_configs (
    version TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    canonical TEXT NOT NULL,
    pinned_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bank_id TEXT NOT NULL REFERENCES banks(bank_id),
    period TEXT NOT NULL,
    run_id TEXT NOT NULL,
    scored_at TEXT NOT NULL,
    config_version TEXT NOT NULL REFERENCES scoring_configs(version),
    config_fingerprint TEXT NOT NULL,
    composite REAL,
    classification TEXT NOT NULL,
    expected_weight REAL NOT NULL,
    available_weight REAL NOT NULL,
    missing_pillars TEXT NOT NULL DEFAULT '',
    insufficient_coverage INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scores_bank_period ON scores(bank_id, period);
CREATE INDEX IF NOT EXISTS idx_scores_run ON scores(run_id);
CREATE TABLE IF NOT EXISTS pillar_scores (
    score_id INTEGER NOT NULL REFERENCES scores(id),
    pillar TEXT NOT NULL,
    weight REAL NOT NULL,
    score REAL,
    classification TEXT NOT NULL,
    expected_weight REAL NOT NULL,
    available_weight REAL NOT NULL,
    missing TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (score_id, pillar)
);
CREATE TABLE IF NOT EXISTS indicator_scores (
    score_id INTEGER NOT NULL REFERENCES scores(id),
    indicator TEXT NOT NULL,
    pillar TEXT NOT NULL,
    weight REAL NOT NULL,
    value REAL,
    sub_score REAL,
    class TEXT,
    unrated_reason TEXT,
    outlier INTEGER NOT NULL,
    coverage_present INTEGER NOT NULL,
    observation_id INTEGER REFERENCES raw_observations(id),
    source_ref TEXT,
    PRIMARY KEY (score_id, indicator)
);
CREATE TABLE IF NOT EXISTS audit_trail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    bank_id TEXT,
    status TEXT NOT NULL,
    detail TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_trail_run ON audit_trail(run_id);";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    locks: KeyLocks,
}

fn pool_err(e: r2d2::Error) -> CamelsError {
    CamelsError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> CamelsError {
    CamelsError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn corrupt(what: &str, raw: &str) -> CamelsError {
    CamelsError::DatabaseQuery {
        reason: format!("stored {what} '{raw}' is invalid"),
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, CamelsError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", raw))
}

fn parse_quarter(raw: &str) -> Result<Quarter, CamelsError> {
    Quarter::parse(raw).map_err(|_| corrupt("period", raw))
}

fn parse_with<T: std::str::FromStr>(what: &str, raw: &str) -> Result<T, CamelsError> {
    raw.parse::<T>().map_err(|_| corrupt(what, raw))
}

fn ids_to_text(ids: &[ObservationId]) -> String {
    ids.iter()
        .map(ObservationId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn text_to_ids(raw: &str) -> Result<Vec<ObservationId>, CamelsError> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| parse_with::<ObservationId>("observation id", s))
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

struct HistoryRow {
    bank_id: String,
    indicator: String,
    period: String,
    value: Option<f64>,
    status: String,
    canonical: Option<i64>,
    discarded: String,
}

impl HistoryRow {
    fn into_entry(self) -> Result<HistoryEntry, CamelsError> {
        Ok(HistoryEntry {
            quarter: parse_quarter(&self.period)?,
            status: parse_with("history status", &self.status)?,
            provenance: Provenance {
                canonical: self.canonical,
                discarded: text_to_ids(&self.discarded)?,
            },
            bank_id: self.bank_id,
            indicator: self.indicator,
            value: self.value,
        })
    }
}

const HISTORY_COLUMNS: &str = "bank_id, indicator, period, value, status, \
     canonical_observation_id, discarded_observation_ids";

fn history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        bank_id: row.get(0)?,
        indicator: row.get(1)?,
        period: row.get(2)?,
        value: row.get(3)?,
        status: row.get(4)?,
        canonical: row.get(5)?,
        discarded: row.get(6)?,
    })
}

struct LogRow {
    run_id: String,
    stage: String,
    bank_id: String,
    indicator: Option<String>,
    period: Option<String>,
    decision: String,
    observation_id: Option<i64>,
    related_observation_id: Option<i64>,
    detail: String,
    recorded_at: String,
}

const LOG_COLUMNS: &str = "run_id, stage, bank_id, indicator, period, decision, \
     observation_id, related_observation_id, detail, recorded_at";

fn log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRow> {
    Ok(LogRow {
        run_id: row.get(0)?,
        stage: row.get(1)?,
        bank_id: row.get(2)?,
        indicator: row.get(3)?,
        period: row.get(4)?,
        decision: row.get(5)?,
        observation_id: row.get(6)?,
        related_observation_id: row.get(7)?,
        detail: row.get(8)?,
        recorded_at: row.get(9)?,
    })
}

impl LogRow {
    fn into_entry(self) -> Result<LogEntry, CamelsError> {
        Ok(LogEntry {
            decision: parse_with::<Decision>("decision", &self.decision)?,
            recorded_at: parse_ts(&self.recorded_at)?,
            run_id: self.run_id,
            stage: self.stage,
            bank_id: self.bank_id,
            indicator: self.indicator,
            period: self.period,
            observation_id: self.observation_id,
            related_observation_id: self.related_observation_id,
            detail: self.detail,
        })
    }
}

fn insert_log(conn: &Connection, entries: &[LogEntry]) -> Result<(), CamelsError> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO normalization_log (run_id, stage, bank_id, indicator, period, decision,
                observation_id, related_observation_id, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .map_err(query_err)?;
    for e in entries {
        stmt.execute(params![
            e.run_id,
            e.stage,
            e.bank_id,
            e.indicator,
            e.period,
            e.decision.as_str(),
            e.observation_id,
            e.related_observation_id,
            e.detail,
            ts(&e.recorded_at),
        ])
        .map_err(query_err)?;
    }
    Ok(())
}

fn query_log(conn: &Connection, filter: &str, value: &str) -> Result<Vec<LogEntry>, CamelsError> {
    let sql = format!("SELECT {LOG_COLUMNS} FROM normalization_log WHERE {filter} = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params![value], log_row)
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)?;
    rows.into_iter().map(LogRow::into_entry).collect()
}

struct ScoreRow {
    id: i64,
    bank_id: String,
    period: String,
    run_id: String,
    scored_at: String,
    config_version: String,
    config_fingerprint: String,
    composite: Option<f64>,
    classification: String,
    expected_weight: f64,
    available_weight: f64,
    missing_pillars: String,
    insufficient_coverage: bool,
}

const SCORE_COLUMNS: &str = "id, bank_id, period, run_id, scored_at, config_version, \
     config_fingerprint, composite, classification, expected_weight, available_weight, \
     missing_pillars, insufficient_coverage";

fn score_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreRow> {
    Ok(ScoreRow {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        period: row.get(2)?,
        run_id: row.get(3)?,
        scored_at: row.get(4)?,
        config_version: row.get(5)?,
        config_fingerprint: row.get(6)?,
        composite: row.get(7)?,
        classification: row.get(8)?,
        expected_weight: row.get(9)?,
        available_weight: row.get(10)?,
        missing_pillars: row.get(11)?,
        insufficient_coverage: row.get(12)?,
    })
}

fn load_score(conn: &Connection, row: ScoreRow) -> Result<ScoreRecord, CamelsError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT pillar, weight, score, classification, expected_weight, available_weight,
                    missing
             FROM pillar_scores WHERE score_id = ?1 ORDER BY rowid",
        )
        .map_err(query_err)?;
    let pillar_rows = stmt
        .query_map(params![row.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, String>(6)?,
            ))
        })
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)?;
    let pillars = pillar_rows
        .into_iter()
        .map(|(pillar, weight, score, class, expected, available, missing)| {
            Ok(PillarScore {
                pillar: parse_with::<Pillar>("pillar", &pillar)?,
                weight,
                score,
                classification: parse_with::<Classification>("classification", &class)?,
                expected_weight: expected,
                available_weight: available,
                missing: split_list(&missing),
            })
        })
        .collect::<Result<Vec<_>, CamelsError>>()?;

    let mut stmt = conn
        .prepare_cached(
            "SELECT indicator, pillar, weight, value, sub_score, class, unrated_reason,
                    outlier, coverage_present, observation_id, source_ref
             FROM indicator_scores WHERE score_id = ?1 ORDER BY indicator",
        )
        .map_err(query_err)?;
    let indicator_rows = stmt
        .query_map(params![row.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, Option<f64>>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, bool>(7)?,
                r.get::<_, i64>(8)?,
                r.get::<_, Option<i64>>(9)?,
                r.get::<_, Option<String>>(10)?,
            ))
        })
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)?;
    let indicators = indicator_rows
        .into_iter()
        .map(
            |(
                indicator,
                pillar,
                weight,
                value,
                sub_score,
                class,
                reason,
                outlier,
                present,
                observation_id,
                source_ref,
            )| {
                let rating = match (sub_score, class, reason) {
                    (Some(score), Some(class), _) => Rating::Rated {
                        score,
                        class: parse_with::<TrafficLight>("class", &class)?,
                    },
                    (_, _, Some(reason)) => {
                        Rating::Unrated(parse_with::<UnratedReason>("unrated reason", &reason)?)
                    }
                    _ => return Err(corrupt("indicator rating", &indicator)),
                };
                Ok(IndicatorScore {
                    pillar: parse_with::<Pillar>("pillar", &pillar)?,
                    indicator,
                    weight,
                    value,
                    rating,
                    outlier,
                    coverage_present: present.max(0) as usize,
                    observation_id,
                    source_ref,
                })
            },
        )
        .collect::<Result<Vec<_>, CamelsError>>()?;

    let missing_pillars = split_list(&row.missing_pillars)
        .iter()
        .map(|p| parse_with::<Pillar>("pillar", p))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ScoreRecord {
        period: parse_quarter(&row.period)?,
        scored_at: parse_ts(&row.scored_at)?,
        classification: parse_with::<Classification>("classification", &row.classification)?,
        bank_id: row.bank_id,
        run_id: row.run_id,
        config_version: row.config_version,
        config_fingerprint: row.config_fingerprint,
        indicators,
        pillars,
        composite: row.composite,
        expected_weight: row.expected_weight,
        available_weight: row.available_weight,
        missing_pillars,
        insufficient_coverage: row.insufficient_coverage,
    })
}

impl SqliteStore {
    pub fn open(path: &Path, pool_size: u32) -> Result<Self, CamelsError> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(pool_err)?;
        Ok(Self {
            pool,
            locks: KeyLocks::new(),
        })
    }

    pub fn from_settings(settings: &EngineSettings) -> Result<Self, CamelsError> {
        if let Some(parent) = settings.paths.database.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::open(&settings.paths.database, settings.runtime.pool_size)
    }

    pub fn in_memory() -> Result<Self, CamelsError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_err)?;
        Ok(Self {
            pool,
            locks: KeyLocks::new(),
        })
    }

    pub fn initialize_schema(&self) -> Result<(), CamelsError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_err)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, CamelsError> {
        self.pool.get().map_err(pool_err)
    }
}

impl IndicatorStore for SqliteStore {
    fn seed_banks(&self, banks: &[Bank]) -> Result<usize, CamelsError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        let mut changed = 0;
        for bank in banks {
            let existing: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT name, country, regulator FROM banks WHERE bank_id = ?1",
                    params![bank.bank_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
                .map_err(query_err)?;
            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO banks (bank_id, name, country, regulator) VALUES (?1, ?2, ?3, ?4)",
                        params![bank.bank_id, bank.name, bank.country, bank.regulator],
                    )
                    .map_err(query_err)?;
                    changed += 1;
                }
                Some((name, country, regulator)) => {
                    for (field, stored, incoming) in [
                        ("country", &country, &bank.country),
                        ("regulator", &regulator, &bank.regulator),
                    ] {
                        if stored != incoming {
                            return Err(CamelsError::ReferenceConflict {
                                bank_id: bank.bank_id.clone(),
                                field: field.to_string(),
                            });
                        }
                    }
                    if name != bank.name {
                        log::info!("correcting name of bank {}: '{name}' -> '{}'", bank.bank_id, bank.name);
                        tx.execute(
                            "UPDATE banks SET name = ?1 WHERE bank_id = ?2",
                            params![bank.name, bank.bank_id],
                        )
                        .map_err(query_err)?;
                        changed += 1;
                    }
                }
            }
        }
        tx.commit().map_err(query_err)?;
        Ok(changed)
    }

    fn sync_indicators(&self, catalog: &IndicatorCatalog) -> Result<usize, CamelsError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        for d in catalog.definitions() {
            tx.execute(
                "INSERT INTO indicators (code, name, pillar, unit, polarity, min_value, max_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(code) DO UPDATE SET name = excluded.name, pillar = excluded.pillar,
                    unit = excluded.unit, polarity = excluded.polarity,
                    min_value = excluded.min_value, max_value = excluded.max_value",
                params![
                    d.code,
                    d.name,
                    d.pillar.as_str(),
                    d.unit,
                    d.polarity.as_str(),
                    d.min_value,
                    d.max_value
                ],
            )
            .map_err(query_err)?;
            tx.execute(
                "DELETE FROM indicator_conversions WHERE code = ?1",
                params![d.code],
            )
            .map_err(query_err)?;
            for (unit, factor) in &d.conversions {
                tx.execute(
                    "INSERT INTO indicator_conversions (code, unit, factor) VALUES (?1, ?2, ?3)",
                    params![d.code, unit, factor],
                )
                .map_err(query_err)?;
            }
        }
        tx.commit().map_err(query_err)?;
        Ok(catalog.len())
    }

    fn banks(&self) -> Result<Vec<Bank>, CamelsError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT bank_id, name, country, regulator FROM banks ORDER BY bank_id")
            .map_err(query_err)?;
        stmt.query_map([], |r| {
            Ok(Bank {
                bank_id: r.get(0)?,
                name: r.get(1)?,
                country: r.get(2)?,
                regulator: r.get(3)?,
            })
        })
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)
    }

    fn indicator_codes(&self) -> Result<Vec<String>, CamelsError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT code FROM indicators ORDER BY code")
            .map_err(query_err)?;
        stmt.query_map([], |r| r.get(0))
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)
    }

    fn append_observation(&self, obs: &NewObservation) -> Result<ObservationId, CamelsError> {
        let conn = self.conn()?;
        let known = |sql: &str, key: &str| -> Result<bool, CamelsError> {
            conn.query_row(sql, params![key], |_| Ok(()))
                .optional()
                .map(|r| r.is_some())
                .map_err(query_err)
        };
        if !known("SELECT 1 FROM banks WHERE bank_id = ?1", &obs.bank_id)? {
            return Err(CamelsError::InvalidObservation {
                field: "bank_id".into(),
                reason: format!("'{}' is not a seeded bank", obs.bank_id),
            });
        }
        if !known("SELECT 1 FROM indicators WHERE code = ?1", &obs.indicator)? {
            return Err(CamelsError::InvalidObservation {
                field: "indicator".into(),
                reason: format!("'{}' is not in the indicator catalog", obs.indicator),
            });
        }
        conn.execute(
            "INSERT INTO raw_observations (bank_id, indicator, period, value, unit, source_ref,
                content_hash, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                obs.bank_id,
                obs.indicator,
                obs.period,
                obs.value,
                obs.unit,
                obs.source_ref,
                obs.content_hash,
                ts(&obs.ingested_at)
            ],
        )
        .map_err(query_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn observations_for(
        &self,
        bank_id: &str,
        indicator: &str,
    ) -> Result<Vec<RawObservation>, CamelsError> {
        self.query_observations(
            "WHERE bank_id = ?1 AND indicator = ?2",
            params![bank_id, indicator],
        )
    }

    fn observations_for_bank(&self, bank_id: &str) -> Result<Vec<RawObservation>, CamelsError> {
        self.query_observations("WHERE bank_id = ?1", params![bank_id])
    }

    fn replace_history(
        &self,
        bank_id: &str,
        indicator: &str,
        series: &NormalizedSeries,
    ) -> Result<(), CamelsError> {
        let key_lock = self.locks.lock_for(bank_id, indicator)?;
        let _held = key_lock.lock().map_err(|_| CamelsError::Database {
            reason: format!("history lock for {bank_id}/{indicator} poisoned"),
        })?;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        tx.execute(
            "DELETE FROM indicator_history WHERE bank_id = ?1 AND indicator = ?2",
            params![bank_id, indicator],
        )
        .map_err(query_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO indicator_history (bank_id, indicator, period, value, status,
                        canonical_observation_id, discarded_observation_ids)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .map_err(query_err)?;
            for e in &series.entries {
                stmt.execute(params![
                    bank_id,
                    indicator,
                    e.quarter.to_string(),
                    e.value,
                    e.status.as_str(),
                    e.provenance.canonical,
                    ids_to_text(&e.provenance.discarded),
                ])
                .map_err(query_err)?;
            }
        }
        let c = &series.coverage;
        tx.execute(
            "INSERT INTO indicator_coverage (bank_id, indicator, as_of, window_quarters,
                minimum_coverage, present, gaps, consecutive, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(bank_id, indicator) DO UPDATE SET as_of = excluded.as_of,
                window_quarters = excluded.window_quarters,
                minimum_coverage = excluded.minimum_coverage, present = excluded.present,
                gaps = excluded.gaps, consecutive = excluded.consecutive,
                status = excluded.status",
            params![
                bank_id,
                indicator,
                c.as_of.to_string(),
                c.window_quarters as i64,
                c.minimum_coverage as i64,
                c.present as i64,
                c.gaps as i64,
                c.consecutive as i64,
                c.status.as_str()
            ],
        )
        .map_err(query_err)?;
        insert_log(&tx, &series.log)?;
        tx.commit().map_err(query_err)
    }

    fn history(
        &self,
        bank_id: &str,
        indicator: &str,
        from: Option<Quarter>,
        to: Option<Quarter>,
    ) -> Result<Vec<HistoryEntry>, CamelsError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM indicator_history
             WHERE bank_id = ?1 AND indicator = ?2
               AND (?3 IS NULL OR period >= ?3) AND (?4 IS NULL OR period <= ?4)
             ORDER BY period"
        );
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(
                params![
                    bank_id,
                    indicator,
                    from.map(|q| q.to_string()),
                    to.map(|q| q.to_string())
                ],
                history_row,
            )
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        rows.into_iter().map(HistoryRow::into_entry).collect()
    }

    fn history_for_bank(&self, bank_id: &str) -> Result<BankHistory, CamelsError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM indicator_history WHERE bank_id = ?1
             ORDER BY indicator, period"
        );
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params![bank_id], history_row)
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        let mut history = BankHistory::new();
        for row in rows {
            let entry = row.into_entry()?;
            history
                .entry(entry.indicator.clone())
                .or_default()
                .push(entry);
        }
        Ok(history)
    }

    fn coverage(
        &self,
        bank_id: &str,
        indicator: &str,
    ) -> Result<Option<CoverageSummary>, CamelsError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT as_of, window_quarters, minimum_coverage, present, gaps, consecutive, status
                 FROM indicator_coverage WHERE bank_id = ?1 AND indicator = ?2",
                params![bank_id, indicator],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, i64>(5)?,
                        r.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(query_err)?;
        let Some((as_of, window, minimum, present, gaps, consecutive, status)) = row else {
            return Ok(None);
        };
        Ok(Some(CoverageSummary {
            bank_id: bank_id.to_string(),
            indicator: indicator.to_string(),
            as_of: parse_quarter(&as_of)?,
            window_quarters: window as usize,
            minimum_coverage: minimum as usize,
            present: present as usize,
            gaps: gaps as usize,
            consecutive: consecutive as usize,
            status: parse_with::<CoverageStatus>("coverage status", &status)?,
        }))
    }

    fn append_log(&self, entries: &[LogEntry]) -> Result<(), CamelsError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        insert_log(&tx, entries)?;
        tx.commit().map_err(query_err)
    }

    fn log_for_bank(&self, bank_id: &str) -> Result<Vec<LogEntry>, CamelsError> {
        let conn = self.conn()?;
        query_log(&conn, "bank_id", bank_id)
    }

    fn log_for_run(&self, run_id: &str) -> Result<Vec<LogEntry>, CamelsError> {
        let conn = self.conn()?;
        query_log(&conn, "run_id", run_id)
    }

    fn pin_scoring_config(&self, config: &ScoringConfig) -> Result<(), CamelsError> {
        let fingerprint = config.fingerprint();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        let stored: Option<String> = tx
            .query_row(
                "SELECT fingerprint FROM scoring_configs WHERE version = ?1",
                params![config.version],
                |r| r.get(0),
            )
            .optional()
            .map_err(query_err)?;
        match stored {
            Some(existing) if existing != fingerprint => {
                return Err(CamelsError::InvalidScoringConfig {
                    reason: format!(
                        "version '{}' is already pinned to different content",
                        config.version
                    ),
                });
            }
            Some(_) => {}
            None => {
                tx.execute(
                    "INSERT INTO scoring_configs (version, fingerprint, canonical, pinned_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        config.version,
                        fingerprint,
                        config.canonical_text(),
                        ts(&Utc::now())
                    ],
                )
                .map_err(query_err)?;
            }
        }
        tx.commit().map_err(query_err)
    }

    fn append_score(&self, record: &ScoreRecord) -> Result<i64, CamelsError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        let missing_pillars: Vec<&str> = record.missing_pillars.iter().map(Pillar::as_str).collect();
        tx.execute(
            "INSERT INTO scores (bank_id, period, run_id, scored_at, config_version,
                config_fingerprint, composite, classification, expected_weight,
                available_weight, missing_pillars, insufficient_coverage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.bank_id,
                record.period.to_string(),
                record.run_id,
                ts(&record.scored_at),
                record.config_version,
                record.config_fingerprint,
                record.composite,
                record.classification.as_str(),
                record.expected_weight,
                record.available_weight,
                missing_pillars.join(","),
                record.insufficient_coverage
            ],
        )
        .map_err(query_err)?;
        let score_id = tx.last_insert_rowid();

        for p in &record.pillars {
            tx.execute(
                "INSERT INTO pillar_scores (score_id, pillar, weight, score, classification,
                    expected_weight, available_weight, missing)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    score_id,
                    p.pillar.as_str(),
                    p.weight,
                    p.score,
                    p.classification.as_str(),
                    p.expected_weight,
                    p.available_weight,
                    p.missing.join(",")
                ],
            )
            .map_err(query_err)?;
        }
        for s in &record.indicators {
            let (sub_score, class, reason) = match s.rating {
                Rating::Rated { score, class } => (Some(score), Some(class.as_str()), None),
                Rating::Unrated(reason) => (None, None, Some(reason.as_str())),
            };
            tx.execute(
                "INSERT INTO indicator_scores (score_id, indicator, pillar, weight, value,
                    sub_score, class, unrated_reason, outlier, coverage_present,
                    observation_id, source_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    score_id,
                    s.indicator,
                    s.pillar.as_str(),
                    s.weight,
                    s.value,
                    sub_score,
                    class,
                    reason,
                    s.outlier,
                    s.coverage_present as i64,
                    s.observation_id,
                    s.source_ref
                ],
            )
            .map_err(query_err)?;
        }
        tx.commit().map_err(query_err)?;
        Ok(score_id)
    }

    fn latest_score(
        &self,
        bank_id: &str,
        period: Quarter,
    ) -> Result<Option<ScoreRecord>, CamelsError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SCORE_COLUMNS} FROM scores WHERE bank_id = ?1 AND period = ?2
             ORDER BY scored_at DESC, id DESC LIMIT 1"
        );
        let row = conn
            .query_row(&sql, params![bank_id, period.to_string()], score_row)
            .optional()
            .map_err(query_err)?;
        row.map(|r| load_score(&conn, r)).transpose()
    }

    fn scores_for_run(&self, run_id: &str) -> Result<Vec<ScoreRecord>, CamelsError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SCORE_COLUMNS} FROM scores WHERE run_id = ?1 ORDER BY bank_id, period, id"
        );
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params![run_id], score_row)
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        rows.into_iter().map(|r| load_score(&conn, r)).collect()
    }

    fn record_audit(&self, event: &AuditEvent) -> Result<(), CamelsError> {
        self.conn()?
            .execute(
                "INSERT INTO audit_trail (run_id, stage, bank_id, status, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.run_id,
                    event.stage,
                    event.bank_id,
                    event.status.as_str(),
                    event.detail,
                    ts(&event.recorded_at)
                ],
            )
            .map_err(query_err)?;
        Ok(())
    }

    fn audit_for_run(&self, run_id: &str) -> Result<Vec<AuditEvent>, CamelsError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, stage, bank_id, status, detail, recorded_at
                 FROM audit_trail WHERE run_id = ?1 ORDER BY id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![run_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        rows.into_iter()
            .map(|(run_id, stage, bank_id, status, detail, recorded_at)| {
                Ok(AuditEvent {
                    run_id,
                    stage,
                    bank_id,
                    status: parse_with::<AuditStatus>("audit status", &status)?,
                    detail,
                    recorded_at: parse_ts(&recorded_at)?,
                })
            })
            .collect()
    }
}

impl SqliteStore {
    fn query_observations(
        &self,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<RawObservation>, CamelsError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, bank_id, indicator, period, value, unit, source_ref, content_hash,
                    ingested_at
             FROM raw_observations {filter} ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(args, |r| {
                Ok((
                    r.get::<_, ObservationId>(0)?,
                    NewObservation {
                        bank_id: r.get(1)?,
                        indicator: r.get(2)?,
                        period: r.get(3)?,
                        value: r.get(4)?,
                        unit: r.get(5)?,
                        source_ref: r.get(6)?,
                        content_hash: r.get(7)?,
                        ingested_at: Utc::now(),
                    },
                    r.get::<_, String>(8)?,
                ))
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;
        rows.into_iter()
            .map(|(id, obs, ingested)| {
                let ingested_at = parse_ts(&ingested)?;
                Ok(RawObservation::from_new(id, NewObservation { ingested_at, ..obs }))
            })
            .collect()
    }
}
