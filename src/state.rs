// src/state.rs
//
// =============================================================================
// ALLOYSCREEN: RESUME STATE & REPORT STORE (v 0.1 )
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - One row per (system, composition tag, temperature). Relaxation rows have
//   no temperature; MD rows carry the target temperature in whole kelvin.
// - `completed` is the source of truth for "already done". Failed rows are
//   kept for the report but are retried on resume.
// - Two backends behind `StateStore`:
//   * CSV report (default): `pipeline_results_<timestamp>.csv`. A run resumes
//     from the newest report in the output directory, or a pinned one, and
//     rewrites the full row set into its own timestamped file.
//   * SQLite: the same rows as JSON blobs keyed by the triple, upserted.
// - Missing or unreadable resume state means nothing has completed.
//
// Only the orchestrator writes here, between systems.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const REPORT_PREFIX: &str = "pipeline_results_";

// -----------------------------------------------------------------------------
// Records
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub system: String,
    pub composition: String,
    /// Whole kelvin; `None` for the relaxation row.
    pub temperature_k: Option<i64>,
}

impl StateKey {
    pub fn relax(system: impl Into<String>, composition: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            composition: composition.into(),
            temperature_k: None,
        }
    }

    pub fn md(system: impl Into<String>, composition: impl Into<String>, temperature: f64) -> Self {
        Self {
            system: system.into(),
            composition: composition.into(),
            temperature_k: Some(temperature.round() as i64),
        }
    }
}

/// One report row. Column order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateRecord {
    pub system: String,
    pub composition: String,
    pub formula: String,
    pub total_atoms: usize,
    pub lattice_a: Option<f64>,
    pub density: Option<f64>,
    pub energy_per_atom: Option<f64>,
    pub energy_above_hull: Option<f64>,
    pub is_stable: Option<bool>,
    pub temperature: Option<f64>,
    pub md_completed: bool,
    pub trajectory_ref: Option<String>,
    pub structure_ref: Option<String>,
    pub md_avg_temperature: Option<f64>,
    pub md_temp_fluctuation: Option<f64>,
    pub md_avg_energy_per_atom: Option<f64>,
    pub md_volume_change_pct: Option<f64>,
    pub md_thermally_stable: Option<bool>,
    pub md_frames: Option<usize>,
    pub completed: bool,
    pub error: Option<String>,
}

impl StateRecord {
    pub fn key(&self) -> StateKey {
        StateKey {
            system: self.system.clone(),
            composition: self.composition.clone(),
            temperature_k: self.temperature.map(|t| t.round() as i64),
        }
    }
}

// -----------------------------------------------------------------------------
// The trait
// -----------------------------------------------------------------------------

pub trait StateStore: Send {
    fn has_completed(&self, key: &StateKey) -> bool {
        self.lookup(key).map(|r| r.completed).unwrap_or(false)
    }

    fn lookup(&self, key: &StateKey) -> Option<StateRecord>;

    /// All rows of `system`, key order.
    fn records_for_system(&self, system: &str) -> Vec<StateRecord>;

    fn all_records(&self) -> Vec<StateRecord>;

    /// Insert or replace the row for `record.key()`.
    fn upsert(&mut self, record: StateRecord) -> Result<()>;

    fn mark_completed(&mut self, mut record: StateRecord) -> Result<()> {
        record.completed = true;
        record.error = None;
        self.upsert(record)
    }

    fn record_failure(&mut self, mut record: StateRecord, error: &str) -> Result<()> {
        record.completed = false;
        record.error = Some(error.to_string());
        self.upsert(record)
    }

    /// Make everything written so far durable.
    fn flush(&mut self) -> Result<()>;

    /// Human-readable location for logs and the run summary.
    fn location(&self) -> String;
}

// -----------------------------------------------------------------------------
// CSV report backend
// -----------------------------------------------------------------------------

/// Newest `pipeline_results_*.csv` in `dir`, by name (the timestamp sorts).
pub fn find_latest_report(dir: &Path) -> Option<PathBuf> {
    let mut reports: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(REPORT_PREFIX) && n.ends_with(".csv"))
                .unwrap_or(false)
        })
        .collect();
    reports.sort();
    reports.pop()
}

pub fn load_report(path: &Path) -> Result<Vec<StateRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open report {:?}", path))?;
    let mut out = Vec::new();
    for row in reader.deserialize::<StateRecord>() {
        out.push(row.with_context(|| format!("Malformed row in {:?}", path))?);
    }
    Ok(out)
}

pub fn write_report(path: &Path, records: &[StateRecord]) -> Result<()> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut w = csv::Writer::from_path(&tmp)
            .with_context(|| format!("Failed to create report {:?}", tmp))?;
        for r in records {
            w.serialize(r)?;
        }
        w.flush()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to finalize report {:?}", path))?;
    Ok(())
}

pub struct CsvReportStore {
    output: PathBuf,
    rows: BTreeMap<StateKey, StateRecord>,
    resumed_from: Option<PathBuf>,
}

impl CsvReportStore {
    /// `resume = false` starts empty even if reports exist.
    pub fn open(dir: impl AsRef<Path>, resume: bool, pinned: Option<&Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output dir {:?}", dir))?;

        let source = if resume {
            pinned.map(Path::to_path_buf).or_else(|| find_latest_report(dir))
        } else {
            None
        };

        let mut rows = BTreeMap::new();
        if let Some(src) = &source {
            match load_report(src) {
                Ok(records) => {
                    let done = records.iter().filter(|r| r.completed).count();
                    log::info!(
                        "📂 Resuming from {:?}: {} rows, {} completed",
                        src,
                        records.len(),
                        done
                    );
                    for r in records {
                        rows.insert(r.key(), r);
                    }
                }
                Err(e) => {
                    log::warn!("⚠️ Resume state unusable ({:#}); starting fresh", e);
                }
            }
        }

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let output = dir.join(format!("{}{}.csv", REPORT_PREFIX, stamp));
        Ok(Self {
            output,
            rows,
            resumed_from: source,
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub fn resumed_from(&self) -> Option<&Path> {
        self.resumed_from.as_deref()
    }
}

impl StateStore for CsvReportStore {
    fn lookup(&self, key: &StateKey) -> Option<StateRecord> {
        self.rows.get(key).cloned()
    }

    fn records_for_system(&self, system: &str) -> Vec<StateRecord> {
        self.rows
            .values()
            .filter(|r| r.system == system)
            .cloned()
            .collect()
    }

    fn all_records(&self) -> Vec<StateRecord> {
        self.rows.values().cloned().collect()
    }

    fn upsert(&mut self, record: StateRecord) -> Result<()> {
        self.rows.insert(record.key(), record);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let records: Vec<StateRecord> = self.rows.values().cloned().collect();
        write_report(&self.output, &records)?;
        log::info!("   💾 Report saved: {:?} ({} rows)", self.output, records.len());
        Ok(())
    }

    fn location(&self) -> String {
        self.output.display().to_string()
    }
}

// -----------------------------------------------------------------------------
// SQLite backend
// -----------------------------------------------------------------------------

pub struct SqliteStateStore {
    path: PathBuf,
}

// Relaxation rows have no temperature; NULL would defeat the primary key.
const NO_TEMPERATURE: i64 = -1;

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    /// DELETE journal mode avoids WAL side files on shared filesystems.
    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS records (
                system TEXT NOT NULL,
                composition TEXT NOT NULL,
                temperature_k INTEGER NOT NULL,
                completed INTEGER NOT NULL,
                updated_at_ms INTEGER,
                full_json TEXT,
                PRIMARY KEY (system, composition, temperature_k)
            );
            CREATE INDEX IF NOT EXISTS idx_records_system ON records(system);
            COMMIT;",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path).context("Failed to open state DB")
    }

    fn query(&self, sql: &str, system: Option<&str>) -> Result<Vec<StateRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = match system {
            Some(s) => stmt
                .query_map(params![s], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        let mut out = Vec::with_capacity(rows.len());
        for json in rows {
            match serde_json::from_str::<StateRecord>(&json) {
                Ok(r) => out.push(r),
                Err(_) => log::warn!("Failed to deserialize a state record; skipped."),
            }
        }
        Ok(out)
    }
}

impl StateStore for SqliteStateStore {
    fn lookup(&self, key: &StateKey) -> Option<StateRecord> {
        let res: Result<Option<String>> = self.conn().and_then(|conn| {
            conn.query_row(
                "SELECT full_json FROM records
                 WHERE system = ?1 AND composition = ?2 AND temperature_k = ?3",
                params![
                    key.system,
                    key.composition,
                    key.temperature_k.unwrap_or(NO_TEMPERATURE)
                ],
                |r| r.get(0),
            )
            .optional()
            .map_err(Into::into)
        });
        match res {
            Ok(json) => json.and_then(|j| serde_json::from_str(&j).ok()),
            Err(e) => {
                log::warn!("State lookup failed: {:#}", e);
                None
            }
        }
    }

    fn records_for_system(&self, system: &str) -> Vec<StateRecord> {
        self.query(
            "SELECT full_json FROM records WHERE system = ?1
             ORDER BY composition, temperature_k",
            Some(system),
        )
        .unwrap_or_else(|e| {
            log::warn!("State query failed: {:#}", e);
            Vec::new()
        })
    }

    fn all_records(&self) -> Vec<StateRecord> {
        self.query(
            "SELECT full_json FROM records ORDER BY system, composition, temperature_k",
            None,
        )
        .unwrap_or_else(|e| {
            log::warn!("State query failed: {:#}", e);
            Vec::new()
        })
    }

    fn upsert(&mut self, record: StateRecord) -> Result<()> {
        let key = record.key();
        let json = serde_json::to_string(&record)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (system, composition, temperature_k, completed, updated_at_ms, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(system, composition, temperature_k) DO UPDATE SET
                completed=excluded.completed,
                updated_at_ms=excluded.updated_at_ms,
                full_json=excluded.full_json",
            params![
                key.system,
                key.composition,
                key.temperature_k.unwrap_or(NO_TEMPERATURE),
                record.completed,
                chrono::Utc::now().timestamp_millis(),
                json
            ],
        )?;
        Ok(())
    }

    /// Every upsert is already committed.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
