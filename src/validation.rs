// src/validation.rs
//
// =============================================================================
// ALLOYSCREEN: EXPERIMENTAL VALIDATION (v 0.1 )
// =============================================================================
//
// The Referee.
//
// Responsibilities:
// 1. Pair simulated structures with experimental references by reduced formula.
// 2. Undo supercell scaling of the simulated lattice constant.
// 3. Score each pair: 100 - (0.6 * lattice error % + 0.4 * density error %).
// 4. Summarise the matched set.

pub mod reference;

use crate::config::ScreeningConfig;
use crate::core::ChemicalSystem;
use crate::miner::Miner;
use anyhow::{Context, Result};
use reference::{normalize_formula, resolve_references, ReferenceRow, ReferenceSource};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use reference::ReferenceError;

const LATTICE_WEIGHT: f64 = 0.6;
const DENSITY_WEIGHT: f64 = 0.4;

/// Above this ratio the simulated constant is taken to be a supercell edge.
const SUPERCELL_DETECTION_RATIO: f64 = 2.5;

/// The simulated side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedRecord {
    pub formula: String,
    /// Å, possibly of a supercell.
    pub lattice_a: f64,
    /// g/cm³
    pub density: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub identifier: String,
    pub exp_formula: String,
    pub sim_formula: String,
    /// After supercell correction.
    pub sim_lattice_a: f64,
    pub exp_lattice_a: f64,
    pub supercell_factor: u32,
    pub lattice_error_pct: f64,
    pub sim_density: f64,
    pub exp_density: f64,
    pub density_error_pct: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub source: Option<String>,
    pub total_references: usize,
    pub matched: usize,
    pub mean_score: Option<f64>,
    pub mean_lattice_error_pct: Option<f64>,
    pub mean_density_error_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub records: Vec<ValidationRecord>,
    pub summary: ValidationSummary,
}

fn relative_error_pct(sim: f64, exp: f64) -> f64 {
    if exp > 0.0 {
        (sim - exp).abs() / exp * 100.0
    } else {
        0.0
    }
}

/// (corrected lattice constant, factor). Factor is 1 unless the simulated
/// value exceeds 2.5x the reference.
pub fn supercell_correction(sim_a: f64, exp_a: f64) -> (f64, u32) {
    if exp_a > 0.0 && sim_a > exp_a * SUPERCELL_DETECTION_RATIO {
        let factor = (sim_a / exp_a).round().max(1.0);
        (sim_a / factor, factor as u32)
    } else {
        (sim_a, 1)
    }
}

pub fn score_pair(sim: &SimulatedRecord, exp: &ReferenceRow) -> ValidationRecord {
    let (sim_a, factor) = supercell_correction(sim.lattice_a, exp.lattice_constant_a);
    if factor > 1 {
        log::info!(
            "   🔍 {}: supercell edge {:.2} Å -> {:.4} Å ({}x)",
            sim.formula,
            sim.lattice_a,
            sim_a,
            factor
        );
    }
    let lattice_error_pct = relative_error_pct(sim_a, exp.lattice_constant_a);
    let density_error_pct = relative_error_pct(sim.density, exp.density);
    let total = LATTICE_WEIGHT * lattice_error_pct + DENSITY_WEIGHT * density_error_pct;

    ValidationRecord {
        identifier: exp.identifier.clone(),
        exp_formula: exp.formula.clone(),
        sim_formula: sim.formula.clone(),
        sim_lattice_a: sim_a,
        exp_lattice_a: exp.lattice_constant_a,
        supercell_factor: factor,
        lattice_error_pct,
        sim_density: sim.density,
        exp_density: exp.density,
        density_error_pct,
        score: (100.0 - total).max(0.0),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

pub struct Validator {
    simulated: Vec<SimulatedRecord>,
}

impl Validator {
    pub fn new(simulated: Vec<SimulatedRecord>) -> Self {
        Self { simulated }
    }

    /// Every reference row paired with the first simulated record of the same
    /// reduced formula; unmatched rows are dropped.
    pub fn validate(&self, references: &[ReferenceRow], source: Option<&str>) -> ValidationReport {
        let sim_keys: Vec<String> = self
            .simulated
            .iter()
            .map(|s| normalize_formula(&s.formula))
            .collect();

        let records: Vec<ValidationRecord> = references
            .iter()
            .filter_map(|r| {
                let key = normalize_formula(&r.formula);
                sim_keys
                    .iter()
                    .position(|k| *k == key)
                    .map(|i| score_pair(&self.simulated[i], r))
            })
            .collect();

        log::info!(
            "   📊 Matched {} of {} reference rows",
            records.len(),
            references.len()
        );

        let summary = ValidationSummary {
            source: source.map(str::to_string),
            total_references: references.len(),
            matched: records.len(),
            mean_score: mean(records.iter().map(|r| r.score)),
            mean_lattice_error_pct: mean(records.iter().map(|r| r.lattice_error_pct)),
            mean_density_error_pct: mean(records.iter().map(|r| r.density_error_pct)),
        };
        ValidationReport { records, summary }
    }

    /// Resolves references for `system` through the configured fallback chain.
    pub async fn validate_system(
        &self,
        cfg: &ScreeningConfig,
        miner: Option<Arc<dyn Miner>>,
        system: &ChemicalSystem,
    ) -> ValidationReport {
        let chain = ReferenceSource::chain(
            cfg.validation.mode,
            miner,
            cfg.validation.custom_path.clone(),
        );
        let (source, rows) = resolve_references(&chain, system).await;
        self.validate(&rows, source)
    }
}

impl ValidationReport {
    pub fn log_summary(&self) {
        let s = &self.summary;
        log::info!("{}", "=".repeat(60));
        log::info!("🎯 Simulation vs Experiment");
        match s.mean_score {
            Some(score) => {
                log::info!("   Mean score          : {:.2} / 100", score);
                log::info!(
                    "   Mean lattice error  : {:.2}%",
                    s.mean_lattice_error_pct.unwrap_or(0.0)
                );
                log::info!(
                    "   Mean density error  : {:.2}%",
                    s.mean_density_error_pct.unwrap_or(0.0)
                );
            }
            None => log::warn!("   No reference row matched a simulated structure"),
        }
        for r in &self.records {
            log::info!(
                "   {:<10} sim a {:>8.4} | exp a {:>8.4} | err {:>6.2}% | score {:>6.2}",
                r.exp_formula,
                r.sim_lattice_a,
                r.exp_lattice_a,
                r.lattice_error_pct,
                r.score
            );
        }
        log::info!("{}", "=".repeat(60));
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut w = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create validation report {:?}", path))?;
        for r in &self.records {
            w.serialize(r)?;
        }
        w.flush()?;
        Ok(())
    }
}
