// src/validation/reference.rs
//
// Experimental reference data: rows, sources and the fallback chain.
//
// Sources are resolved once from `ReferenceMode` into an ordered list. The
// first source returning a non-empty, in-system row set wins; errors and empty
// answers fall through to the next entry.

use crate::config::ReferenceMode;
use crate::core::{ChemicalSystem, Formula};
use crate::miner::Miner;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("Reference row for '{formula}' is missing required column `{field}`")]
    MissingField { formula: String, field: &'static str },
    #[error("Reference row for '{formula}': `{field}` must be positive, got {value}")]
    InvalidValue {
        formula: String,
        field: &'static str,
        value: f64,
    },
    #[error("Reference row has an empty formula")]
    EmptyFormula,
    #[error("Failed to read reference table {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Reference source '{source_name}' unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },
}

/// One experimental reference, all columns resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub identifier: String,
    pub formula: String,
    pub lattice_constant_a: f64,
    pub lattice_constant_b: f64,
    pub lattice_constant_c: f64,
    /// g/cm³
    pub density: f64,
    pub formation_energy: f64,
    pub energy_above_hull: f64,
    pub crystal_system: String,
}

/// A row as it arrives from a table or a miner; only formula, a and density
/// are mandatory. Column names of the `exp_*` export format are accepted too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReferenceRow {
    #[serde(default, alias = "mp_id", alias = "material_id")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub formula: String,
    #[serde(default, alias = "exp_lattice_a")]
    pub lattice_constant_a: Option<f64>,
    #[serde(default, alias = "exp_lattice_b")]
    pub lattice_constant_b: Option<f64>,
    #[serde(default, alias = "exp_lattice_c")]
    pub lattice_constant_c: Option<f64>,
    #[serde(default, alias = "exp_density")]
    pub density: Option<f64>,
    #[serde(default, alias = "exp_formation_energy")]
    pub formation_energy: Option<f64>,
    #[serde(default, alias = "exp_e_above_hull")]
    pub energy_above_hull: Option<f64>,
    #[serde(default)]
    pub crystal_system: Option<String>,
}

impl RawReferenceRow {
    /// Fills defaults: b and c fall back to a, identifier is `<prefix>-<formula>`,
    /// energies 0.0, crystal system "Unknown".
    pub fn into_row(self, id_prefix: &str) -> Result<ReferenceRow, ReferenceError> {
        let formula = self.formula.trim().to_string();
        if formula.is_empty() {
            return Err(ReferenceError::EmptyFormula);
        }
        let a = self.lattice_constant_a.ok_or_else(|| ReferenceError::MissingField {
            formula: formula.clone(),
            field: "lattice_constant_a",
        })?;
        let density = self.density.ok_or_else(|| ReferenceError::MissingField {
            formula: formula.clone(),
            field: "density",
        })?;
        for (field, value) in [("lattice_constant_a", a), ("density", density)] {
            if value.is_nan() || value <= 0.0 {
                return Err(ReferenceError::InvalidValue {
                    formula,
                    field,
                    value,
                });
            }
        }

        Ok(ReferenceRow {
            identifier: self
                .identifier
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("{}-{}", id_prefix, formula)),
            lattice_constant_a: a,
            lattice_constant_b: self.lattice_constant_b.unwrap_or(a),
            lattice_constant_c: self.lattice_constant_c.unwrap_or(a),
            density,
            formation_energy: self.formation_energy.unwrap_or(0.0),
            energy_above_hull: self.energy_above_hull.unwrap_or(0.0),
            crystal_system: self
                .crystal_system
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            formula,
        })
    }
}

// ============================================================================
// LITERATURE TABLE (NIST / ASM Handbook)
// ============================================================================

struct ElementReference {
    lattice_a: f64,
    density: f64,
    crystal: &'static str,
}

fn element_reference(element: &str) -> Option<ElementReference> {
    let (lattice_a, density, crystal) = match element {
        "Cu" => (3.6147, 8.96, "Fm-3m"),
        "Ni" => (3.5238, 8.90, "Fm-3m"),
        "Al" => (4.0495, 2.70, "Fm-3m"),
        "Mg" => (3.2094, 1.74, "P63/mmc"),
        "Fe" => (2.8665, 7.87, "Im-3m"),
        "Co" => (3.5447, 8.90, "Fm-3m"),
        "Ti" => (2.9508, 4.51, "P63/mmc"),
        "V" => (3.0240, 6.11, "Im-3m"),
        "Cr" => (2.8846, 7.19, "Im-3m"),
        "Zn" => (2.6650, 7.14, "P63/mmc"),
        _ => return None,
    };
    Some(ElementReference {
        lattice_a,
        density,
        crystal,
    })
}

/// Mixing energy assigned to Vegard rows.
const VEGARD_FORMATION_ENERGY: f64 = -0.01;

/// Pure-element rows plus Vegard's-law equimolar rows for every pair and, for
/// a ternary, the full system. Empty when any element is not tabulated.
pub fn literature_rows(elements: &[String]) -> Vec<ReferenceRow> {
    let mut table = Vec::with_capacity(elements.len());
    for e in elements {
        match element_reference(e) {
            Some(r) => table.push((e.as_str(), r)),
            None => {
                log::warn!("📚 No literature data for {}; literature table unavailable", e);
                return Vec::new();
            }
        }
    }

    let mut rows: Vec<ReferenceRow> = table
        .iter()
        .map(|(e, r)| ReferenceRow {
            identifier: format!("MANUAL-{}", e),
            formula: e.to_string(),
            lattice_constant_a: r.lattice_a,
            lattice_constant_b: r.lattice_a,
            lattice_constant_c: r.lattice_a,
            density: r.density,
            formation_energy: 0.0,
            energy_above_hull: 0.0,
            crystal_system: r.crystal.to_string(),
        })
        .collect();

    let mut subsets: Vec<Vec<usize>> = Vec::new();
    for i in 0..table.len() {
        for j in (i + 1)..table.len() {
            subsets.push(vec![i, j]);
        }
    }
    if table.len() == 3 {
        subsets.push(vec![0, 1, 2]);
    }

    for subset in subsets {
        let k = subset.len() as f64;
        let a = subset.iter().map(|&i| table[i].1.lattice_a).sum::<f64>() / k;
        let rho = subset.iter().map(|&i| table[i].1.density).sum::<f64>() / k;
        let formula = Formula::from_symbols(subset.iter().map(|&i| table[i].0)).to_string();
        rows.push(ReferenceRow {
            identifier: format!("MANUAL-{}", formula),
            formula,
            lattice_constant_a: a,
            lattice_constant_b: a,
            lattice_constant_c: a,
            density: rho,
            formation_energy: VEGARD_FORMATION_ENERGY,
            energy_above_hull: 0.0,
            crystal_system: table[subset[0]].1.crystal.to_string(),
        });
    }
    rows
}

/// User table. Required columns: formula, lattice_constant_a (or
/// exp_lattice_a), density (or exp_density).
pub fn load_custom_csv(path: &Path) -> Result<Vec<ReferenceRow>, ReferenceError> {
    let csv_err = |source| ReferenceError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let mut rows = Vec::new();
    for rec in reader.deserialize::<RawReferenceRow>() {
        let raw = rec.map_err(csv_err)?;
        rows.push(raw.into_row("CUSTOM")?);
    }
    log::info!("📂 Loaded {} custom reference rows from {:?}", rows.len(), path);
    Ok(rows)
}

/// Same reduced formula -> keep the row with the lowest energy above hull.
pub fn dedupe_by_formula(rows: Vec<ReferenceRow>) -> Vec<ReferenceRow> {
    let mut best: BTreeMap<String, ReferenceRow> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for row in rows {
        let key = normalize_formula(&row.formula);
        match best.get(&key) {
            Some(existing) if existing.energy_above_hull <= row.energy_above_hull => {}
            Some(_) => {
                best.insert(key, row);
            }
            None => {
                order.push(key.clone());
                best.insert(key, row);
            }
        }
    }
    order.into_iter().filter_map(|k| best.remove(&k)).collect()
}

/// GCD-reduced canonical form; unparsable formulas are kept verbatim.
pub fn normalize_formula(formula: &str) -> String {
    Formula::parse(formula)
        .map(|f| f.reduced().to_string())
        .unwrap_or_else(|_| formula.trim().to_string())
}

// ============================================================================
// SOURCES
// ============================================================================

pub enum ReferenceSource {
    /// Remote materials database behind the miner command.
    Live(Arc<dyn Miner>),
    Literature,
    Custom(PathBuf),
}

impl ReferenceSource {
    pub fn name(&self) -> &'static str {
        match self {
            ReferenceSource::Live(_) => "live",
            ReferenceSource::Literature => "literature",
            ReferenceSource::Custom(_) => "custom",
        }
    }

    pub async fn fetch(&self, elements: &[String]) -> Result<Vec<ReferenceRow>, ReferenceError> {
        match self {
            ReferenceSource::Live(miner) => {
                miner
                    .fetch_references(elements)
                    .await
                    .map_err(|e| ReferenceError::Unavailable {
                        source_name: self.name().to_string(),
                        reason: format!("{:#}", e),
                    })
            }
            ReferenceSource::Literature => Ok(literature_rows(elements)),
            ReferenceSource::Custom(path) => load_custom_csv(path),
        }
    }

    /// Ordered fallback list for `mode`.
    pub fn chain(
        mode: ReferenceMode,
        miner: Option<Arc<dyn Miner>>,
        custom_path: Option<PathBuf>,
    ) -> Vec<ReferenceSource> {
        match mode {
            ReferenceMode::Auto => {
                let mut chain = Vec::new();
                if let Some(m) = miner {
                    chain.push(ReferenceSource::Live(m));
                }
                chain.push(ReferenceSource::Literature);
                chain
            }
            ReferenceMode::Live => miner.map(ReferenceSource::Live).into_iter().collect(),
            ReferenceMode::Literature => vec![ReferenceSource::Literature],
            ReferenceMode::Custom => custom_path
                .map(ReferenceSource::Custom)
                .into_iter()
                .collect(),
        }
    }
}

/// Walks `chain` until a source yields in-system rows. Rows are restricted
/// to the chemical system and deduplicated by formula.
pub async fn resolve_references(
    chain: &[ReferenceSource],
    system: &ChemicalSystem,
) -> (Option<&'static str>, Vec<ReferenceRow>) {
    for source in chain {
        match source.fetch(&system.elements).await {
            Ok(rows) => {
                let rows: Vec<ReferenceRow> = rows
                    .into_iter()
                    .filter(|r| {
                        Formula::parse(&r.formula)
                            .map(|f| system.contains(&f))
                            .unwrap_or(false)
                    })
                    .collect();
                if rows.is_empty() {
                    log::warn!(
                        "⚠️ Reference source '{}' has no rows for {}",
                        source.name(),
                        system
                    );
                    continue;
                }
                let rows = dedupe_by_formula(rows);
                log::info!(
                    "📚 {} reference rows for {} from '{}'",
                    rows.len(),
                    system,
                    source.name()
                );
                return (Some(source.name()), rows);
            }
            Err(e) => {
                log::warn!("⚠️ {}", e);
            }
        }
    }
    (None, Vec::new())
}
