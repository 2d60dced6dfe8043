// src/composition.rs
//
// =============================================================================
// ALLOYSCREEN: COMPOSITION GENERATOR (v 0.1 )
// =============================================================================
//
// The Recipe Book.
//
// Responsibilities:
// 1. Binary ratio grids strictly inside (0, 1), snapped to 10 decimals.
// 2. Ternary integer partitions, generated or mined.
// 3. Silent fallback from mined to generated when the miner has nothing.
// 4. Base-element selection by crystal-family priority (fcc > bcc > hcp).

use crate::builder::lattice_template;
use crate::config::{CompositionConfig, CompositionMode};
use crate::core::{gcd_all, ChemicalSystem, Composition, Formula};
use crate::miner::Miner;
use std::collections::HashSet;
use std::sync::Arc;

const SNAP_DECIMALS: f64 = 1e10;

fn snap(x: f64) -> f64 {
    (x * SNAP_DECIMALS).round() / SNAP_DECIMALS
}

// ============================================================================
// 1. PURE FUNCTIONS
// ============================================================================

/// `{s, 2s, ...}` strictly inside (0, 1). Pure elements are handled separately.
pub fn binary_ratios(step: f64) -> Vec<f64> {
    if !(step > 0.0 && step <= 0.5) {
        return Vec::new();
    }
    // Small slack so 1/s for exact divisors is not floored one short.
    let n = (1.0 / step + 1e-9).floor() as usize;
    (1..=n)
        .map(|k| snap(k as f64 * step))
        .filter(|r| *r > 0.0 && *r < 1.0)
        .collect()
}

/// Ordered positive triples for every sum, lexicographic in `a` then `b`.
/// Triples from different sums are kept even if they reduce to the same ratio.
pub fn ternary_partitions(sums: &[u32]) -> Vec<[u32; 3]> {
    let mut out = Vec::new();
    for &total in sums {
        if total < 3 {
            continue;
        }
        for a in 1..total - 1 {
            for b in 1..total - a {
                let c = total - a - b;
                if c >= 1 {
                    out.push([a, b, c]);
                }
            }
        }
    }
    out
}

/// Reduces a triple to lowest terms.
pub fn reduce_partition(parts: [u32; 3]) -> [u32; 3] {
    let g = gcd_all(parts.iter().map(|p| *p as u64)) as u32;
    if g <= 1 {
        return parts;
    }
    [parts[0] / g, parts[1] / g, parts[2] / g]
}

/// Keeps the first occurrence of each reduced triple.
pub fn dedupe_reduced(parts: Vec<[u32; 3]>) -> Vec<[u32; 3]> {
    let mut seen = HashSet::new();
    parts
        .into_iter()
        .filter(|p| seen.insert(reduce_partition(*p)))
        .collect()
}

/// Mined formulas -> dopant fractions, rounded to 3 decimals, sorted, unique.
pub fn mined_binary_ratios(formulas: &[String], system: &ChemicalSystem) -> Vec<f64> {
    let dopant = &system.elements[1];
    let mut ratios: Vec<f64> = formulas
        .iter()
        .filter_map(|f| Formula::parse(f).ok())
        .filter(|f| system.contains(f))
        .map(|f| (f.fraction(dopant) * 1000.0).round() / 1000.0)
        .filter(|r| *r > 0.0 && *r < 1.0)
        .collect();
    ratios.sort_by(|a, b| a.total_cmp(b));
    ratios.dedup();
    ratios
}

/// Mined formulas -> reduced integer triples in system order, deduplicated.
/// Formulas missing any of the three elements are skipped.
pub fn mined_ternary_partitions(formulas: &[String], system: &ChemicalSystem) -> Vec<[u32; 3]> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for f in formulas {
        let Ok(formula) = Formula::parse(f) else {
            log::debug!("Ignoring unparsable mined formula '{}'", f);
            continue;
        };
        if !system.contains(&formula) {
            continue;
        }
        let counts: Vec<u64> = system.elements.iter().map(|e| formula.count(e)).collect();
        if counts.iter().any(|c| *c == 0) {
            continue;
        }
        let g = gcd_all(counts.iter().copied());
        let triple = [
            (counts[0] / g) as u32,
            (counts[1] / g) as u32,
            (counts[2] / g) as u32,
        ];
        if seen.insert(triple) {
            out.push(triple);
        }
    }
    out
}

/// Family priority of `element`; elements without a template rank last.
fn base_priority(element: &str) -> u8 {
    lattice_template(element)
        .map(|t| t.family.priority())
        .unwrap_or(0)
}

/// Highest crystal-family priority wins; ties go to the lexicographically
/// first symbol. Unknown elements rank below hcp.
pub fn select_base_element(elements: &[String]) -> Option<String> {
    elements
        .iter()
        .max_by(|a, b| {
            let pa = base_priority(a);
            let pb = base_priority(b);
            // Reverse the name comparison so the smaller symbol is "greater".
            pa.cmp(&pb).then_with(|| b.cmp(a))
        })
        .cloned()
}

// ============================================================================
// 2. THE GENERATOR
// ============================================================================

pub struct CompositionGenerator {
    cfg: CompositionConfig,
    miner: Option<Arc<dyn Miner>>,
}

impl CompositionGenerator {
    pub fn new(cfg: CompositionConfig, miner: Option<Arc<dyn Miner>>) -> Self {
        Self { cfg, miner }
    }

    /// All non-pure compositions to screen for `system`.
    pub async fn compositions(&self, system: &ChemicalSystem) -> Vec<Composition> {
        if system.is_ternary() {
            self.ternary(system).await
        } else {
            self.binary(system).await
        }
    }

    pub fn pure_compositions(system: &ChemicalSystem) -> Vec<Composition> {
        system
            .elements
            .iter()
            .map(|e| Composition::Pure { element: e.clone() })
            .collect()
    }

    async fn binary(&self, system: &ChemicalSystem) -> Vec<Composition> {
        let mut ratios = Vec::new();

        if self.cfg.binary_mode == CompositionMode::Mined {
            if let Some(formulas) = self.mine(system).await {
                ratios = mined_binary_ratios(&formulas, system);
                if let Some(cap) = self.cfg.max_mined_ratios {
                    ratios.truncate(cap);
                }
            }
            if ratios.is_empty() {
                log::info!("   ↪ No mined ratios for {}, using generated grid", system);
            }
        }

        if ratios.is_empty() {
            ratios = binary_ratios(self.cfg.ratio_step);
        }

        let base = system.elements[0].clone();
        let dopant = system.elements[1].clone();
        ratios
            .into_iter()
            .map(|fraction| Composition::Binary {
                base: base.clone(),
                dopant: dopant.clone(),
                fraction,
            })
            .collect()
    }

    async fn ternary(&self, system: &ChemicalSystem) -> Vec<Composition> {
        let mut parts = Vec::new();

        if self.cfg.ternary_mode == CompositionMode::Mined {
            if let Some(formulas) = self.mine(system).await {
                parts = mined_ternary_partitions(&formulas, system);
                if let Some(cap) = self.cfg.max_mined_ratios {
                    parts.truncate(cap);
                }
            }
            if parts.is_empty() {
                log::info!("   ↪ No mined partitions for {}, using generated sums", system);
            }
        }

        if parts.is_empty() {
            parts = ternary_partitions(&self.cfg.ternary_sums);
        }

        if self.cfg.dedupe_reduced {
            parts = dedupe_reduced(parts);
        }

        let elements = [
            system.elements[0].clone(),
            system.elements[1].clone(),
            system.elements[2].clone(),
        ];
        parts
            .into_iter()
            .map(|p| Composition::Ternary {
                elements: elements.clone(),
                parts: p,
            })
            .collect()
    }

    /// Miner failures are logged and reported as "no data".
    async fn mine(&self, system: &ChemicalSystem) -> Option<Vec<String>> {
        let miner = self.miner.as_ref()?;
        match miner.mine_formulas(&system.elements).await {
            Ok(f) if !f.is_empty() => Some(f),
            Ok(_) => None,
            Err(e) => {
                log::warn!("⚠️ Miner failed for {}: {:#}", system, e);
                None
            }
        }
    }
}
