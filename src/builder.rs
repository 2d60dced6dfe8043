// src/builder.rs
//
// =============================================================================
// ALLOYSCREEN: STRUCTURE BUILDER (v 0.1 )
// =============================================================================
//
// The Foundry.
//
// Responsibilities:
// 1. Hold the per-element lattice templates (family + lattice constant).
// 2. Build conventional fcc / bcc / orthohexagonal hcp cells.
// 3. Expand them into supercells and substitute species at random sites.
// 4. Keep substitution reproducible: one RNG stream per composition.

use crate::core::{Angstroms, Atom, Lattice, Structure};
use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// 1. LATTICE TEMPLATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrystalFamily {
    Fcc,
    Bcc,
    Hcp,
}

impl CrystalFamily {
    /// Closest-packed cubic first.
    pub fn priority(&self) -> u8 {
        match self {
            CrystalFamily::Fcc => 3,
            CrystalFamily::Bcc => 2,
            CrystalFamily::Hcp => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeTemplate {
    pub family: CrystalFamily,
    pub a: Angstroms,
}

/// Ideal c/a for the hcp template.
const HCP_C_OVER_A: f64 = 1.633;

/// Preferred ground-state structure of common metals (Materials Project / ICSD).
pub fn lattice_template(element: &str) -> Option<LatticeTemplate> {
    use CrystalFamily::*;
    let (family, a) = match element {
        // Light metals
        "Li" => (Bcc, 3.51),
        "Be" => (Hcp, 2.29),
        "Mg" => (Hcp, 3.21),
        "Al" => (Fcc, 4.05),
        // 3d
        "Ti" => (Hcp, 2.95),
        "V" => (Bcc, 3.03),
        "Cr" => (Bcc, 2.88),
        "Mn" => (Bcc, 8.91), // alpha-Mn approximated as bcc
        "Fe" => (Bcc, 2.87),
        "Co" => (Hcp, 2.51),
        "Ni" => (Fcc, 3.52),
        "Cu" => (Fcc, 3.61),
        "Zn" => (Hcp, 2.66),
        // 4d
        "Zr" => (Hcp, 3.23),
        "Nb" => (Bcc, 3.30),
        "Mo" => (Bcc, 3.15),
        "Tc" => (Hcp, 2.74),
        "Ru" => (Hcp, 2.71),
        "Rh" => (Fcc, 3.80),
        "Pd" => (Fcc, 3.89),
        "Ag" => (Fcc, 4.09),
        "Cd" => (Hcp, 2.98),
        // 5d
        "Hf" => (Hcp, 3.20),
        "Ta" => (Bcc, 3.31),
        "W" => (Bcc, 3.16),
        "Re" => (Hcp, 2.76),
        "Os" => (Hcp, 2.74),
        "Ir" => (Fcc, 3.84),
        "Pt" => (Fcc, 3.92),
        "Au" => (Fcc, 4.08),
        _ => return None,
    };
    Some(LatticeTemplate {
        family,
        a: Angstroms(a),
    })
}

/// Unknown elements fall back to fcc with a = 4.0 Å.
pub fn template_or_default(element: &str) -> LatticeTemplate {
    lattice_template(element).unwrap_or(LatticeTemplate {
        family: CrystalFamily::Fcc,
        a: Angstroms(4.0),
    })
}

/// Single-species conventional cell for `template`.
pub fn conventional_cell(element: &str, template: LatticeTemplate) -> Structure {
    let a = template.a.0;
    let (lattice, basis): (Lattice, Vec<[f64; 3]>) = match template.family {
        CrystalFamily::Fcc => (
            Lattice::orthorhombic(a, a, a),
            vec![
                [0.0, 0.0, 0.0],
                [0.0, 0.5, 0.5],
                [0.5, 0.0, 0.5],
                [0.5, 0.5, 0.0],
            ],
        ),
        CrystalFamily::Bcc => (
            Lattice::orthorhombic(a, a, a),
            vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]],
        ),
        // Orthohexagonal setting: a x sqrt(3)a x c, 4 atoms.
        CrystalFamily::Hcp => (
            Lattice::orthorhombic(a, 3f64.sqrt() * a, HCP_C_OVER_A * a),
            vec![
                [0.0, 0.0, 0.0],
                [0.5, 0.5, 0.0],
                [0.0, 1.0 / 3.0, 0.5],
                [0.5, 5.0 / 6.0, 0.5],
            ],
        ),
    };

    let atoms = basis
        .into_iter()
        .map(|f| Atom::new(element, lattice.to_cartesian(f)))
        .collect();

    let family = match template.family {
        CrystalFamily::Fcc => "fcc",
        CrystalFamily::Bcc => "bcc",
        CrystalFamily::Hcp => "hcp",
    };
    Structure::new(atoms, lattice, format!("lattice_builder:{}", family))
}

// ============================================================================
// 2. THE GENERATOR INTERFACE
// ============================================================================

pub trait StructureGenerator: Send + Sync {
    /// Pure-element supercell, `multiplicity` repetitions per axis.
    fn pure(&self, element: &str, multiplicity: usize) -> Result<Structure>;

    /// Substitutional alloy on the lattice of `base_element`.
    ///
    /// `species` lists every element with its target site fraction. Site
    /// counts are floored and the remainder goes to the first entry.
    fn alloy(
        &self,
        base_element: &str,
        species: &[(String, f64)],
        multiplicity: usize,
    ) -> Result<Structure>;
}

// ============================================================================
// 3. THE LATTICE BUILDER
// ============================================================================

pub struct LatticeBuilder {
    seed: u64,
}

impl LatticeBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

/// A stable RNG stream per (seed, key), so results do not depend on the order
/// requests are served in.
pub fn seeded_rng(seed: u64, key: &str) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest[..32]);
    StdRng::from_seed(bytes)
}

/// Floors every share and hands the remainder to the first species.
pub fn site_counts(total_sites: usize, fractions: &[f64]) -> Vec<usize> {
    let mut counts: Vec<usize> = fractions
        .iter()
        .map(|f| (total_sites as f64 * f.max(0.0)).floor() as usize)
        .collect();
    let assigned: usize = counts.iter().sum();
    if let Some(first) = counts.first_mut() {
        if assigned < total_sites {
            *first += total_sites - assigned;
        }
    }
    counts
}

impl StructureGenerator for LatticeBuilder {
    fn pure(&self, element: &str, multiplicity: usize) -> Result<Structure> {
        if multiplicity == 0 {
            return Err(anyhow!("Supercell multiplicity must be at least 1"));
        }
        let cell = conventional_cell(element, template_or_default(element));
        Ok(cell.repeat([multiplicity; 3]))
    }

    fn alloy(
        &self,
        base_element: &str,
        species: &[(String, f64)],
        multiplicity: usize,
    ) -> Result<Structure> {
        if species.is_empty() {
            return Err(anyhow!("Alloy needs at least one species"));
        }
        let total_fraction: f64 = species.iter().map(|(_, f)| f).sum();
        if (total_fraction - 1.0).abs() > 1e-6 {
            return Err(anyhow!(
                "Site fractions must sum to 1.0, got {:.6}",
                total_fraction
            ));
        }

        let mut structure = self.pure(base_element, multiplicity)?;
        let n = structure.len();

        let fractions: Vec<f64> = species.iter().map(|(_, f)| *f).collect();
        let counts = site_counts(n, &fractions);

        if species.len() > 1 && counts[1..].iter().all(|c| *c == 0) {
            log::warn!(
                "Supercell of {} sites too small to place any dopant of {:?}",
                n,
                species
            );
        }

        let key = format!(
            "{}|{}|{}",
            base_element,
            multiplicity,
            species
                .iter()
                .map(|(e, f)| format!("{}:{:.6}", e, f))
                .collect::<Vec<_>>()
                .join(",")
        );
        let mut rng = seeded_rng(self.seed, &key);
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut rng);

        let mut offset = 0;
        for ((element, _), count) in species.iter().zip(counts) {
            let end = (offset + count).min(n);
            for &idx in &indices[offset..end] {
                structure.atoms[idx].symbol = element.clone();
            }
            offset = end;
        }

        structure.source = format!("{}+substitution", structure.source);
        Ok(structure)
    }
}
