// src/physics.rs
//
// =============================================================================
// ALLOYSCREEN: SEMANTIC VALIDATOR (v 0.1 )
// =============================================================================
//
// The Gatekeeper.
// Uses KD-Trees for O(N log N) spatial checks.
//
// Every structure passes through here before it reaches a calculator, so a
// builder bug (stacked atoms, collapsed cell) surfaces as a clean failure
// record instead of a diverging relaxation.

use crate::core::Structure;
use anyhow::{anyhow, Result};
use kdtree::distance::squared_euclidean;
use kdtree::KdTree;

// ============================================================================
// 1. CONSTANTS & MASS TABLE
// ============================================================================

const CONVERSION_AMU_ANG_TO_G_CM3: f64 = 1.660539;

/// Boltzmann constant in eV/K.
pub const BOLTZMANN_EV_K: f64 = 8.617333262e-5;

/// Closest approach tolerated between two atoms, in Å.
pub const MIN_INTERATOMIC_DISTANCE: f64 = 0.7;

pub fn atomic_mass(symbol: &str) -> f64 {
    match symbol {
        "H" => 1.008,
        "He" => 4.0026,
        "Li" => 6.94,
        "Be" => 9.012,
        "B" => 10.81,
        "C" => 12.011,
        "N" => 14.007,
        "O" => 15.999,
        "Na" => 22.99,
        "Mg" => 24.305,
        "Al" => 26.982,
        "Si" => 28.085,
        "K" => 39.098,
        "Ca" => 40.078,
        "Sc" => 44.956,
        "Ti" => 47.867,
        "V" => 50.942,
        "Cr" => 51.996,
        "Mn" => 54.938,
        "Fe" => 55.845,
        "Co" => 58.933,
        "Ni" => 58.693,
        "Cu" => 63.546,
        "Zn" => 65.38,
        "Ga" => 69.723,
        "Ge" => 72.63,
        "Y" => 88.906,
        "Zr" => 91.224,
        "Nb" => 92.906,
        "Mo" => 95.95,
        "Tc" => 98.0,
        "Ru" => 101.07,
        "Rh" => 102.91,
        "Pd" => 106.42,
        "Ag" => 107.87,
        "Cd" => 112.41,
        "In" => 114.82,
        "Sn" => 118.71,
        "Sb" => 121.76,
        "La" => 138.91,
        "Ce" => 140.12,
        "Hf" => 178.49,
        "Ta" => 180.95,
        "W" => 183.84,
        "Re" => 186.21,
        "Os" => 190.23,
        "Ir" => 192.22,
        "Pt" => 195.08,
        "Au" => 196.97,
        "Pb" => 207.2,
        _ => 100.0,
    }
}

/// amu / Å³ -> g / cm³.
pub fn density_g_cm3(mass_amu: f64, volume_a3: f64) -> f64 {
    if volume_a3 <= 0.0 {
        return 0.0;
    }
    mass_amu / volume_a3 * CONVERSION_AMU_ANG_TO_G_CM3
}

// ============================================================================
// 2. THE CHECKS
// ============================================================================

const MIN_CELL_VOLUME: f64 = 1e-3;
const DENSITY_RANGE: (f64, f64) = (0.1, 30.0);

pub trait SanityCheck {
    /// Fails with the first violated constraint.
    fn validate_physics(&self) -> Result<()>;
}

impl SanityCheck for Structure {
    fn validate_physics(&self) -> Result<()> {
        if self.atoms.is_empty() {
            return Err(anyhow!("Structure has no atoms"));
        }

        let volume = self.lattice.volume();
        if volume < MIN_CELL_VOLUME {
            return Err(anyhow!("Degenerate cell: volume {:.4} Å³", volume));
        }

        if let Some((i, j, d)) = closest_pair(self)? {
            if d < MIN_INTERATOMIC_DISTANCE {
                return Err(anyhow!(
                    "Atoms {}[{}] and {}[{}] overlap ({:.3} Å apart)",
                    self.atoms[i].symbol,
                    i,
                    self.atoms[j].symbol,
                    j,
                    d
                ));
            }
        }

        let rho = self.density();
        if rho < DENSITY_RANGE.0 || rho > DENSITY_RANGE.1 {
            return Err(anyhow!("Implausible density: {:.3} g/cm³", rho));
        }
        Ok(())
    }
}

/// Closest pair of distinct atoms as (i, j, distance), i < j. Cartesian
/// positions only; periodic images are not considered.
pub fn closest_pair(structure: &Structure) -> Result<Option<(usize, usize, f64)>> {
    if structure.atoms.len() < 2 {
        return Ok(None);
    }

    let mut tree: KdTree<f64, usize, [f64; 3]> = KdTree::new(3);
    for (i, atom) in structure.atoms.iter().enumerate() {
        tree.add(atom.position, i)
            .map_err(|e| anyhow!("kd-tree insert failed: {:?}", e))?;
    }

    let mut best: Option<(usize, usize, f64)> = None;
    for (i, atom) in structure.atoms.iter().enumerate() {
        // Self is normally the first hit; with coincident atoms it may not be.
        let hits = tree
            .nearest(&atom.position, 2, &squared_euclidean)
            .map_err(|e| anyhow!("kd-tree query failed: {:?}", e))?;
        for (d2, &j) in hits {
            if j != i && best.map_or(true, |(_, _, b)| d2 < b) {
                best = Some((i.min(j), i.max(j), d2));
            }
        }
    }
    Ok(best.map(|(i, j, d2)| (i, j, d2.sqrt())))
}
