// src/drivers/lennard_jones.rs
//
// =============================================================================
// ALLOYSCREEN: LENNARD-JONES FALLBACK CALCULATOR (v 0.1 )
// =============================================================================
//
// The Stand-In.
//
// A shifted 12-6 pair potential used when no learned-potential daemon is
// configured. Per-element σ is derived from the nearest-neighbour distance of
// the element's lattice template; unlike pairs use Lorentz-Berthelot mixing.
// Periodic images are enumerated explicitly, so small cells are handled
// correctly even when the cutoff exceeds half a cell width.

use crate::builder::{template_or_default, CrystalFamily};
use crate::core::{ElectronVolts, Structure};
use crate::drivers::{Calculator, Evaluation};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;

pub struct LennardJonesCalculator {
    epsilon: f64,
    cutoff_sigmas: f64,
}

impl LennardJonesCalculator {
    pub fn new(epsilon: f64, cutoff_sigmas: f64) -> Self {
        Self {
            epsilon,
            cutoff_sigmas,
        }
    }

    /// σ placing the pair minimum at the template nearest-neighbour distance.
    pub fn sigma_for(element: &str) -> f64 {
        let t = template_or_default(element);
        let a = t.a.0;
        let nn = match t.family {
            CrystalFamily::Fcc => a / 2f64.sqrt(),
            CrystalFamily::Bcc => a * 3f64.sqrt() / 2.0,
            CrystalFamily::Hcp => a,
        };
        nn / 2f64.powf(1.0 / 6.0)
    }

    fn pair(&self, sigma: f64, r2: f64) -> (f64, f64) {
        // Returns (energy, -dV/dr / r).
        let s2 = sigma * sigma / r2;
        let s6 = s2 * s2 * s2;
        let s12 = s6 * s6;
        let e = 4.0 * self.epsilon * (s12 - s6);
        let f_over_r = 24.0 * self.epsilon * (2.0 * s12 - s6) / r2;
        (e, f_over_r)
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: [f64; 3]) -> f64 {
    (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
}

#[async_trait]
impl Calculator for LennardJonesCalculator {
    async fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation> {
        let n = structure.len();
        let lattice = &structure.lattice;
        let volume = lattice.volume();
        let inv = lattice
            .inverse()
            .ok_or_else(|| anyhow!("Degenerate cell (volume {:.3e})", volume))?;

        let mut sigmas: HashMap<&str, f64> = HashMap::new();
        for a in &structure.atoms {
            sigmas
                .entry(a.symbol.as_str())
                .or_insert_with(|| Self::sigma_for(&a.symbol));
        }
        let max_sigma = sigmas.values().copied().fold(0.0, f64::max);
        let rc_max = self.cutoff_sigmas * max_sigma;

        // Images needed along each axis: ceil(rc / perpendicular width).
        let v = lattice.vectors;
        let mut reach = [0i64; 3];
        for k in 0..3 {
            if !lattice.pbc[k] {
                continue;
            }
            let area = norm(cross(v[(k + 1) % 3], v[(k + 2) % 3]));
            let width = volume / area;
            reach[k] = (rc_max / width).ceil() as i64;
        }

        let mut energy = 0.0;
        let mut forces = vec![[0.0; 3]; n];
        let mut virial = [[0.0; 3]; 3];

        for i in 0..n {
            let si = sigmas[structure.atoms[i].symbol.as_str()];
            let ri = structure.atoms[i].position;
            for j in i..n {
                let sj = sigmas[structure.atoms[j].symbol.as_str()];
                let sigma = 0.5 * (si + sj);
                let rc = self.cutoff_sigmas * sigma;
                let rc2 = rc * rc;
                let (e_shift, _) = self.pair(sigma, rc2);

                let rj = structure.atoms[j].position;
                let d0 = lattice.minimum_image(&inv, [ri[0] - rj[0], ri[1] - rj[1], ri[2] - rj[2]]);

                for na in -reach[0]..=reach[0] {
                    for nb in -reach[1]..=reach[1] {
                        for nc in -reach[2]..=reach[2] {
                            if i == j && na == 0 && nb == 0 && nc == 0 {
                                continue;
                            }
                            let shift = [
                                na as f64 * v[0][0] + nb as f64 * v[1][0] + nc as f64 * v[2][0],
                                na as f64 * v[0][1] + nb as f64 * v[1][1] + nc as f64 * v[2][1],
                                na as f64 * v[0][2] + nb as f64 * v[1][2] + nc as f64 * v[2][2],
                            ];
                            let d = [d0[0] + shift[0], d0[1] + shift[1], d0[2] + shift[2]];
                            let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                            if r2 >= rc2 || r2 < 1e-12 {
                                continue;
                            }
                            let (e, f_over_r) = self.pair(sigma, r2);
                            // Self-images are counted from both ends of the loop.
                            let w = if i == j { 0.5 } else { 1.0 };
                            energy += w * (e - e_shift);

                            let f = [f_over_r * d[0], f_over_r * d[1], f_over_r * d[2]];
                            if i != j {
                                for k in 0..3 {
                                    forces[i][k] += f[k];
                                    forces[j][k] -= f[k];
                                }
                            }
                            for a in 0..3 {
                                for b in 0..3 {
                                    virial[a][b] += w * d[a] * f[b];
                                }
                            }
                        }
                    }
                }
            }
        }

        if !energy.is_finite() {
            return Err(anyhow!("Lennard-Jones energy diverged"));
        }

        let mut stress = [[0.0; 3]; 3];
        for a in 0..3 {
            for b in 0..3 {
                stress[a][b] = -virial[a][b] / volume;
            }
        }

        Ok(Evaluation {
            energy: ElectronVolts(energy),
            forces,
            stress: Some(stress),
        })
    }

    fn label(&self) -> String {
        "lennard_jones".to_string()
    }
}
