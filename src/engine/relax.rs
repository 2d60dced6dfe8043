// src/engine/relax.rs
//
// Structure relaxation (FIRE) and its batched driver.
//
// Contract: a failed relaxation never raises. Divergence, non-convergence,
// a calculator error or a structure rejected by the sanity gate all come back
// as `energy_per_atom = +inf` with the input structure untouched.

use crate::config::RelaxConfig;
use crate::core::Structure;
use crate::drivers::Calculator;
use crate::physics::SanityCheck;
use crate::trajectory::{
    Frame, TrajectoryHandle, TrajectoryHeader, TrajectoryKind, TrajectoryRecord, TrajectoryStore,
};
use anyhow::{anyhow, Result};

// FIRE parameters (Bitzek et al., PRL 97, 170201).
const FIRE_DT_START: f64 = 0.1;
const FIRE_DT_MAX: f64 = 1.0;
const FIRE_N_MIN: usize = 5;
const FIRE_F_INC: f64 = 1.1;
const FIRE_F_DEC: f64 = 0.5;
const FIRE_ALPHA_START: f64 = 0.1;
const FIRE_F_ALPHA: f64 = 0.99;

#[derive(Debug, Clone)]
pub struct RelaxOutcome {
    pub structure: Structure,
    /// `f64::INFINITY` marks a failed relaxation.
    pub energy_per_atom: f64,
    pub converged: bool,
    pub steps: usize,
    pub trajectory: Option<TrajectoryHandle>,
    pub error: Option<String>,
}

impl RelaxOutcome {
    pub fn is_success(&self) -> bool {
        self.energy_per_atom.is_finite()
    }

    fn failed(structure: &Structure, steps: usize, error: String) -> Self {
        Self {
            structure: structure.clone(),
            energy_per_atom: f64::INFINITY,
            converged: false,
            steps,
            trajectory: None,
            error: Some(error),
        }
    }
}

struct FireResult {
    structure: Structure,
    energy: f64,
    converged: bool,
    steps: usize,
    frames: Vec<Frame>,
}

pub struct Relaxer {
    cfg: RelaxConfig,
    store: Option<TrajectoryStore>,
}

impl Relaxer {
    /// `store` is only used when `cfg.save_trajectory` is set.
    pub fn new(cfg: RelaxConfig, store: Option<TrajectoryStore>) -> Self {
        let store = if cfg.save_trajectory { store } else { None };
        Self { cfg, store }
    }

    pub async fn relax(&self, calc: &mut dyn Calculator, structure: &Structure) -> RelaxOutcome {
        if let Err(e) = structure.validate_physics() {
            log::warn!(
                "⚠️ Rejected {} before relaxation: {}",
                structure.reduced_formula(),
                e
            );
            return RelaxOutcome::failed(structure, 0, e.to_string());
        }

        let result = match self.fire(calc, structure).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("⚠️ Relaxation of {} failed: {:#}", structure.reduced_formula(), e);
                return RelaxOutcome::failed(structure, 0, format!("{:#}", e));
            }
        };

        if !result.converged {
            log::warn!(
                "⚠️ {} did not converge within {} steps (fmax {})",
                structure.reduced_formula(),
                self.cfg.max_steps,
                self.cfg.fmax
            );
            return RelaxOutcome::failed(
                structure,
                result.steps,
                format!("not converged after {} steps", result.steps),
            );
        }

        let energy_per_atom = result.energy / structure.len() as f64;

        let trajectory = match &self.store {
            Some(store) => match self.persist(store, &result.structure, &result.frames) {
                Ok(h) => Some(h),
                Err(e) => {
                    log::warn!("Could not persist relaxation trajectory: {:#}", e);
                    None
                }
            },
            None => None,
        };

        RelaxOutcome {
            structure: result.structure,
            energy_per_atom,
            converged: true,
            steps: result.steps,
            trajectory,
            error: None,
        }
    }

    async fn fire(&self, calc: &mut dyn Calculator, start: &Structure) -> Result<FireResult> {
        let n = start.len();
        let mut s = start.clone();
        let mut pos = s.positions();
        let mut vel = vec![[0.0f64; 3]; n];
        let mut dt = FIRE_DT_START;
        let mut alpha = FIRE_ALPHA_START;
        let mut n_pos = 0usize;
        let mut frames = Vec::new();

        for step in 0..=self.cfg.max_steps {
            s.set_positions(&pos);
            let eval = calc.evaluate(&s).await?;
            if !eval.energy.0.is_finite() {
                return Err(anyhow!("non-finite energy at step {}", step));
            }
            if eval.forces.len() != n {
                return Err(anyhow!("calculator returned {} forces for {} atoms", eval.forces.len(), n));
            }

            frames.push(Frame {
                step,
                positions: pos.clone(),
                cell: s.lattice.vectors,
                volume: s.lattice.volume(),
                temperature: 0.0,
                potential_energy: eval.energy.0,
            });

            if eval.fmax() <= self.cfg.fmax {
                return Ok(FireResult {
                    structure: s,
                    energy: eval.energy.0,
                    converged: true,
                    steps: step,
                    frames,
                });
            }
            if step == self.cfg.max_steps {
                break;
            }

            let f = &eval.forces;
            let vf: f64 = (0..n).map(|i| dot(vel[i], f[i])).sum();

            if vf > 0.0 {
                let v_norm = (0..n).map(|i| dot(vel[i], vel[i])).sum::<f64>().sqrt();
                let f_norm = (0..n).map(|i| dot(f[i], f[i])).sum::<f64>().sqrt();
                if f_norm > 0.0 {
                    for i in 0..n {
                        for k in 0..3 {
                            vel[i][k] = (1.0 - alpha) * vel[i][k] + alpha * v_norm * f[i][k] / f_norm;
                        }
                    }
                }
                if n_pos > FIRE_N_MIN {
                    dt = (dt * FIRE_F_INC).min(FIRE_DT_MAX);
                    alpha *= FIRE_F_ALPHA;
                }
                n_pos += 1;
            } else {
                vel.iter_mut().for_each(|v| *v = [0.0; 3]);
                alpha = FIRE_ALPHA_START;
                dt *= FIRE_F_DEC;
                n_pos = 0;
            }

            let mut dr = vec![[0.0f64; 3]; n];
            for i in 0..n {
                for k in 0..3 {
                    vel[i][k] += dt * f[i][k];
                    dr[i][k] = dt * vel[i][k];
                }
            }
            let dr_norm = dr.iter().map(|d| dot(*d, *d)).sum::<f64>().sqrt();
            let scale = if dr_norm > self.cfg.max_step {
                self.cfg.max_step / dr_norm
            } else {
                1.0
            };
            for i in 0..n {
                for k in 0..3 {
                    pos[i][k] += scale * dr[i][k];
                }
            }
        }

        let last = frames.last().map(|f| f.potential_energy).unwrap_or(f64::INFINITY);
        Ok(FireResult {
            structure: s,
            energy: last,
            converged: false,
            steps: self.cfg.max_steps,
            frames,
        })
    }

    fn persist(
        &self,
        store: &TrajectoryStore,
        relaxed: &Structure,
        frames: &[Frame],
    ) -> Result<TrajectoryHandle> {
        let formula = relaxed.reduced_formula();
        let tag = relaxed
            .composition
            .as_ref()
            .map(|c| c.tag())
            .unwrap_or_else(|| relaxed.id.simple().to_string()[..8].to_string());

        let mut writer = store.create(&TrajectoryStore::relax_stem(&formula, &tag))?;
        writer.append(&TrajectoryRecord::Header(TrajectoryHeader {
            kind: TrajectoryKind::Relax,
            formula,
            composition_tag: tag,
            target_temperature: None,
            ensemble: None,
            n_atoms: relaxed.len(),
            species: relaxed.atoms.iter().map(|a| a.symbol.clone()).collect(),
            created_ms: chrono::Utc::now().timestamp_millis(),
        }))?;
        for f in frames {
            writer.append(&TrajectoryRecord::Frame(f.clone()))?;
        }
        writer.finish()
    }
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

// ============================================================================
// BATCHED DRIVER
// ============================================================================

/// Runs a list through one calculator in sub-batches of `batch_size`.
/// Sub-batching only bounds how much work is in flight per log checkpoint;
/// every member is relaxed exactly as `Relaxer::relax` would.
pub struct BatchRelaxer<'a> {
    relaxer: &'a Relaxer,
    batch_size: usize,
}

impl<'a> BatchRelaxer<'a> {
    pub fn new(relaxer: &'a Relaxer, batch_size: usize) -> Self {
        Self {
            relaxer,
            batch_size: batch_size.max(1),
        }
    }

    /// Output order equals input order.
    pub async fn relax_all(
        &self,
        calc: &mut dyn Calculator,
        structures: &[Structure],
    ) -> Vec<RelaxOutcome> {
        let mut out = Vec::with_capacity(structures.len());
        let n_batches = structures.len().div_ceil(self.batch_size);

        for (b, chunk) in structures.chunks(self.batch_size).enumerate() {
            log::info!(
                "   📦 Relax batch {}/{} ({} structures) on {}",
                b + 1,
                n_batches,
                chunk.len(),
                calc.label()
            );
            for s in chunk {
                out.push(self.relaxer.relax(calc, s).await);
            }
        }

        let ok = out.iter().filter(|o| o.is_success()).count();
        log::info!("   ✅ {}/{} relaxations succeeded", ok, out.len());
        out
    }
}
