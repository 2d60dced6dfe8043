// src/engine/md.rs
//
// Velocity-Verlet molecular dynamics with Berendsen coupling.
//
// NVT: velocities rescaled towards the target temperature every step.
// NPT: additionally, the cell and positions are scaled isotropically towards
//      the target pressure (requires the calculator to report stress).
//
// Units: Å, fs, amu, eV.

use crate::builder::seeded_rng;
use crate::config::{Ensemble, FramePolicy, MdConfig};
use crate::core::Structure;
use crate::drivers::{Calculator, Evaluation, EV_PER_A3_TO_GPA};
use crate::engine::{ACCEL_CONVERSION, KINETIC_CONVERSION};
use crate::physics::{atomic_mass, BOLTZMANN_EV_K};
use crate::trajectory::{
    Frame, TrajectoryHandle, TrajectoryHeader, TrajectoryKind, TrajectoryRecord, TrajectoryStore,
};
use anyhow::{anyhow, Context, Result};
use rand::Rng;

// Per-step bounds on the coupling factors; keeps a bad first step from
// blowing up the run.
const THERMOSTAT_CLAMP: (f64, f64) = (0.9, 1.1);
const BAROSTAT_CLAMP: (f64, f64) = (0.99, 1.01);

#[derive(Debug, Clone, Copy)]
pub struct MdParams {
    pub temperature: f64,
    pub steps: usize,
    pub time_step_fs: f64,
    pub save_interval: usize,
}

impl MdParams {
    pub fn from_config(cfg: &MdConfig, temperature: f64) -> Self {
        Self {
            temperature,
            steps: cfg.steps,
            time_step_fs: cfg.time_step_fs,
            save_interval: cfg.save_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MdOutcome {
    pub temperature: f64,
    pub final_structure: Structure,
    pub handle: TrajectoryHandle,
    pub frames: usize,
}

pub struct MdRunner {
    cfg: MdConfig,
    store: TrajectoryStore,
}

/// Instantaneous kinetic temperature, T = 2 KE / (3 N kB).
pub fn kinetic_temperature(masses: &[f64], velocities: &[[f64; 3]]) -> f64 {
    if masses.is_empty() {
        return 0.0;
    }
    let ke: f64 = masses
        .iter()
        .zip(velocities)
        .map(|(m, v)| 0.5 * m * (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]))
        .sum::<f64>()
        * KINETIC_CONVERSION;
    2.0 * ke / (3.0 * masses.len() as f64 * BOLTZMANN_EV_K)
}

/// Maxwell-Boltzmann velocities (Å/fs) with zero total momentum, rescaled so
/// the kinetic temperature equals `temperature` exactly.
pub fn maxwell_boltzmann<R: Rng>(masses: &[f64], temperature: f64, rng: &mut R) -> Vec<[f64; 3]> {
    let mut v: Vec<[f64; 3]> = masses
        .iter()
        .map(|m| {
            let sigma = (BOLTZMANN_EV_K * temperature / (m * KINETIC_CONVERSION)).sqrt();
            [
                sigma * standard_normal(rng),
                sigma * standard_normal(rng),
                sigma * standard_normal(rng),
            ]
        })
        .collect();

    let total_mass: f64 = masses.iter().sum();
    if total_mass > 0.0 {
        let mut p = [0.0; 3];
        for (m, vi) in masses.iter().zip(&v) {
            for k in 0..3 {
                p[k] += m * vi[k];
            }
        }
        for vi in v.iter_mut() {
            for k in 0..3 {
                vi[k] -= p[k] / total_mass;
            }
        }
    }

    let current = kinetic_temperature(masses, &v);
    if current > 0.0 {
        let scale = (temperature / current).sqrt();
        for vi in v.iter_mut() {
            for x in vi.iter_mut() {
                *x *= scale;
            }
        }
    }
    v
}

// Box-Muller.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn should_save(policy: FramePolicy, step: usize, steps: usize, interval: usize) -> bool {
    if step % interval == 0 {
        return true;
    }
    policy == FramePolicy::Ceil && step == steps
}

fn accelerations(eval: &Evaluation, masses: &[f64]) -> Vec<[f64; 3]> {
    eval.forces
        .iter()
        .zip(masses)
        .map(|(f, m)| {
            let s = ACCEL_CONVERSION / m;
            [f[0] * s, f[1] * s, f[2] * s]
        })
        .collect()
}

impl MdRunner {
    pub fn new(cfg: MdConfig, store: TrajectoryStore) -> Self {
        Self { cfg, store }
    }

    pub fn config(&self) -> &MdConfig {
        &self.cfg
    }

    /// Small cells are doubled along every axis.
    pub fn prepare(&self, structure: &Structure) -> Structure {
        if structure.len() < self.cfg.min_atoms {
            let mut big = structure.repeat([2, 2, 2]);
            big.id = structure.id;
            big
        } else {
            structure.clone()
        }
    }

    /// One trajectory. `index` disambiguates batch members sharing a formula.
    pub async fn run(
        &self,
        calc: &mut dyn Calculator,
        structure: &Structure,
        params: MdParams,
        index: Option<usize>,
    ) -> Result<MdOutcome> {
        if params.save_interval == 0 || params.steps == 0 {
            return Err(anyhow!("MD needs steps >= 1 and save_interval >= 1"));
        }
        let mut s = self.prepare(structure);
        if s.is_empty() {
            return Err(anyhow!("MD on an empty structure"));
        }
        let n = s.len();
        let formula = s.reduced_formula();
        let ensemble = self.cfg.ensemble;
        let stem = TrajectoryStore::md_stem(&formula, params.temperature, ensemble.tag(), index);

        log::info!(
            "   🔥 MD {} @ {:.0} K ({}, {} atoms, {} steps) on {}",
            formula,
            params.temperature,
            ensemble.tag(),
            n,
            params.steps,
            calc.label()
        );

        let masses: Vec<f64> = s.atoms.iter().map(|a| atomic_mass(&a.symbol)).collect();
        let mut rng = seeded_rng(self.cfg.seed, &stem);
        let mut vel = maxwell_boltzmann(&masses, params.temperature, &mut rng);
        let mut pos = s.positions();

        let mut writer = self.store.create(&stem)?;
        writer.append(&TrajectoryRecord::Header(TrajectoryHeader {
            kind: TrajectoryKind::Md,
            formula: formula.clone(),
            composition_tag: s.composition.as_ref().map(|c| c.tag()).unwrap_or_default(),
            target_temperature: Some(params.temperature),
            ensemble: Some(ensemble.tag().to_string()),
            n_atoms: n,
            species: s.atoms.iter().map(|a| a.symbol.clone()).collect(),
            created_ms: chrono::Utc::now().timestamp_millis(),
        }))?;

        let dt = params.time_step_fs;
        let mut eval = calc
            .evaluate(&s)
            .await
            .with_context(|| format!("Initial evaluation of {} failed", formula))?;
        let mut acc = accelerations(&eval, &masses);
        let mut barostat_warned = false;

        for step in 1..=params.steps {
            // 1. Half kick + drift
            for i in 0..n {
                for k in 0..3 {
                    vel[i][k] += 0.5 * dt * acc[i][k];
                    pos[i][k] += dt * vel[i][k];
                }
            }
            s.set_positions(&pos);

            // 2. New forces, second half kick
            eval = calc.evaluate(&s).await?;
            if !eval.energy.0.is_finite() || eval.forces.len() != n {
                // `writer` is dropped unfinished and removes the partial file.
                return Err(anyhow!("MD of {} diverged at step {}", formula, step));
            }
            acc = accelerations(&eval, &masses);
            for i in 0..n {
                for k in 0..3 {
                    vel[i][k] += 0.5 * dt * acc[i][k];
                }
            }

            // 3. Thermostat
            let t_inst = kinetic_temperature(&masses, &vel);
            let mut t_now = t_inst;
            if t_inst > 0.0 {
                let lambda = (1.0 + dt / self.cfg.thermostat_tau_fs * (params.temperature / t_inst - 1.0))
                    .max(0.0)
                    .sqrt()
                    .clamp(THERMOSTAT_CLAMP.0, THERMOSTAT_CLAMP.1);
                for v in vel.iter_mut() {
                    for x in v.iter_mut() {
                        *x *= lambda;
                    }
                }
                t_now = t_inst * lambda * lambda;
            }

            // 4. Barostat
            if ensemble == Ensemble::Npt {
                match eval.virial_pressure() {
                    Some(p_virial) => {
                        let volume = s.lattice.volume();
                        let p_kin = n as f64 * BOLTZMANN_EV_K * t_now / volume;
                        let p_gpa = (p_kin + p_virial) * EV_PER_A3_TO_GPA;
                        let mu = (1.0
                            - self.cfg.compressibility_per_gpa * dt / self.cfg.barostat_tau_fs
                                * (self.cfg.pressure_gpa - p_gpa))
                            .max(0.0)
                            .cbrt()
                            .clamp(BAROSTAT_CLAMP.0, BAROSTAT_CLAMP.1);
                        s.lattice = s.lattice.scaled(mu);
                        for p in pos.iter_mut() {
                            for x in p.iter_mut() {
                                *x *= mu;
                            }
                        }
                        s.set_positions(&pos);
                    }
                    None if !barostat_warned => {
                        log::warn!(
                            "{} reports no stress; NPT run of {} continues at fixed cell",
                            calc.label(),
                            formula
                        );
                        barostat_warned = true;
                    }
                    None => {}
                }
            }

            if should_save(self.cfg.frame_policy, step, params.steps, params.save_interval) {
                writer.append(&TrajectoryRecord::Frame(Frame {
                    step,
                    positions: pos.clone(),
                    cell: s.lattice.vectors,
                    volume: s.lattice.volume(),
                    temperature: t_now,
                    potential_energy: eval.energy.0,
                }))?;
            }
        }

        let frames = writer.frames_written();
        let handle = writer.finish()?;
        log::info!("   💾 {} frames -> {}", frames, handle.file_name());

        Ok(MdOutcome {
            temperature: params.temperature,
            final_structure: s,
            handle,
            frames,
        })
    }

    /// Independent runs from the same start structure, one per temperature.
    pub async fn run_multi_temperature(
        &self,
        calc: &mut dyn Calculator,
        structure: &Structure,
        temperatures: &[f64],
    ) -> Vec<(f64, Result<MdOutcome>)> {
        let mut out = Vec::with_capacity(temperatures.len());
        for &t in temperatures {
            let params = MdParams::from_config(&self.cfg, t);
            let res = self.run(calc, structure, params, None).await;
            if let Err(e) = &res {
                log::warn!("⚠️ MD at {:.0} K failed: {:#}", t, e);
            }
            out.push((t, res));
        }
        out
    }

    /// One trajectory per structure, indexed by position in `structures`.
    pub async fn run_batch(
        &self,
        calc: &mut dyn Calculator,
        structures: &[Structure],
        temperature: f64,
    ) -> Vec<Result<MdOutcome>> {
        let params = MdParams::from_config(&self.cfg, temperature);
        let mut out = Vec::with_capacity(structures.len());
        for (i, s) in structures.iter().enumerate() {
            let res = self.run(calc, s, params, Some(i)).await;
            if let Err(e) = &res {
                log::warn!("⚠️ MD batch member {} ({}) failed: {:#}", i, s.reduced_formula(), e);
            }
            out.push(res);
        }
        out
    }
}
