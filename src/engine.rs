// src/engine.rs
//
// =============================================================================
// ALLOYSCREEN: SIMULATION ENGINE (v 0.1 )
// =============================================================================
//
// The Workbench.
//
// Responsibilities:
// 1. Relaxation: FIRE minimisation of atomic positions (single + batched).
// 2. Dynamics: velocity Verlet with Berendsen coupling (single, batched,
//    multi-temperature), frames persisted through the trajectory store.
//
// Both runners borrow a calculator for the duration of a call and never keep
// it, so the caller decides which worker owns which device context.

pub mod md;
pub mod relax;

pub use md::{MdOutcome, MdParams, MdRunner};
pub use relax::{BatchRelaxer, RelaxOutcome, Relaxer};

/// eV/(Å·amu) -> Å/fs².
pub const ACCEL_CONVERSION: f64 = 9.648_533_2e-3;

/// amu·Å²/fs² -> eV.
pub const KINETIC_CONVERSION: f64 = 1.0 / ACCEL_CONVERSION;
