// src/drivers.rs
//
// =============================================================================
// ALLOYSCREEN: CALCULATOR MODULE & INTERFACE (v 0.1 )
// =============================================================================
//
// The Hexagonal Port.
//
// Responsibilities:
// 1. Define the `Calculator` trait (The Contract): energy, forces, stress.
// 2. Dispatch `OracleConfig` variants to concrete implementations.
// 3. Hand out one calculator per worker; handles are never shared.
//
// A calculator is not reentrant. `evaluate` takes `&mut self`, so the borrow
// checker forbids two concurrent calls against the same device context.

use crate::config::OracleConfig;
use crate::core::{ElectronVolts, Structure};
use crate::resources::Sandbox;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod daemon;
pub mod lennard_jones;

/// 1 eV/Å³ in GPa.
pub const EV_PER_A3_TO_GPA: f64 = 160.217_663_4;

// ============================================================================
// 1. THE CALCULATOR TRAIT (The Contract)
// ============================================================================

/// Single-point result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub energy: ElectronVolts,
    /// Per-atom forces in eV/Å.
    pub forces: Vec<[f64; 3]>,
    /// Cauchy stress in eV/Å³ (ASE sign convention: negative under compression).
    pub stress: Option<[[f64; 3]; 3]>,
}

impl Evaluation {
    /// Largest per-atom force norm.
    pub fn fmax(&self) -> f64 {
        self.forces
            .iter()
            .map(|f| (f[0] * f[0] + f[1] * f[1] + f[2] * f[2]).sqrt())
            .fold(0.0, f64::max)
    }

    /// Virial pressure in eV/Å³ (kinetic part excluded).
    pub fn virial_pressure(&self) -> Option<f64> {
        self.stress.map(|s| -(s[0][0] + s[1][1] + s[2][2]) / 3.0)
    }
}

#[async_trait]
pub trait Calculator: Send {
    /// The primary entry point: one single-point evaluation.
    async fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation>;

    /// Short label for logs (`daemon@gpu[0]`, `lj`).
    fn label(&self) -> String;

    /// Releases external resources. Default: nothing to release.
    async fn shutdown(&mut self) {}
}

// ============================================================================
// 2. THE DISPATCHER (The Factory)
// ============================================================================

/// Builds a fresh calculator bound to a sandbox.
#[async_trait]
pub trait CalculatorFactory: Send + Sync {
    async fn create(&self, sandbox: &Sandbox) -> Result<Box<dyn Calculator>>;
}

pub struct DriverFactory {
    oracle: OracleConfig,
}

impl DriverFactory {
    pub fn new(oracle: OracleConfig) -> Self {
        Self { oracle }
    }
}

#[async_trait]
impl CalculatorFactory for DriverFactory {
    async fn create(&self, sandbox: &Sandbox) -> Result<Box<dyn Calculator>> {
        match &self.oracle {
            // 1. Learned potential behind a persistent daemon
            OracleConfig::Daemon {
                python,
                script,
                model_path,
                expected_model_hash,
                handshake_timeout_s,
            } => Ok(Box::new(daemon::DaemonCalculator::new(
                daemon::DaemonSpec {
                    python: python.clone(),
                    script: script.clone(),
                    model_path: model_path.clone(),
                    expected_model_hash: expected_model_hash.clone(),
                    handshake_timeout_s: *handshake_timeout_s,
                },
                sandbox.clone(),
            ))),

            // 2. Built-in pair potential
            OracleConfig::LennardJones {
                epsilon,
                cutoff_sigmas,
            } => Ok(Box::new(lennard_jones::LennardJonesCalculator::new(
                *epsilon,
                *cutoff_sigmas,
            ))),
        }
    }
}
