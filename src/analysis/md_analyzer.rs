// src/analysis/md_analyzer.rs
//
// Reduces an MD trajectory to a thermal-stability verdict.
//
// The first ceil(f * N) frames are equilibration and are never analyzed.
// The window is fixed, not adaptive.

use crate::config::AnalysisConfig;
use crate::trajectory::{Frame, Trajectory, TrajectoryHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Equilibration discards {discarded} of {total} frames; nothing left to analyze")]
    EmptyAnalysisWindow { total: usize, discarded: usize },
    #[error("Trajectory declares zero atoms")]
    NoAtoms,
    #[error("Could not read trajectory {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MDResult {
    pub avg_temperature: f64,
    pub temperature_fluctuation_pct: f64,
    pub avg_energy_per_atom: f64,
    pub volume_change_pct: f64,
    pub is_thermally_stable: bool,
    /// Frames actually analyzed (after equilibration).
    pub frame_count: usize,
}

pub struct TrajectoryAnalyzer {
    equilibration_fraction: f64,
    max_temperature_fluctuation_pct: f64,
    max_volume_change_pct: f64,
}

impl Default for TrajectoryAnalyzer {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

impl TrajectoryAnalyzer {
    pub fn from_config(cfg: &AnalysisConfig) -> Self {
        Self {
            equilibration_fraction: cfg.equilibration_fraction,
            max_temperature_fluctuation_pct: cfg.max_temperature_fluctuation_pct,
            max_volume_change_pct: cfg.max_volume_change_pct,
        }
    }

    /// Frames dropped from the front of an `total`-frame trajectory.
    pub fn discarded_frames(&self, total: usize) -> usize {
        let raw = self.equilibration_fraction * total as f64;
        // Guard against 0.2 * 100 landing a hair above 20.
        ((raw - 1e-9).ceil().max(0.0) as usize).min(total)
    }

    pub fn analyze(&self, handle: &TrajectoryHandle) -> Result<MDResult, AnalysisError> {
        let traj = Trajectory::load(handle).map_err(|e| AnalysisError::Unreadable {
            path: handle.path.display().to_string(),
            reason: format!("{:#}", e),
        })?;
        self.analyze_frames(&traj.frames, traj.n_atoms())
    }

    pub fn analyze_frames(&self, frames: &[Frame], n_atoms: usize) -> Result<MDResult, AnalysisError> {
        if n_atoms == 0 {
            return Err(AnalysisError::NoAtoms);
        }
        let total = frames.len();
        let discarded = self.discarded_frames(total);
        let window = &frames[discarded..];
        if window.is_empty() {
            return Err(AnalysisError::EmptyAnalysisWindow { total, discarded });
        }

        let n = window.len() as f64;
        let avg_temperature = window.iter().map(|f| f.temperature).sum::<f64>() / n;
        let variance = window
            .iter()
            .map(|f| (f.temperature - avg_temperature).powi(2))
            .sum::<f64>()
            / n;
        let temperature_fluctuation_pct = if avg_temperature == 0.0 {
            0.0
        } else {
            variance.sqrt() * 100.0 / avg_temperature
        };

        let avg_energy_per_atom =
            window.iter().map(|f| f.potential_energy).sum::<f64>() / n / n_atoms as f64;

        let v_first = window[0].volume;
        let v_last = window[window.len() - 1].volume;
        let volume_change_pct = if v_first == 0.0 {
            0.0
        } else {
            (v_last - v_first) * 100.0 / v_first
        };

        let is_thermally_stable = temperature_fluctuation_pct < self.max_temperature_fluctuation_pct
            && volume_change_pct.abs() < self.max_volume_change_pct;

        Ok(MDResult {
            avg_temperature,
            temperature_fluctuation_pct,
            avg_energy_per_atom,
            volume_change_pct,
            is_thermally_stable,
            frame_count: window.len(),
        })
    }
}
