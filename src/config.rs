// src/config.rs
//
// =============================================================================
// ALLOYSCREEN: SCREENING CONFIGURATION (v 0.1 )
// =============================================================================
//
// The Control Tower.
//
// Responsibilities:
// 1. Parse the YAML run file into an immutable `ScreeningConfig`.
// 2. Fill every omitted field with its documented default.
// 3. Reject inconsistent settings before any calculator is booted.
// 4. Fingerprint the effective configuration for run provenance.
//
// The value is built once in `main` and handed out as `Arc<ScreeningConfig>`.

use crate::core::ChemicalSystem;
use crate::provenance::sha256_bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// 1. ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Unreadable composition source {path:?}: {reason}")]
    CompositionSource { path: PathBuf, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ============================================================================
// 2. SECTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    #[default]
    Generated,
    Mined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    /// Binary ratio step `s ∈ (0, 0.5]`.
    pub ratio_step: f64,
    pub binary_mode: CompositionMode,
    /// Integer sums enumerated by the ternary generator.
    pub ternary_sums: Vec<u32>,
    pub ternary_mode: CompositionMode,
    /// Drop ternary partitions whose reduced triple was already produced.
    pub dedupe_reduced: bool,
    /// Cap on mined binary ratios.
    pub max_mined_ratios: Option<usize>,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            ratio_step: 0.1,
            binary_mode: CompositionMode::Generated,
            ternary_sums: vec![3, 4, 5, 6],
            ternary_mode: CompositionMode::Generated,
            dedupe_reduced: false,
            max_mined_ratios: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Supercell multiplicity along each axis for binary alloys.
    pub supercell_size: usize,
    /// Supercell multiplicity for ternary alloys and their end-members.
    pub ternary_supercell_size: usize,
    /// Seed for substitution shuffles. Each composition derives its own stream.
    pub seed: u64,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            supercell_size: 4,
            ternary_supercell_size: 3,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaxConfig {
    /// Convergence threshold on the largest per-atom force (eV/Å).
    pub fmax: f64,
    pub max_steps: usize,
    /// Largest displacement of one atom in one step (Å).
    pub max_step: f64,
    pub save_trajectory: bool,
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            fmax: 0.05,
            max_steps: 200,
            max_step: 0.2,
            save_trajectory: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// eV/atom above the hull still counted as stable.
    pub threshold: f64,
    pub ternary_threshold: Option<f64>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            ternary_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Ensemble {
    /// Isothermal-isobaric: the cell breathes.
    #[default]
    Npt,
    /// Isothermal-isochoric: fixed cell.
    Nvt,
}

impl Ensemble {
    pub fn tag(&self) -> &'static str {
        match self {
            Ensemble::Npt => "npt",
            Ensemble::Nvt => "nvt",
        }
    }
}

/// How the last partial save interval is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FramePolicy {
    /// One frame after every `save_interval`-th step.
    #[default]
    Floor,
    /// As `Floor`, plus the final step when a remainder exists.
    Ceil,
}

impl FramePolicy {
    pub fn expected_frames(&self, steps: usize, save_interval: usize) -> usize {
        let base = steps / save_interval;
        match self {
            FramePolicy::Floor => base,
            FramePolicy::Ceil => base + usize::from(steps % save_interval != 0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdConfig {
    pub enabled: bool,
    /// One independent run per temperature (K).
    pub temperatures: Vec<f64>,
    pub steps: usize,
    pub time_step_fs: f64,
    pub save_interval: usize,
    pub ensemble: Ensemble,
    pub frame_policy: FramePolicy,
    /// Thermostat relaxation time (fs).
    pub thermostat_tau_fs: f64,
    /// Barostat relaxation time (fs), NPT only.
    pub barostat_tau_fs: f64,
    /// Target pressure (GPa), NPT only.
    pub pressure_gpa: f64,
    /// Isothermal compressibility used by the barostat (1/GPa).
    pub compressibility_per_gpa: f64,
    /// Structures smaller than this are doubled along every axis first.
    pub min_atoms: usize,
    pub seed: u64,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            temperatures: vec![1000.0],
            steps: 5000,
            time_step_fs: 1.0,
            save_interval: 50,
            ensemble: Ensemble::Npt,
            frame_policy: FramePolicy::Floor,
            thermostat_tau_fs: 25.0,
            barostat_tau_fs: 75.0,
            pressure_gpa: 0.0,
            compressibility_per_gpa: 0.01,
            min_atoms: 200,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Leading share of frames treated as equilibration.
    pub equilibration_fraction: f64,
    /// Strict upper bound on σ(T)/⟨T⟩ × 100.
    pub max_temperature_fluctuation_pct: f64,
    /// Strict upper bound on |ΔV/V| × 100.
    pub max_volume_change_pct: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            equilibration_fraction: 0.2,
            max_temperature_fluctuation_pct: 10.0,
            max_volume_change_pct: 15.0,
        }
    }
}

/// Which energy oracle backs the calculators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OracleConfig {
    /// Persistent learned-potential daemon speaking JSON lines.
    Daemon {
        #[serde(default = "default_python")]
        python: String,
        script: PathBuf,
        #[serde(default)]
        model_path: Option<PathBuf>,
        #[serde(default)]
        expected_model_hash: Option<String>,
        #[serde(default = "default_handshake_timeout")]
        handshake_timeout_s: u64,
    },
    /// Built-in pair potential used when no daemon is available.
    LennardJones {
        #[serde(default = "default_lj_epsilon")]
        epsilon: f64,
        #[serde(default = "default_lj_cutoff")]
        cutoff_sigmas: f64,
    },
}

fn default_python() -> String {
    "python".to_string()
}
fn default_handshake_timeout() -> u64 {
    60
}
fn default_lj_epsilon() -> f64 {
    0.4
}
fn default_lj_cutoff() -> f64 {
    2.5
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig::LennardJones {
            epsilon: default_lj_epsilon(),
            cutoff_sigmas: default_lj_cutoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Compositions handed to the batched relaxer at once.
    pub ratio_batch_size: usize,
    /// Concurrent MD workers, each with its own calculator.
    pub md_workers: usize,
    /// Run several systems at once, one per accelerator device.
    pub system_parallel: bool,
    /// Override for the detected accelerator count.
    pub num_devices: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            ratio_batch_size: 4,
            md_workers: 1,
            system_parallel: false,
            num_devices: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    Csv,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub enabled: bool,
    /// Resume from this report instead of the latest one.
    pub pinned_report: Option<PathBuf>,
    pub backend: StateBackend,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pinned_report: None,
            backend: StateBackend::Csv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// Live source first, literature table on failure.
    #[default]
    Auto,
    Live,
    Literature,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub mode: ReferenceMode,
    /// CSV table used in `custom` mode.
    pub custom_path: Option<PathBuf>,
}

/// External command used for ratio mining and live reference rows.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MinerConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_s: Option<u64>,
}

/// CSV file whose `formula` column seeds the list of systems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionSource {
    pub path: PathBuf,
    #[serde(default)]
    pub max_systems: Option<usize>,
    #[serde(default = "default_true")]
    pub include_ternary: bool,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// 3. THE ROOT CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Explicit systems, e.g. `["Cu-Ni", "Fe-Cr-Ni"]`.
    pub systems: Vec<String>,
    pub composition_source: Option<CompositionSource>,
    /// Root directory for reports, trajectories and snapshots.
    pub output_dir: PathBuf,

    pub composition: CompositionConfig,
    pub structure: StructureConfig,
    pub relax: RelaxConfig,
    pub stability: StabilityConfig,
    pub md: MdConfig,
    pub analysis: AnalysisConfig,
    pub oracle: OracleConfig,
    pub parallel: ParallelConfig,
    pub resume: ResumeConfig,
    pub validation: ValidationConfig,
    pub miner: MinerConfig,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            systems: vec!["Cu-Ni".to_string()],
            composition_source: None,
            output_dir: PathBuf::from("data/final_results"),
            composition: CompositionConfig::default(),
            structure: StructureConfig::default(),
            relax: RelaxConfig::default(),
            stability: StabilityConfig::default(),
            md: MdConfig::default(),
            analysis: AnalysisConfig::default(),
            oracle: OracleConfig::default(),
            parallel: ParallelConfig::default(),
            resume: ResumeConfig::default(),
            validation: ValidationConfig::default(),
            miner: MinerConfig::default(),
        }
    }
}

impl ScreeningConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: ScreeningConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.composition;
        if !(c.ratio_step > 0.0 && c.ratio_step <= 0.5) {
            return Err(invalid(
                "composition.ratio_step",
                format!("{} is outside (0, 0.5]", c.ratio_step),
            ));
        }
        if let Some(bad) = c.ternary_sums.iter().find(|&&t| t < 3) {
            return Err(invalid(
                "composition.ternary_sums",
                format!("sum {} cannot hold three positive parts", bad),
            ));
        }

        if self.structure.supercell_size == 0 || self.structure.ternary_supercell_size == 0 {
            return Err(invalid("structure.supercell_size", "must be at least 1"));
        }

        if self.relax.fmax <= 0.0 || self.relax.max_step <= 0.0 {
            return Err(invalid("relax", "fmax and max_step must be positive"));
        }

        if self.stability.threshold < 0.0 {
            return Err(invalid("stability.threshold", "must be non-negative"));
        }

        let md = &self.md;
        if md.enabled {
            if md.temperatures.is_empty() || md.temperatures.iter().any(|t| *t <= 0.0) {
                return Err(invalid("md.temperatures", "need at least one positive temperature"));
            }
            if md.steps == 0 || md.save_interval == 0 {
                return Err(invalid("md", "steps and save_interval must be at least 1"));
            }
            if md.time_step_fs <= 0.0 || md.thermostat_tau_fs <= 0.0 {
                return Err(invalid("md", "time_step_fs and thermostat_tau_fs must be positive"));
            }
        }

        let a = &self.analysis;
        if !(0.0..1.0).contains(&a.equilibration_fraction) {
            return Err(invalid(
                "analysis.equilibration_fraction",
                format!("{} is outside [0, 1)", a.equilibration_fraction),
            ));
        }

        let p = &self.parallel;
        if p.ratio_batch_size == 0 || p.md_workers == 0 {
            return Err(invalid("parallel", "ratio_batch_size and md_workers must be at least 1"));
        }
        if p.system_parallel && p.md_workers > 1 && p.num_devices == Some(1) {
            return Err(invalid(
                "parallel",
                "system_parallel and md_workers > 1 cannot combine on a single device",
            ));
        }

        if self.validation.enabled
            && self.validation.mode == ReferenceMode::Custom
            && self.validation.custom_path.is_none()
        {
            return Err(invalid("validation.custom_path", "required in custom mode"));
        }

        if self.systems.is_empty() && self.composition_source.is_none() {
            return Err(invalid("systems", "no systems and no composition_source"));
        }
        for s in &self.systems {
            s.parse::<ChemicalSystem>()
                .map_err(|e| invalid("systems", e.to_string()))?;
        }

        Ok(())
    }

    /// Hull threshold for a system of `n` elements.
    pub fn stability_threshold(&self, n_elements: usize) -> f64 {
        match (n_elements, self.stability.ternary_threshold) {
            (3, Some(t)) => t,
            _ => self.stability.threshold,
        }
    }

    /// SHA-256 of the canonical JSON form.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        sha256_bytes(&bytes)
    }

    pub fn trajectory_dir(&self) -> PathBuf {
        self.output_dir.join("trajectories")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.output_dir.join("structures")
    }
}
