// src/main.rs
//
// =============================================================================
// ALLOYSCREEN: COMMANDER & ENTRY POINT (v 0.1 )
// =============================================================================
//
// The wiring center of the entire architecture.
//
// Modes:
// 1. RUN:          Full screening (relax -> hull -> MD -> validation).
// 2. ANALYZE:      Thermal-stability verdict for one trajectory file.
// 3. COMPOSITIONS: Preview the composition grid of a system.
// 4. VALIDATE:     Score an existing pipeline report against references.

use alloyscreen::analysis::TrajectoryAnalyzer;
use alloyscreen::builder::LatticeBuilder;
use alloyscreen::composition::CompositionGenerator;
use alloyscreen::drivers::DriverFactory;
use alloyscreen::miner::{CommandMiner, Miner};
use alloyscreen::pipeline::{
    dedupe_simulated, open_state_store, simulated_records, PipelineOrchestrator, SystemPhase,
};
use alloyscreen::state::load_report;
use alloyscreen::trajectory::TrajectoryHandle;
use alloyscreen::validation::reference::{dedupe_by_formula, resolve_references, ReferenceSource};
use alloyscreen::validation::Validator;
use alloyscreen::{ChemicalSystem, ScreeningConfig};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "alloyscreen",
    version,
    about = "High-throughput alloy stability screening"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Screen every configured chemical system.
    Run {
        /// YAML screening config. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `output_dir`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Resume from this report (or SQLite state file) instead of the latest.
        #[arg(long)]
        resume_from: Option<PathBuf>,

        /// Start from scratch even if the config enables resume.
        #[arg(long)]
        fresh: bool,
    },

    /// Analyse one MD trajectory file.
    Analyze {
        #[arg(long)]
        trajectory: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List the compositions a system would be screened at.
    Compositions {
        /// e.g. "Cu-Ni" or "Fe-Cr-Ni".
        #[arg(long)]
        system: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a finished pipeline report against experimental references.
    Validate {
        #[arg(long)]
        report: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Where to write the per-pair CSV.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match cli.command {
        Commands::Run {
            config,
            output,
            resume_from,
            fresh,
        } => run_pipeline(config, output, resume_from, fresh).await,
        Commands::Analyze { trajectory, config } => run_analyze(trajectory, config),
        Commands::Compositions { system, config } => run_compositions(system, config).await,
        Commands::Validate {
            report,
            config,
            out,
        } => run_validate(report, config, out).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<ScreeningConfig> {
    match path {
        Some(p) => ScreeningConfig::load(p).with_context(|| format!("Loading config {:?}", p)),
        None => {
            log::info!("ℹ️ No config given; using defaults");
            Ok(ScreeningConfig::default())
        }
    }
}

fn build_miner(cfg: &ScreeningConfig) -> Option<Arc<dyn Miner>> {
    CommandMiner::from_config(&cfg.miner).map(|m| Arc::new(m) as Arc<dyn Miner>)
}

// ============================================================================
// 3. RUN
// ============================================================================

async fn run_pipeline(
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    resume_from: Option<PathBuf>,
    fresh: bool,
) -> Result<()> {
    let mut cfg = load_config(config.as_deref())?;
    if let Some(dir) = output {
        cfg.output_dir = dir;
    }
    if fresh {
        cfg.resume.enabled = false;
        cfg.resume.pinned_report = None;
    }
    cfg.validate()?;

    let store = open_state_store(&cfg, resume_from.as_deref())?;
    log::info!("💾 State: {}", store.location());

    let miner = build_miner(&cfg);
    let factory = Arc::new(DriverFactory::new(cfg.oracle.clone()));
    let generator = Arc::new(LatticeBuilder::new(cfg.structure.seed));

    let mut orchestrator =
        PipelineOrchestrator::new(Arc::new(cfg), factory, generator, miner, store);
    let summary = orchestrator.run().await?;

    let failed = summary
        .systems
        .iter()
        .filter(|s| s.phase == SystemPhase::Failed)
        .count();
    if failed == summary.systems.len() {
        return Err(anyhow!("All {} systems failed", failed));
    }
    if failed > 0 {
        log::warn!("⚠️ {} of {} systems failed", failed, summary.systems.len());
    }
    Ok(())
}

// ============================================================================
// 4. UTILITIES
// ============================================================================

fn run_analyze(trajectory: PathBuf, config: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config.as_deref())?;
    let analyzer = TrajectoryAnalyzer::from_config(&cfg.analysis);
    let result = analyzer.analyze(&TrajectoryHandle::new(trajectory))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_compositions(system: String, config: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config.as_deref())?;
    let system: ChemicalSystem = system.parse()?;
    let generator = CompositionGenerator::new(cfg.composition.clone(), build_miner(&cfg));

    for c in CompositionGenerator::pure_compositions(&system) {
        println!("{}", c.tag());
    }
    let alloys = generator.compositions(&system).await;
    for c in &alloys {
        println!("{}", c.tag());
    }
    log::info!("📋 {} alloy compositions for {}", alloys.len(), system);
    Ok(())
}

async fn run_validate(report: PathBuf, config: Option<PathBuf>, out: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config.as_deref())?;
    let records = load_report(&report)?;
    if records.is_empty() {
        return Err(anyhow!("Report {:?} has no rows", report));
    }

    let chain = ReferenceSource::chain(
        cfg.validation.mode,
        build_miner(&cfg),
        cfg.validation.custom_path.clone(),
    );
    let systems: BTreeSet<String> = records.iter().map(|r| r.system.clone()).collect();

    let mut references = Vec::new();
    let mut sources = BTreeSet::new();
    for name in systems {
        let system: ChemicalSystem = match name.parse() {
            Ok(s) => s,
            Err(e) => {
                log::warn!("⚠️ Skipping system `{}`: {}", name, e);
                continue;
            }
        };
        let (source, rows) = resolve_references(&chain, &system).await;
        sources.extend(source);
        references.extend(rows);
    }

    let source = (!sources.is_empty()).then(|| sources.into_iter().collect::<Vec<_>>().join("+"));
    let references = dedupe_by_formula(references);
    let simulated = dedupe_simulated(simulated_records(&records));
    let validation = Validator::new(simulated).validate(&references, source.as_deref());
    validation.log_summary();

    if let Some(path) = out {
        validation.write_csv(&path)?;
        log::info!("📝 Validation written to {:?}", path);
    }
    Ok(())
}
