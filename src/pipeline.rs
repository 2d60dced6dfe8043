// src/pipeline.rs
//
// =============================================================================
// ALLOYSCREEN: PIPELINE ORCHESTRATOR (v 0.1 )
// =============================================================================
//
// The Conductor.
//
// Per system:  INIT -> PHASE1 (relax) -> PHASE2 (hull) -> PHASE3 (MD) -> DONE
//              FAILED from any phase; other systems are unaffected.
//
// Responsibilities:
// 1. Resolve the system list (explicit or from a composition-source CSV).
// 2. Consult the state store so completed work is reused, not redone.
// 3. Dispatch: ratio batches on one calculator, an MD worker pool fed from a
//    queue, and optionally one system per accelerator device.
// 4. Own every persistent write (state rows, report, structure snapshots,
//    run summary). System tasks only return outcomes.

use crate::analysis::{StabilityAnalyzer, TrajectoryAnalyzer};
use crate::builder::StructureGenerator;
use crate::composition::{select_base_element, CompositionGenerator};
use crate::config::{ConfigError, OracleConfig, ScreeningConfig, StateBackend};
use crate::core::{ChemicalSystem, Composition, Formula, Structure};
use crate::drivers::{Calculator, CalculatorFactory};
use crate::engine::{BatchRelaxer, MdParams, MdRunner, RelaxOutcome, Relaxer};
use crate::miner::Miner;
use crate::provenance::{sha256_file, RunStamp};
use crate::resources::{ResourceLedger, Sandbox};
use crate::state::{CsvReportStore, SqliteStateStore, StateKey, StateRecord, StateStore};
use crate::trajectory::TrajectoryStore;
use crate::validation::reference::{
    dedupe_by_formula, normalize_formula, resolve_references, ReferenceSource,
};
use crate::validation::{SimulatedRecord, ValidationSummary, Validator};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

// ============================================================================
// 1. SUMMARIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemPhase {
    Init,
    Phase1Running,
    Phase2Running,
    Phase3Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSummary {
    pub system: String,
    pub phase: SystemPhase,
    /// Successfully relaxed structures, end-members included.
    pub total_structures: usize,
    pub failed_relaxations: usize,
    pub stable_count: usize,
    pub md_count: usize,
    /// Rows taken from resume state instead of recomputed.
    pub reused: usize,
    pub error: Option<String>,
}

impl SystemSummary {
    fn new(system: &str) -> Self {
        Self {
            system: system.to_string(),
            phase: SystemPhase::Init,
            total_structures: 0,
            failed_relaxations: 0,
            stable_count: 0,
            md_count: 0,
            reused: 0,
            error: None,
        }
    }

    /// Failed systems report zero counts.
    fn fail(mut self, error: String) -> Self {
        log::error!("❌ System {} failed: {}", self.system, error);
        self.phase = SystemPhase::Failed;
        self.total_structures = 0;
        self.failed_relaxations = 0;
        self.stable_count = 0;
        self.md_count = 0;
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub stamp: RunStamp,
    pub config_fingerprint: String,
    pub state_location: String,
    pub systems: Vec<SystemSummary>,
    pub validation: Option<ValidationSummary>,
}

/// What a system task hands back. Nothing in here has been persisted yet.
struct SystemOutcome {
    summary: SystemSummary,
    records: Vec<(StateRecord, Option<String>)>,
    snapshots: Vec<(PathBuf, Structure)>,
}

// ============================================================================
// 2. SYSTEM DISCOVERY
// ============================================================================

/// Explicit systems first, then those found in the composition source.
pub fn load_systems(cfg: &ScreeningConfig) -> Result<Vec<ChemicalSystem>, ConfigError> {
    let mut systems: Vec<ChemicalSystem> = Vec::new();
    for s in &cfg.systems {
        let sys = s.parse::<ChemicalSystem>().map_err(|e| ConfigError::Invalid {
            field: "systems",
            reason: e.to_string(),
        })?;
        if !systems.contains(&sys) {
            systems.push(sys);
        }
    }

    if let Some(src) = &cfg.composition_source {
        for sys in systems_from_csv(&src.path, src.max_systems, src.include_ternary)? {
            if !systems.contains(&sys) {
                systems.push(sys);
            }
        }
    }
    Ok(systems)
}

/// Scans the `formula` column for binary and ternary element sets. Element
/// order inside a system is alphabetical; `max_systems` caps each arity.
pub fn systems_from_csv(
    path: &Path,
    max_systems: Option<usize>,
    include_ternary: bool,
) -> Result<Vec<ChemicalSystem>, ConfigError> {
    let err = |reason: String| ConfigError::CompositionSource {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| err(e.to_string()))?;
    let headers = reader.headers().map_err(|e| err(e.to_string()))?.clone();
    let col = headers
        .iter()
        .position(|h| h.trim() == "formula")
        .ok_or_else(|| err("no `formula` column".to_string()))?;

    let mut binaries: BTreeSet<Vec<String>> = BTreeSet::new();
    let mut ternaries: BTreeSet<Vec<String>> = BTreeSet::new();
    for row in reader.records() {
        let row = row.map_err(|e| err(e.to_string()))?;
        let Some(raw) = row.get(col) else { continue };
        let Ok(formula) = Formula::parse(raw.trim()) else {
            continue;
        };
        let elements: Vec<String> = formula.elements().map(str::to_string).collect();
        match elements.len() {
            2 => {
                binaries.insert(elements);
            }
            3 if include_ternary => {
                ternaries.insert(elements);
            }
            _ => {}
        }
    }

    let cap = max_systems.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    for set in [binaries, ternaries] {
        for elements in set.into_iter().take(cap) {
            if let Ok(sys) = ChemicalSystem::new(elements) {
                out.push(sys);
            }
        }
    }
    log::info!("📂 {} systems discovered in {:?}", out.len(), path);
    Ok(out)
}

/// Backend per configuration. A pinned report forces resume on.
pub fn open_state_store(
    cfg: &ScreeningConfig,
    pinned: Option<&Path>,
) -> Result<Box<dyn StateStore>> {
    let pinned = pinned.or(cfg.resume.pinned_report.as_deref());
    match cfg.resume.backend {
        StateBackend::Csv => Ok(Box::new(CsvReportStore::open(
            &cfg.output_dir,
            cfg.resume.enabled || pinned.is_some(),
            pinned,
        )?)),
        StateBackend::Sqlite => {
            std::fs::create_dir_all(&cfg.output_dir)
                .with_context(|| format!("Failed to create {:?}", cfg.output_dir))?;
            let path = pinned
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cfg.output_dir.join("pipeline_state.db"));
            Ok(Box::new(SqliteStateStore::open(path)?))
        }
    }
}

// ============================================================================
// 3. THE ORCHESTRATOR
// ============================================================================

/// Everything a system task needs; cheap to clone into a spawned task.
#[derive(Clone)]
struct SystemContext {
    cfg: Arc<ScreeningConfig>,
    factory: Arc<dyn CalculatorFactory>,
    generator: Arc<dyn StructureGenerator>,
    miner: Option<Arc<dyn Miner>>,
}

pub struct PipelineOrchestrator {
    ctx: SystemContext,
    store: Box<dyn StateStore>,
    ledger: ResourceLedger,
}

impl PipelineOrchestrator {
    pub fn new(
        cfg: Arc<ScreeningConfig>,
        factory: Arc<dyn CalculatorFactory>,
        generator: Arc<dyn StructureGenerator>,
        miner: Option<Arc<dyn Miner>>,
        store: Box<dyn StateStore>,
    ) -> Self {
        let ledger = ResourceLedger::detect(cfg.parallel.num_devices);
        Self::with_ledger(cfg, factory, generator, miner, store, ledger)
    }

    /// Fixed resource inventory; used where probing the host is unwanted.
    pub fn with_ledger(
        cfg: Arc<ScreeningConfig>,
        factory: Arc<dyn CalculatorFactory>,
        generator: Arc<dyn StructureGenerator>,
        miner: Option<Arc<dyn Miner>>,
        store: Box<dyn StateStore>,
        ledger: ResourceLedger,
    ) -> Self {
        Self {
            ctx: SystemContext {
                cfg,
                factory,
                generator,
                miner,
            },
            store,
            ledger,
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Full run: every system, validation, run summary.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let cfg = self.ctx.cfg.clone();
        let model_sha = match &cfg.oracle {
            OracleConfig::Daemon {
                model_path: Some(p),
                ..
            } => sha256_file(p).ok(),
            _ => None,
        };
        let mut stamp = RunStamp::begin(cfg.fingerprint(), model_sha);

        let systems = load_systems(&cfg)?;
        if systems.is_empty() {
            return Err(anyhow!("No chemical systems to screen"));
        }
        log::info!("🚀 Screening {} systems -> {:?}", systems.len(), cfg.output_dir);

        let summaries = self.run_systems(&systems).await;

        let validation = if cfg.validation.enabled {
            self.validate(&systems, &summaries).await
        } else {
            None
        };

        stamp.finish();
        let summary = RunSummary {
            stamp,
            config_fingerprint: cfg.fingerprint(),
            state_location: self.store.location(),
            systems: summaries,
            validation,
        };
        write_run_summary(&cfg.output_dir, &summary)?;
        log_final_table(&summary.systems);
        Ok(summary)
    }

    /// Sequential by default; one system per device with system-level
    /// parallelism on a multi-device host.
    pub async fn run_systems(&mut self, systems: &[ChemicalSystem]) -> Vec<SystemSummary> {
        let devices = self.ledger.device_count();
        let parallel = self.ctx.cfg.parallel.system_parallel && devices >= 2;
        if self.ctx.cfg.parallel.system_parallel && !parallel {
            log::warn!(
                "⚠️ System-level parallelism needs >= 2 devices ({} found); running sequentially",
                devices
            );
        }

        if parallel {
            self.run_systems_parallel(systems).await
        } else {
            let sandbox = if devices > 0 {
                Sandbox::for_device(Some(0))
            } else {
                Sandbox::default()
            };
            let mut out = Vec::with_capacity(systems.len());
            for (i, system) in systems.iter().enumerate() {
                log::info!("{}", "=".repeat(70));
                log::info!("🎯 [{}/{}] System {}", i + 1, systems.len(), system);
                let prior = self.store.records_for_system(&system.name());
                let outcome =
                    run_system(self.ctx.clone(), system.clone(), sandbox.clone(), devices, prior).await;
                out.push(self.commit(outcome));
            }
            out
        }
    }

    async fn run_systems_parallel(&mut self, systems: &[ChemicalSystem]) -> Vec<SystemSummary> {
        let mut pending: VecDeque<ChemicalSystem> = systems.iter().cloned().collect();
        let mut set: JoinSet<(Sandbox, SystemOutcome)> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, (String, Sandbox)> = HashMap::new();
        let mut out = Vec::with_capacity(systems.len());

        loop {
            // Fill every free device.
            while let Some(system) = pending.front().cloned() {
                let Some(sandbox) = self.ledger.claim_device() else {
                    break;
                };
                pending.pop_front();
                log::info!("🎯 System {} -> {}", system, sandbox.signature());
                let prior = self.store.records_for_system(&system.name());
                let ctx = self.ctx.clone();
                let name = system.name();
                let task_sandbox = sandbox.clone();
                let handle = set.spawn(async move {
                    let outcome = run_system(ctx, system, task_sandbox.clone(), 1, prior).await;
                    (task_sandbox, outcome)
                });
                running.insert(handle.id(), (name, sandbox));
            }

            match set.join_next_with_id().await {
                Some(Ok((id, (sandbox, outcome)))) => {
                    running.remove(&id);
                    self.ledger.release(&sandbox);
                    out.push(self.commit(outcome));
                }
                Some(Err(e)) => {
                    // A panicked task returns nothing; recover its slot from the books.
                    match running.remove(&e.id()) {
                        Some((name, sandbox)) => {
                            self.ledger.release(&sandbox);
                            out.push(SystemSummary::new(&name).fail(format!("system task aborted: {}", e)));
                        }
                        None => log::error!("Unknown system task aborted: {}", e),
                    }
                }
                None => break,
            }
        }

        for system in pending {
            out.push(SystemSummary::new(&system.name()).fail("no device became available".into()));
        }

        // Completion order is arbitrary; report in input order.
        let order: HashMap<String, usize> = systems
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name(), i))
            .collect();
        out.sort_by_key(|s| order.get(&s.system).copied().unwrap_or(usize::MAX));
        out
    }

    /// Persists one system's outcome. The only place state is written.
    fn commit(&mut self, outcome: SystemOutcome) -> SystemSummary {
        for (path, structure) in &outcome.snapshots {
            if let Err(e) = write_snapshot(path, structure) {
                log::warn!("⚠️ Snapshot {:?} not written: {:#}", path, e);
            }
        }
        for (record, failure) in outcome.records {
            let res = match failure {
                Some(err) => self.store.record_failure(record, &err),
                None => self.store.mark_completed(record),
            };
            if let Err(e) = res {
                log::error!("State write failed: {:#}", e);
            }
        }
        if let Err(e) = self.store.flush() {
            log::error!("State flush failed: {:#}", e);
        }
        outcome.summary
    }

    async fn validate(
        &self,
        systems: &[ChemicalSystem],
        summaries: &[SystemSummary],
    ) -> Option<ValidationSummary> {
        log::info!("{}", "=".repeat(70));
        log::info!("🧪 Validation against experimental references");

        let cfg = &self.ctx.cfg;
        let chain = ReferenceSource::chain(
            cfg.validation.mode,
            self.ctx.miner.clone(),
            cfg.validation.custom_path.clone(),
        );

        let mut references = Vec::new();
        let mut sources: BTreeSet<&'static str> = BTreeSet::new();
        let mut simulated = Vec::new();
        for system in systems {
            let done = summaries
                .iter()
                .any(|s| s.system == system.name() && s.phase == SystemPhase::Done);
            if !done {
                continue;
            }
            simulated.extend(simulated_records(&self.store.records_for_system(&system.name())));
            let (source, rows) = resolve_references(&chain, system).await;
            if let Some(s) = source {
                sources.insert(s);
            }
            references.extend(rows);
        }

        // Systems sharing an element both fetch its rows; score each formula once.
        let references = dedupe_by_formula(references);
        let simulated = dedupe_simulated(simulated);

        let source = (!sources.is_empty()).then(|| sources.into_iter().collect::<Vec<_>>().join("+"));
        let report = Validator::new(simulated).validate(&references, source.as_deref());
        report.log_summary();

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = cfg.output_dir.join(format!("validation_{}.csv", stamp));
        if let Err(e) = report.write_csv(&path) {
            log::warn!("⚠️ Validation report not written: {:#}", e);
        }
        Some(report.summary)
    }
}

/// First record per reduced formula.
pub fn dedupe_simulated(records: Vec<SimulatedRecord>) -> Vec<SimulatedRecord> {
    let mut seen = BTreeSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(normalize_formula(&r.formula)))
        .collect()
}

/// Completed relaxation rows with geometry data.
pub fn simulated_records(records: &[StateRecord]) -> Vec<SimulatedRecord> {
    records
        .iter()
        .filter(|r| r.completed && r.temperature.is_none())
        .filter_map(|r| {
            Some(SimulatedRecord {
                formula: r.formula.clone(),
                lattice_a: r.lattice_a?,
                density: r.density?,
            })
        })
        .collect()
}

// ============================================================================
// 4. ONE SYSTEM (runs inside a task; never writes state)
// ============================================================================

fn multiplicity(cfg: &ScreeningConfig, system: &ChemicalSystem) -> usize {
    if system.is_ternary() {
        cfg.structure.ternary_supercell_size
    } else {
        cfg.structure.supercell_size
    }
}

/// Builds the starting structure of `composition`.
pub fn build_structure(
    generator: &dyn StructureGenerator,
    composition: &Composition,
    multiplicity: usize,
) -> Result<Structure> {
    let structure = match composition {
        Composition::Pure { element } => generator.pure(element, multiplicity)?,
        Composition::Binary {
            base,
            dopant,
            fraction,
        } => generator.alloy(
            base,
            &[(base.clone(), 1.0 - fraction), (dopant.clone(), *fraction)],
            multiplicity,
        )?,
        Composition::Ternary { elements, .. } => {
            let base = select_base_element(elements)
                .ok_or_else(|| anyhow!("No base element for {:?}", elements))?;
            let fractions = composition.target_fractions();
            // Host first: it absorbs the rounding remainder.
            let mut species: Vec<(String, f64)> =
                elements.iter().cloned().zip(fractions).collect();
            species.sort_by_key(|(e, _)| *e != base);
            generator.alloy(&base, &species, multiplicity)?
        }
    };
    Ok(structure.with_composition(composition.clone()))
}

fn snapshot_path(cfg: &ScreeningConfig, system: &str, tag: &str) -> PathBuf {
    let clean: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect();
    cfg.snapshot_dir().join(system).join(format!("{}.json", clean))
}

fn write_snapshot(path: &Path, structure: &Structure) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), structure)?;
    Ok(())
}

fn read_snapshot(path: &str) -> Result<Structure> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Missing snapshot {}", path))?;
    Ok(serde_json::from_str(&text)?)
}

fn relax_record(system: &str, composition: &Composition, structure: &Structure) -> StateRecord {
    StateRecord {
        system: system.to_string(),
        composition: composition.tag(),
        formula: structure.reduced_formula(),
        total_atoms: structure.len(),
        ..Default::default()
    }
}

/// A structure ready for the hull: relaxed now, or restored from state.
struct Relaxed {
    composition: Composition,
    structure: Structure,
    energy_per_atom: f64,
    record: StateRecord,
}

/// Restores a completed relaxation from state plus its snapshot.
fn restore(prior: &HashMap<StateKey, StateRecord>, key: &StateKey) -> Option<(Structure, StateRecord)> {
    let record = prior.get(key).filter(|r| r.completed)?;
    let energy = record.energy_per_atom.filter(|e| e.is_finite())?;
    let path = record.structure_ref.as_deref()?;
    match read_snapshot(path) {
        Ok(s) => {
            log::info!("   ♻️ Reusing {} ({:.4} eV/atom)", key.composition, energy);
            Some((s, record.clone()))
        }
        Err(e) => {
            log::warn!("⚠️ Resume record for {} unusable ({:#}); recomputing", key.composition, e);
            None
        }
    }
}

async fn run_system(
    ctx: SystemContext,
    system: ChemicalSystem,
    sandbox: Sandbox,
    md_devices: usize,
    prior: Vec<StateRecord>,
) -> SystemOutcome {
    let name = system.name();
    let mut outcome = SystemOutcome {
        summary: SystemSummary::new(&name),
        records: Vec::new(),
        snapshots: Vec::new(),
    };

    let prior: HashMap<StateKey, StateRecord> = prior.into_iter().map(|r| (r.key(), r)).collect();

    let mut calc = match ctx.factory.create(&sandbox).await {
        Ok(c) => c,
        Err(e) => {
            outcome.summary = outcome.summary.fail(format!("calculator unavailable: {:#}", e));
            return outcome;
        }
    };

    let result = run_phases(&ctx, &system, &sandbox, md_devices, &prior, calc.as_mut(), &mut outcome).await;
    calc.shutdown().await;

    match result {
        Ok(()) => {
            outcome.summary.phase = SystemPhase::Done;
            log::info!(
                "✅ {} done: {} relaxed, {} stable, {} MD runs",
                name,
                outcome.summary.total_structures,
                outcome.summary.stable_count,
                outcome.summary.md_count
            );
        }
        Err(e) => {
            outcome.summary = outcome.summary.fail(format!("{:#}", e));
        }
    }
    outcome
}

async fn run_phases(
    ctx: &SystemContext,
    system: &ChemicalSystem,
    sandbox: &Sandbox,
    md_devices: usize,
    prior: &HashMap<StateKey, StateRecord>,
    calc: &mut dyn Calculator,
    outcome: &mut SystemOutcome,
) -> Result<()> {
    let cfg = &ctx.cfg;
    let name = system.name();
    let mult = multiplicity(cfg, system);
    let traj_store = TrajectoryStore::new(cfg.trajectory_dir())?;
    let relaxer = Relaxer::new(cfg.relax.clone(), Some(traj_store.clone()));
    let mut relaxed: Vec<Relaxed> = Vec::new();

    // ---------------------------------------------------------------------
    // PHASE 1: relaxation (end-members first, then alloys in batches)
    // ---------------------------------------------------------------------
    outcome.summary.phase = SystemPhase::Phase1Running;
    log::info!("=== [Phase 1] Relaxation: {} ===", name);

    for composition in CompositionGenerator::pure_compositions(system) {
        let key = StateKey::relax(&name, composition.tag());
        if let Some((structure, record)) = restore(prior, &key) {
            outcome.summary.reused += 1;
            relaxed.push(Relaxed {
                energy_per_atom: record.energy_per_atom.unwrap_or(f64::INFINITY),
                composition,
                structure,
                record,
            });
            continue;
        }

        let start = build_structure(ctx.generator.as_ref(), &composition, mult)?;
        let res = relaxer.relax(calc, &start).await;
        if !res.is_success() {
            let err = res.error.clone().unwrap_or_else(|| "unknown".into());
            outcome
                .records
                .push((relax_record(&name, &composition, &start), Some(err.clone())));
            return Err(anyhow!("end-member {} failed to relax: {}", composition.tag(), err));
        }
        log::info!(
            "   🔹 {} relaxed: {:.4} eV/atom ({} steps)",
            composition.tag(),
            res.energy_per_atom,
            res.steps
        );
        relaxed.push(accept(cfg, &name, composition, res, outcome));
    }

    let generator = CompositionGenerator::new(cfg.composition.clone(), ctx.miner.clone());
    let alloys = generator.compositions(system).await;
    log::info!("   ℹ️ {} alloy compositions for {}", alloys.len(), name);

    let mut pending: Vec<(Composition, Structure)> = Vec::new();
    for composition in alloys {
        let key = StateKey::relax(&name, composition.tag());
        if let Some((structure, record)) = restore(prior, &key) {
            outcome.summary.reused += 1;
            relaxed.push(Relaxed {
                energy_per_atom: record.energy_per_atom.unwrap_or(f64::INFINITY),
                composition,
                structure,
                record,
            });
            continue;
        }
        match build_structure(ctx.generator.as_ref(), &composition, mult) {
            Ok(s) => pending.push((composition, s)),
            Err(e) => {
                log::warn!("⚠️ Could not build {}: {:#}", composition.tag(), e);
                outcome.summary.failed_relaxations += 1;
            }
        }
    }

    let starts: Vec<Structure> = pending.iter().map(|(_, s)| s.clone()).collect();
    let results = BatchRelaxer::new(&relaxer, cfg.parallel.ratio_batch_size)
        .relax_all(calc, &starts)
        .await;
    for ((composition, start), res) in pending.into_iter().zip(results) {
        if res.is_success() {
            relaxed.push(accept(cfg, &name, composition, res, outcome));
        } else {
            outcome.summary.failed_relaxations += 1;
            let err = res.error.unwrap_or_else(|| "unknown".into());
            outcome
                .records
                .push((relax_record(&name, &composition, &start), Some(err)));
        }
    }
    outcome.summary.total_structures = relaxed.len();

    // ---------------------------------------------------------------------
    // PHASE 2: convex hull
    // ---------------------------------------------------------------------
    outcome.summary.phase = SystemPhase::Phase2Running;
    log::info!("=== [Phase 2] Stability: {} ===", name);

    let threshold = cfg.stability_threshold(system.elements.len());
    let mut analyzer = StabilityAnalyzer::new(system.elements.clone(), threshold);
    for r in &relaxed {
        analyzer.add_result(&r.structure, r.energy_per_atom)?;
    }
    let verdicts: HashMap<_, _> = analyzer
        .analyze()
        .into_iter()
        .map(|v| (v.structure_id, v))
        .collect();

    let mut md_targets: Vec<(Composition, Structure)> = Vec::new();
    for r in relaxed.iter_mut() {
        if let Some(v) = verdicts.get(&r.structure.id) {
            r.record.energy_above_hull = Some(v.energy_above_hull);
            r.record.is_stable = Some(v.is_stable);
            log::info!(
                "   {} {:<12} {:<10} E_hull = {:.4} eV/atom",
                if v.is_stable { "🟢" } else { "🔴" },
                v.formula,
                r.composition.tag(),
                v.energy_above_hull
            );
            if v.is_stable {
                outcome.summary.stable_count += 1;
                if !r.composition.is_pure() {
                    md_targets.push((r.composition.clone(), r.structure.clone()));
                }
            }
        }
        outcome.records.push((r.record.clone(), None));
    }
    log::info!(
        "   📊 {} of {} structures within {:.3} eV/atom of the hull",
        outcome.summary.stable_count,
        relaxed.len(),
        threshold
    );

    // ---------------------------------------------------------------------
    // PHASE 3: molecular dynamics
    // ---------------------------------------------------------------------
    outcome.summary.phase = SystemPhase::Phase3Running;
    if !cfg.md.enabled {
        log::info!("=== [Phase 3] MD disabled ===");
        return Ok(());
    }
    log::info!("=== [Phase 3] MD: {} stable alloys ===", md_targets.len());

    let mut tasks: VecDeque<MdTask> = VecDeque::new();
    for (composition, structure) in &md_targets {
        for &t in &cfg.md.temperatures {
            let key = StateKey::md(&name, composition.tag(), t);
            if prior.get(&key).map(|r| r.completed && r.md_completed).unwrap_or(false) {
                outcome.summary.reused += 1;
                outcome.summary.md_count += 1;
                continue;
            }
            tasks.push_back(MdTask {
                system: name.clone(),
                composition: composition.clone(),
                structure: structure.clone(),
                temperature: t,
            });
        }
    }

    let runner = Arc::new(MdRunner::new(cfg.md.clone(), traj_store));
    let analyzer = Arc::new(TrajectoryAnalyzer::from_config(&cfg.analysis));
    let workers = cfg.parallel.md_workers.min(tasks.len());

    let finished = if workers <= 1 {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            let rec = run_md_task(&runner, &analyzer, calc, &task).await;
            out.push(rec);
        }
        out
    } else {
        run_md_pool(ctx, sandbox, md_devices, runner, analyzer, tasks, workers).await
    };

    for (record, failure) in finished {
        if failure.is_none() {
            outcome.summary.md_count += 1;
        }
        outcome.records.push((record, failure));
    }
    Ok(())
}

fn accept(
    cfg: &ScreeningConfig,
    system: &str,
    composition: Composition,
    res: RelaxOutcome,
    outcome: &mut SystemOutcome,
) -> Relaxed {
    let path = snapshot_path(cfg, system, &composition.tag());
    let structure = res.structure;
    let mut record = relax_record(system, &composition, &structure);
    record.lattice_a = Some(structure.lattice_a());
    record.density = Some(structure.density());
    record.energy_per_atom = Some(res.energy_per_atom);
    record.trajectory_ref = res.trajectory.map(|h| h.path.display().to_string());
    record.structure_ref = Some(path.display().to_string());
    outcome.snapshots.push((path, structure.clone()));
    Relaxed {
        composition,
        structure,
        energy_per_atom: res.energy_per_atom,
        record,
    }
}

// ============================================================================
// 5. MD TASKS & WORKER POOL
// ============================================================================

struct MdTask {
    system: String,
    composition: Composition,
    structure: Structure,
    temperature: f64,
}

/// Runs and analyses one trajectory. Returns the MD row and, on failure,
/// the error text.
async fn run_md_task(
    runner: &MdRunner,
    analyzer: &TrajectoryAnalyzer,
    calc: &mut dyn Calculator,
    task: &MdTask,
) -> (StateRecord, Option<String>) {
    let mut record = StateRecord {
        system: task.system.clone(),
        composition: task.composition.tag(),
        formula: task.structure.reduced_formula(),
        total_atoms: task.structure.len(),
        temperature: Some(task.temperature),
        ..Default::default()
    };

    let params = MdParams::from_config(runner.config(), task.temperature);
    let md = match runner.run(calc, &task.structure, params, None).await {
        Ok(md) => md,
        Err(e) => {
            log::warn!("⚠️ MD {} @ {:.0} K failed: {:#}", record.formula, task.temperature, e);
            return (record, Some(format!("{:#}", e)));
        }
    };

    record.md_completed = true;
    record.total_atoms = md.final_structure.len();
    record.lattice_a = Some(md.final_structure.lattice_a());
    record.density = Some(md.final_structure.density());
    record.trajectory_ref = Some(md.handle.path.display().to_string());

    match analyzer.analyze(&md.handle) {
        Ok(r) => {
            log::info!(
                "   {} {} @ {:.0} K: <T> = {:.1} K, dT = {:.2}%, dV = {:.2}%",
                if r.is_thermally_stable { "🟢" } else { "🔴" },
                record.formula,
                task.temperature,
                r.avg_temperature,
                r.temperature_fluctuation_pct,
                r.volume_change_pct
            );
            record.md_avg_temperature = Some(r.avg_temperature);
            record.md_temp_fluctuation = Some(r.temperature_fluctuation_pct);
            record.md_avg_energy_per_atom = Some(r.avg_energy_per_atom);
            record.md_volume_change_pct = Some(r.volume_change_pct);
            record.md_thermally_stable = Some(r.is_thermally_stable);
            record.md_frames = Some(r.frame_count);
        }
        Err(e) => {
            log::warn!("⚠️ Trajectory analysis of {} failed: {}", md.handle.file_name(), e);
            record.error = Some(e.to_string());
        }
    }
    (record, None)
}

/// `workers` tasks pull from a shared queue; each owns its own calculator,
/// bound to a device round-robin.
async fn run_md_pool(
    ctx: &SystemContext,
    sandbox: &Sandbox,
    md_devices: usize,
    runner: Arc<MdRunner>,
    analyzer: Arc<TrajectoryAnalyzer>,
    tasks: VecDeque<MdTask>,
    workers: usize,
) -> Vec<(StateRecord, Option<String>)> {
    log::info!("   👷 {} MD workers for {} tasks", workers, tasks.len());
    let queue = Arc::new(Mutex::new(tasks));
    let mut set = JoinSet::new();

    for w in 0..workers {
        let worker_sandbox = if md_devices > 1 && sandbox.gpus.len() <= 1 {
            Sandbox::for_device(Some(w % md_devices))
        } else {
            sandbox.clone()
        };
        let queue = queue.clone();
        let factory = ctx.factory.clone();
        let runner = runner.clone();
        let analyzer = analyzer.clone();

        set.spawn(async move {
            let mut out = Vec::new();
            let mut calc = match factory.create(&worker_sandbox).await {
                Ok(c) => c,
                Err(e) => {
                    log::error!("MD worker {} could not start: {:#}", w, e);
                    return out;
                }
            };
            loop {
                let next = queue.lock().await.pop_front();
                let Some(task) = next else { break };
                out.push(run_md_task(&runner, &analyzer, calc.as_mut(), &task).await);
            }
            calc.shutdown().await;
            out
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(rows) => results.extend(rows),
            Err(e) => log::error!("MD worker aborted: {}", e),
        }
    }

    // Tasks no worker could take.
    for task in queue.lock().await.drain(..) {
        let record = StateRecord {
            system: task.system.clone(),
            composition: task.composition.tag(),
            formula: task.structure.reduced_formula(),
            total_atoms: task.structure.len(),
            temperature: Some(task.temperature),
            ..Default::default()
        };
        results.push((record, Some("no MD worker available".to_string())));
    }
    results
}

// ============================================================================
// 6. OUTPUT
// ============================================================================

fn write_run_summary(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = summary.stamp.started_at.format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("run_summary_{}.json", stamp));
    let file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to create run summary {:?}", path))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), summary)?;
    log::info!("📝 Run summary: {:?}", path);
    Ok(path)
}

fn log_final_table(systems: &[SystemSummary]) {
    log::info!("{}", "=".repeat(70));
    log::info!("🏁 Final summary");
    log::info!(
        "{:<14} | {:<8} | {:>7} | {:>6} | {:>4} | {:>6}",
        "system",
        "status",
        "relaxed",
        "stable",
        "md",
        "reused"
    );
    for s in systems {
        log::info!(
            "{:<14} | {:<8} | {:>7} | {:>6} | {:>4} | {:>6}",
            s.system,
            if s.phase == SystemPhase::Done { "done" } else { "FAILED" },
            s.total_structures,
            s.stable_count,
            s.md_count,
            s.reused
        );
    }
    log::info!("{}", "=".repeat(70));
}
