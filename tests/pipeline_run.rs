use alloyscreen::builder::LatticeBuilder;
use alloyscreen::config::{CompositionSource, Ensemble, ReferenceMode, ScreeningConfig};
use alloyscreen::core::ElectronVolts;
use alloyscreen::drivers::{Calculator, CalculatorFactory, Evaluation};
use alloyscreen::pipeline::{load_systems, open_state_store, systems_from_csv};
use alloyscreen::resources::{ClusterType, ResourceLedger, Sandbox};
use alloyscreen::{PipelineOrchestrator, Structure, SystemPhase};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ----------------------------------------------------------------------------
// A force-free model with a negative mixing term: every relaxation converges
// at once and every alloy lies on the hull.
// ----------------------------------------------------------------------------

struct ToyCalculator {
    calls: Arc<AtomicUsize>,
}

fn reference_energy(symbol: &str) -> Option<f64> {
    match symbol {
        "Cu" => Some(-3.5),
        "Ni" => Some(-4.4),
        "Fe" => Some(-8.3),
        _ => None,
    }
}

#[async_trait]
impl Calculator for ToyCalculator {
    async fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let formula = structure.formula();
        let n = structure.len() as f64;
        let mut energy = 0.0;
        let mut fractions = Vec::new();
        for el in formula.elements() {
            let e = reference_energy(el).ok_or_else(|| anyhow!("no parameters for {}", el))?;
            let x = formula.fraction(el);
            energy += x * e;
            fractions.push(x);
        }
        for i in 0..fractions.len() {
            for j in (i + 1)..fractions.len() {
                energy -= 0.3 * fractions[i] * fractions[j];
            }
        }
        Ok(Evaluation {
            energy: ElectronVolts(energy * n),
            forces: vec![[0.0; 3]; structure.len()],
            stress: None,
        })
    }

    fn label(&self) -> String {
        "toy".into()
    }
}

struct ToyFactory {
    calls: Arc<AtomicUsize>,
    created: AtomicUsize,
}

impl ToyFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
        })
    }

    fn evaluations(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalculatorFactory for ToyFactory {
    async fn create(&self, _sandbox: &Sandbox) -> Result<Box<dyn Calculator>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ToyCalculator {
            calls: self.calls.clone(),
        }))
    }
}

fn small_config(dir: &Path, systems: &[&str]) -> ScreeningConfig {
    let mut cfg = ScreeningConfig::default();
    cfg.systems = systems.iter().map(|s| s.to_string()).collect();
    cfg.output_dir = dir.to_path_buf();
    cfg.composition.ratio_step = 0.25;
    cfg.structure.supercell_size = 1;
    cfg.md.temperatures = vec![300.0];
    cfg.md.steps = 20;
    cfg.md.save_interval = 5;
    cfg.md.ensemble = Ensemble::Nvt;
    cfg.md.min_atoms = 1;
    cfg
}

fn cpu_ledger(gpus: usize) -> ResourceLedger {
    ResourceLedger::with_inventory(ClusterType::Local, "test".into(), 4, gpus)
}

fn orchestrator(
    cfg: ScreeningConfig,
    factory: Arc<ToyFactory>,
    gpus: usize,
) -> PipelineOrchestrator {
    let cfg = Arc::new(cfg);
    let store = open_state_store(&cfg, None).expect("Failed to open state store");
    PipelineOrchestrator::with_ledger(
        cfg.clone(),
        factory,
        Arc::new(LatticeBuilder::new(cfg.structure.seed)),
        None,
        store,
        cpu_ledger(gpus),
    )
}

#[tokio::test]
async fn test_full_run_screens_binary() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ToyFactory::new();
    let mut orch = orchestrator(small_config(dir.path(), &["Cu-Ni"]), factory.clone(), 0);

    let summary = orch.run().await.expect("Pipeline failed");
    assert_eq!(summary.systems.len(), 1);
    let s = &summary.systems[0];
    assert_eq!(s.phase, SystemPhase::Done);
    assert_eq!(s.total_structures, 5);
    assert_eq!(s.failed_relaxations, 0);
    assert_eq!(s.stable_count, 5);
    assert_eq!(s.md_count, 3);
    assert_eq!(s.reused, 0);

    let records = orch.store().records_for_system("Cu-Ni");
    assert_eq!(records.len(), 5 + 3);
    assert!(records.iter().all(|r| r.completed));
    let md: Vec<_> = records.iter().filter(|r| r.temperature.is_some()).collect();
    assert_eq!(md.len(), 3);
    assert!(md.iter().all(|r| r.md_completed && r.md_frames == Some(3)));
    assert!(records
        .iter()
        .filter(|r| r.temperature.is_none())
        .all(|r| r.energy_above_hull.map(|e| e.abs() < 1e-9).unwrap_or(false)));

    assert!(dir.path().join("structures").join("Cu-Ni").join("pure-Cu.json").exists());
    assert!(dir.path().join("trajectories").join("md_Cu3Ni_300K_nvt.traj").exists());
}

#[tokio::test]
async fn test_resume_skips_completed_work() {
    let dir = tempfile::tempdir().unwrap();

    let first = ToyFactory::new();
    orchestrator(small_config(dir.path(), &["Cu-Ni"]), first.clone(), 0)
        .run()
        .await
        .expect("First run failed");
    assert!(first.evaluations() > 0);

    let second = ToyFactory::new();
    let summary = orchestrator(small_config(dir.path(), &["Cu-Ni"]), second.clone(), 0)
        .run()
        .await
        .expect("Resumed run failed");
    assert_eq!(second.evaluations(), 0, "completed work was recomputed");
    let s = &summary.systems[0];
    assert_eq!(s.phase, SystemPhase::Done);
    assert_eq!(s.reused, 5 + 3);
    assert_eq!(s.md_count, 3);

    // Switching resume off recomputes everything.
    let mut cfg = small_config(dir.path(), &["Cu-Ni"]);
    cfg.resume.enabled = false;
    let third = ToyFactory::new();
    orchestrator(cfg, third.clone(), 0).run().await.unwrap();
    assert!(third.evaluations() > 0);
}

#[tokio::test]
async fn test_failed_system_does_not_stop_others() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ToyFactory::new();
    let mut cfg = small_config(dir.path(), &["Cu-Zn", "Cu-Ni"]);
    cfg.md.enabled = false;
    let mut orch = orchestrator(cfg, factory, 0);

    let summary = orch.run().await.expect("Pipeline failed");
    let zn = &summary.systems[0];
    assert_eq!(zn.system, "Cu-Zn");
    assert_eq!(zn.phase, SystemPhase::Failed);
    assert_eq!(zn.total_structures, 0);
    assert!(zn.error.is_some());
    assert_eq!(summary.systems[1].phase, SystemPhase::Done);

    let zn_rows = orch.store().records_for_system("Cu-Zn");
    assert!(zn_rows.iter().any(|r| !r.completed && r.error.is_some()));
}

#[tokio::test]
async fn test_one_system_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ToyFactory::new();
    let mut cfg = small_config(dir.path(), &["Cu-Ni", "Fe-Ni", "Cu-Fe"]);
    cfg.parallel.system_parallel = true;
    cfg.md.enabled = false;

    let summary = orchestrator(cfg, factory.clone(), 2)
        .run()
        .await
        .expect("Pipeline failed");
    assert_eq!(summary.systems.len(), 3);
    assert!(summary.systems.iter().all(|s| s.phase == SystemPhase::Done));
    assert_eq!(factory.created.load(Ordering::SeqCst), 3);
}

/// Panics on its first `panics` creations, then behaves like `ToyFactory`.
struct FlakyFactory {
    inner: Arc<ToyFactory>,
    panics: AtomicUsize,
}

#[async_trait]
impl CalculatorFactory for FlakyFactory {
    async fn create(&self, sandbox: &Sandbox) -> Result<Box<dyn Calculator>> {
        let left = self.panics.load(Ordering::SeqCst);
        if left > 0 && self.panics.compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            panic!("device {:?} lost", sandbox.gpus);
        }
        self.inner.create(sandbox).await
    }
}

#[tokio::test]
async fn test_crashed_system_task_is_reported_and_frees_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = small_config(dir.path(), &["Cu-Ni", "Fe-Ni", "Cu-Fe", "Fe-Cu"]);
    cfg.parallel.system_parallel = true;
    cfg.md.enabled = false;
    let cfg = Arc::new(cfg);

    let factory = Arc::new(FlakyFactory {
        inner: ToyFactory::new(),
        panics: AtomicUsize::new(2),
    });
    let store = open_state_store(&cfg, None).unwrap();
    let mut orch = PipelineOrchestrator::with_ledger(
        cfg.clone(),
        factory,
        Arc::new(LatticeBuilder::new(cfg.structure.seed)),
        None,
        store,
        cpu_ledger(2),
    );

    let summary = orch.run().await.expect("Pipeline failed");
    assert_eq!(summary.systems.len(), 4);
    let names: Vec<&str> = summary.systems.iter().map(|s| s.system.as_str()).collect();
    assert_eq!(names, vec!["Cu-Ni", "Fe-Ni", "Cu-Fe", "Fe-Cu"]);
    let failed: Vec<_> = summary
        .systems
        .iter()
        .filter(|s| s.phase == SystemPhase::Failed)
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed
        .iter()
        .all(|s| s.total_structures == 0 && s.error.as_deref().unwrap_or("").contains("aborted")));
    // Both devices came back, so the remaining systems still ran.
    assert_eq!(
        summary
            .systems
            .iter()
            .filter(|s| s.phase == SystemPhase::Done)
            .count(),
        2
    );
}

#[tokio::test]
async fn test_md_worker_pool() {
    let dir = tempfile::tempdir().unwrap();
    let factory = ToyFactory::new();
    let mut cfg = small_config(dir.path(), &["Cu-Ni"]);
    cfg.md.temperatures = vec![300.0, 600.0];
    cfg.parallel.md_workers = 3;

    let mut orch = orchestrator(cfg, factory.clone(), 0);
    let summary = orch.run().await.expect("Pipeline failed");
    assert_eq!(summary.systems[0].md_count, 6);
    // One calculator for the system plus one per MD worker.
    assert_eq!(factory.created.load(Ordering::SeqCst), 1 + 3);
    let md_rows = orch
        .store()
        .records_for_system("Cu-Ni")
        .into_iter()
        .filter(|r| r.md_completed)
        .count();
    assert_eq!(md_rows, 6);
}

#[tokio::test]
async fn test_shared_element_scored_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = small_config(dir.path(), &["Cu-Ni", "Cu-Fe"]);
    cfg.md.enabled = false;
    cfg.validation.enabled = true;
    cfg.validation.mode = ReferenceMode::Literature;

    let summary = orchestrator(cfg, ToyFactory::new(), 0)
        .run()
        .await
        .expect("Pipeline failed");
    let v = summary.validation.expect("validation summary");
    // Cu, Ni, Fe, CuNi, CuFe
    assert_eq!(v.total_references, 5);
    assert_eq!(v.matched, 5);

    let report = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("validation_"))
                .unwrap_or(false)
        })
        .expect("validation report");
    let mut reader = csv::Reader::from_path(&report).unwrap();
    let headers = reader.headers().unwrap().clone();
    let col = headers.iter().position(|h| h == "exp_formula").unwrap();
    let formulas: Vec<String> = reader
        .records()
        .map(|r| r.unwrap()[col].to_string())
        .collect();
    assert_eq!(formulas.len(), 5);
    assert_eq!(formulas.iter().filter(|f| *f == "Cu").count(), 1);
}

#[test]
fn test_systems_from_composition_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known.csv");
    std::fs::write(
        &path,
        "material_id,formula\nmp-1,Ni3Cu\nmp-2,CuNi\nmp-3,FeCrNi2\nmp-4,Cu\nmp-5,AlNi\n",
    )
    .unwrap();

    let systems = systems_from_csv(&path, None, true).unwrap();
    let names: Vec<String> = systems.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["Al-Ni", "Cu-Ni", "Cr-Fe-Ni"]);

    let capped = systems_from_csv(&path, Some(1), false).unwrap();
    assert_eq!(capped.len(), 1);

    let mut cfg = ScreeningConfig::default();
    cfg.systems = vec!["Cu-Ni".into()];
    cfg.composition_source = Some(CompositionSource {
        path: path.clone(),
        max_systems: None,
        include_ternary: false,
    });
    let all = load_systems(&cfg).unwrap();
    let names: Vec<String> = all.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["Cu-Ni", "Al-Ni"]);

    std::fs::write(&path, "name\nCuNi\n").unwrap();
    assert!(systems_from_csv(&path, None, true).is_err());
}
