use alloyscreen::config::ReferenceMode;
use alloyscreen::miner::Miner;
use alloyscreen::validation::reference::{
    dedupe_by_formula, literature_rows, load_custom_csv, normalize_formula, resolve_references,
    RawReferenceRow, ReferenceRow, ReferenceSource,
};
use alloyscreen::validation::{score_pair, supercell_correction, SimulatedRecord, Validator};
use alloyscreen::ChemicalSystem;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;

fn reference(formula: &str, a: f64, density: f64) -> ReferenceRow {
    ReferenceRow {
        identifier: format!("REF-{}", formula),
        formula: formula.to_string(),
        lattice_constant_a: a,
        lattice_constant_b: a,
        lattice_constant_c: a,
        density,
        formation_energy: 0.0,
        energy_above_hull: 0.0,
        crystal_system: "Fm-3m".to_string(),
    }
}

fn sim(formula: &str, a: f64, density: f64) -> SimulatedRecord {
    SimulatedRecord {
        formula: formula.to_string(),
        lattice_a: a,
        density,
    }
}

#[test]
fn test_perfect_match_scores_100() {
    let r = score_pair(&sim("Cu", 3.6147, 8.96), &reference("Cu", 3.6147, 8.96));
    assert_eq!(r.lattice_error_pct, 0.0);
    assert_eq!(r.density_error_pct, 0.0);
    assert_eq!(r.score, 100.0);
    assert_eq!(r.supercell_factor, 1);
}

#[test]
fn test_weighted_score() {
    // 1% lattice error, 0% density error -> 100 - 0.6.
    let r = score_pair(&sim("Cu", 3.6509, 8.96), &reference("Cu", 3.6147, 8.96));
    assert!((r.lattice_error_pct - 1.0).abs() < 0.01);
    assert!((r.score - 99.4).abs() < 0.01);

    // Hopeless pairs bottom out at zero.
    let r = score_pair(&sim("Cu", 3.6, 100.0), &reference("Cu", 3.6, 1.0));
    assert_eq!(r.score, 0.0);
}

#[test]
fn test_supercell_correction() {
    // A 4x4x4 fcc supercell edge.
    let (a, factor) = supercell_correction(14.44, 3.61);
    assert_eq!(factor, 4);
    assert!((a - 3.61).abs() < 1e-9);

    // Below 2.5x the value is taken as a primitive constant.
    assert_eq!(supercell_correction(7.2, 3.61), (7.2, 1));
    assert_eq!(supercell_correction(3.6, 0.0), (3.6, 1));
}

#[test]
fn test_validator_matches_by_reduced_formula() {
    let validator = Validator::new(vec![
        sim("Cu3Ni", 14.32, 8.9),
        sim("CuNi", 7.1, 8.9),
        sim("Cu3Ni", 99.0, 1.0),
    ]);
    let refs = vec![
        reference("Cu6Ni2", 3.58, 8.9),
        reference("CuNi", 3.57, 8.93),
        reference("Fe", 2.87, 7.87),
    ];
    let report = validator.validate(&refs, Some("literature"));

    assert_eq!(report.summary.total_references, 3);
    assert_eq!(report.summary.matched, 2);
    assert_eq!(report.summary.source.as_deref(), Some("literature"));
    // First simulated Cu3Ni wins and is supercell-corrected.
    assert_eq!(report.records[0].sim_formula, "Cu3Ni");
    assert_eq!(report.records[0].supercell_factor, 4);
    assert!(report.summary.mean_score.is_some());

    let empty = Validator::new(Vec::new()).validate(&refs, None);
    assert_eq!(empty.summary.matched, 0);
    assert!(empty.summary.mean_score.is_none());
}

#[test]
fn test_report_csv_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("validation.csv");
    let report = Validator::new(vec![sim("Cu", 3.62, 8.9)]).validate(&[reference("Cu", 3.6147, 8.96)], None);
    report.write_csv(&path).expect("Failed to write validation csv");

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("identifier,exp_formula,sim_formula"));
    assert_eq!(text.lines().count(), 2);
}

#[test]
fn test_raw_row_defaults() {
    let raw = RawReferenceRow {
        formula: " CuNi ".into(),
        lattice_constant_a: Some(3.57),
        density: Some(8.93),
        ..Default::default()
    };
    let row = raw.into_row("CUSTOM").unwrap();
    assert_eq!(row.identifier, "CUSTOM-CuNi");
    assert_eq!(row.lattice_constant_b, 3.57);
    assert_eq!(row.lattice_constant_c, 3.57);
    assert_eq!(row.formation_energy, 0.0);
    assert_eq!(row.crystal_system, "Unknown");

    let missing = RawReferenceRow {
        formula: "Cu".into(),
        lattice_constant_a: Some(3.6),
        ..Default::default()
    };
    assert!(missing.into_row("X").is_err());

    let negative = RawReferenceRow {
        formula: "Cu".into(),
        lattice_constant_a: Some(-3.6),
        density: Some(8.9),
        ..Default::default()
    };
    assert!(negative.into_row("X").is_err());
}

#[test]
fn test_custom_table() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "formula,exp_lattice_a,exp_density,crystal_system").unwrap();
    writeln!(file, "Cu, 3.615, 8.96, Fm-3m").unwrap();
    writeln!(file, "CuNi,3.57,8.93,").unwrap();
    file.flush().unwrap();

    let rows = load_custom_csv(file.path()).expect("Failed to load custom table");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].identifier, "CUSTOM-Cu");
    assert_eq!(rows[0].crystal_system, "Fm-3m");
    assert_eq!(rows[1].crystal_system, "Unknown");
    assert_eq!(rows[1].lattice_constant_c, 3.57);
}

#[test]
fn test_literature_table() {
    let rows = literature_rows(&["Cu".to_string(), "Ni".to_string()]);
    let formulas: Vec<&str> = rows.iter().map(|r| r.formula.as_str()).collect();
    assert_eq!(formulas, vec!["Cu", "Ni", "CuNi"]);
    assert_eq!(rows[0].identifier, "MANUAL-Cu");
    assert!((rows[2].lattice_constant_a - (3.6147 + 3.5238) / 2.0).abs() < 1e-9);

    let rows = literature_rows(&["Fe".to_string(), "Cr".to_string(), "Ni".to_string()]);
    assert_eq!(rows.len(), 3 + 3 + 1);

    assert!(literature_rows(&["Cu".to_string(), "Pt".to_string()]).is_empty());
}

#[test]
fn test_dedupe_keeps_lowest_hull_energy() {
    let mut a = reference("CuNi", 3.57, 8.9);
    a.energy_above_hull = 0.02;
    let mut b = reference("Cu2Ni2", 3.58, 8.9);
    b.energy_above_hull = 0.0;
    let rows = dedupe_by_formula(vec![a, b, reference("Cu", 3.61, 8.96)]);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].formula, "Cu2Ni2");
    assert_eq!(normalize_formula("Cu2Ni2"), "CuNi");
}

struct OfflineMiner;

#[async_trait]
impl Miner for OfflineMiner {
    async fn mine_formulas(&self, _elements: &[String]) -> Result<Vec<String>> {
        Err(anyhow!("no network"))
    }

    async fn fetch_references(&self, _elements: &[String]) -> Result<Vec<ReferenceRow>> {
        Err(anyhow!("no network"))
    }
}

#[tokio::test]
async fn test_auto_mode_falls_back_to_literature() {
    let system = ChemicalSystem::new(vec!["Cu", "Ni"]).unwrap();
    let miner: Arc<dyn Miner> = Arc::new(OfflineMiner);

    let chain = ReferenceSource::chain(ReferenceMode::Auto, Some(miner.clone()), None);
    assert_eq!(chain.len(), 2);
    let (source, rows) = resolve_references(&chain, &system).await;
    assert_eq!(source, Some("literature"));
    assert_eq!(rows.len(), 3);

    let chain = ReferenceSource::chain(ReferenceMode::Live, Some(miner), None);
    let (source, rows) = resolve_references(&chain, &system).await;
    assert_eq!(source, None);
    assert!(rows.is_empty());
}
