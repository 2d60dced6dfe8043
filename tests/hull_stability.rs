use alloyscreen::analysis::{StabilityAnalyzer, StabilityError};
use alloyscreen::core::{Atom, Lattice};
use alloyscreen::Structure;

fn cell(symbols: &[&str]) -> Structure {
    let atoms = symbols
        .iter()
        .enumerate()
        .map(|(i, s)| Atom::new(*s, [i as f64 * 2.5, 0.0, 0.0]))
        .collect();
    let a = 2.5 * symbols.len().max(1) as f64;
    Structure::new(atoms, Lattice::orthorhombic(a, 2.5, 2.5), "test".to_string())
}

fn cu_ni() -> StabilityAnalyzer {
    StabilityAnalyzer::new(vec!["Cu".into(), "Ni".into()], 0.05)
}

#[test]
fn test_end_members_sit_on_hull() {
    let mut analyzer = cu_ni();
    let cu = cell(&["Cu", "Cu"]);
    let ni = cell(&["Ni", "Ni"]);
    analyzer.add_result(&cu, -3.0).unwrap();
    analyzer.add_result(&ni, -4.0).unwrap();

    let results = analyzer.analyze();
    assert_eq!(results.len(), 2);
    for r in &results {
        assert!(r.energy_above_hull.abs() < 1e-9, "{} off hull", r.formula);
        assert!(r.is_stable);
    }
}

#[test]
fn test_midpoint_above_hull() {
    let mut analyzer = cu_ni();
    let above = cell(&["Cu", "Ni"]);
    let near = cell(&["Cu", "Cu", "Ni", "Ni"]);
    analyzer.add_result(&cell(&["Cu"]), -3.0).unwrap();
    analyzer.add_result(&cell(&["Ni"]), -4.0).unwrap();
    analyzer.add_result(&above, -3.4).unwrap();

    let results = analyzer.analyze();
    let mid = results
        .iter()
        .find(|r| r.structure_id == above.id)
        .expect("midpoint missing");
    // Tie line at x = 0.5 is -3.5.
    assert!((mid.energy_above_hull - 0.1).abs() < 1e-9);
    assert!(!mid.is_stable);

    // Within the threshold counts as stable.
    let mut analyzer = cu_ni();
    analyzer.add_result(&cell(&["Cu"]), -3.0).unwrap();
    analyzer.add_result(&cell(&["Ni"]), -4.0).unwrap();
    analyzer.add_result(&near, -3.48).unwrap();
    let r = analyzer
        .analyze()
        .into_iter()
        .find(|r| r.structure_id == near.id)
        .unwrap();
    assert!((r.energy_above_hull - 0.02).abs() < 1e-9);
    assert!(r.is_stable);
}

#[test]
fn test_ordered_phase_reshapes_hull() {
    let mut analyzer = cu_ni();
    let ordered = cell(&["Cu", "Ni"]);
    let cu3ni = cell(&["Cu", "Cu", "Cu", "Ni"]);
    analyzer.add_result(&cell(&["Cu"]), -3.0).unwrap();
    analyzer.add_result(&cell(&["Ni"]), -4.0).unwrap();
    analyzer.add_result(&ordered, -3.8).unwrap();
    // Tie line Cu -> CuNi at x = 0.25 is -3.4.
    analyzer.add_result(&cu3ni, -3.3).unwrap();

    let results = analyzer.analyze();
    let get = |id| results.iter().find(|r| r.structure_id == id).unwrap();
    assert!(get(ordered.id).energy_above_hull.abs() < 1e-9);
    assert!((get(cu3ni.id).energy_above_hull - 0.1).abs() < 1e-9);
}

#[test]
fn test_ternary_interior_point() {
    let mut analyzer = StabilityAnalyzer::new(vec!["Fe".into(), "Cr".into(), "Ni".into()], 0.05);
    let mixed = cell(&["Fe", "Cr", "Ni"]);
    analyzer.add_result(&cell(&["Fe"]), -8.0).unwrap();
    analyzer.add_result(&cell(&["Cr"]), -9.0).unwrap();
    analyzer.add_result(&cell(&["Ni"]), -5.0).unwrap();
    analyzer.add_result(&mixed, -7.0).unwrap();

    let r = analyzer
        .analyze()
        .into_iter()
        .find(|r| r.structure_id == mixed.id)
        .unwrap();
    // Plane through the end-members at (1/3, 1/3, 1/3) is -22/3.
    assert!((r.energy_above_hull - (-7.0 + 22.0 / 3.0)).abs() < 1e-9);
    assert!(!r.is_stable);
}

#[test]
fn test_analyze_is_idempotent_and_frozen() {
    let mut analyzer = cu_ni();
    analyzer.add_result(&cell(&["Cu"]), -3.0).unwrap();
    analyzer.add_result(&cell(&["Ni"]), -4.0).unwrap();
    analyzer.add_result(&cell(&["Cu", "Ni"]), -3.4).unwrap();

    let first = analyzer.analyze();
    let second = analyzer.analyze();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.structure_id, b.structure_id);
        assert_eq!(a.energy_above_hull, b.energy_above_hull);
    }
    assert!(analyzer.is_analyzed());
    assert_eq!(
        analyzer.add_result(&cell(&["Cu"]), -3.1),
        Err(StabilityError::AlreadyAnalyzed)
    );
}

#[test]
fn test_degenerate_single_composition() {
    let mut analyzer = cu_ni();
    analyzer.add_result(&cell(&["Cu"]), -3.0).unwrap();
    analyzer.add_result(&cell(&["Cu", "Cu"]), -2.5).unwrap();

    let results = analyzer.analyze();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.energy_above_hull == 0.0 && r.is_stable));
}

#[test]
fn test_sentinel_energies_are_ignored() {
    let mut analyzer = cu_ni();
    analyzer.add_result(&cell(&["Cu"]), -3.0).unwrap();
    analyzer.add_result(&cell(&["Ni"]), f64::INFINITY).unwrap();
    analyzer.add_result(&cell(&["Cu", "Ni"]), f64::NAN).unwrap();
    assert_eq!(analyzer.len(), 1);
    assert_eq!(analyzer.analyze().len(), 1);
}

#[test]
fn test_foreign_element_rejected() {
    let mut analyzer = cu_ni();
    let err = analyzer.add_result(&cell(&["Cu", "Zn"]), -3.0).unwrap_err();
    assert!(matches!(err, StabilityError::ForeignElement { ref element, .. } if element == "Zn"));
    assert!(analyzer.is_empty());
}

fn ternary_cell(counts: [usize; 3]) -> Structure {
    let mut symbols = Vec::new();
    for (el, n) in ["Cu", "Fe", "Ni"].iter().zip(counts) {
        symbols.extend(std::iter::repeat(*el).take(n));
    }
    cell(&symbols)
}

/// Regular-solution energy with deterministic roughness, per atom.
fn rough_energy(counts: [usize; 3]) -> f64 {
    let total = counts.iter().sum::<usize>() as f64;
    let x: Vec<f64> = counts.iter().map(|c| *c as f64 / total).collect();
    let pure = [-3.5, -8.3, -4.4];
    let mut e: f64 = x.iter().zip(pure).map(|(xi, ei)| xi * ei).sum();
    e -= 0.3 * (x[0] * x[1] + x[0] * x[2] + x[1] * x[2]);
    e + 0.02 * ((counts[0] * 7 + counts[1] * 3 + counts[2]) % 5) as f64 / 5.0
}

fn ternary_grid(max_sum: usize) -> Vec<[usize; 3]> {
    let mut grid = vec![[1, 0, 0], [0, 1, 0], [0, 0, 1]];
    for t in 3..=max_sum {
        for a in 1..t {
            for b in 1..(t - a) {
                grid.push([a, b, t - a - b]);
            }
        }
    }
    grid
}

#[test]
fn test_facet_hull_matches_exhaustive_envelope() {
    use alloyscreen::analysis::stability::hull_energy;

    let grid = ternary_grid(6);
    let mut analyzer = StabilityAnalyzer::new(vec!["Cu".into(), "Fe".into(), "Ni".into()], 0.05);
    let mut vertices = Vec::new();
    let mut expected = Vec::new();
    for counts in &grid {
        let s = ternary_cell(*counts);
        let e = rough_energy(*counts);
        analyzer.add_result(&s, e).unwrap();
        let total = counts.iter().sum::<usize>() as f64;
        let x: Vec<f64> = counts.iter().map(|c| *c as f64 / total).collect();
        vertices.push((x.clone(), e));
        expected.push((s.id, x, e));
    }

    let results = analyzer.analyze();
    for (id, x, e) in expected {
        let reference = hull_energy(&vertices, &x, 3).expect("exhaustive hull");
        let r = results.iter().find(|r| r.structure_id == id).unwrap();
        assert!(
            (r.energy_above_hull - (e - reference).max(0.0)).abs() < 1e-7,
            "{}: {} vs {}",
            r.formula,
            r.energy_above_hull,
            e - reference
        );
    }
    assert!(results.iter().any(|r| r.energy_above_hull > 1e-3));
}

#[test]
fn test_large_ternary_grid() {
    use alloyscreen::analysis::stability::LowerHull;

    let grid = ternary_grid(8);
    assert_eq!(grid.len(), 59);
    let mut analyzer = StabilityAnalyzer::new(vec!["Cu".into(), "Fe".into(), "Ni".into()], 0.05);
    let mut vertices = Vec::new();
    for counts in &grid {
        let e = rough_energy(*counts);
        analyzer.add_result(&ternary_cell(*counts), e).unwrap();
        let total = counts.iter().sum::<usize>() as f64;
        vertices.push((counts.iter().map(|c| *c as f64 / total).collect(), e));
    }
    let results = analyzer.analyze();
    assert_eq!(results.len(), 59);
    assert!(results.iter().all(|r| r.energy_above_hull >= 0.0));

    // An end-member is always a hull vertex; Fe carries a 3 % 5 roughness step.
    let hull = LowerHull::build(vertices, 3);
    assert!(hull.facet_count() > 0);
    let fe = hull.energy_at(&[0.0, 1.0, 0.0]).unwrap();
    assert!((fe - (-8.3 + 0.02 * 3.0 / 5.0)).abs() < 1e-9);
}

#[test]
fn test_ternary_points_on_one_edge() {
    // No Ni observed: every composition lies on the Fe-Cr edge, so no facet spans the simplex.
    let mut analyzer = StabilityAnalyzer::new(vec!["Fe".into(), "Cr".into(), "Ni".into()], 0.05);
    let fecr = cell(&["Fe", "Cr"]);
    analyzer.add_result(&cell(&["Fe"]), -8.0).unwrap();
    analyzer.add_result(&cell(&["Cr"]), -9.0).unwrap();
    analyzer.add_result(&fecr, -8.0).unwrap();

    let r = analyzer
        .analyze()
        .into_iter()
        .find(|r| r.structure_id == fecr.id)
        .unwrap();
    assert!((r.energy_above_hull - 0.5).abs() < 1e-9);
}
