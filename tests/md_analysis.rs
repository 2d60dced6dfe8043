use alloyscreen::analysis::{AnalysisError, TrajectoryAnalyzer};
use alloyscreen::config::AnalysisConfig;
use alloyscreen::trajectory::{Frame, TrajectoryHeader, TrajectoryKind, TrajectoryRecord, TrajectoryStore};

fn frame(step: usize, temperature: f64, volume: f64, energy: f64) -> Frame {
    Frame {
        step,
        positions: vec![[0.0; 3]; 4],
        cell: [[volume.cbrt(), 0.0, 0.0], [0.0, volume.cbrt(), 0.0], [0.0, 0.0, volume.cbrt()]],
        volume,
        temperature,
        potential_energy: energy,
    }
}

fn steady(n: usize) -> Vec<Frame> {
    (0..n).map(|i| frame(i, 1000.0, 100.0, -16.0)).collect()
}

#[test]
fn test_equilibration_window() {
    let analyzer = TrajectoryAnalyzer::default();
    assert_eq!(analyzer.discarded_frames(100), 20);
    assert_eq!(analyzer.discarded_frames(5), 1);
    assert_eq!(analyzer.discarded_frames(1), 1);
    assert_eq!(analyzer.discarded_frames(0), 0);

    let r = analyzer.analyze_frames(&steady(100), 4).unwrap();
    assert_eq!(r.frame_count, 80);

    let r = analyzer.analyze_frames(&steady(5), 4).unwrap();
    assert_eq!(r.frame_count, 4);
}

#[test]
fn test_single_frame_has_no_window() {
    let analyzer = TrajectoryAnalyzer::default();
    let err = analyzer.analyze_frames(&steady(1), 4).unwrap_err();
    assert!(matches!(
        err,
        AnalysisError::EmptyAnalysisWindow { total: 1, discarded: 1 }
    ));
    assert!(matches!(
        analyzer.analyze_frames(&steady(10), 0),
        Err(AnalysisError::NoAtoms)
    ));
}

#[test]
fn test_steady_run_is_stable() {
    let analyzer = TrajectoryAnalyzer::default();
    let r = analyzer.analyze_frames(&steady(10), 4).unwrap();
    assert!((r.avg_temperature - 1000.0).abs() < 1e-9);
    assert_eq!(r.temperature_fluctuation_pct, 0.0);
    assert!((r.avg_energy_per_atom + 4.0).abs() < 1e-12);
    assert_eq!(r.volume_change_pct, 0.0);
    assert!(r.is_thermally_stable);
}

#[test]
fn test_fluctuation_threshold_is_strict() {
    let analyzer = TrajectoryAnalyzer::default();
    // Frame 0 is equilibration; the window alternates 900/1100 K.
    let mut frames = vec![frame(0, 5000.0, 100.0, -16.0)];
    for i in 1..=4 {
        let t = if i % 2 == 0 { 900.0 } else { 1100.0 };
        frames.push(frame(i, t, 100.0, -16.0));
    }
    let r = analyzer.analyze_frames(&frames, 4).unwrap();
    assert!((r.avg_temperature - 1000.0).abs() < 1e-9);
    assert!((r.temperature_fluctuation_pct - 10.0).abs() < 1e-9);
    assert!(!r.is_thermally_stable);
}

#[test]
fn test_volume_collapse_is_unstable() {
    let analyzer = TrajectoryAnalyzer::default();
    let mut frames = vec![frame(0, 1000.0, 500.0, -16.0)];
    frames.push(frame(1, 1000.0, 100.0, -16.0));
    frames.push(frame(2, 1000.0, 92.0, -16.0));
    frames.push(frame(3, 1000.0, 85.0, -16.0));
    let r = analyzer.analyze_frames(&frames, 4).unwrap();
    assert!((r.volume_change_pct + 15.0).abs() < 1e-9);
    assert!(!r.is_thermally_stable);

    // A looser bound accepts the same run.
    let lenient = TrajectoryAnalyzer::from_config(&AnalysisConfig {
        max_volume_change_pct: 20.0,
        ..Default::default()
    });
    assert!(lenient.analyze_frames(&frames, 4).unwrap().is_thermally_stable);
}

#[test]
fn test_analyze_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = TrajectoryStore::new(dir.path()).unwrap();
    let mut writer = store.create("md_CuNi_1000K_nvt").unwrap();
    writer
        .append(&TrajectoryRecord::Header(TrajectoryHeader {
            kind: TrajectoryKind::Md,
            formula: "CuNi".into(),
            composition_tag: "x0.5000".into(),
            target_temperature: Some(1000.0),
            ensemble: Some("nvt".into()),
            n_atoms: 4,
            species: vec!["Cu".into(), "Cu".into(), "Ni".into(), "Ni".into()],
            created_ms: 0,
        }))
        .unwrap();
    for f in steady(10) {
        writer.append(&TrajectoryRecord::Frame(f)).unwrap();
    }
    let handle = writer.finish().unwrap();

    let r = TrajectoryAnalyzer::default().analyze(&handle).unwrap();
    assert_eq!(r.frame_count, 8);
    assert!(r.is_thermally_stable);

    let missing = alloyscreen::trajectory::TrajectoryHandle::new(dir.path().join("nope.traj"));
    assert!(matches!(
        TrajectoryAnalyzer::default().analyze(&missing),
        Err(AnalysisError::Unreadable { .. })
    ));
}
