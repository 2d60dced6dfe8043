use alloyscreen::state::{
    find_latest_report, load_report, write_report, CsvReportStore, SqliteStateStore,
};
use alloyscreen::{StateKey, StateRecord, StateStore};

fn relax_row(system: &str, tag: &str, energy: f64) -> StateRecord {
    StateRecord {
        system: system.into(),
        composition: tag.into(),
        formula: "CuNi".into(),
        total_atoms: 4,
        lattice_a: Some(3.57),
        density: Some(8.9),
        energy_per_atom: Some(energy),
        ..Default::default()
    }
}

fn md_row(system: &str, tag: &str, temperature: f64) -> StateRecord {
    StateRecord {
        temperature: Some(temperature),
        md_completed: true,
        md_frames: Some(80),
        ..relax_row(system, tag, -4.0)
    }
}

#[test]
fn test_keys_separate_relax_and_md_rows() {
    let relax = relax_row("Cu-Ni", "x0.5000", -4.0).key();
    let md = md_row("Cu-Ni", "x0.5000", 999.6).key();
    assert_eq!(relax, StateKey::relax("Cu-Ni", "x0.5000"));
    assert_eq!(md, StateKey::md("Cu-Ni", "x0.5000", 1000.0));
    assert_ne!(relax, md);
}

#[test]
fn test_csv_report_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline_results_20240101_000000.csv");

    let mut failed = relax_row("Cu-Ni", "x0.2500", f64::INFINITY);
    failed.energy_per_atom = None;
    failed.error = Some("not converged, 200 steps".into());
    let rows = vec![
        StateRecord {
            completed: true,
            ..relax_row("Cu-Ni", "pure:Cu", -3.5)
        },
        failed,
        md_row("Cu-Ni", "x0.5000", 1000.0),
    ];
    write_report(&path, &rows).unwrap();

    let loaded = load_report(&path).unwrap();
    assert_eq!(loaded, rows);
    assert_eq!(find_latest_report(dir.path()), Some(path));
}

#[test]
fn test_latest_report_is_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("pipeline_results_20240101_000000.csv");
    let new = dir.path().join("pipeline_results_20240202_000000.csv");
    write_report(&old, &[relax_row("Cu-Ni", "pure:Cu", -3.5)]).unwrap();
    write_report(
        &new,
        &[StateRecord {
            completed: true,
            ..relax_row("Cu-Ni", "pure:Ni", -4.4)
        }],
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.csv"), "junk").unwrap();

    let store = CsvReportStore::open(dir.path(), true, None).unwrap();
    assert_eq!(store.resumed_from(), Some(new.as_path()));
    assert!(store.has_completed(&StateKey::relax("Cu-Ni", "pure:Ni")));
    assert!(!store.has_completed(&StateKey::relax("Cu-Ni", "pure:Cu")));

    // Pinned report wins over the newest one.
    let pinned = CsvReportStore::open(dir.path(), true, Some(&old)).unwrap();
    assert_eq!(pinned.all_records().len(), 1);
    assert_eq!(pinned.all_records()[0].composition, "pure:Cu");

    let fresh = CsvReportStore::open(dir.path(), false, None).unwrap();
    assert!(fresh.all_records().is_empty());
}

#[test]
fn test_corrupt_report_means_nothing_completed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("pipeline_results_20240101_000000.csv"),
        "system,composition\nCu-Ni\n\"unterminated",
    )
    .unwrap();
    let store = CsvReportStore::open(dir.path(), true, None).unwrap();
    assert!(store.all_records().is_empty());
}

#[test]
fn test_completion_and_failure_marks() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = CsvReportStore::open(dir.path(), false, None).unwrap();

    store.record_failure(relax_row("Cu-Ni", "x0.2500", -4.0), "diverged").unwrap();
    let key = StateKey::relax("Cu-Ni", "x0.2500");
    assert!(!store.has_completed(&key));
    assert_eq!(store.lookup(&key).unwrap().error.as_deref(), Some("diverged"));

    store.mark_completed(relax_row("Cu-Ni", "x0.2500", -4.0)).unwrap();
    let row = store.lookup(&key).unwrap();
    assert!(row.completed);
    assert!(row.error.is_none());

    store.flush().unwrap();
    let on_disk = load_report(store.output_path()).unwrap();
    assert_eq!(on_disk.len(), 1);
}

#[test]
fn test_sqlite_store_upserts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    {
        let mut store = SqliteStateStore::open(&path).unwrap();
        store.mark_completed(relax_row("Cu-Ni", "pure:Cu", -3.5)).unwrap();
        store.record_failure(relax_row("Cu-Ni", "x0.5000", -4.0), "boom").unwrap();
        store.mark_completed(md_row("Cu-Ni", "x0.5000", 1000.0)).unwrap();
        store.mark_completed(relax_row("Fe-Cr", "pure:Fe", -8.0)).unwrap();
        // Same key again replaces the row.
        store.mark_completed(relax_row("Cu-Ni", "x0.5000", -4.1)).unwrap();
        store.flush().unwrap();
    }

    let store = SqliteStateStore::open(&path).unwrap();
    assert_eq!(store.all_records().len(), 4);
    assert_eq!(store.records_for_system("Cu-Ni").len(), 3);

    let relax = store.lookup(&StateKey::relax("Cu-Ni", "x0.5000")).unwrap();
    assert!(relax.completed);
    assert_eq!(relax.energy_per_atom, Some(-4.1));

    let md = store.lookup(&StateKey::md("Cu-Ni", "x0.5000", 1000.0)).unwrap();
    assert!(md.md_completed);
    assert!(store.lookup(&StateKey::md("Cu-Ni", "x0.5000", 1200.0)).is_none());
}
