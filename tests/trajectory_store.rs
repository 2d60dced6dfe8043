use alloyscreen::trajectory::{
    Frame, Trajectory, TrajectoryHeader, TrajectoryKind, TrajectoryRecord, TrajectoryStore,
};
use std::fs::OpenOptions;
use std::io::Write;

fn frame(step: usize) -> Frame {
    Frame {
        step,
        positions: vec![[0.0, 0.0, 0.0], [1.8, 1.8, 0.0]],
        cell: [[3.6, 0.0, 0.0], [0.0, 3.6, 0.0], [0.0, 0.0, 3.6]],
        volume: 3.6f64.powi(3),
        temperature: 300.0 + step as f64,
        potential_energy: -7.0,
    }
}

fn header() -> TrajectoryHeader {
    TrajectoryHeader {
        kind: TrajectoryKind::Relax,
        formula: "Cu".into(),
        composition_tag: "pure:Cu".into(),
        target_temperature: None,
        ensemble: None,
        n_atoms: 2,
        species: vec!["Cu".into(), "Cu".into()],
        created_ms: 0,
    }
}

#[test]
fn test_stem_names() {
    assert_eq!(
        TrajectoryStore::md_stem("Cu3Ni", 1000.0, "npt", None),
        "md_Cu3Ni_1000K_npt"
    );
    assert_eq!(
        TrajectoryStore::md_stem("Cu3Ni", 1200.4, "nvt", Some(2)),
        "md_Cu3Ni_1200K_nvt_2"
    );
    assert_eq!(
        TrajectoryStore::relax_stem("FeCrNi2", "1:1:2"),
        "relax_FeCrNi2_1-1-2"
    );
}

#[test]
fn test_existing_files_are_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let store = TrajectoryStore::new(dir.path()).unwrap();

    let mut first = store.create("md_Cu_300K_nvt").unwrap();
    first.append(&TrajectoryRecord::Frame(frame(0))).unwrap();
    let first = first.finish().unwrap();

    let second = store.create("md_Cu_300K_nvt").unwrap().finish().unwrap();
    let third = store.create("md_Cu_300K_nvt").unwrap().finish().unwrap();

    assert_eq!(first.file_name(), "md_Cu_300K_nvt.traj");
    assert_eq!(second.file_name(), "md_Cu_300K_nvt_r1.traj");
    assert_eq!(third.file_name(), "md_Cu_300K_nvt_r2.traj");

    let reloaded = Trajectory::load(&first).unwrap();
    assert_eq!(reloaded.frames.len(), 1);
}

#[test]
fn test_reader_recovers_from_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = TrajectoryStore::new(dir.path()).unwrap();

    let mut writer = store.create("relax_Cu_pure-Cu").unwrap();
    writer.append(&TrajectoryRecord::Header(header())).unwrap();
    writer.append(&TrajectoryRecord::Frame(frame(0))).unwrap();
    writer.append(&TrajectoryRecord::Frame(frame(1))).unwrap();
    assert_eq!(writer.frames_written(), 2);
    let handle = writer.finish().unwrap();

    // Garbage between records.
    {
        let mut f = OpenOptions::new().append(true).open(&handle.path).unwrap();
        f.write_all(b"not a record at all").unwrap();
    }
    // A valid record after the garbage, copied from a scratch file.
    let mut scratch = store.create("scratch").unwrap();
    scratch.append(&TrajectoryRecord::Frame(frame(2))).unwrap();
    let scratch = scratch.finish().unwrap();
    {
        let bytes = std::fs::read(&scratch.path).unwrap();
        let mut f = OpenOptions::new().append(true).open(&handle.path).unwrap();
        f.write_all(&bytes).unwrap();
    }

    // A torn write at the tail.
    {
        let mut f = OpenOptions::new().append(true).open(&handle.path).unwrap();
        f.write_all(&0x414C5452u32.to_le_bytes()).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
    }

    let traj = Trajectory::load(&handle).unwrap();
    assert_eq!(traj.header, Some(header()));
    assert_eq!(traj.n_atoms(), 2);
    let steps: Vec<usize> = traj.frames.iter().map(|f| f.step).collect();
    assert_eq!(steps, vec![0, 1, 2]);
}

#[test]
fn test_unfinished_writer_removes_its_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = TrajectoryStore::new(dir.path()).unwrap();

    let mut writer = store.create("md_Cu_300K_nvt").unwrap();
    writer.append(&TrajectoryRecord::Header(header())).unwrap();
    writer.append(&TrajectoryRecord::Frame(frame(0))).unwrap();
    let path = writer.path().to_path_buf();
    assert!(path.exists());
    drop(writer);
    assert!(!path.exists());

    // The name is free again.
    let handle = store.create("md_Cu_300K_nvt").unwrap().finish().unwrap();
    assert_eq!(handle.file_name(), "md_Cu_300K_nvt.traj");
}
