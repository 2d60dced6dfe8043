// src/trajectory.rs
//
// =============================================================================
// ALLOYSCREEN: TRAJECTORY STORE (v 0.1)
// =============================================================================
//
// Responsibilities:
// - Immutable, Append-Only Storage of relaxation and MD frames.
// - Container: Bincode (Fast, Compact, Type-Safe).
// - Deterministic names keyed by (formula, temperature, ensemble, index);
//   an existing file is never overwritten, a numbered sibling is created.
//
// Defensive Features:
// - Magic Headers: 0x414C5452 ("ALTR") anchors every record.
// - CRC32 Checksums: Detects bit-rot and partial writes.
// - Self-Healing: Reader scans byte-by-byte to recover from corruption.
// - Size Limits: Rejects records > 128MB to prevent OOM.

use anyhow::{anyhow, Context, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// -----------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------

// "ALTR" in ASCII / Big Endian
const MAGIC_BYTES: u32 = 0x414C5452;

// Hard limit to prevent memory exhaustion on corrupted length reads
const MAX_RECORD_SIZE: u32 = 128 * 1024 * 1024; // 128 MB

// Numbered siblings tried before giving up on a name.
const MAX_NAME_ATTEMPTS: usize = 10_000;

// -----------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrajectoryKind {
    Relax,
    Md,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryHeader {
    pub kind: TrajectoryKind,
    /// Reduced formula.
    pub formula: String,
    pub composition_tag: String,
    pub target_temperature: Option<f64>,
    pub ensemble: Option<String>,
    pub n_atoms: usize,
    pub species: Vec<String>,
    pub created_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub step: usize,
    pub positions: Vec<[f64; 3]>,
    pub cell: [[f64; 3]; 3],
    pub volume: f64,
    /// Instantaneous kinetic temperature (K); 0 for relaxation frames.
    pub temperature: f64,
    /// Total potential energy (eV).
    pub potential_energy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrajectoryRecord {
    Header(TrajectoryHeader),
    Frame(Frame),
}

/// Where a trajectory lives. The read path accepts exactly what the write path returned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrajectoryHandle {
    pub path: PathBuf,
}

impl TrajectoryHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// A fully loaded trajectory.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub header: Option<TrajectoryHeader>,
    pub frames: Vec<Frame>,
}

impl Trajectory {
    pub fn load(handle: &TrajectoryHandle) -> Result<Self> {
        let mut reader = TrajectoryReader::open(&handle.path)?;
        let mut header = None;
        let mut frames = Vec::new();
        while let Some(rec) = reader.next()? {
            match rec {
                TrajectoryRecord::Header(h) => {
                    if header.is_none() {
                        header = Some(h);
                    }
                }
                TrajectoryRecord::Frame(f) => frames.push(f),
            }
        }
        Ok(Self { header, frames })
    }

    pub fn n_atoms(&self) -> usize {
        match &self.header {
            Some(h) => h.n_atoms,
            None => self.frames.first().map(|f| f.positions.len()).unwrap_or(0),
        }
    }
}

// =============================================================================
// STORE (Naming)
// =============================================================================

#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    root: PathBuf,
}

/// Keeps file names portable: `2:1:1` -> `2-1-1`.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

impl TrajectoryStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create trajectory dir {:?}", root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `md_<formula>_<T>K_<ensemble>[_<index>]`
    pub fn md_stem(formula: &str, temperature: f64, ensemble: &str, index: Option<usize>) -> String {
        let mut stem = format!(
            "md_{}_{:.0}K_{}",
            sanitize(formula),
            temperature,
            sanitize(ensemble)
        );
        if let Some(i) = index {
            stem.push_str(&format!("_{}", i));
        }
        stem
    }

    /// `relax_<formula>_<composition tag>`
    pub fn relax_stem(formula: &str, tag: &str) -> String {
        format!("relax_{}_{}", sanitize(formula), sanitize(tag))
    }

    /// Creates a fresh file for `stem`. If `stem.traj` exists, `stem_r1.traj`,
    /// `stem_r2.traj`, ... are tried. Existing files are never truncated.
    pub fn create(&self, stem: &str) -> Result<TrajectoryWriter> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{}.traj", stem)
            } else {
                format!("{}_r{}.traj", stem, attempt)
            };
            let path = self.root.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok(TrajectoryWriter::from_file(path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {:?}", path));
                }
            }
        }
        Err(anyhow!("No free trajectory name for stem '{}'", stem))
    }
}

// =============================================================================
// WRITER (Append-Only)
// =============================================================================

/// A writer dropped without `finish` deletes its file.
pub struct TrajectoryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: usize,
    finished: bool,
}

impl TrajectoryWriter {
    fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            writer: BufWriter::new(file),
            frames: 0,
            finished: false,
        }
    }

    pub fn append(&mut self, record: &TrajectoryRecord) -> Result<()> {
        // 1. Serialize Container to Binary (Bincode)
        let bytes = bincode::serialize(record).context("Bincode serialization failed")?;

        let len = bytes.len() as u32;
        if bytes.len() > MAX_RECORD_SIZE as usize {
            return Err(anyhow!("Record exceeds 128MB limit: {} bytes", bytes.len()));
        }

        // 2. Calculate Integrity Checksum (CRC32)
        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        let crc = hasher.finalize();

        // 3. Write Frame: [MAGIC][CRC][LEN][DATA]
        self.writer.write_all(&MAGIC_BYTES.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&bytes)?;

        if matches!(record, TrajectoryRecord::Frame(_)) {
            self.frames += 1;
        }
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames
    }

    /// Flushes to the OS and returns the read handle.
    pub fn finish(mut self) -> Result<TrajectoryHandle> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data().ok();
        self.finished = true;
        Ok(TrajectoryHandle::new(self.path.clone()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TrajectoryWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::warn!("🗑️ Discarded unfinished trajectory {:?}", self.path),
            Err(e) => log::warn!("Could not remove unfinished trajectory {:?}: {}", self.path, e),
        }
    }
}

// =============================================================================
// READER (Self-Healing)
// =============================================================================

pub struct TrajectoryReader {
    reader: BufReader<File>,
    cursor: u64,
    path: PathBuf,
}

impl TrajectoryReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("Failed to open trajectory: {:?}", path))?;

        Ok(Self {
            reader: BufReader::new(file),
            cursor: 0,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tries to read the next record.
    /// Returns:
    /// - `Ok(Some(record))`: Valid record found.
    /// - `Ok(None)`: End-Of-File, possibly after skipping a corrupt tail.
    pub fn next(&mut self) -> Result<Option<TrajectoryRecord>> {
        loop {
            let start_pos = self.cursor;
            self.reader.seek(SeekFrom::Start(start_pos))?;

            // A. Read Magic (4 bytes)
            let mut magic_buf = [0u8; 4];
            match self.reader.read_exact(&mut magic_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            let magic = u32::from_le_bytes(magic_buf);
            if magic != MAGIC_BYTES {
                log::warn!(
                    "Corruption at offset {} in {:?}. Magic: {:x}. Scanning...",
                    start_pos,
                    self.path,
                    magic
                );
                match self.scan_for_magic(start_pos + 1)? {
                    Some(new_offset) => {
                        self.cursor = new_offset;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            // B. Read Metadata (CRC + Len = 8 bytes)
            let mut meta_buf = [0u8; 8];
            if self.reader.read_exact(&mut meta_buf).is_err() {
                return Ok(None); // Partial write at EOF
            }
            let expected_crc = u32::from_le_bytes([meta_buf[0], meta_buf[1], meta_buf[2], meta_buf[3]]);
            let len = u32::from_le_bytes([meta_buf[4], meta_buf[5], meta_buf[6], meta_buf[7]]);

            if len > MAX_RECORD_SIZE {
                log::error!(
                    "Implausible record length {} at {}. Header corrupt.",
                    len,
                    start_pos
                );
                match self.scan_for_magic(start_pos + 1)? {
                    Some(new_offset) => {
                        self.cursor = new_offset;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            // C. Read Payload
            let mut payload = vec![0u8; len as usize];
            if self.reader.read_exact(&mut payload).is_err() {
                return Ok(None); // Partial payload write
            }

            // D. Validate Integrity (CRC32)
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != expected_crc {
                log::error!("CRC Mismatch at {} in {:?}. Data corrupted.", start_pos, self.path);
                match self.scan_for_magic(start_pos + 1)? {
                    Some(new_offset) => {
                        self.cursor = new_offset;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let next_offset = start_pos + 12 + len as u64;

            // E. Deserialize Container (Bincode)
            match bincode::deserialize::<TrajectoryRecord>(&payload) {
                Ok(r) => {
                    self.cursor = next_offset;
                    return Ok(Some(r));
                }
                Err(e) => {
                    log::error!("Bincode Error at {}: {}. Skipping.", start_pos, e);
                    self.cursor = next_offset;
                    continue;
                }
            }
        }
    }

    /// Brute-force scan for the next magic word.
    fn scan_for_magic(&mut self, start_scan: u64) -> Result<Option<u64>> {
        self.reader.seek(SeekFrom::Start(start_scan))?;

        let mut byte = [0u8; 1];
        let mut buffer = [0u8; 4]; // Rolling window
        let mut valid_bytes = 0;
        let mut current_pos = start_scan;

        while valid_bytes < 4 {
            if self.reader.read(&mut byte)? == 0 {
                return Ok(None);
            }
            buffer[valid_bytes] = byte[0];
            valid_bytes += 1;
            current_pos += 1;
        }

        loop {
            if u32::from_le_bytes(buffer) == MAGIC_BYTES {
                return Ok(Some(current_pos - 4));
            }

            if self.reader.read(&mut byte)? == 0 {
                return Ok(None);
            }

            buffer.rotate_left(1);
            buffer[3] = byte[0];
            current_pos += 1;
        }
    }
}
