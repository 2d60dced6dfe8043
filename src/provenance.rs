// src/provenance.rs
//
// =============================================================================
// ALLOYSCREEN: ARTIFACT NOTARY (v 0.1 )
// =============================================================================
//
// The Trust Layer.
//
// Responsibilities:
// 1. Streamed SHA-256 of files and byte slices.
// 2. Model Notarization: Verifies ML model weights match expected hashes.
// 3. Run stamps: who ran what, where, with which configuration.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

// ============================================================================
// 1. HASHING UTILITIES
// ============================================================================

/// Calculates SHA256 of a file efficiently (streamed).
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("Failed to open for hashing: {:?}", path))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];

    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Calculates SHA256 of a byte slice (e.g. JSON string).
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// 2. MODEL NOTARY (ML Provenance)
// ============================================================================

pub struct ModelNotary;

impl ModelNotary {
    /// Verifies that a model file on disk matches the expected hash.
    /// Returns the actual hash so it can be stamped into the run summary.
    pub fn verify(model_path: &Path, expected_hash: Option<&str>) -> Result<String> {
        if !model_path.exists() {
            return Err(anyhow!("Model file not found: {:?}", model_path));
        }

        let actual_hash = sha256_file(model_path).context("Failed to hash model weights")?;

        if let Some(expected) = expected_hash {
            if actual_hash != expected {
                return Err(anyhow!(
                    "Model Integrity Violation! Path: {:?}\nExpected: {}\nActual:   {}",
                    model_path,
                    expected,
                    actual_hash
                ));
            }
        }

        Ok(actual_hash)
    }
}

// ============================================================================
// 3. RUN STAMP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStamp {
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config_sha256: String,
    pub model_sha256: Option<String>,
    pub version: String,
}

impl RunStamp {
    pub fn begin(config_sha256: String, model_sha256: Option<String>) -> Self {
        Self {
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".into()),
            started_at: Utc::now(),
            finished_at: None,
            config_sha256,
            model_sha256,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
