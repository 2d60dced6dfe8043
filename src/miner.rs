// src/miner.rs
//
// =============================================================================
// ALLOYSCREEN: EXTERNAL MINER ADAPTER (v 0.1 )
// =============================================================================
//
// The Compatibility Adapter for materials databases.
//
// Responsibilities:
// 1. Define the `Miner` trait (observed formulas + reference rows).
// 2. "The Sandwich": Rust spawns the configured command, the command talks to
//    the remote database, prints a JSON array on stdout, Rust parses it.
// 3. Bound every call with a timeout so a hung API never stalls a system.
//
// Command protocol: `<command> <args..> <mode> <El1> <El2> [<El3>]`
// where mode is `ratios` or `references`.

use crate::config::MinerConfig;
use crate::validation::reference::{RawReferenceRow, ReferenceRow};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

// ============================================================================
// 1. THE TRAIT
// ============================================================================

#[async_trait]
pub trait Miner: Send + Sync {
    /// Formulas of known phases inside the chemical system.
    async fn mine_formulas(&self, elements: &[String]) -> Result<Vec<String>>;

    /// Experimental reference rows for the chemical system.
    async fn fetch_references(&self, elements: &[String]) -> Result<Vec<ReferenceRow>>;
}

// ============================================================================
// 2. COMMAND MINER
// ============================================================================

pub struct CommandMiner {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

/// Accepts either `["Cu3Ni", ...]` or `[{"formula": "Cu3Ni", ...}, ...]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum MinedEntry {
    Formula(String),
    Record { formula: String },
}

impl CommandMiner {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    /// `None` when no command is configured.
    pub fn from_config(cfg: &MinerConfig) -> Option<Self> {
        cfg.command.as_ref().map(|c| {
            Self::new(
                c.clone(),
                cfg.args.clone(),
                Duration::from_secs(cfg.timeout_s.unwrap_or(120)),
            )
        })
    }

    async fn call(&self, mode: &str, elements: &[String]) -> Result<Value> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg(mode);
        cmd.args(elements);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn miner '{}'", self.command))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("Miner timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::error!(
                "Miner '{}' failed. Exit: {:?}\nSTDERR tail:\n{}",
                self.command,
                output.status.code(),
                stderr.lines().rev().take(10).collect::<Vec<_>>().join("\n")
            );
            return Err(anyhow!(
                "Miner exited with error code {:?}",
                output.status.code()
            ));
        }

        let out_str = String::from_utf8_lossy(&output.stdout);
        let json: Value =
            serde_json::from_str(out_str.trim()).context("Miner returned invalid JSON")?;
        Ok(json)
    }
}

#[async_trait]
impl Miner for CommandMiner {
    async fn mine_formulas(&self, elements: &[String]) -> Result<Vec<String>> {
        let json = self.call("ratios", elements).await?;
        let entries: Vec<MinedEntry> =
            serde_json::from_value(json).context("Unexpected miner ratio payload")?;
        Ok(entries
            .into_iter()
            .map(|e| match e {
                MinedEntry::Formula(f) => f,
                MinedEntry::Record { formula } => formula,
            })
            .collect())
    }

    async fn fetch_references(&self, elements: &[String]) -> Result<Vec<ReferenceRow>> {
        let json = self.call("references", elements).await?;
        let raw: Vec<RawReferenceRow> =
            serde_json::from_value(json).context("Unexpected miner reference payload")?;

        let mut rows = Vec::with_capacity(raw.len());
        for r in raw {
            match r.into_row("MP") {
                Ok(row) => rows.push(row),
                Err(e) => log::warn!("Skipping malformed reference row: {}", e),
            }
        }
        Ok(rows)
    }
}
