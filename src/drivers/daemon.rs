// src/drivers/daemon.rs
//
// =============================================================================
// ALLOYSCREEN: POTENTIAL DAEMON DRIVER (v 0.1 )
// =============================================================================
//
// The Persistent Daemon.
//
// Responsibilities:
// 1. Maintain a long-running Python process (Kernel) to hold VRAM state.
// 2. Stream requests via Stdin/Stdout (JSON lines).
// 3. Bind the kernel to exactly one sandbox (device) for its lifetime.
// 4. Capture Stderr in real-time for debugging ("Glass Box").
// 5. Reboot the kernel on the next call after a crash.

use crate::core::{ElectronVolts, Structure};
use crate::drivers::{Calculator, Evaluation};
use crate::physics::SanityCheck;
use crate::provenance::ModelNotary;
use crate::resources::Sandbox;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

// ============================================================================
// 1. THE DRIVER STRUCT
// ============================================================================

#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub python: String,
    pub script: PathBuf,
    pub model_path: Option<PathBuf>,
    pub expected_model_hash: Option<String>,
    pub handshake_timeout_s: u64,
}

pub struct DaemonCalculator {
    spec: DaemonSpec,
    sandbox: Sandbox,
    kernel: Option<DaemonKernel>,
    model_hash: Option<String>,
}

impl DaemonCalculator {
    pub fn new(spec: DaemonSpec, sandbox: Sandbox) -> Self {
        Self {
            spec,
            sandbox,
            kernel: None,
            model_hash: None,
        }
    }

    pub fn model_hash(&self) -> Option<&str> {
        self.model_hash.as_deref()
    }
}

// ============================================================================
// 2. THE KERNEL (Running Process)
// ============================================================================

struct DaemonKernel {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl DaemonKernel {
    async fn kill(&mut self) {
        let _ = self.process.kill().await;
    }
}

// ============================================================================
// 3. IMPLEMENTATION
// ============================================================================

#[async_trait]
impl Calculator for DaemonCalculator {
    async fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation> {
        // A. SEMANTIC VALIDATOR (The Gatekeeper)
        // Don't send garbage to the GPU.
        if let Err(e) = structure.validate_physics() {
            return Err(anyhow!("Physical Integrity Check Failed: {}", e));
        }

        // B. KERNEL MANAGEMENT (The Persistent Daemon)
        if self.kernel.is_none() {
            let k = self.boot_kernel().await?;
            self.kernel = Some(k);
        }
        let kernel = self
            .kernel
            .as_mut()
            .ok_or_else(|| anyhow!("Daemon kernel missing after boot"))?;

        // C. EXECUTION (The Stream)
        let req_json = serde_json::to_string(&DaemonRequest {
            structure,
            calc_mode: "single_point",
        })?;

        kernel
            .stdin
            .write_all(req_json.as_bytes())
            .await
            .context("Failed to write to daemon stdin")?;
        kernel.stdin.write_all(b"\n").await?;
        kernel.stdin.flush().await?;

        let mut resp_line = String::new();
        let bytes_read = kernel
            .stdout
            .read_line(&mut resp_line)
            .await
            .context("Failed to read from daemon stdout")?;

        if bytes_read == 0 {
            // EOF = Daemon Crashed. Invalidate so the next call reboots it.
            kernel.kill().await;
            self.kernel = None;
            return Err(anyhow!(
                "Potential daemon crashed unexpectedly (EOF on stdout). Check logs."
            ));
        }

        // D. Parse Response
        let resp: DaemonResponse = serde_json::from_str(&resp_line)
            .with_context(|| format!("Invalid JSON from daemon: '{}'", resp_line.trim()))?;

        if let Some(err) = resp.error {
            return Err(anyhow!("Daemon Logic Error: {}", err));
        }

        let energy = resp
            .energy
            .ok_or_else(|| anyhow!("Daemon response carries no energy"))?;
        if !energy.is_finite() {
            return Err(anyhow!("Daemon returned non-finite energy {}", energy));
        }
        let forces = resp
            .forces
            .ok_or_else(|| anyhow!("Daemon response carries no forces"))?;
        if forces.len() != structure.len() {
            return Err(anyhow!(
                "Daemon returned {} force vectors for {} atoms",
                forces.len(),
                structure.len()
            ));
        }

        Ok(Evaluation {
            energy: ElectronVolts(energy),
            forces,
            stress: resp.stress,
        })
    }

    fn label(&self) -> String {
        format!("daemon@{}", self.sandbox.signature())
    }

    async fn shutdown(&mut self) {
        if let Some(mut k) = self.kernel.take() {
            k.kill().await;
        }
    }
}

impl DaemonCalculator {
    async fn boot_kernel(&mut self) -> Result<DaemonKernel> {
        // PROVENANCE (The Notary): refuse silently swapped weights.
        if let Some(p) = &self.spec.model_path {
            let hash = ModelNotary::verify(p, self.spec.expected_model_hash.as_deref())?;
            self.model_hash = Some(hash);
        }

        // 1. Construct Command
        let mut cmd = Command::new(&self.spec.python);
        cmd.arg("-u"); // Unbuffered python stdout is CRITICAL for streaming
        cmd.arg(&self.spec.script);
        if let Some(p) = &self.spec.model_path {
            cmd.arg("--model").arg(p);
        }
        cmd.arg("--device")
            .arg(if self.sandbox.gpus.is_empty() { "cpu" } else { "cuda" });

        // 2. Apply Isolation (CUDA_VISIBLE_DEVICES, thread caps)
        self.sandbox.apply(&mut cmd);

        // 3. Setup Pipes
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // 4. Spawn
        let mut child = cmd.spawn().context("Failed to spawn potential daemon")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to open daemon stdin"))?;
        let raw_stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to open daemon stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to open daemon stderr"))?;

        // 5. Glass Box Logging (Stderr -> Rust Log)
        let tag = self.sandbox.signature();
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::warn!("[DAEMON {}] {}", tag, line);
            }
        });

        // 6. Handshake (Wait for "READY" once the model is loaded)
        let mut handshake_reader = BufReader::new(raw_stdout);
        let mut handshake = String::new();
        let timeout = Duration::from_secs(self.spec.handshake_timeout_s);

        match tokio::time::timeout(timeout, handshake_reader.read_line(&mut handshake)).await {
            Ok(Ok(n)) if n > 0 => {
                if !handshake.trim().contains("READY") {
                    let _ = child.kill().await;
                    return Err(anyhow!(
                        "Daemon boot failed. Expected 'READY', got: '{}'",
                        handshake.trim()
                    ));
                }
            }
            Ok(_) => {
                let _ = child.kill().await;
                return Err(anyhow!("Daemon closed stdout during boot"));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(anyhow!(
                    "Daemon timed out loading model ({}s)",
                    self.spec.handshake_timeout_s
                ));
            }
        }

        log::info!("🧠 Potential daemon ready on {}", self.sandbox.signature());

        Ok(DaemonKernel {
            process: child,
            stdin,
            stdout: handshake_reader,
        })
    }
}

// ============================================================================
// 4. PROTOCOL SCHEMA (Private)
// ============================================================================

#[derive(Serialize)]
struct DaemonRequest<'a> {
    structure: &'a Structure,
    calc_mode: &'static str,
}

#[derive(Deserialize)]
struct DaemonResponse {
    energy: Option<f64>,
    forces: Option<Vec<[f64; 3]>>,
    stress: Option<[[f64; 3]; 3]>,
    error: Option<String>,
}
