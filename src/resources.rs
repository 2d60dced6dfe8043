// src/resources.rs
//
// =============================================================================
// ALLOYSCREEN: RESOURCE LEDGER & TOPOLOGY (v 0.1 )
// =============================================================================
//
// The Inventory.
//
// Responsibilities:
// 1. Detect the scheduler (Local, Slurm, PBS), core count and accelerator count.
// 2. Hand out device slots: one accelerator plus an even share of the cores.
// 3. Turn a slot into isolation env vars for a calculator process
//    (CUDA_VISIBLE_DEVICES, OMP_NUM_THREADS and friends).
//
// At most one calculator context lives on a device at a time; the ledger is
// what enforces that for system-level parallelism.

use serde::{Deserialize, Serialize};
use std::env;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::process::Command;

// ============================================================================
// 1. SANDBOX
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClusterType {
    Local,
    Slurm,
    Pbs,
}

/// A claimed slice of the node. Empty `gpus` means CPU-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub cores: Vec<usize>,
    pub gpus: Vec<usize>,
}

fn id_list(ids: &[usize]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

impl Sandbox {
    /// Pinned to one accelerator, cores left to the OS.
    pub fn for_device(device: Option<usize>) -> Self {
        Self {
            cores: Vec::new(),
            gpus: device.into_iter().collect(),
        }
    }

    /// Short signature for logs, e.g. `gpu[0]`.
    pub fn signature(&self) -> String {
        if self.gpus.is_empty() {
            "cpu".to_string()
        } else {
            format!("gpu{:?}", self.gpus)
        }
    }

    /// Environment a calculator process needs to stay inside this sandbox.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if !self.cores.is_empty() {
            let threads = self.cores.len().to_string();
            for key in ["OMP_NUM_THREADS", "MKL_NUM_THREADS", "OPENBLAS_NUM_THREADS"] {
                vars.push((key, threads.clone()));
            }
            vars.push(("ALLOYSCREEN_PINNED_CORES", id_list(&self.cores)));
        }
        if !self.gpus.is_empty() {
            let devices = id_list(&self.gpus);
            vars.push(("CUDA_VISIBLE_DEVICES", devices.clone()));
            vars.push(("ROCR_VISIBLE_DEVICES", devices));
        }
        vars
    }

    pub fn apply(&self, cmd: &mut Command) {
        for (key, value) in self.env_vars() {
            cmd.env(key, value);
        }
    }
}

// ============================================================================
// 2. THE LEDGER
// ============================================================================

pub struct ResourceLedger {
    pub cluster_type: ClusterType,
    pub hostname: String,
    core_busy: Vec<bool>,
    device_busy: Vec<bool>,
}

impl ResourceLedger {
    /// Inspects the host. `device_override` replaces the detected accelerator count.
    pub fn detect(device_override: Option<usize>) -> Self {
        let (ctype, cores) = detect_scheduler();
        let devices = device_override.unwrap_or_else(detect_devices);
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".into());

        let mut sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        log::info!(
            "🖥️  {} ({:?}): {} cores, {} devices, {} MB",
            hostname,
            ctype,
            cores,
            devices,
            sys.total_memory() / 1024 / 1024
        );

        Self::with_inventory(ctype, hostname, cores, devices)
    }

    /// Fixed inventory, no probing.
    pub fn with_inventory(
        cluster_type: ClusterType,
        hostname: String,
        cores: usize,
        devices: usize,
    ) -> Self {
        Self {
            cluster_type,
            hostname,
            core_busy: vec![false; cores],
            device_busy: vec![false; devices],
        }
    }

    pub fn device_count(&self) -> usize {
        self.device_busy.len()
    }

    pub fn free_devices(&self) -> usize {
        self.device_busy.iter().filter(|b| !**b).count()
    }

    /// Cores that go with each device when the node is split evenly.
    pub fn cores_per_device(&self) -> usize {
        match self.device_busy.len() {
            0 => self.core_busy.len(),
            n => (self.core_busy.len() / n).max(1),
        }
    }

    /// Claims the first free device and its share of cores. `None` when every
    /// device is taken.
    pub fn claim_device(&mut self) -> Option<Sandbox> {
        let device = self.device_busy.iter().position(|b| !b)?;
        self.device_busy[device] = true;

        let want = self.cores_per_device();
        let cores: Vec<usize> = self
            .core_busy
            .iter()
            .enumerate()
            .filter(|(_, busy)| !**busy)
            .map(|(i, _)| i)
            .take(want)
            .collect();
        for &c in &cores {
            self.core_busy[c] = true;
        }

        Some(Sandbox {
            cores,
            gpus: vec![device],
        })
    }

    pub fn release(&mut self, sandbox: &Sandbox) {
        for &d in &sandbox.gpus {
            if let Some(slot) = self.device_busy.get_mut(d) {
                *slot = false;
            }
        }
        for &c in &sandbox.cores {
            if let Some(slot) = self.core_busy.get_mut(c) {
                *slot = false;
            }
        }
    }
}

// ============================================================================
// 3. DETECTION
// ============================================================================

/// Scheduler type and the cores it granted this job.
fn detect_scheduler() -> (ClusterType, usize) {
    // SLURM_CPUS_ON_NODE may look like "8(x2)".
    let leading_int = |s: String| {
        s.split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|n| n.parse::<usize>().ok())
    };

    if env::var("SLURM_JOB_ID").is_ok() {
        let cores = env::var("SLURM_CPUS_ON_NODE")
            .ok()
            .and_then(leading_int)
            .unwrap_or_else(num_cpus::get);
        return (ClusterType::Slurm, cores);
    }
    if env::var("PBS_JOBID").is_ok() {
        let cores = env::var("NCPUS")
            .ok()
            .and_then(leading_int)
            .unwrap_or_else(num_cpus::get);
        return (ClusterType::Pbs, cores);
    }
    (ClusterType::Local, num_cpus::get())
}

/// Visible accelerators: an outer CUDA_VISIBLE_DEVICES mask wins over
/// `nvidia-smi`. No tooling means no devices.
fn detect_devices() -> usize {
    if let Ok(mask) = env::var("CUDA_VISIBLE_DEVICES") {
        let n = mask.split(',').filter(|s| !s.trim().is_empty()).count();
        if n > 0 {
            return n;
        }
    }

    std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count()
        })
        .unwrap_or(0)
}
