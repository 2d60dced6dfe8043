// src/lib.rs
//
// =============================================================================
// ALLOYSCREEN: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod analysis;
pub mod builder;
pub mod composition;
pub mod config;
pub mod core;
pub mod drivers;
pub mod engine;
pub mod miner;
pub mod physics;
pub mod pipeline;
pub mod provenance;
pub mod resources;
pub mod state;
pub mod trajectory;
pub mod validation;

// 2. Re-exports (The Public API)
// These allow `use alloyscreen::Structure` or `use alloyscreen::PipelineOrchestrator`.

pub use crate::config::ScreeningConfig;
pub use crate::core::{ChemicalSystem, Composition, Formula, Structure};
pub use pipeline::{PipelineOrchestrator, RunSummary, SystemPhase, SystemSummary};
pub use resources::ResourceLedger;
pub use state::{StateKey, StateRecord, StateStore};
