// src/analysis.rs
//
// =============================================================================
// ALLOYSCREEN: ANALYSIS (v 0.1 )
// =============================================================================
//
// The Judges.
//
// Responsibilities:
// 1. Thermodynamic verdict: distance of each relaxed structure to the lower
//    convex hull of its chemical system.
// 2. Kinetic verdict: thermal stability of an MD trajectory after the
//    equilibration window is discarded.

pub mod md_analyzer;
pub mod stability;

pub use md_analyzer::{AnalysisError, MDResult, TrajectoryAnalyzer};
pub use stability::{StabilityAnalyzer, StabilityError, StabilityResult};
