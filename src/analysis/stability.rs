// src/analysis/stability.rs
//
// Energy above the lower convex hull.
//
// Lifecycle: Collecting -> Analyzed. Results are computed once and cached, so
// `analyze()` can be called any number of times.
//
// The lower hull is built once per analysis: every n-subset of distinct
// compositions spans a candidate plane, kept as a facet when no observation
// lies below it. The hull energy at q is the highest facet plane at q.
// Point sets that span no facet (all compositions collinear) fall back to the
// minimum of sum(l_i * E_i) over convex combinations reproducing q.

use crate::core::{Composition, Structure};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const COMPOSITION_TOL: f64 = 1e-8;
const WEIGHT_TOL: f64 = 1e-9;
const HULL_TOL: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum StabilityError {
    #[error("Results already analyzed; no further observations accepted")]
    AlreadyAnalyzed,
    #[error("Structure {formula} contains {element}, which is not part of {system}")]
    ForeignElement {
        formula: String,
        element: String,
        system: String,
    },
    #[error("Cannot place an empty structure on the hull")]
    EmptyStructure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityResult {
    pub structure_id: Uuid,
    /// Reduced formula.
    pub formula: String,
    pub composition: Option<Composition>,
    pub energy_per_atom: f64,
    pub energy_above_hull: f64,
    pub is_stable: bool,
}

#[derive(Debug, Clone)]
struct Observation {
    structure_id: Uuid,
    formula: String,
    composition: Option<Composition>,
    fractions: Vec<f64>,
    energy_per_atom: f64,
}

#[derive(Debug)]
enum State {
    Collecting,
    Analyzed(Vec<StabilityResult>),
}

pub struct StabilityAnalyzer {
    elements: Vec<String>,
    threshold: f64,
    observations: Vec<Observation>,
    state: State,
}

impl StabilityAnalyzer {
    pub fn new(elements: Vec<String>, threshold: f64) -> Self {
        Self {
            elements,
            threshold,
            observations: Vec::new(),
            state: State::Collecting,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Number of accepted (finite) observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn is_analyzed(&self) -> bool {
        matches!(self.state, State::Analyzed(_))
    }

    /// Non-finite energies (failed relaxations) are dropped silently.
    pub fn add_result(
        &mut self,
        structure: &Structure,
        energy_per_atom: f64,
    ) -> Result<(), StabilityError> {
        if self.is_analyzed() {
            return Err(StabilityError::AlreadyAnalyzed);
        }
        if !energy_per_atom.is_finite() {
            log::debug!("Skipping sentinel energy for {}", structure.reduced_formula());
            return Ok(());
        }
        if structure.is_empty() {
            return Err(StabilityError::EmptyStructure);
        }

        let formula = structure.formula();
        if let Some(foreign) = formula.elements().find(|e| !self.elements.iter().any(|s| s == e)) {
            return Err(StabilityError::ForeignElement {
                formula: formula.reduced().to_string(),
                element: foreign.to_string(),
                system: self.elements.join("-"),
            });
        }

        self.observations.push(Observation {
            structure_id: structure.id,
            formula: formula.reduced().to_string(),
            composition: structure.composition.clone(),
            fractions: formula.fractions(&self.elements),
            energy_per_atom,
        });
        Ok(())
    }

    /// Idempotent. The first call freezes the observation set.
    pub fn analyze(&mut self) -> Vec<StabilityResult> {
        if let State::Analyzed(results) = &self.state {
            return results.clone();
        }
        let results = self.compute();
        self.state = State::Analyzed(results.clone());
        results
    }

    fn compute(&self) -> Vec<StabilityResult> {
        // The hull only depends on the lowest energy at each distinct composition.
        let mut vertices: Vec<(Vec<f64>, f64)> = Vec::new();
        for o in &self.observations {
            match vertices.iter_mut().find(|(x, _)| same_point(x, &o.fractions)) {
                Some((_, e)) => *e = e.min(o.energy_per_atom),
                None => vertices.push((o.fractions.clone(), o.energy_per_atom)),
            }
        }

        let trivial = vertices.len() < 2;
        if trivial && !self.observations.is_empty() {
            log::info!(
                "   ℹ️ Fewer than two distinct compositions in {}; all points on the hull",
                self.elements.join("-")
            );
        }
        let hull = LowerHull::build(vertices, self.elements.len());

        self.observations
            .iter()
            .map(|o| {
                let e_above = if trivial {
                    0.0
                } else {
                    let e_hull = hull.energy_at(&o.fractions).unwrap_or(o.energy_per_atom);
                    (o.energy_per_atom - e_hull).max(0.0)
                };
                StabilityResult {
                    structure_id: o.structure_id,
                    formula: o.formula.clone(),
                    composition: o.composition.clone(),
                    energy_per_atom: o.energy_per_atom,
                    energy_above_hull: e_above,
                    is_stable: e_above <= self.threshold,
                }
            })
            .collect()
    }
}

fn same_point(a: &[f64], b: &[f64]) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() < COMPOSITION_TOL)
}

/// Lower convex envelope of (composition, energy) points in an n-element
/// simplex. Compositions are full fraction vectors; the last fraction is
/// implied by the others and dropped for the plane fits.
pub struct LowerHull {
    vertices: Vec<(Vec<f64>, f64)>,
    n: usize,
    /// `E(x) = c[0] + sum(c[i + 1] * x[i])` for each facet plane.
    facets: Vec<Vec<f64>>,
}

impl LowerHull {
    /// `vertices` should hold one (lowest) energy per distinct composition.
    pub fn build(mut vertices: Vec<(Vec<f64>, f64)>, n: usize) -> Self {
        // Low energies first: they reject most candidate planes immediately.
        vertices.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut facets = Vec::new();
        if n >= 2 && vertices.len() >= n {
            let mut support = Vec::with_capacity(n);
            visit_supports(vertices.len(), n, 0, &mut support, &mut |idx| {
                if let Some(plane) = fit_plane(&vertices, idx, n) {
                    let supporting = vertices
                        .iter()
                        .all(|(x, e)| *e >= eval_plane(&plane, x) - HULL_TOL);
                    if supporting {
                        facets.push(plane);
                    }
                }
            });
        }
        log::debug!(
            "Lower hull: {} facets over {} compositions",
            facets.len(),
            vertices.len()
        );
        Self {
            vertices,
            n,
            facets,
        }
    }

    pub fn facet_count(&self) -> usize {
        self.facets.len()
    }

    /// Hull energy at `query` (full fraction vector).
    pub fn energy_at(&self, query: &[f64]) -> Option<f64> {
        if self.facets.is_empty() {
            return hull_energy(&self.vertices, query, self.n);
        }
        self.facets
            .iter()
            .map(|plane| eval_plane(plane, query))
            .max_by(|a, b| a.total_cmp(b))
    }
}

fn eval_plane(plane: &[f64], x: &[f64]) -> f64 {
    plane[0]
        + plane[1..]
            .iter()
            .zip(x)
            .map(|(c, xi)| c * xi)
            .sum::<f64>()
}

/// Plane through the n vertices in `idx`; `None` when they are affinely
/// dependent.
fn fit_plane(vertices: &[(Vec<f64>, f64)], idx: &[usize], n: usize) -> Option<Vec<f64>> {
    let m: Vec<Vec<f64>> = idx
        .iter()
        .map(|&i| {
            let (x, e) = &vertices[i];
            let mut row = Vec::with_capacity(n + 1);
            row.push(1.0);
            row.extend_from_slice(&x[..n - 1]);
            row.push(*e);
            row
        })
        .collect();
    gauss_solve(m)
}

/// Lowest convex combination of `vertices` reproducing `query`, using
/// supports of up to `max_support` points. Exhaustive; used directly only
/// for degenerate point sets.
pub fn hull_energy(vertices: &[(Vec<f64>, f64)], query: &[f64], max_support: usize) -> Option<f64> {
    let mut best: Option<f64> = None;
    let mut support = Vec::with_capacity(max_support);
    for k in 1..=max_support.min(vertices.len()) {
        visit_supports(vertices.len(), k, 0, &mut support, &mut |idx| {
            if let Some(e) = combination_energy(vertices, idx, query) {
                best = Some(best.map_or(e, |b: f64| b.min(e)));
            }
        });
    }
    best
}

fn visit_supports(
    n: usize,
    k: usize,
    start: usize,
    current: &mut Vec<usize>,
    f: &mut dyn FnMut(&[usize]),
) {
    if current.len() == k {
        f(&current[..]);
        return;
    }
    for i in start..n {
        current.push(i);
        visit_supports(n, k, i + 1, current, f);
        current.pop();
    }
}

/// Solves A l = q in the least-squares sense (columns of A are the support
/// compositions). `None` if the system is singular, the residual is not
/// zero, or any weight is negative.
fn combination_energy(vertices: &[(Vec<f64>, f64)], idx: &[usize], query: &[f64]) -> Option<f64> {
    let k = idx.len();
    let dim = query.len();

    // Normal equations: (A^T A) l = A^T q
    let mut m = vec![vec![0.0; k + 1]; k];
    for r in 0..k {
        for c in 0..k {
            m[r][c] = (0..dim)
                .map(|d| vertices[idx[r]].0[d] * vertices[idx[c]].0[d])
                .sum();
        }
        m[r][k] = (0..dim).map(|d| vertices[idx[r]].0[d] * query[d]).sum();
    }
    let weights = gauss_solve(m)?;

    if weights.iter().any(|w| *w < -WEIGHT_TOL) {
        return None;
    }
    for d in 0..dim {
        let x: f64 = (0..k).map(|j| weights[j] * vertices[idx[j]].0[d]).sum();
        if (x - query[d]).abs() > COMPOSITION_TOL * 10.0 {
            return None;
        }
    }
    Some((0..k).map(|j| weights[j] * vertices[idx[j]].1).sum())
}

/// Gaussian elimination with partial pivoting on an augmented k x (k+1) matrix.
fn gauss_solve(mut m: Vec<Vec<f64>>) -> Option<Vec<f64>> {
    let k = m.len();
    for col in 0..k {
        let pivot = (col..k).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for row in 0..k {
            if row == col {
                continue;
            }
            let factor = m[row][col] / m[col][col];
            for c in col..=k {
                m[row][c] -= factor * m[col][c];
            }
        }
    }
    Some((0..k).map(|i| m[i][k] / m[i][i]).collect())
}
