// src/core.rs
//
// =============================================================================
// ALLOYSCREEN: CORE SCHEMA AUTHORITY (v 0.1 )
// =============================================================================
//
// The shared vocabulary of the screening pipeline.
// Every other module speaks in these types: the builder emits `Structure`s,
// the calculators consume them, the analyzers reduce them to `Formula`s.
//
// Design Principles:
// 1. Newtype Pattern: Prevent unit errors (eV vs eV/atom).
// 2. Canonical Formulas: Alphabetical, GCD-reduced, count 1 omitted.
// 3. Provenance: Every structure carries the composition it instantiates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// 1. TYPE-SAFE UNITS (The "Newtype" Pattern)
// ============================================================================

/// Energy in Electron Volts (eV).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct ElectronVolts(pub f64);

/// Distance in Angstroms (Å).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Angstroms(pub f64);

// ============================================================================
// 2. ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum FormulaError {
    #[error("Empty formula")]
    Empty,
    #[error("Unexpected character '{ch}' at position {pos} in formula '{formula}'")]
    InvalidCharacter { formula: String, ch: char, pos: usize },
    #[error("Zero count for element '{0}'")]
    ZeroCount(String),
    #[error("A chemical system needs 2 or 3 distinct elements, got {0:?}")]
    InvalidSystem(Vec<String>),
}

// ============================================================================
// 3. INTEGER HELPERS
// ============================================================================

pub fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// GCD of a whole list. Returns 0 for an empty or all-zero list.
pub fn gcd_all<I: IntoIterator<Item = u64>>(values: I) -> u64 {
    values.into_iter().fold(0, gcd)
}

// ============================================================================
// 4. FORMULA
// ============================================================================

/// Element counts keyed by symbol. `BTreeMap` keeps the canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Formula {
    counts: BTreeMap<String, u64>,
}

impl Formula {
    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts = BTreeMap::new();
        for s in symbols {
            *counts.entry(s.as_ref().to_string()).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn from_counts<I, S>(pairs: I) -> Result<Self, FormulaError>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut counts = BTreeMap::new();
        for (el, n) in pairs {
            let el = el.into();
            if n == 0 {
                return Err(FormulaError::ZeroCount(el));
            }
            *counts.entry(el).or_insert(0) += n;
        }
        if counts.is_empty() {
            return Err(FormulaError::Empty);
        }
        Ok(Self { counts })
    }

    /// Parses flat formulas such as `Cu3Ni`, `NiCu3` or `Fe2CrNi`.
    /// Repeated symbols are summed.
    pub fn parse(s: &str) -> Result<Self, FormulaError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(FormulaError::Empty);
        }

        let chars: Vec<char> = trimmed.chars().collect();
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if !c.is_ascii_uppercase() {
                return Err(FormulaError::InvalidCharacter {
                    formula: trimmed.to_string(),
                    ch: c,
                    pos: i,
                });
            }
            let mut symbol = c.to_string();
            i += 1;
            while i < chars.len() && chars[i].is_ascii_lowercase() {
                symbol.push(chars[i]);
                i += 1;
            }

            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let count = if start == i {
                1
            } else {
                let digits: String = chars[start..i].iter().collect();
                // Only digits reach here, so overflow is the only failure.
                digits.parse::<u64>().map_err(|_| FormulaError::InvalidCharacter {
                    formula: trimmed.to_string(),
                    ch: chars[start],
                    pos: start,
                })?
            };
            if count == 0 {
                return Err(FormulaError::ZeroCount(symbol));
            }
            *counts.entry(symbol).or_insert(0) += count;
        }

        Ok(Self { counts })
    }

    /// Divides every count by the common GCD.
    pub fn reduced(&self) -> Formula {
        let g = gcd_all(self.counts.values().copied());
        if g <= 1 {
            return self.clone();
        }
        Formula {
            counts: self
                .counts
                .iter()
                .map(|(k, v)| (k.clone(), v / g))
                .collect(),
        }
    }

    pub fn count(&self, element: &str) -> u64 {
        self.counts.get(element).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(|s| s.as_str())
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Atomic fraction of `element` (0.0 when absent).
    pub fn fraction(&self, element: &str) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.count(element) as f64 / total as f64
    }

    /// Fractions in the order of `elements`. Elements outside the list are ignored.
    pub fn fractions(&self, elements: &[String]) -> Vec<f64> {
        elements.iter().map(|e| self.fraction(e)).collect()
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (el, n) in &self.counts {
            if *n == 1 {
                write!(f, "{}", el)?;
            } else {
                write!(f, "{}{}", el, n)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Formula {
    type Err = FormulaError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

// ============================================================================
// 5. CHEMICAL SYSTEM & COMPOSITION
// ============================================================================

/// An ordered set of 2 or 3 elements, e.g. `Cu-Ni` or `Fe-Cr-Ni`.
/// For binaries the first element is the host lattice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChemicalSystem {
    pub elements: Vec<String>,
}

impl ChemicalSystem {
    pub fn new<S: Into<String>>(elements: Vec<S>) -> Result<Self, FormulaError> {
        let elements: Vec<String> = elements.into_iter().map(Into::into).collect();
        let mut uniq = elements.clone();
        uniq.sort();
        uniq.dedup();
        if uniq.len() != elements.len() || !(2..=3).contains(&elements.len()) {
            return Err(FormulaError::InvalidSystem(elements));
        }
        for el in &elements {
            // Each entry must itself be a single element symbol.
            let f = Formula::parse(el)?;
            if f.counts.len() != 1 || f.total() != 1 {
                return Err(FormulaError::InvalidSystem(elements.clone()));
            }
        }
        Ok(Self { elements })
    }

    pub fn name(&self) -> String {
        self.elements.join("-")
    }

    pub fn is_ternary(&self) -> bool {
        self.elements.len() == 3
    }

    /// True if every element of `formula` belongs to this system.
    pub fn contains(&self, formula: &Formula) -> bool {
        formula.elements().all(|e| self.elements.iter().any(|x| x == e))
    }
}

impl fmt::Display for ChemicalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ChemicalSystem {
    type Err = FormulaError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = s
            .split(|c: char| c == '-' || c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .collect();
        ChemicalSystem::new(parts)
    }
}

/// The recipe a structure instantiates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Composition {
    Pure {
        element: String,
    },
    /// `fraction` is the dopant's share of the lattice sites.
    Binary {
        base: String,
        dopant: String,
        fraction: f64,
    },
    /// Integer partition in the order of the system's elements.
    Ternary {
        elements: [String; 3],
        parts: [u32; 3],
    },
}

impl Composition {
    /// Stable key used in reports, state stores and file names.
    pub fn tag(&self) -> String {
        match self {
            Composition::Pure { element } => format!("pure:{}", element),
            Composition::Binary { fraction, .. } => format!("x{:.4}", fraction),
            Composition::Ternary { parts, .. } => {
                format!("{}:{}:{}", parts[0], parts[1], parts[2])
            }
        }
    }

    pub fn is_pure(&self) -> bool {
        matches!(self, Composition::Pure { .. })
    }

    pub fn elements(&self) -> Vec<String> {
        match self {
            Composition::Pure { element } => vec![element.clone()],
            Composition::Binary { base, dopant, .. } => vec![base.clone(), dopant.clone()],
            Composition::Ternary { elements, .. } => elements.to_vec(),
        }
    }

    /// Target site fractions in the order of `elements()`.
    pub fn target_fractions(&self) -> Vec<f64> {
        match self {
            Composition::Pure { .. } => vec![1.0],
            Composition::Binary { fraction, .. } => vec![1.0 - fraction, *fraction],
            Composition::Ternary { parts, .. } => {
                let total: u32 = parts.iter().sum();
                parts.iter().map(|p| *p as f64 / total as f64).collect()
            }
        }
    }
}

// ============================================================================
// 6. THE STRUCTURE OBJECT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub symbol: String,
    pub position: [f64; 3], // [x, y, z] in Angstroms
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Atom {
    pub fn new(symbol: impl Into<String>, position: [f64; 3]) -> Self {
        Self {
            symbol: symbol.into(),
            position,
            tags: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub vectors: [[f64; 3]; 3], // Row vectors a, b, c
    pub pbc: [bool; 3],
}

impl Lattice {
    pub fn new(vectors: [[f64; 3]; 3]) -> Self {
        Self {
            vectors,
            pbc: [true; 3],
        }
    }

    pub fn orthorhombic(a: f64, b: f64, c: f64) -> Self {
        Self::new([[a, 0.0, 0.0], [0.0, b, 0.0], [0.0, 0.0, c]])
    }

    pub fn volume(&self) -> f64 {
        let a = self.vectors[0];
        let b = self.vectors[1];
        let c = self.vectors[2];
        let cross_x = a[1] * b[2] - a[2] * b[1];
        let cross_y = a[2] * b[0] - a[0] * b[2];
        let cross_z = a[0] * b[1] - a[1] * b[0];
        (cross_x * c[0] + cross_y * c[1] + cross_z * c[2]).abs()
    }

    /// Lengths |a|, |b|, |c|.
    pub fn lengths(&self) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (i, v) in self.vectors.iter().enumerate() {
            out[i] = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        }
        out
    }

    /// Inverse of the row-vector matrix, `None` for a degenerate cell.
    pub fn inverse(&self) -> Option<[[f64; 3]; 3]> {
        let m = &self.vectors;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        Some([
            [
                (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
            ],
            [
                (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
            ],
            [
                (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
            ],
        ])
    }

    /// Cartesian -> fractional, given a precomputed inverse.
    pub fn to_fractional_with(inv: &[[f64; 3]; 3], r: [f64; 3]) -> [f64; 3] {
        let mut f = [0.0; 3];
        for j in 0..3 {
            f[j] = r[0] * inv[0][j] + r[1] * inv[1][j] + r[2] * inv[2][j];
        }
        f
    }

    pub fn to_cartesian(&self, f: [f64; 3]) -> [f64; 3] {
        let m = &self.vectors;
        let mut r = [0.0; 3];
        for j in 0..3 {
            r[j] = f[0] * m[0][j] + f[1] * m[1][j] + f[2] * m[2][j];
        }
        r
    }

    /// Minimum-image displacement for a cartesian difference vector.
    pub fn minimum_image(&self, inv: &[[f64; 3]; 3], d: [f64; 3]) -> [f64; 3] {
        let mut f = Self::to_fractional_with(inv, d);
        for (k, x) in f.iter_mut().enumerate() {
            if self.pbc[k] {
                *x -= x.round();
            }
        }
        self.to_cartesian(f)
    }

    /// Isotropic scaling of all three vectors.
    pub fn scaled(&self, factor: f64) -> Lattice {
        let mut v = self.vectors;
        for row in v.iter_mut() {
            for x in row.iter_mut() {
                *x *= factor;
            }
        }
        Lattice {
            vectors: v,
            pbc: self.pbc,
        }
    }
}

fn unit_multiplicity() -> [usize; 3] {
    [1, 1, 1]
}

/// Compatible with ASE (Python) via JSON serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub atoms: Vec<Atom>,
    pub lattice: Lattice,

    /// Repetitions of the template cell along a, b, c.
    #[serde(default = "unit_multiplicity")]
    pub supercell: [usize; 3],

    #[serde(default)]
    pub composition: Option<Composition>,

    #[serde(default)]
    pub source: String, // e.g. "lattice_builder:fcc"

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Structure {
    pub fn new(atoms: Vec<Atom>, lattice: Lattice, source: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            atoms,
            lattice,
            supercell: unit_multiplicity(),
            composition: None,
            source,
            metadata: HashMap::new(),
        }
    }

    pub fn with_composition(mut self, composition: Composition) -> Self {
        self.composition = Some(composition);
        self
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn positions(&self) -> Vec<[f64; 3]> {
        self.atoms.iter().map(|a| a.position).collect()
    }

    pub fn set_positions(&mut self, positions: &[[f64; 3]]) {
        for (atom, p) in self.atoms.iter_mut().zip(positions) {
            atom.position = *p;
        }
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.atoms.iter().map(|a| a.symbol.as_str()).collect()
    }

    /// Full (supercell) formula, e.g. `Cu24Ni8`.
    pub fn formula(&self) -> Formula {
        Formula::from_symbols(self.atoms.iter().map(|a| a.symbol.as_str()))
    }

    /// GCD-reduced formula string, e.g. `Cu3Ni`.
    pub fn reduced_formula(&self) -> String {
        self.formula().reduced().to_string()
    }

    /// Total mass in amu.
    pub fn mass(&self) -> f64 {
        self.atoms
            .iter()
            .map(|a| crate::physics::atomic_mass(&a.symbol))
            .sum()
    }

    /// Mass density in g/cm³.
    pub fn density(&self) -> f64 {
        crate::physics::density_g_cm3(self.mass(), self.lattice.volume())
    }

    /// Length of the first cell vector (the reported lattice constant).
    pub fn lattice_a(&self) -> f64 {
        self.lattice.lengths()[0]
    }

    /// Tiles the cell `reps` times. Atom order is cell-major, then original order.
    pub fn repeat(&self, reps: [usize; 3]) -> Structure {
        let mut atoms = Vec::with_capacity(self.atoms.len() * reps[0] * reps[1] * reps[2]);
        let v = &self.lattice.vectors;
        for i in 0..reps[0] {
            for j in 0..reps[1] {
                for k in 0..reps[2] {
                    let shift = [
                        i as f64 * v[0][0] + j as f64 * v[1][0] + k as f64 * v[2][0],
                        i as f64 * v[0][1] + j as f64 * v[1][1] + k as f64 * v[2][1],
                        i as f64 * v[0][2] + j as f64 * v[1][2] + k as f64 * v[2][2],
                    ];
                    for a in &self.atoms {
                        let mut atom = a.clone();
                        atom.position = [
                            a.position[0] + shift[0],
                            a.position[1] + shift[1],
                            a.position[2] + shift[2],
                        ];
                        atoms.push(atom);
                    }
                }
            }
        }

        let mut vectors = *v;
        for (axis, n) in reps.iter().enumerate() {
            for x in vectors[axis].iter_mut() {
                *x *= *n as f64;
            }
        }

        Structure {
            id: Uuid::new_v4(),
            atoms,
            lattice: Lattice {
                vectors,
                pbc: self.lattice.pbc,
            },
            supercell: [
                self.supercell[0] * reps[0],
                self.supercell[1] * reps[1],
                self.supercell[2] * reps[2],
            ],
            composition: self.composition.clone(),
            source: self.source.clone(),
            metadata: self.metadata.clone(),
        }
    }
}
