use anyhow::{anyhow, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// The 20 standard residues, in index-encoding order.
pub const COMMON_AMINO_ACIDS: &str = "ACDEFGHIKLMNPQRSTVWY";

/// Filler / unknown residue. Index 20 in the index encoding.
pub const UNKNOWN_AMINO_ACID: char = 'X';

/// Number of symbols seen by an embedding layer: 20 residues plus `X`.
pub const ALPHABET_SIZE: usize = 21;

const BLOSUM62_MATRIX: &str = "
   A  R  N  D  C  Q  E  G  H  I  L  K  M  F  P  S  T  W  Y  V  X
A  4 -1 -2 -2  0 -1 -1  0 -2 -1 -1 -1 -1 -2 -1  1  0 -3 -2  0  0
R -1  5  0 -2 -3  1  0 -2  0 -3 -2  2 -1 -3 -2 -1 -1 -3 -2 -3  0
N -2  0  6  1 -3  0  0  0  1 -3 -3  0 -2 -3 -2  1  0 -4 -2 -3  0
D -2 -2  1  6 -3  0  2 -1 -1 -3 -4 -1 -3 -3 -1  0 -1 -4 -3 -3  0
C  0 -3 -3 -3  9 -3 -4 -3 -3 -1 -1 -3 -1 -2 -3 -1 -1 -2 -2 -1  0
Q -1  1  0  0 -3  5  2 -2  0 -3 -2  1  0 -3 -1  0 -1 -2 -1 -2  0
E -1  0  0  2 -4  2  5 -2  0 -3 -3  1 -2 -3 -1  0 -1 -3 -2 -2  0
G  0 -2  0 -1 -3 -2 -2  6 -2 -4 -4 -2 -3 -3 -2  0 -2 -2 -3 -3  0
H -2  0  1 -1 -3  0  0 -2  8 -3 -3 -1 -2 -1 -2 -1 -2 -2  2 -3  0
I -1 -3 -3 -3 -1 -3 -3 -4 -3  4  2 -3  1  0 -3 -2 -1 -3 -1  3  0
L -1 -2 -3 -4 -1 -2 -3 -4 -3  2  4 -2  2  0 -3 -2 -1 -2 -1  1  0
K -1  2  0 -1 -3  1  1 -2 -1 -3 -2  5 -1 -3 -1  0 -1 -3 -2 -2  0
M -1 -1 -2 -3 -1  0 -2 -3 -2  1  2 -1  5  0 -2 -1 -1 -1 -1  1  0
F -2 -3 -3 -3 -2 -3 -3 -3 -1  0  0 -3  0  6 -4 -2 -2  1  3 -1  0
P -1 -2 -2 -1 -3 -1 -1 -2 -2 -3 -3 -1 -2 -4  7 -1 -1 -4 -3 -2  0
S  1 -1  1  0 -1  0  0  0 -1 -2 -2  0 -1 -2 -1  4  1 -3 -2 -2  0
T  0 -1  0 -1 -1 -1 -1 -2 -2 -1 -1 -1 -1 -2 -1  1  5 -2 -2  0  0
W -3 -3 -4 -4 -2 -2 -3 -2 -2 -3 -2 -3 -1  1 -4 -3 -2 11  2 -3  0
Y -2 -2 -2 -3 -2 -1 -2 -3  2 -1 -1 -2 -1  3 -3 -2 -2  2  7 -1  0
V  0 -3 -3 -3 -1 -2 -2 -3 -3  3  1 -2  1 -1 -2 -2  0 -3 -1  4  0
X  0  0  0  0  0  0  0  0  0  0  0  0  0  0  0  0  0  0  0  0  1
";

/// Residue -> fixed numeric vector tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorEncoding {
    #[serde(rename = "BLOSUM62")]
    Blosum62,
    #[serde(rename = "one-hot")]
    OneHot,
}

impl VectorEncoding {
    pub fn dim(&self) -> usize {
        ALPHABET_SIZE
    }

    /// Row of the table for `residue`, or `None` when outside the alphabet.
    pub fn vector(&self, residue: char) -> Option<&'static [f32]> {
        let idx = amino_acid_index(residue)?;
        let table = match self {
            VectorEncoding::Blosum62 => blosum62_table(),
            VectorEncoding::OneHot => one_hot_table(),
        };
        Some(&table[idx])
    }
}

/// Position of `residue` in `COMMON_AMINO_ACIDS` + `X`.
pub fn amino_acid_index(residue: char) -> Option<usize> {
    if residue == UNKNOWN_AMINO_ACID {
        return Some(ALPHABET_SIZE - 1);
    }
    COMMON_AMINO_ACIDS.find(residue)
}

fn blosum62_table() -> &'static Vec<Vec<f32>> {
    static TABLE: OnceLock<Vec<Vec<f32>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut lines = BLOSUM62_MATRIX.lines().filter(|l| !l.trim().is_empty());
        let columns: Vec<char> = lines
            .next()
            .map(|header| header.split_whitespace().filter_map(|c| c.chars().next()).collect())
            .unwrap_or_default();

        let mut rows: HashMap<char, HashMap<char, f32>> = HashMap::new();
        for line in lines {
            let mut fields = line.split_whitespace();
            let Some(row_aa) = fields.next().and_then(|f| f.chars().next()) else {
                continue;
            };
            let values: HashMap<char, f32> = columns
                .iter()
                .zip(fields.filter_map(|v| v.parse::<f32>().ok()))
                .map(|(c, v)| (*c, v))
                .collect();
            rows.insert(row_aa, values);
        }

        let alphabet: Vec<char> = alphabet().collect();
        alphabet
            .iter()
            .map(|r| {
                alphabet
                    .iter()
                    .map(|c| rows.get(r).and_then(|row| row.get(c)).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect()
    })
}

fn one_hot_table() -> &'static Vec<Vec<f32>> {
    static TABLE: OnceLock<Vec<Vec<f32>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        (0..ALPHABET_SIZE)
            .map(|i| {
                let mut row = vec![0.0f32; ALPHABET_SIZE];
                row[i] = 1.0;
                row
            })
            .collect()
    })
}

/// The full index-encoding alphabet: 20 residues followed by `X`.
pub fn alphabet() -> impl Iterator<Item = char> {
    COMMON_AMINO_ACIDS.chars().chain(std::iter::once(UNKNOWN_AMINO_ACID))
}

/// Residue frequencies over the 20 common amino acids.
///
/// `smoothing` is added to every count before normalizing, so a residue never
/// seen in `peptides` still gets sampled when smoothing > 0.
pub fn amino_acid_distribution<S: AsRef<str>>(peptides: &[S], smoothing: f64) -> Vec<f64> {
    let mut counts = vec![smoothing; COMMON_AMINO_ACIDS.len()];
    for peptide in peptides {
        for c in peptide.as_ref().chars() {
            if let Some(idx) = COMMON_AMINO_ACIDS.find(c) {
                counts[idx] += 1.0;
            }
        }
    }
    let total: f64 = counts.iter().sum();
    if total <= 0.0 {
        return vec![1.0 / COMMON_AMINO_ACIDS.len() as f64; COMMON_AMINO_ACIDS.len()];
    }
    counts.iter().map(|c| c / total).collect()
}

/// Draw `num` random peptides of `length` residues.
///
/// Residues are sampled independently from `distribution` (weights over
/// `COMMON_AMINO_ACIDS`), or uniformly when `None`.
pub fn random_peptides<R: Rng + ?Sized>(
    num: usize,
    length: usize,
    distribution: Option<&[f64]>,
    rng: &mut R,
) -> Result<Vec<String>> {
    let residues: Vec<char> = COMMON_AMINO_ACIDS.chars().collect();
    let uniform = vec![1.0; residues.len()];
    let weights = distribution.unwrap_or(&uniform);
    if weights.len() != residues.len() {
        return Err(anyhow!(
            "Amino acid distribution has {} entries, expected {}",
            weights.len(),
            residues.len()
        ));
    }
    let sampler = WeightedIndex::new(weights)
        .map_err(|e| anyhow!("Invalid amino acid distribution: {}", e))?;

    Ok((0..num)
        .map(|_| (0..length).map(|_| residues[sampler.sample(rng)]).collect())
        .collect())
}
