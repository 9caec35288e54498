use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use ndarray::{concatenate, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use crate::building_blocks::amino_acid::{amino_acid_index, VectorEncoding, UNKNOWN_AMINO_ACID};
use crate::error::{AffinityError, EncodingError};

fn encoding_error(e: EncodingError) -> anyhow::Error {
    AffinityError::Encoding(e).into()
}

/// How residues become numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeptideEncoding {
    /// Residue -> integer, consumed by an embedding layer.
    #[serde(rename = "index")]
    Index,
    #[serde(rename = "BLOSUM62")]
    Blosum62,
    #[serde(rename = "one-hot")]
    OneHot,
}

impl PeptideEncoding {
    pub fn vector_encoding(&self) -> Option<VectorEncoding> {
        match self {
            PeptideEncoding::Index => None,
            PeptideEncoding::Blosum62 => Some(VectorEncoding::Blosum62),
            PeptideEncoding::OneHot => Some(VectorEncoding::OneHot),
        }
    }
}

/// Maps a variable-length peptide onto `kmer_size` positions.
///
/// The first `left_edge` and last `right_edge` residues keep their positions
/// so terminal anchors stay aligned. Shorter peptides get `X` filler around
/// the middle residues; longer peptides (up to `max_length`) lose residues
/// from the middle. `middle_offset` is how many filler slots (or dropped
/// residues) sit before the kept middle residues; `None` puts the larger half
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub peptide_encoding: PeptideEncoding,
    pub kmer_size: usize,
    pub left_edge: usize,
    pub right_edge: usize,
    pub max_length: usize,
    pub middle_offset: Option<usize>,
    pub fallback_symbol: Option<char>,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            peptide_encoding: PeptideEncoding::Blosum62,
            kmer_size: 15,
            left_edge: 4,
            right_edge: 4,
            max_length: 15,
            middle_offset: None,
            fallback_symbol: None,
        }
    }
}

impl EncodingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.left_edge + self.right_edge > self.kmer_size {
            return Err(encoding_error(EncodingError::InvalidConfig(format!(
                "left_edge ({}) + right_edge ({}) exceeds kmer_size ({})",
                self.left_edge, self.right_edge, self.kmer_size
            ))));
        }
        if self.max_length < self.kmer_size {
            return Err(encoding_error(EncodingError::InvalidConfig(format!(
                "max_length ({}) is below kmer_size ({})",
                self.max_length, self.kmer_size
            ))));
        }
        if let Some(symbol) = self.fallback_symbol {
            if amino_acid_index(symbol).is_none() {
                return Err(encoding_error(EncodingError::InvalidConfig(format!(
                    "fallback symbol '{}' is not in the alphabet",
                    symbol
                ))));
            }
        }
        Ok(())
    }

    pub fn supported_lengths(&self) -> RangeInclusive<usize> {
        (self.left_edge + self.right_edge).max(1)..=self.max_length
    }

    /// Alphabet indices of `peptide` laid out over `kmer_size` positions.
    pub fn fixed_length_indices(&self, peptide: &str) -> Result<Vec<usize>> {
        let residues: Vec<usize> = peptide
            .chars()
            .map(|c| match amino_acid_index(c) {
                Some(idx) => Ok(idx),
                None => match self.fallback_symbol.and_then(amino_acid_index) {
                    Some(idx) => Ok(idx),
                    None => Err(encoding_error(EncodingError::UnknownResidue {
                        peptide: peptide.to_string(),
                        residue: c,
                    })),
                },
            })
            .collect::<Result<_>>()?;

        let length = residues.len();
        let supported = self.supported_lengths();
        if length == 0 {
            return Err(encoding_error(EncodingError::EmptySequence));
        }
        if !supported.contains(&length) {
            return Err(encoding_error(EncodingError::UnsupportedLength {
                peptide: peptide.to_string(),
                length,
                min_length: *supported.start(),
                max_length: *supported.end(),
            }));
        }

        let filler = amino_acid_index(UNKNOWN_AMINO_ACID).unwrap_or(0);
        let middle_slots = self.kmer_size - self.left_edge - self.right_edge;
        let middle_len = length - self.left_edge - self.right_edge;
        let mut result = vec![filler; self.kmer_size];

        result[..self.left_edge].copy_from_slice(&residues[..self.left_edge]);
        result[self.kmer_size - self.right_edge..]
            .copy_from_slice(&residues[length - self.right_edge..]);

        let middle = &residues[self.left_edge..length - self.right_edge];
        if middle_len <= middle_slots {
            let num_fill = middle_slots - middle_len;
            let offset = self.offset_for(num_fill);
            let start = self.left_edge + offset;
            result[start..start + middle_len].copy_from_slice(middle);
        } else {
            let num_drop = middle_len - middle_slots;
            let offset = self.offset_for(num_drop);
            result[self.left_edge..self.left_edge + middle_slots]
                .copy_from_slice(&middle[offset..offset + middle_slots]);
        }
        Ok(result)
    }

    fn offset_for(&self, count: usize) -> usize {
        self.middle_offset
            .unwrap_or_else(|| count.div_ceil(2))
            .min(count)
    }
}

/// Fixed-length numeric form of a batch of peptides.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedPeptides {
    /// (n, kmer_size) alphabet indices.
    Index(Array2<u32>),
    /// (n, kmer_size, vector_dim).
    Vector(Array3<f32>),
}

impl EncodedPeptides {
    pub fn len(&self) -> usize {
        match self {
            EncodedPeptides::Index(a) => a.shape()[0],
            EncodedPeptides::Vector(a) => a.shape()[0],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        match self {
            EncodedPeptides::Index(a) => EncodedPeptides::Index(a.select(Axis(0), rows)),
            EncodedPeptides::Vector(a) => EncodedPeptides::Vector(a.select(Axis(0), rows)),
        }
    }

    pub fn concatenate(&self, other: &Self) -> Result<Self> {
        match (self, other) {
            (EncodedPeptides::Index(a), EncodedPeptides::Index(b)) => Ok(EncodedPeptides::Index(
                concatenate(Axis(0), &[a.view(), b.view()])?,
            )),
            (EncodedPeptides::Vector(a), EncodedPeptides::Vector(b)) => Ok(
                EncodedPeptides::Vector(concatenate(Axis(0), &[a.view(), b.view()])?),
            ),
            _ => Err(anyhow!("Cannot concatenate index and vector encodings")),
        }
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let tensor = match self {
            EncodedPeptides::Index(a) => {
                let (n, l) = a.dim();
                Tensor::from_vec(a.iter().copied().collect::<Vec<u32>>(), (n, l), device)?
            }
            EncodedPeptides::Vector(a) => {
                let (n, l, d) = a.dim();
                Tensor::from_vec(a.iter().copied().collect::<Vec<f32>>(), (n, l, d), device)?
            }
        };
        Ok(tensor)
    }
}

/// Vector-encode equal-length sequences without any length normalization.
///
/// Used for allele pseudosequences, which are already fixed length.
pub fn vector_encode_fixed_length<S: AsRef<str>>(
    sequences: &[S],
    encoding: VectorEncoding,
) -> Result<Array3<f32>> {
    let length = sequences.first().map(|s| s.as_ref().chars().count()).unwrap_or(0);
    let dim = encoding.dim();
    let mut result = Array3::<f32>::zeros((sequences.len(), length, dim));
    for (i, seq) in sequences.iter().enumerate() {
        let seq = seq.as_ref();
        if seq.chars().count() != length {
            return Err(anyhow!(
                "Expected sequences of length {}, got {} ({})",
                length,
                seq.chars().count(),
                seq
            ));
        }
        for (j, c) in seq.chars().enumerate() {
            let vector = encoding.vector(c).ok_or_else(|| {
                encoding_error(EncodingError::UnknownResidue {
                    peptide: seq.to_string(),
                    residue: c,
                })
            })?;
            for (k, v) in vector.iter().enumerate() {
                result[[i, j, k]] = *v;
            }
        }
    }
    Ok(result)
}

/// A batch of peptides plus memoized encodings of it.
///
/// Duplicates are encoded once; every `encode` call for a config already seen
/// returns the cached array.
#[derive(Debug)]
pub struct SequenceEncoder {
    sequences: Vec<String>,
    unique: Vec<String>,
    positions: Vec<usize>,
    cache: Mutex<HashMap<EncodingConfig, Arc<EncodedPeptides>>>,
}

impl SequenceEncoder {
    pub fn create<S: AsRef<str>>(sequences: &[S]) -> Result<Self> {
        let mut unique = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut positions = Vec::with_capacity(sequences.len());

        for seq in sequences {
            let seq = seq.as_ref();
            if seq.is_empty() {
                return Err(encoding_error(EncodingError::EmptySequence));
            }
            if let Some(bad) = seq.chars().find(|c| !c.is_ascii_uppercase()) {
                return Err(encoding_error(EncodingError::UnknownResidue {
                    peptide: seq.to_string(),
                    residue: bad,
                }));
            }
            let next = index.len();
            let pos = *index.entry(seq).or_insert_with(|| {
                unique.push(seq.to_string());
                next
            });
            positions.push(pos);
        }

        Ok(Self {
            sequences: sequences.iter().map(|s| s.as_ref().to_string()).collect(),
            unique,
            positions,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn sequences(&self) -> &[String] {
        &self.sequences
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn num_unique(&self) -> usize {
        self.unique.len()
    }

    /// Sub-batch of the rows at `rows`, in that order.
    pub fn subset(&self, rows: &[usize]) -> Result<Self> {
        let seqs: Vec<&str> = rows.iter().map(|&i| self.sequences[i].as_str()).collect();
        Self::create(&seqs)
    }

    /// Encode every input sequence (input order) under `config`.
    pub fn encode(&self, config: &EncodingConfig) -> Result<Arc<EncodedPeptides>> {
        {
            let cache = self
                .cache
                .lock()
                .map_err(|_| anyhow!("Encoding cache lock poisoned"))?;
            if let Some(hit) = cache.get(config) {
                return Ok(Arc::clone(hit));
            }
        }

        config.validate()?;
        let unique_encoded = self.encode_unique(config)?;
        let encoded = Arc::new(unique_encoded.select(&self.positions));

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("Encoding cache lock poisoned"))?;
        cache.insert(config.clone(), Arc::clone(&encoded));
        Ok(encoded)
    }

    fn encode_unique(&self, config: &EncodingConfig) -> Result<EncodedPeptides> {
        let n = self.unique.len();
        let l = config.kmer_size;
        let indices: Vec<Vec<usize>> = self
            .unique
            .iter()
            .map(|s| config.fixed_length_indices(s))
            .collect::<Result<_>>()?;

        match config.peptide_encoding.vector_encoding() {
            None => {
                let flat: Vec<u32> = indices.iter().flatten().map(|&i| i as u32).collect();
                Ok(EncodedPeptides::Index(Array2::from_shape_vec((n, l), flat)?))
            }
            Some(vector_encoding) => {
                let dim = vector_encoding.dim();
                let alphabet: Vec<char> = crate::building_blocks::amino_acid::alphabet().collect();
                let mut result = Array3::<f32>::zeros((n, l, dim));
                for (i, row) in indices.iter().enumerate() {
                    for (j, &aa) in row.iter().enumerate() {
                        if let Some(vector) = vector_encoding.vector(alphabet[aa]) {
                            for (k, v) in vector.iter().enumerate() {
                                result[[i, j, k]] = *v;
                            }
                        }
                    }
                }
                Ok(EncodedPeptides::Vector(result))
            }
        }
    }
}
