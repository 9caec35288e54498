use std::error::Error;
use std::fmt;

/// Failure to turn a peptide into a fixed-length network input.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingError {
    /// No padding or trimming rule maps this length onto the target length.
    UnsupportedLength {
        peptide: String,
        length: usize,
        min_length: usize,
        max_length: usize,
    },
    /// Residue outside the alphabet and no fallback symbol configured.
    UnknownResidue { peptide: String, residue: char },
    EmptySequence,
    InvalidConfig(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncodingError::UnsupportedLength {
                peptide,
                length,
                min_length,
                max_length,
            } => write!(
                f,
                "Peptide {} has length {}; supported lengths are {}-{}",
                peptide, length, min_length, max_length
            ),
            EncodingError::UnknownResidue { peptide, residue } => write!(
                f,
                "Peptide {} contains unsupported residue '{}'",
                peptide, residue
            ),
            EncodingError::EmptySequence => write!(f, "Cannot encode an empty sequence"),
            EncodingError::InvalidConfig(msg) => write!(f, "Invalid encoding config: {}", msg),
        }
    }
}

impl Error for EncodingError {}

/// Error kinds surfaced by model training, prediction and persistence.
///
/// Library functions return `anyhow::Result`; use
/// `err.downcast_ref::<AffinityError>()` to recover the kind.
#[derive(Debug, Clone, PartialEq)]
pub enum AffinityError {
    Encoding(EncodingError),
    /// Supplied hyperparameter name is not part of the schema.
    UnsupportedHyperparameter(String),
    /// Two schemas being merged declare different defaults for one key.
    ConflictingHyperparameterDefault(String),
    InvalidHyperparameter(String),
    /// Neither an allele-specific nor a pan-allele ensemble covers the allele.
    UnsupportedAllele(String),
    /// The covering ensemble has no member accepting this peptide length.
    UnsupportedPeptideLength { allele: String, peptide: String },
    /// A manifest row points at a missing or unreadable artifact.
    CorruptArtifact {
        allele: String,
        member_index: Option<usize>,
        path: String,
        reason: String,
    },
    InvalidInput(String),
}

impl AffinityError {
    /// Errors that `no_throw` prediction turns into a NaN row.
    pub fn is_coverage_error(&self) -> bool {
        matches!(
            self,
            AffinityError::UnsupportedAllele(_) | AffinityError::UnsupportedPeptideLength { .. }
        )
    }

    /// Input or configuration mistakes. These fail the same way on every
    /// attempt, so training never skips or retries them.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            AffinityError::Encoding(_)
                | AffinityError::UnsupportedHyperparameter(_)
                | AffinityError::ConflictingHyperparameterDefault(_)
                | AffinityError::InvalidHyperparameter(_)
                | AffinityError::InvalidInput(_)
        )
    }
}

impl fmt::Display for AffinityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AffinityError::Encoding(e) => write!(f, "{}", e),
            AffinityError::UnsupportedHyperparameter(key) => {
                write!(f, "Unsupported hyperparameter: {}", key)
            }
            AffinityError::ConflictingHyperparameterDefault(key) => write!(
                f,
                "Hyperparameter {} is declared twice with different defaults",
                key
            ),
            AffinityError::InvalidHyperparameter(msg) => {
                write!(f, "Invalid hyperparameter value: {}", msg)
            }
            AffinityError::UnsupportedAllele(allele) => {
                write!(f, "No models cover allele {}", allele)
            }
            AffinityError::UnsupportedPeptideLength { allele, peptide } => write!(
                f,
                "No model for allele {} supports the length of peptide {} ({})",
                allele,
                peptide,
                peptide.len()
            ),
            AffinityError::CorruptArtifact {
                allele,
                member_index,
                path,
                reason,
            } => match member_index {
                Some(idx) => write!(
                    f,
                    "Corrupt artifact for allele {} member {} at {}: {}",
                    allele, idx, path, reason
                ),
                None => write!(
                    f,
                    "Corrupt artifact for allele {} at {}: {}",
                    allele, path, reason
                ),
            },
            AffinityError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl Error for AffinityError {}

impl From<EncodingError> for AffinityError {
    fn from(e: EncodingError) -> Self {
        AffinityError::Encoding(e)
    }
}
