pub mod amino_acid;
pub mod featurize;
pub mod nn;
