use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::building_blocks::featurize::EncodingConfig;
use crate::error::AffinityError;

pub const MANIFEST_FILE: &str = "manifest.csv";
pub const PSEUDOSEQUENCES_FILE: &str = "pseudosequences.csv";
pub const CALIBRATION_DIR: &str = "percent_ranks";

/// Allele label used for members of the shared pan-allele ensemble.
pub const PAN_ALLELE_LABEL: &str = "pan-class1";

/// One ensemble member: which allele it serves and where its artifacts live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub model_name: String,
    pub allele: String,
    pub member_index: usize,
    /// JSON form of the member's `EncodingConfig`.
    pub encoding: String,
    pub config_file: String,
    pub weights_file: String,
}

impl ManifestRow {
    pub fn new(allele: &str, member_index: usize, encoding: &EncodingConfig) -> Result<Self> {
        let model_name = model_name(allele, member_index);
        Ok(Self {
            config_file: format!("{}.json", model_name),
            weights_file: format!("weights_{}.safetensors", model_name),
            model_name,
            allele: allele.to_string(),
            member_index,
            encoding: serde_json::to_string(encoding)?,
        })
    }

    /// The same member under a new index, with a fresh name and file names.
    pub fn renumbered(&self, member_index: usize) -> Self {
        let model_name = model_name(&self.allele, member_index);
        Self {
            config_file: format!("{}.json", model_name),
            weights_file: format!("weights_{}.safetensors", model_name),
            model_name,
            allele: self.allele.clone(),
            member_index,
            encoding: self.encoding.clone(),
        }
    }

    pub fn encoding_config(&self) -> Result<EncodingConfig> {
        serde_json::from_str(&self.encoding).map_err(|e| {
            self.corrupt(MANIFEST_FILE, format!("unreadable encoding config: {}", e))
                .into()
        })
    }

    pub fn corrupt(&self, path: &str, reason: String) -> AffinityError {
        AffinityError::CorruptArtifact {
            allele: self.allele.clone(),
            member_index: Some(self.member_index),
            path: path.to_string(),
            reason,
        }
    }
}

/// `"{allele}-{index}-{16 hex chars}"`; the suffix keeps names from
/// independent training runs distinct.
pub fn model_name(allele: &str, member_index: usize) -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}-{}-{:016x}", allele, member_index, suffix)
}

pub fn write_manifest<P: AsRef<Path>>(path: P, rows: &[ManifestRow]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create manifest {:?}", path))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_manifest<P: AsRef<Path>>(path: P) -> Result<Vec<ManifestRow>> {
    let path = path.as_ref();
    let corrupt = |reason: String| AffinityError::CorruptArtifact {
        allele: String::new(),
        member_index: None,
        path: path.display().to_string(),
        reason,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| corrupt(e.to_string()))?;
    reader
        .deserialize::<ManifestRow>()
        .enumerate()
        .map(|(i, row)| row.map_err(|e| corrupt(format!("row {}: {}", i + 1, e)).into()))
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct PseudosequenceRow {
    allele: String,
    pseudosequence: String,
}

pub fn write_pseudosequences<P: AsRef<Path>>(
    path: P,
    pseudosequences: &BTreeMap<String, String>,
) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    for (allele, pseudosequence) in pseudosequences {
        writer.serialize(PseudosequenceRow {
            allele: allele.clone(),
            pseudosequence: pseudosequence.clone(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads `allele,pseudosequence` rows; allele names are normalized.
pub fn read_pseudosequences<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut result = BTreeMap::new();
    for row in reader.deserialize::<PseudosequenceRow>() {
        let row = row.with_context(|| format!("Malformed pseudosequence row in {:?}", path))?;
        result.insert(
            crate::utils::data_handling::normalize_allele_name(&row.allele),
            row.pseudosequence,
        );
    }
    Ok(result)
}

/// File name of an allele's calibrator inside `CALIBRATION_DIR`.
pub fn calibrator_file(allele: &str) -> String {
    let safe: String = allele
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}.csv", safe)
}
