use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default upper bound of the affinity scale, in nM.
pub const MAX_IC50: f64 = 50000.0;

/// Affinity (nM) -> regression target in [0, 1]. Stronger binders map higher.
pub fn from_ic50(ic50: f64, max_ic50: f64) -> f64 {
    let x = 1.0 - ic50.ln() / max_ic50.ln();
    x.clamp(0.0, 1.0)
}

/// Regression target -> affinity (nM). Inverse of `from_ic50` on [1, max_ic50].
pub fn to_ic50(x: f64, max_ic50: f64) -> f64 {
    max_ic50.powf(1.0 - x)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementType {
    Quantitative,
    Qualitative,
}

/// Direction of a censored measurement.
///
/// `Greater` means the true affinity is weaker (larger nM) than the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Inequality {
    #[default]
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
}

impl Inequality {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "=" => Ok(Inequality::Equal),
            ">" => Ok(Inequality::Greater),
            "<" => Ok(Inequality::Less),
            other => Err(anyhow!("Unsupported measurement inequality: {}", other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Inequality::Equal => "=",
            Inequality::Greater => ">",
            Inequality::Less => "<",
        }
    }
}

/// One row of binding data, as produced by a data-loading collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityMeasurement {
    pub peptide: String,
    pub allele: String,
    /// Affinity in nM.
    pub measurement_value: f64,
    pub measurement_type: MeasurementType,
    #[serde(default)]
    pub measurement_inequality: Inequality,
    #[serde(default)]
    pub measurement_source: Option<String>,
}

impl AffinityMeasurement {
    pub fn new(peptide: &str, allele: &str, measurement_value: f64) -> Self {
        Self {
            peptide: peptide.to_string(),
            allele: allele.to_string(),
            measurement_value,
            measurement_type: MeasurementType::Quantitative,
            measurement_inequality: Inequality::Equal,
            measurement_source: None,
        }
    }

    pub fn with_inequality(mut self, inequality: Inequality) -> Self {
        self.measurement_inequality = inequality;
        self
    }

    pub fn qualitative(mut self) -> Self {
        self.measurement_type = MeasurementType::Qualitative;
        self
    }

    pub fn is_quantitative(&self) -> bool {
        self.measurement_type == MeasurementType::Quantitative
    }
}

/// Read measurements from a CSV with columns `peptide, allele,
/// measurement_value, measurement_type[, measurement_inequality,
/// measurement_source]`.
pub fn load_measurements<P: AsRef<Path>>(path: P) -> Result<Vec<AffinityMeasurement>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open measurements file {:?}", path))?;
    let mut rows = Vec::new();
    for (i, record) in reader.deserialize::<AffinityMeasurement>().enumerate() {
        let mut row =
            record.with_context(|| format!("Malformed measurement row {} in {:?}", i + 1, path))?;
        row.allele = normalize_allele_name(&row.allele);
        rows.push(row);
    }
    log::info!("Loaded {} measurements from {:?}", rows.len(), path);
    Ok(rows)
}

/// Canonical allele spelling: uppercase, no `*`, `:` or whitespace, with an
/// `HLA-` prefix on bare HLA class I gene names.
///
/// `A0201` -> `HLA-A0201`, `HLA-A*02:01` -> `HLA-A0201`, `H-2-Kb` stays `H-2-KB`.
pub fn normalize_allele_name(allele: &str) -> String {
    let cleaned: String = allele
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '*' && *c != ':')
        .collect::<String>()
        .to_uppercase();
    if cleaned.starts_with("HLA-") {
        return cleaned;
    }
    let stripped = cleaned.strip_prefix("HLA").unwrap_or(&cleaned);
    let mut chars = stripped.chars();
    let is_hla_gene = matches!(chars.next(), Some('A' | 'B' | 'C' | 'E' | 'G'))
        && chars.next().map_or(false, |c| c.is_ascii_digit());
    if is_hla_gene {
        format!("HLA-{}", stripped)
    } else {
        cleaned
    }
}
