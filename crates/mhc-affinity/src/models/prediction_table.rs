use anyhow::{Context, Result};
use std::path::Path;

/// One (peptide, allele) prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRow {
    pub peptide: String,
    /// Normalized allele name.
    pub allele: String,
    /// Ensemble geometric mean in nM; NaN for rows skipped under `no_throw`.
    pub prediction: f64,
    pub prediction_percentile: Option<f64>,
    /// Per-member nM predictions, when requested.
    pub individual: Option<Vec<f64>>,
}

/// Prediction rows in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionTable {
    rows: Vec<PredictionRow>,
}

impl PredictionTable {
    pub fn new(rows: Vec<PredictionRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[PredictionRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn predictions(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.prediction).collect()
    }

    pub fn percentiles(&self) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.prediction_percentile).collect()
    }

    /// Columns: peptide, allele, prediction, then prediction_percentile and
    /// model_0..model_{k-1} when any row carries them. Missing values are
    /// written as empty cells.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let with_percentile = self.rows.iter().any(|r| r.prediction_percentile.is_some());
        let num_models = self
            .rows
            .iter()
            .filter_map(|r| r.individual.as_ref().map(|v| v.len()))
            .max()
            .unwrap_or(0);

        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create prediction table {:?}", path))?;
        let mut header = vec![
            "peptide".to_string(),
            "allele".to_string(),
            "prediction".to_string(),
        ];
        if with_percentile {
            header.push("prediction_percentile".to_string());
        }
        header.extend((0..num_models).map(|i| format!("model_{}", i)));
        writer.write_record(&header)?;

        let cell = |v: f64| if v.is_nan() { String::new() } else { v.to_string() };
        for row in &self.rows {
            let mut record = vec![row.peptide.clone(), row.allele.clone(), cell(row.prediction)];
            if with_percentile {
                record.push(row.prediction_percentile.map(cell).unwrap_or_default());
            }
            for i in 0..num_models {
                record.push(
                    row.individual
                        .as_ref()
                        .and_then(|v| v.get(i))
                        .map(|v| cell(*v))
                        .unwrap_or_default(),
                );
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
