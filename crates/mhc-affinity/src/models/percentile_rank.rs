use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_NUM_QUANTILES: usize = 10000;

/// Maps a score to its percentile rank within a background score sample.
///
/// Stores a sorted summary of at most `num_quantiles` points (always
/// including the sample minimum and maximum). `transform` interpolates
/// linearly between neighbouring points and clamps to 0 / 100 at or beyond
/// the extremes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileCalibrator {
    quantiles: Vec<f64>,
}

impl PercentileCalibrator {
    pub fn fit(scores: &[f64], num_quantiles: usize) -> Result<Self> {
        let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        if sorted.is_empty() {
            return Err(anyhow!("Cannot fit a percentile calibrator on zero finite scores"));
        }
        if num_quantiles < 2 {
            return Err(anyhow!("num_quantiles must be at least 2, got {}", num_quantiles));
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let quantiles = if n <= num_quantiles {
            sorted
        } else {
            (0..num_quantiles)
                .map(|i| {
                    let pos = i as f64 * (n - 1) as f64 / (num_quantiles - 1) as f64;
                    let lo = pos.floor() as usize;
                    let hi = pos.ceil() as usize;
                    let frac = pos - lo as f64;
                    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
                })
                .collect()
        };
        Ok(Self { quantiles })
    }

    pub fn from_series(quantiles: Vec<f64>) -> Result<Self> {
        if quantiles.is_empty() {
            return Err(anyhow!("Percentile calibrator series is empty"));
        }
        if quantiles.windows(2).any(|w| w[0] > w[1]) || quantiles.iter().any(|q| !q.is_finite()) {
            return Err(anyhow!("Percentile calibrator series must be finite and sorted"));
        }
        Ok(Self { quantiles })
    }

    pub fn to_series(&self) -> &[f64] {
        &self.quantiles
    }

    pub fn transform(&self, score: f64) -> f64 {
        let q = &self.quantiles;
        let n = q.len();
        if score.is_nan() {
            return f64::NAN;
        }
        if n == 1 || score <= q[0] {
            return 0.0;
        }
        if score >= q[n - 1] {
            return 100.0;
        }
        let hi = q.partition_point(|x| *x <= score);
        let lo = hi - 1;
        let rank = |j: usize| 100.0 * j as f64 / (n - 1) as f64;
        let span = q[hi] - q[lo];
        if span <= 0.0 {
            return rank(lo);
        }
        rank(lo) + (rank(hi) - rank(lo)) * (score - q[lo]) / span
    }

    pub fn transform_many(&self, scores: &[f64]) -> Vec<f64> {
        scores.iter().map(|s| self.transform(*s)).collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create calibrator file {:?}", path))?;
        writer.write_record(["quantile"])?;
        for q in &self.quantiles {
            writer.write_record([q.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open calibrator file {:?}", path))?;
        let mut quantiles = Vec::new();
        for record in reader.records() {
            let record = record?;
            let value = record
                .get(0)
                .ok_or_else(|| anyhow!("Empty row in {:?}", path))?
                .parse::<f64>()
                .with_context(|| format!("Malformed quantile in {:?}", path))?;
            quantiles.push(value);
        }
        Self::from_series(quantiles)
    }
}
