use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use crate::building_blocks::amino_acid::random_peptides;
use crate::building_blocks::featurize::SequenceEncoder;
use crate::error::AffinityError;
use crate::models::hyperparameters::Hyperparameters;
use crate::models::manifest::{
    calibrator_file, read_manifest, read_pseudosequences, write_manifest, write_pseudosequences,
    ManifestRow, CALIBRATION_DIR, MANIFEST_FILE, PAN_ALLELE_LABEL, PSEUDOSEQUENCES_FILE,
};
use crate::models::neural_network::AffinityNetwork;
use crate::models::percentile_rank::{PercentileCalibrator, DEFAULT_NUM_QUANTILES};
use crate::models::prediction_table::{PredictionRow, PredictionTable};
use crate::models::training::{
    allele_specific_tasks, pan_allele_tasks, train_task, TaskExecutor, TrainedMember,
    TrainingData, TrainingOptions, TrainingTask,
};
use crate::utils::data_handling::{normalize_allele_name, AffinityMeasurement};
use crate::utils::logging::Progress;

/// A trained network plus its manifest entry.
pub struct EnsembleMember {
    pub row: ManifestRow,
    pub network: AffinityNetwork,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PredictOptions {
    pub include_individual_model_predictions: bool,
    pub include_percentile_ranks: bool,
    /// Emit NaN rows instead of failing on alleles or lengths no model covers.
    pub no_throw: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrationOptions {
    pub num_peptides_per_length: usize,
    pub num_quantiles: usize,
    pub seed: u64,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            num_peptides_per_length: 100_000,
            num_quantiles: DEFAULT_NUM_QUANTILES,
            seed: 0,
        }
    }
}

struct RowOutcome {
    prediction: f64,
    individual: Vec<f64>,
    percentile: Option<f64>,
}

/// Geometric mean of the finite, positive values; NaN when there are none.
pub fn geometric_mean(values: &[f64]) -> f64 {
    let logs: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite() && **v > 0.0)
        .map(|v| v.ln())
        .collect();
    if logs.is_empty() {
        return f64::NAN;
    }
    (logs.iter().sum::<f64>() / logs.len() as f64).exp()
}

/// Per-allele ensembles, an optional pan-allele ensemble and percentile
/// calibrators, persisted as a manifest of independently stored members.
pub struct AffinityPredictor {
    allele_to_models: BTreeMap<String, Vec<EnsembleMember>>,
    pan_allele_models: Vec<EnsembleMember>,
    pseudosequences: BTreeMap<String, String>,
    calibrators: BTreeMap<String, PercentileCalibrator>,
    device: Device,
}

impl AffinityPredictor {
    pub fn new(device: Device) -> Self {
        Self {
            allele_to_models: BTreeMap::new(),
            pan_allele_models: Vec::new(),
            pseudosequences: BTreeMap::new(),
            calibrators: BTreeMap::new(),
            device,
        }
    }

    /// Allele names are normalized on insert.
    pub fn with_pseudosequences(mut self, pseudosequences: BTreeMap<String, String>) -> Self {
        self.pseudosequences = pseudosequences
            .into_iter()
            .map(|(allele, seq)| (normalize_allele_name(&allele), seq))
            .collect();
        self
    }

    pub fn pseudosequences(&self) -> &BTreeMap<String, String> {
        &self.pseudosequences
    }

    pub fn num_models(&self) -> usize {
        self.allele_to_models.values().map(|v| v.len()).sum::<usize>()
            + self.pan_allele_models.len()
    }

    pub fn ensemble(&self, allele: &str) -> Option<&[EnsembleMember]> {
        self.allele_to_models
            .get(&normalize_allele_name(allele))
            .map(|v| v.as_slice())
    }

    pub fn pan_allele_ensemble(&self) -> &[EnsembleMember] {
        &self.pan_allele_models
    }

    pub fn calibrator(&self, allele: &str) -> Option<&PercentileCalibrator> {
        self.calibrators.get(&normalize_allele_name(allele))
    }

    /// Alleles with an allele-specific ensemble, plus every allele with a
    /// pseudosequence when a pan-allele ensemble exists.
    pub fn supported_alleles(&self) -> Vec<String> {
        let mut alleles: BTreeSet<String> = self.allele_to_models.keys().cloned().collect();
        if !self.pan_allele_models.is_empty() {
            alleles.extend(self.pseudosequences.keys().cloned());
        }
        alleles.into_iter().collect()
    }

    /// Union of the peptide lengths any member accepts.
    pub fn supported_peptide_lengths(&self) -> Option<RangeInclusive<usize>> {
        let ranges: Vec<RangeInclusive<usize>> = self
            .all_members()
            .map(|m| m.network.supported_peptide_lengths())
            .collect();
        let min = ranges.iter().map(|r| *r.start()).min()?;
        let max = ranges.iter().map(|r| *r.end()).max()?;
        Some(min..=max)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.all_members().map(|m| m.row.model_name.clone()).collect()
    }

    fn all_members(&self) -> impl Iterator<Item = &EnsembleMember> {
        self.allele_to_models
            .values()
            .flatten()
            .chain(self.pan_allele_models.iter())
    }

    /// The covering ensemble and, for pan-allele coverage, the allele's pseudosequence.
    fn resolve(&self, allele: &str) -> Option<(&[EnsembleMember], Option<&String>)> {
        if let Some(members) = self.allele_to_models.get(allele) {
            if !members.is_empty() {
                return Some((members.as_slice(), None));
            }
        }
        if self.pan_allele_models.is_empty() {
            return None;
        }
        self.pseudosequences
            .get(allele)
            .map(|seq| (self.pan_allele_models.as_slice(), Some(seq)))
    }

    /// Train `options.n_models` members for every allele with enough data.
    ///
    /// Returns the names of the members added.
    pub fn fit_allele_specific(
        &mut self,
        measurements: &[AffinityMeasurement],
        hyperparameters: &Hyperparameters,
        options: &TrainingOptions,
        executor: &dyn TaskExecutor,
    ) -> Result<Vec<String>> {
        hyperparameters.validate()?;
        let data = TrainingData::new(measurements.to_vec());
        let tasks = allele_specific_tasks(&data, options);
        if tasks.is_empty() {
            warn!(
                "No allele has at least {} measurements; nothing to train",
                options.min_measurements_per_allele
            );
            return Ok(Vec::new());
        }
        info!(
            "Training {} allele-specific models for {} alleles",
            tasks.len(),
            tasks.len() / options.n_models.max(1)
        );
        self.run_tasks(&tasks, &data, hyperparameters, options, executor)
    }

    /// Train shared members over peptide + pseudosequence inputs.
    pub fn fit_pan_allele(
        &mut self,
        measurements: &[AffinityMeasurement],
        hyperparameters: &Hyperparameters,
        options: &TrainingOptions,
        executor: &dyn TaskExecutor,
    ) -> Result<Vec<String>> {
        hyperparameters.validate()?;
        if self.pseudosequences.is_empty() {
            return Err(AffinityError::InvalidInput(
                "pan-allele training needs allele pseudosequences".to_string(),
            )
            .into());
        }
        let data = TrainingData::new(measurements.to_vec())
            .with_pseudosequences(self.pseudosequences.clone());
        let tasks = pan_allele_tasks(&data, options)?;
        info!("Training {} pan-allele models", tasks.len());
        self.run_tasks(&tasks, &data, hyperparameters, options, executor)
    }

    fn run_tasks(
        &mut self,
        tasks: &[TrainingTask],
        data: &TrainingData,
        hyperparameters: &Hyperparameters,
        options: &TrainingOptions,
        executor: &dyn TaskExecutor,
    ) -> Result<Vec<String>> {
        let device = self.device.clone();
        let work = |task: &TrainingTask| train_task(task, data, hyperparameters, options, &device);
        let outcomes = executor.execute(tasks, options.failure_policy, &work)?;
        let trained: Vec<TrainedMember> = outcomes.into_iter().flatten().collect();
        if trained.len() < tasks.len() {
            warn!(
                "{} of {} training tasks produced no model",
                tasks.len() - trained.len(),
                tasks.len()
            );
        }
        self.add_trained_members(trained)
    }

    /// Append members produced by `train_task`, possibly on another machine.
    ///
    /// Member indices continue after the existing ensemble; calibrators of
    /// alleles whose ensemble changed are dropped.
    pub fn add_trained_members(&mut self, members: Vec<TrainedMember>) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(members.len());
        for member in members {
            let allele = if member.task.is_pan_allele() {
                PAN_ALLELE_LABEL.to_string()
            } else {
                normalize_allele_name(&member.task.allele)
            };
            names.push(self.add_network(&allele, member.network)?);
        }
        Ok(names)
    }

    /// Add one network to `allele`'s ensemble (or the pan-allele ensemble when
    /// `allele` is `PAN_ALLELE_LABEL`). Returns the new member's model name.
    pub fn add_network(&mut self, allele: &str, network: AffinityNetwork) -> Result<String> {
        let is_pan = allele == PAN_ALLELE_LABEL;
        if is_pan != network.is_pan_allele() {
            return Err(AffinityError::InvalidInput(format!(
                "network pan-allele flag does not match allele {}",
                allele
            ))
            .into());
        }
        let allele = if is_pan { allele.to_string() } else { normalize_allele_name(allele) };
        let ensemble = if is_pan {
            &mut self.pan_allele_models
        } else {
            self.allele_to_models.entry(allele.clone()).or_default()
        };
        let row = ManifestRow::new(&allele, ensemble.len(), &network.hyperparameters().encoding)?;
        let name = row.model_name.clone();
        ensemble.push(EnsembleMember { row, network });
        self.invalidate_calibration(&allele);
        Ok(name)
    }

    fn invalidate_calibration(&mut self, allele: &str) {
        let stale: Vec<String> = if allele == PAN_ALLELE_LABEL {
            self.calibrators
                .keys()
                .filter(|a| !self.allele_to_models.contains_key(*a))
                .cloned()
                .collect()
        } else {
            vec![allele.to_string()]
        };
        for allele in stale {
            if self.calibrators.remove(&allele).is_some() {
                warn!("Ensemble for {} changed; dropping its percentile calibration", allele);
            }
        }
    }

    /// Ensemble predictions (nM) for each (peptide, allele) pair, in input order.
    pub fn predict<S: AsRef<str> + Sync, A: AsRef<str> + Sync>(
        &self,
        peptides: &[S],
        alleles: &[A],
        options: &PredictOptions,
    ) -> Result<Vec<f64>> {
        Ok(self.predict_to_table(peptides, alleles, options)?.predictions())
    }

    pub fn predict_to_table<S: AsRef<str> + Sync, A: AsRef<str> + Sync>(
        &self,
        peptides: &[S],
        alleles: &[A],
        options: &PredictOptions,
    ) -> Result<PredictionTable> {
        if peptides.len() != alleles.len() {
            return Err(AffinityError::InvalidInput(format!(
                "{} peptides but {} alleles",
                peptides.len(),
                alleles.len()
            ))
            .into());
        }
        let normalized: Vec<String> = alleles
            .iter()
            .map(|a| normalize_allele_name(a.as_ref()))
            .collect();
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, allele) in normalized.iter().enumerate() {
            groups.entry(allele.as_str()).or_default().push(i);
        }

        let group_results = groups
            .par_iter()
            .map(|(allele, rows)| {
                let group_peptides: Vec<&str> =
                    rows.iter().map(|&i| peptides[i].as_ref()).collect();
                self.predict_group(allele, &group_peptides, options)
                    .map(|outcomes| rows.iter().copied().zip(outcomes).collect::<Vec<_>>())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut outcomes: Vec<Option<std::result::Result<RowOutcome, AffinityError>>> =
            (0..peptides.len()).map(|_| None).collect();
        for (i, outcome) in group_results.into_iter().flatten() {
            outcomes[i] = Some(outcome);
        }

        let mut rows = Vec::with_capacity(peptides.len());
        for (i, outcome) in outcomes.into_iter().enumerate() {
            let outcome = outcome.ok_or_else(|| anyhow!("Row {} was not predicted", i))?;
            let peptide = peptides[i].as_ref().to_string();
            let allele = normalized[i].clone();
            match outcome {
                Ok(o) => rows.push(PredictionRow {
                    peptide,
                    allele,
                    prediction: o.prediction,
                    prediction_percentile: o.percentile,
                    individual: options
                        .include_individual_model_predictions
                        .then_some(o.individual),
                }),
                Err(e) if options.no_throw && e.is_coverage_error() => {
                    log::debug!("Emitting NaN for {} / {}: {}", peptide, allele, e);
                    rows.push(PredictionRow {
                        peptide,
                        allele,
                        prediction: f64::NAN,
                        prediction_percentile: None,
                        individual: options.include_individual_model_predictions.then(Vec::new),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(PredictionTable::new(rows))
    }

    /// Predictions for rows sharing one (normalized) allele.
    ///
    /// The outer error is fatal (bad residues, backend failures); inner
    /// errors are per-row coverage failures.
    fn predict_group(
        &self,
        allele: &str,
        peptides: &[&str],
        options: &PredictOptions,
    ) -> Result<Vec<std::result::Result<RowOutcome, AffinityError>>> {
        let Some((members, pseudosequence)) = self.resolve(allele) else {
            return Ok(peptides
                .iter()
                .map(|_| Err(AffinityError::UnsupportedAllele(allele.to_string())))
                .collect());
        };

        let ranges: Vec<RangeInclusive<usize>> = members
            .iter()
            .map(|m| m.network.supported_peptide_lengths())
            .collect();
        let covered: Vec<usize> = (0..peptides.len())
            .filter(|&i| ranges.iter().any(|r| r.contains(&peptides[i].len())))
            .collect();

        let mut individual = vec![vec![f64::NAN; members.len()]; peptides.len()];
        if !covered.is_empty() {
            let covered_peptides: Vec<&str> = covered.iter().map(|&i| peptides[i]).collect();
            let encoder = SequenceEncoder::create(&covered_peptides)?;
            for (m, (member, range)) in members.iter().zip(&ranges).enumerate() {
                let local: Vec<usize> = (0..covered.len())
                    .filter(|&j| range.contains(&covered_peptides[j].len()))
                    .collect();
                if local.is_empty() {
                    continue;
                }
                let subset;
                let member_encoder = if local.len() == covered.len() {
                    &encoder
                } else {
                    subset = encoder.subset(&local)?;
                    &subset
                };
                let pseudos = pseudosequence.map(|seq| vec![seq.clone(); local.len()]);
                let values = member
                    .network
                    .predict(member_encoder, pseudos.as_deref())
                    .with_context(|| format!("Model {} failed to predict", member.row.model_name))?;
                for (j, value) in local.iter().zip(values) {
                    individual[covered[*j]][m] = value;
                }
            }
        }

        let calibrator = if options.include_percentile_ranks {
            let calibrator = self.calibrators.get(allele);
            if calibrator.is_none() {
                warn!("No percentile calibration for {}", allele);
            }
            calibrator
        } else {
            None
        };

        Ok(individual
            .into_iter()
            .enumerate()
            .map(|(i, values)| {
                if !ranges.iter().any(|r| r.contains(&peptides[i].len())) {
                    return Err(AffinityError::UnsupportedPeptideLength {
                        allele: allele.to_string(),
                        peptide: peptides[i].to_string(),
                    });
                }
                let prediction = geometric_mean(&values);
                Ok(RowOutcome {
                    prediction,
                    percentile: calibrator.map(|c| c.transform(prediction)),
                    individual: values,
                })
            })
            .collect())
    }

    /// Percentile ranks of `affinities` (nM) under `allele`'s calibrator.
    pub fn percentile_ranks(&self, affinities: &[f64], allele: &str) -> Result<Vec<f64>> {
        let allele = normalize_allele_name(allele);
        let calibrator = self.calibrators.get(&allele).ok_or_else(|| {
            AffinityError::InvalidInput(format!("no percentile calibration for {}", allele))
        })?;
        Ok(calibrator.transform_many(affinities))
    }

    /// Fit a calibrator per allele from predictions on uniform random peptides
    /// of every length the allele's ensemble supports. `None` calibrates every
    /// supported allele.
    pub fn calibrate_percentile_ranks(
        &mut self,
        alleles: Option<&[String]>,
        options: &CalibrationOptions,
    ) -> Result<()> {
        let alleles: Vec<String> = match alleles {
            Some(a) => a.iter().map(|x| normalize_allele_name(x)).collect(),
            None => self.supported_alleles(),
        };
        let progress = Progress::new(alleles.len(), "[calibration] alleles");
        let fitted = alleles
            .par_iter()
            .enumerate()
            .map(|(i, allele)| -> Result<(String, PercentileCalibrator)> {
                let (members, _) = self
                    .resolve(allele)
                    .ok_or_else(|| AffinityError::UnsupportedAllele(allele.clone()))?;
                let mut lengths: BTreeSet<usize> = BTreeSet::new();
                for member in members {
                    lengths.extend(member.network.supported_peptide_lengths());
                }
                let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(i as u64));
                let mut background = Vec::new();
                for length in lengths {
                    background.extend(random_peptides(
                        options.num_peptides_per_length,
                        length,
                        None,
                        &mut rng,
                    )?);
                }
                let allele_column = vec![allele.as_str(); background.len()];
                let scores = self.predict(&background, &allele_column, &PredictOptions::default())?;
                let calibrator = PercentileCalibrator::fit(&scores, options.num_quantiles)?;
                progress.inc();
                Ok((allele.clone(), calibrator))
            })
            .collect::<Result<Vec<_>>>();
        progress.finish();
        for (allele, calibrator) in fitted? {
            self.calibrators.insert(allele, calibrator);
        }
        info!("Calibrated percentile ranks for {} alleles", alleles.len());
        Ok(())
    }

    /// Write the manifest, member configs and weights, pseudosequences and
    /// calibrators under `dir`.
    ///
    /// With `model_names`, only those members' config and weight files are
    /// (re)written; the manifest always lists every member.
    pub fn save<P: AsRef<Path>>(&self, dir: P, model_names: Option<&[String]>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        let selected: Option<BTreeSet<&str>> =
            model_names.map(|names| names.iter().map(|s| s.as_str()).collect());
        let mut rows = Vec::new();
        for member in self.all_members() {
            let row = &member.row;
            rows.push(row.clone());
            if let Some(selected) = &selected {
                if !selected.contains(row.model_name.as_str()) {
                    continue;
                }
            }
            let mut config = member.network.get_config()?;
            if let Value::Object(map) = &mut config {
                map.insert("model_name".to_string(), Value::String(row.model_name.clone()));
                map.insert("allele".to_string(), Value::String(row.allele.clone()));
                map.insert("member_index".to_string(), Value::from(row.member_index));
            }
            let config_path = dir.join(&row.config_file);
            fs::write(&config_path, serde_json::to_string_pretty(&config)?)
                .with_context(|| format!("Failed to write {:?}", config_path))?;
            member.network.save_weights(dir.join(&row.weights_file))?;
        }
        write_manifest(dir.join(MANIFEST_FILE), &rows)?;

        if !self.pseudosequences.is_empty() {
            write_pseudosequences(dir.join(PSEUDOSEQUENCES_FILE), &self.pseudosequences)?;
        }

        let calibration_dir = dir.join(CALIBRATION_DIR);
        if !self.calibrators.is_empty() {
            fs::create_dir_all(&calibration_dir)?;
        }
        for allele in self.supported_alleles() {
            let path = calibration_dir.join(calibrator_file(&allele));
            match self.calibrators.get(&allele) {
                Some(calibrator) => calibrator.save(&path)?,
                None if path.exists() => fs::remove_file(&path)?,
                None => {}
            }
        }
        info!("Saved {} models to {:?}", rows.len(), dir);
        Ok(())
    }

    /// Rebuild a predictor by replaying the manifest under `dir`.
    ///
    /// `max_models` caps how many manifest rows are loaded. Calibrators of
    /// ensembles that lose members to the cap are not loaded.
    pub fn load<P: AsRef<Path>>(dir: P, max_models: Option<usize>, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        let mut rows = read_manifest(dir.join(MANIFEST_FILE))?;
        let count_rows = |rows: &[ManifestRow]| {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for row in rows {
                *counts.entry(row.allele.clone()).or_default() += 1;
            }
            counts
        };
        let saved_counts = count_rows(&rows);
        if let Some(max) = max_models {
            rows.truncate(max);
        }
        let loaded_counts = count_rows(&rows);
        // Ensembles that lost members no longer match their saved calibration.
        let truncated: BTreeSet<String> = saved_counts
            .into_iter()
            .filter(|(label, count)| loaded_counts.get(label).map_or(false, |n| n < count))
            .map(|(label, _)| label)
            .collect();

        let members = rows
            .into_par_iter()
            .map(|row| load_member(dir, row, &device))
            .collect::<Result<Vec<_>>>()?;

        let mut predictor = AffinityPredictor::new(device);
        let pseudo_path = dir.join(PSEUDOSEQUENCES_FILE);
        if pseudo_path.exists() {
            predictor.pseudosequences = read_pseudosequences(&pseudo_path)?;
        }
        for member in members {
            if member.row.allele == PAN_ALLELE_LABEL {
                predictor.pan_allele_models.push(member);
            } else {
                predictor
                    .allele_to_models
                    .entry(member.row.allele.clone())
                    .or_default()
                    .push(member);
            }
        }

        for allele in predictor.supported_alleles() {
            let label = if predictor.allele_to_models.contains_key(&allele) {
                allele.as_str()
            } else {
                PAN_ALLELE_LABEL
            };
            if truncated.contains(label) {
                warn!(
                    "Skipping percentile calibration for {}: ensemble truncated by max_models",
                    allele
                );
                continue;
            }
            let path = dir.join(CALIBRATION_DIR).join(calibrator_file(&allele));
            if path.exists() {
                let calibrator = PercentileCalibrator::load(&path).map_err(|e| {
                    AffinityError::CorruptArtifact {
                        allele: allele.clone(),
                        member_index: None,
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                predictor.calibrators.insert(allele, calibrator);
            }
        }
        info!(
            "Loaded {} models ({} alleles, {} pan-allele) from {:?}",
            predictor.num_models(),
            predictor.allele_to_models.len(),
            predictor.pan_allele_models.len(),
            dir
        );
        Ok(predictor)
    }

    /// Concatenate the ensembles of independently trained predictors.
    ///
    /// Members are renumbered per allele and renamed to match. A calibrator
    /// survives only when a single predictor contributed every member
    /// covering its allele.
    pub fn merge(predictors: Vec<AffinityPredictor>) -> Result<AffinityPredictor> {
        let mut iter = predictors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| AffinityError::InvalidInput("nothing to merge".to_string()))?;
        let mut parts = vec![first];
        parts.extend(iter);

        let mut specific_sources: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        let mut pan_sources: BTreeSet<usize> = BTreeSet::new();
        for (p, predictor) in parts.iter().enumerate() {
            for allele in predictor.allele_to_models.keys() {
                specific_sources.entry(allele.clone()).or_default().insert(p);
            }
            if !predictor.pan_allele_models.is_empty() {
                pan_sources.insert(p);
            }
        }

        let mut merged = AffinityPredictor::new(parts[0].device.clone());
        let mut calibrators = Vec::new();
        for (p, predictor) in parts.into_iter().enumerate() {
            for (allele, seq) in predictor.pseudosequences {
                match merged.pseudosequences.get(&allele) {
                    Some(existing) if *existing != seq => {
                        return Err(AffinityError::InvalidInput(format!(
                            "conflicting pseudosequences for {}",
                            allele
                        ))
                        .into())
                    }
                    _ => {
                        merged.pseudosequences.insert(allele, seq);
                    }
                }
            }
            for (allele, members) in predictor.allele_to_models {
                let ensemble = merged.allele_to_models.entry(allele).or_default();
                for mut member in members {
                    member.row = member.row.renumbered(ensemble.len());
                    ensemble.push(member);
                }
            }
            for mut member in predictor.pan_allele_models {
                member.row = member.row.renumbered(merged.pan_allele_models.len());
                merged.pan_allele_models.push(member);
            }
            for (allele, calibrator) in predictor.calibrators {
                let sole_source = match specific_sources.get(&allele) {
                    Some(sources) => sources.len() == 1 && sources.contains(&p),
                    None => pan_sources.len() == 1 && pan_sources.contains(&p),
                };
                if sole_source {
                    calibrators.push((allele, calibrator));
                } else {
                    warn!("Dropping percentile calibration for {} after merge", allele);
                }
            }
        }
        merged.calibrators.extend(calibrators);
        info!("Merged predictor has {} models", merged.num_models());
        Ok(merged)
    }
}

fn load_member(dir: &Path, row: ManifestRow, device: &Device) -> Result<EnsembleMember> {
    let config_path = dir.join(&row.config_file);
    let weights_path = dir.join(&row.weights_file);
    let corrupt = |path: &Path, e: anyhow::Error| -> anyhow::Error {
        row.corrupt(&path.display().to_string(), format!("{:#}", e)).into()
    };

    let text = fs::read_to_string(&config_path).map_err(|e| corrupt(&config_path, e.into()))?;
    let config: Value = serde_json::from_str(&text).map_err(|e| corrupt(&config_path, e.into()))?;
    let mut network = AffinityNetwork::from_config(&config, device.clone())
        .map_err(|e| corrupt(&config_path, e))?;
    if network.hyperparameters().encoding != row.encoding_config()? {
        return Err(corrupt(
            &config_path,
            anyhow!("encoding in config does not match the manifest"),
        ));
    }
    if !weights_path.exists() {
        return Err(corrupt(&weights_path, anyhow!("weights file is missing")));
    }
    network
        .load_weights(&weights_path)
        .map_err(|e| corrupt(&weights_path, e))?;
    Ok(EnsembleMember { row, network })
}
