use anyhow::{anyhow, Result};
use candle_core::Device;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::building_blocks::featurize::SequenceEncoder;
use crate::error::AffinityError;
use crate::models::hyperparameters::Hyperparameters;
use crate::models::manifest::PAN_ALLELE_LABEL;
use crate::models::neural_network::{AffinityNetwork, FitOptions};
use crate::utils::data_handling::{normalize_allele_name, AffinityMeasurement};
use crate::utils::logging::Progress;

/// What to do when training one ensemble member fails.
///
/// Only runtime failures are subject to the policy. Encoding and
/// hyperparameter errors always propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingFailurePolicy {
    /// Propagate the first failure and abandon the whole fit.
    Abort,
    /// Log and drop the member.
    Skip,
    /// Retrain with a fresh seed, up to `max_attempts` tries in total, then skip.
    Retry { max_attempts: usize },
}

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub n_models: usize,
    pub min_measurements_per_allele: usize,
    /// Drop qualitative measurements entirely.
    pub only_quantitative: bool,
    /// Sample weight of qualitative measurements (quantitative rows weigh 1).
    pub qualitative_weight: f64,
    pub failure_policy: TrainingFailurePolicy,
    pub seed: u64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            n_models: 1,
            min_measurements_per_allele: 25,
            only_quantitative: false,
            qualitative_weight: 1.0,
            failure_policy: TrainingFailurePolicy::Skip,
            seed: 0,
        }
    }
}

/// Train one model for one allele.
///
/// `rows` index into the shared measurement table; tasks never own or mutate
/// the table.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTask {
    pub allele: String,
    pub member_index: usize,
    pub seed: u64,
    pub rows: Arc<Vec<usize>>,
}

impl TrainingTask {
    pub fn is_pan_allele(&self) -> bool {
        self.allele == PAN_ALLELE_LABEL
    }

    fn reseeded(&self, attempt: usize) -> Self {
        Self {
            seed: self
                .seed
                .wrapping_add((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            ..self.clone()
        }
    }
}

/// Read-only inputs shared by every task of one fit.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub measurements: Arc<Vec<AffinityMeasurement>>,
    /// Normalized allele -> pseudosequence, needed by pan-allele tasks.
    pub pseudosequences: Arc<BTreeMap<String, String>>,
}

impl TrainingData {
    pub fn new(measurements: Vec<AffinityMeasurement>) -> Self {
        Self {
            measurements: Arc::new(measurements),
            pseudosequences: Arc::new(BTreeMap::new()),
        }
    }

    pub fn with_pseudosequences(mut self, pseudosequences: BTreeMap<String, String>) -> Self {
        self.pseudosequences = Arc::new(pseudosequences);
        self
    }
}

/// A task that produced a trained network.
pub struct TrainedMember {
    pub task: TrainingTask,
    pub network: AffinityNetwork,
}

impl std::fmt::Debug for TrainedMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainedMember")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// FNV-1a over the allele name, mixed with the base seed and member index.
fn task_seed(base: u64, allele: &str, member_index: usize) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in allele.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash ^ base.rotate_left(17) ^ (member_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn usable_rows(measurements: &[AffinityMeasurement], options: &TrainingOptions) -> Vec<usize> {
    measurements
        .iter()
        .enumerate()
        .filter(|(_, m)| !options.only_quantitative || m.is_quantitative())
        .filter(|(_, m)| m.measurement_value > 0.0 && m.measurement_value.is_finite())
        .map(|(i, _)| i)
        .collect()
}

/// `n_models` tasks per allele with at least `min_measurements_per_allele` rows.
pub fn allele_specific_tasks(data: &TrainingData, options: &TrainingOptions) -> Vec<TrainingTask> {
    let mut by_allele: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for i in usable_rows(&data.measurements, options) {
        by_allele
            .entry(normalize_allele_name(&data.measurements[i].allele))
            .or_default()
            .push(i);
    }

    let mut tasks = Vec::new();
    for (allele, rows) in by_allele {
        if rows.len() < options.min_measurements_per_allele {
            debug!(
                "Skipping {}: {} measurements < {}",
                allele,
                rows.len(),
                options.min_measurements_per_allele
            );
            continue;
        }
        let rows = Arc::new(rows);
        for member_index in 0..options.n_models {
            tasks.push(TrainingTask {
                seed: task_seed(options.seed, &allele, member_index),
                allele: allele.clone(),
                member_index,
                rows: Arc::clone(&rows),
            });
        }
    }
    tasks
}

/// `n_models` pan-allele tasks over every row whose allele has a pseudosequence.
pub fn pan_allele_tasks(
    data: &TrainingData,
    options: &TrainingOptions,
) -> Result<Vec<TrainingTask>> {
    let rows: Vec<usize> = usable_rows(&data.measurements, options)
        .into_iter()
        .filter(|&i| {
            data.pseudosequences
                .contains_key(&normalize_allele_name(&data.measurements[i].allele))
        })
        .collect();
    if rows.is_empty() {
        return Err(AffinityError::InvalidInput(
            "no measurements for alleles with known pseudosequences".to_string(),
        )
        .into());
    }
    let rows = Arc::new(rows);
    Ok((0..options.n_models)
        .map(|member_index| TrainingTask {
            allele: PAN_ALLELE_LABEL.to_string(),
            member_index,
            seed: task_seed(options.seed, PAN_ALLELE_LABEL, member_index),
            rows: Arc::clone(&rows),
        })
        .collect())
}

/// Fit a fresh network on the rows of `task`.
pub fn train_task(
    task: &TrainingTask,
    data: &TrainingData,
    hyperparameters: &Hyperparameters,
    options: &TrainingOptions,
    device: &Device,
) -> Result<AffinityNetwork> {
    let rows: Vec<&AffinityMeasurement> =
        task.rows.iter().map(|&i| &data.measurements[i]).collect();
    if rows.is_empty() {
        return Err(
            AffinityError::InvalidInput(format!("task for {} has no rows", task.allele)).into(),
        );
    }
    let peptides: Vec<&str> = rows.iter().map(|m| m.peptide.as_str()).collect();
    let affinities: Vec<f64> = rows.iter().map(|m| m.measurement_value).collect();
    let inequalities = rows.iter().map(|m| m.measurement_inequality).collect();
    let sample_weights = rows
        .iter()
        .map(|m| if m.is_quantitative() { 1.0 } else { options.qualitative_weight })
        .collect();
    let allele_pseudosequences = if task.is_pan_allele() {
        Some(
            rows.iter()
                .map(|m| {
                    let allele = normalize_allele_name(&m.allele);
                    data.pseudosequences
                        .get(&allele)
                        .cloned()
                        .ok_or_else(|| anyhow!("No pseudosequence for {}", allele))
                })
                .collect::<Result<Vec<_>>>()?,
        )
    } else {
        None
    };

    let encoder = SequenceEncoder::create(&peptides)?;
    let mut network = AffinityNetwork::new(hyperparameters.clone(), device.clone());
    network.fit(
        &encoder,
        &affinities,
        &FitOptions {
            inequalities: Some(inequalities),
            sample_weights: Some(sample_weights),
            allele_pseudosequences,
            seed: task.seed,
        },
    )?;
    Ok(network)
}

/// Apply `policy` around one task. `Ok(None)` means the member was dropped.
pub fn run_with_policy<F>(
    task: &TrainingTask,
    policy: TrainingFailurePolicy,
    work: &F,
) -> Result<Option<TrainedMember>>
where
    F: Fn(&TrainingTask) -> Result<AffinityNetwork> + ?Sized,
{
    let max_attempts = match policy {
        TrainingFailurePolicy::Retry { max_attempts } => max_attempts.max(1),
        _ => 1,
    };
    let mut attempt_task = task.clone();
    for attempt in 0..max_attempts {
        match work(&attempt_task) {
            Ok(network) => {
                return Ok(Some(TrainedMember {
                    task: attempt_task,
                    network,
                }))
            }
            Err(e) => {
                let configuration_error = e
                    .downcast_ref::<AffinityError>()
                    .map_or(false, |kind| kind.is_configuration_error());
                if configuration_error || policy == TrainingFailurePolicy::Abort {
                    return Err(e.context(format!(
                        "Training {} member {} failed",
                        task.allele, task.member_index
                    )));
                }
                warn!(
                    "Training {} member {} failed (attempt {}/{}): {}",
                    task.allele,
                    task.member_index,
                    attempt + 1,
                    max_attempts,
                    e
                );
                attempt_task = task.reseeded(attempt + 1);
            }
        }
    }
    warn!("Dropping {} member {}", task.allele, task.member_index);
    Ok(None)
}

/// Runs training tasks and returns one outcome per task, in task order.
pub trait TaskExecutor: Send + Sync {
    fn execute(
        &self,
        tasks: &[TrainingTask],
        policy: TrainingFailurePolicy,
        work: &(dyn Fn(&TrainingTask) -> Result<AffinityNetwork> + Send + Sync),
    ) -> Result<Vec<Option<TrainedMember>>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl TaskExecutor for SequentialExecutor {
    fn execute(
        &self,
        tasks: &[TrainingTask],
        policy: TrainingFailurePolicy,
        work: &(dyn Fn(&TrainingTask) -> Result<AffinityNetwork> + Send + Sync),
    ) -> Result<Vec<Option<TrainedMember>>> {
        let progress = Progress::new(tasks.len(), "[training] models");
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(run_with_policy(task, policy, work)?);
            progress.inc();
        }
        progress.finish();
        Ok(outcomes)
    }
}

/// Trains tasks on a rayon pool; `num_threads: None` uses the global pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayonExecutor {
    pub num_threads: Option<usize>,
}

impl TaskExecutor for RayonExecutor {
    fn execute(
        &self,
        tasks: &[TrainingTask],
        policy: TrainingFailurePolicy,
        work: &(dyn Fn(&TrainingTask) -> Result<AffinityNetwork> + Send + Sync),
    ) -> Result<Vec<Option<TrainedMember>>> {
        let progress = Progress::new(tasks.len(), "[training] models");
        let run = || {
            tasks
                .par_iter()
                .map(|task| {
                    let outcome = run_with_policy(task, policy, work);
                    progress.inc();
                    outcome
                })
                .collect::<Result<Vec<_>>>()
        };
        let outcomes = match self.num_threads {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()?
                .install(run),
            None => run(),
        };
        progress.finish();
        if let Ok(results) = &outcomes {
            info!(
                "Trained {}/{} models",
                results.iter().filter(|r| r.is_some()).count(),
                tasks.len()
            );
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncodingError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table() -> TrainingData {
        let mut rows = Vec::new();
        for i in 0..12 {
            rows.push(AffinityMeasurement::new("SIINFEKL", "A0201", 100.0 + i as f64));
        }
        for i in 0..3 {
            rows.push(AffinityMeasurement::new("GILGFVFTL", "HLA-B*07:02", 50.0 + i as f64));
        }
        rows.push(AffinityMeasurement::new("NLVPMVATV", "HLA-A*02:01", 500.0).qualitative());
        TrainingData::new(rows)
    }

    #[test]
    fn test_allele_specific_tasks_respect_threshold() {
        let data = table();
        let options = TrainingOptions {
            n_models: 2,
            min_measurements_per_allele: 10,
            ..Default::default()
        };
        let tasks = allele_specific_tasks(&data, &options);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.allele == "HLA-A0201"));
        assert_eq!(tasks[0].rows.len(), 13);
        assert_ne!(tasks[0].seed, tasks[1].seed);

        let quantitative_only = TrainingOptions {
            only_quantitative: true,
            ..options
        };
        let tasks = allele_specific_tasks(&data, &quantitative_only);
        assert_eq!(tasks[0].rows.len(), 12);
    }

    #[test]
    fn test_task_seeds_are_reproducible() {
        let data = table();
        let options = TrainingOptions {
            min_measurements_per_allele: 1,
            ..Default::default()
        };
        assert_eq!(
            allele_specific_tasks(&data, &options),
            allele_specific_tasks(&data, &options)
        );
    }

    #[test]
    fn test_retry_policy_reseeds_then_gives_up() {
        let task = TrainingTask {
            allele: "HLA-A0201".to_string(),
            member_index: 0,
            seed: 1,
            rows: Arc::new(vec![0]),
        };
        let calls = AtomicUsize::new(0);
        let seeds = std::sync::Mutex::new(Vec::new());
        let failing = |t: &TrainingTask| -> Result<AffinityNetwork> {
            calls.fetch_add(1, Ordering::SeqCst);
            seeds.lock().unwrap().push(t.seed);
            Err(anyhow!("diverged"))
        };
        let retry = TrainingFailurePolicy::Retry { max_attempts: 3 };
        let outcome = run_with_policy(&task, retry, &failing).unwrap();
        assert!(outcome.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let seeds = seeds.lock().unwrap();
        assert_eq!(seeds[0], 1);
        assert_ne!(seeds[1], seeds[2]);

        assert!(run_with_policy(&task, TrainingFailurePolicy::Abort, &failing).is_err());
        assert!(run_with_policy(&task, TrainingFailurePolicy::Skip, &failing)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_qualitative_weight_reaches_the_loss() {
        // Quantitative strong binders, contradicted by qualitative non-binders.
        let mut rows = Vec::new();
        for peptide in ["SIINFEKL", "GILGFVFTL", "NLVPMVATV", "KLVALGINA"] {
            rows.push(AffinityMeasurement::new(peptide, "A0201", 10.0));
            rows.push(AffinityMeasurement::new(peptide, "A0201", 40000.0).qualitative());
        }
        let data = TrainingData::new(rows);
        let task = TrainingTask {
            allele: "HLA-A0201".to_string(),
            member_index: 0,
            seed: 9,
            rows: Arc::new((0..8).collect()),
        };
        let hyperparameters = Hyperparameters::from_json_str(
            r#"{"max_epochs": 10, "learning_rate": 0.01, "validation_split": 0.0,
                "early_stopping": false, "random_negative_constant": 0}"#,
        )
        .unwrap();
        let predict = |qualitative_weight: f64| {
            let options = TrainingOptions {
                qualitative_weight,
                ..Default::default()
            };
            let network =
                train_task(&task, &data, &hyperparameters, &options, &Device::Cpu).unwrap();
            let encoder = SequenceEncoder::create(&["SIINFEKL", "GILGFVFTL"]).unwrap();
            network.predict(&encoder, None).unwrap()
        };
        let ignored = predict(0.0);
        let counted = predict(1.0);
        assert!(ignored.iter().zip(&counted).all(|(a, b)| a < b));

        let options = TrainingOptions {
            qualitative_weight: -1.0,
            ..Default::default()
        };
        let err = run_with_policy(&task, TrainingFailurePolicy::Skip, &|t: &TrainingTask| {
            train_task(t, &data, &hyperparameters, &options, &Device::Cpu)
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AffinityError>(),
            Some(AffinityError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_encoding_errors_bypass_skip_and_retry() {
        let task = TrainingTask {
            allele: "HLA-A0201".to_string(),
            member_index: 0,
            seed: 1,
            rows: Arc::new(vec![0]),
        };
        let calls = AtomicUsize::new(0);
        let bad_residue = |_: &TrainingTask| -> Result<AffinityNetwork> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AffinityError::Encoding(EncodingError::UnknownResidue {
                peptide: "SIINFEKLB".to_string(),
                residue: 'B',
            })
            .into())
        };
        for policy in [
            TrainingFailurePolicy::Skip,
            TrainingFailurePolicy::Retry { max_attempts: 3 },
        ] {
            let err = run_with_policy(&task, policy, &bad_residue).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<AffinityError>(),
                Some(AffinityError::Encoding(_))
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
