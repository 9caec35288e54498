use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Linear, Module, Optimizer, VarMap};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Instant;

use crate::building_blocks::amino_acid::{amino_acid_distribution, random_peptides, VectorEncoding};
use crate::building_blocks::featurize::{
    vector_encode_fixed_length, EncodedPeptides, PeptideEncoding, SequenceEncoder,
};
use crate::building_blocks::nn::{
    Activation, Dense, DenseStack, LocallyConnected1D, WeightInitializer,
};
use crate::error::AffinityError;
use crate::models::hyperparameters::{
    Hyperparameters, LossKind, MergeMethod, OptimizerKind,
};
use crate::utils::data_handling::{from_ic50, to_ic50, Inequality};
use crate::utils::stats::{TrainingHistory, TrainingPhase};

const PREDICT_BATCH_SIZE: usize = 4096;

/// Identifies networks with the same topology and input shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkSignature(String);

impl NetworkSignature {
    fn new(
        hyperparameters: &Hyperparameters,
        pseudosequence_length: Option<usize>,
    ) -> Result<Self> {
        let value = serde_json::json!({
            "encoding": hyperparameters.encoding,
            "network": hyperparameters.network,
            "pseudosequence_length": pseudosequence_length,
        });
        Ok(Self(serde_json::to_string(&value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    Unbuilt,
    Compiled,
    Fit,
}

/// Metadata recorded by one call to `fit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitInfo {
    pub history: TrainingHistory,
    pub num_points: usize,
    pub num_random_negatives: usize,
    pub fit_seconds: f64,
    pub fit_timestamp: String,
    /// Input rows held out for validation, in evaluation order.
    #[serde(default)]
    pub validation_rows: Vec<usize>,
}

/// Optional per-row inputs to `fit`.
#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    /// Defaults to `=` for every row.
    pub inequalities: Option<Vec<Inequality>>,
    pub sample_weights: Option<Vec<f64>>,
    /// Required for pan-allele networks: the pseudosequence of each row's allele.
    pub allele_pseudosequences: Option<Vec<String>>,
    pub seed: u64,
}

/// Peptide (+ optional allele) branch -> locally connected -> dense -> [0, 1].
#[derive(Debug, Clone)]
struct Topology {
    embedding: Option<Embedding>,
    locally_connected: Vec<LocallyConnected1D>,
    allele_dense: Option<DenseStack>,
    allele_projection: Option<Linear>,
    merge_method: MergeMethod,
    merge_activation: Activation,
    dense: DenseStack,
    output: Dense,
    l1: f64,
}

impl Topology {
    fn build<R: Rng>(
        init: &mut WeightInitializer<'_, R>,
        hp: &Hyperparameters,
        pseudosequence_length: Option<usize>,
    ) -> Result<Self> {
        let net = &hp.network;
        let mut length = hp.encoding.kmer_size;
        let mut channels = match hp.encoding.peptide_encoding.vector_encoding() {
            Some(v) => v.dim(),
            None => net.embedding_output_dim,
        };

        let embedding = match hp.encoding.peptide_encoding {
            PeptideEncoding::Index => Some(init.embedding(
                "embedding",
                crate::building_blocks::amino_acid::ALPHABET_SIZE,
                net.embedding_output_dim,
            )?),
            _ => None,
        };

        let mut locally_connected = Vec::new();
        for (i, layer) in net.locally_connected_layers.iter().enumerate() {
            let lc = LocallyConnected1D::new(
                init,
                &format!("lc_{}", i),
                length,
                channels,
                layer.filters,
                layer.kernel_size,
                layer.activation,
            )?;
            length = lc.output_length();
            channels = lc.filters();
            locally_connected.push(lc);
        }
        let mut width = length * channels;

        let (allele_dense, allele_projection) = match pseudosequence_length {
            None => (None, None),
            Some(pseudo_len) => {
                let mut allele_width = pseudo_len * VectorEncoding::Blosum62.dim();
                let mut layers = Vec::new();
                for (i, size) in net.allele_dense_layer_sizes.iter().enumerate() {
                    let linear = init.linear(&format!("allele_dense_{}", i), allele_width, *size)?;
                    layers.push(Dense::new(linear, net.activation));
                    allele_width = *size;
                }
                let projection = match net.peptide_allele_merge_method {
                    MergeMethod::Multiply => {
                        Some(init.linear("allele_projection", allele_width, width)?)
                    }
                    MergeMethod::Concatenate => {
                        width += allele_width;
                        None
                    }
                };
                (Some(DenseStack::new(layers, net.dropout_probability)), projection)
            }
        };

        let mut dense_layers = Vec::new();
        for (i, size) in net.layer_sizes.iter().enumerate() {
            let linear = init.linear(&format!("dense_{}", i), width, *size)?;
            dense_layers.push(Dense::new(linear, net.activation));
            width = *size;
        }
        let output = Dense::new(init.linear("output", width, 1)?, net.output_activation);

        Ok(Self {
            embedding,
            locally_connected,
            allele_dense,
            allele_projection,
            merge_method: net.peptide_allele_merge_method,
            merge_activation: net.peptide_allele_merge_activation,
            dense: DenseStack::new(dense_layers, net.dropout_probability),
            output,
            l1: net.dense_layer_l1_regularization,
        })
    }

    fn forward(&self, peptides: &Tensor, alleles: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut xs = match &self.embedding {
            Some(embedding) => embedding.forward(peptides)?,
            None => peptides.clone(),
        };
        for lc in &self.locally_connected {
            xs = lc.forward(&xs)?;
        }
        let mut xs = xs.flatten_from(1)?;

        if let Some(allele_dense) = &self.allele_dense {
            let alleles =
                alleles.ok_or_else(|| anyhow!("Pan-allele network requires allele inputs"))?;
            let allele_features = allele_dense.forward_t(&alleles.flatten_from(1)?, train)?;
            let merged = match (self.merge_method, &self.allele_projection) {
                (MergeMethod::Multiply, Some(projection)) => {
                    (xs * projection.forward(&allele_features)?)?
                }
                _ => Tensor::cat(&[&xs, &allele_features], 1)?,
            };
            xs = self.merge_activation.apply(&merged)?;
        }

        let xs = self.dense.forward_t(&xs, train)?;
        Ok(self.output.forward(&xs)?.squeeze(D::Minus1)?)
    }

    fn regularization(&self) -> Result<Option<Tensor>> {
        if self.l1 <= 0.0 || self.dense.is_empty() {
            return Ok(None);
        }
        Ok(Some((self.dense.l1_norm()? * self.l1)?))
    }
}

enum FitOptimizer {
    Adam(candle_nn::AdamW),
    Sgd(candle_nn::SGD),
}

impl FitOptimizer {
    fn new(kind: OptimizerKind, varmap: &VarMap, learning_rate: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Adam => {
                let params = candle_nn::ParamsAdamW {
                    lr: learning_rate,
                    weight_decay: 0.0,
                    ..Default::default()
                };
                FitOptimizer::Adam(candle_nn::AdamW::new(varmap.all_vars(), params)?)
            }
            OptimizerKind::Sgd => {
                FitOptimizer::Sgd(candle_nn::SGD::new(varmap.all_vars(), learning_rate)?)
            }
        })
    }

    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            FitOptimizer::Adam(opt) => opt.backward_step(loss)?,
            FitOptimizer::Sgd(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }
}

/// Inequality-aware weighted MSE over targets in [0, 1].
///
/// `kinds` holds one-hot (=, >, <) masks of shape (batch, 3). A `>` row is a
/// weaker-than measurement, so only predictions above the target are penalized;
/// `<` rows are the mirror image.
pub fn mse_with_inequalities(
    predictions: &Tensor,
    targets: &Tensor,
    kinds: &Tensor,
    weights: &Tensor,
) -> candle_core::Result<Tensor> {
    let diff = (predictions - targets)?;
    let eq = diff.sqr()?;
    let gt = diff.relu()?.sqr()?;
    let lt = diff.neg()?.relu()?.sqr()?;
    let eq = (eq * kinds.narrow(1, 0, 1)?.squeeze(1)?)?;
    let gt = (gt * kinds.narrow(1, 1, 1)?.squeeze(1)?)?;
    let lt = (lt * kinds.narrow(1, 2, 1)?.squeeze(1)?)?;
    let per_row = ((eq + gt)? + lt)?;
    let weighted = (per_row * weights)?.sum_all()?;
    weighted / weights.sum_all()?.to_scalar::<f32>()?.max(f32::EPSILON) as f64
}

/// Rows of a fit, kept on the host and batched on demand.
struct FitRows {
    peptides: EncodedPeptides,
    alleles: Option<EncodedPeptides>,
    targets: Vec<f32>,
    kinds: Vec<Inequality>,
    weights: Vec<f32>,
}

impl FitRows {
    fn len(&self) -> usize {
        self.targets.len()
    }

    fn select(&self, rows: &[usize]) -> Self {
        Self {
            peptides: self.peptides.select(rows),
            alleles: self.alleles.as_ref().map(|a| a.select(rows)),
            targets: rows.iter().map(|&i| self.targets[i]).collect(),
            kinds: rows.iter().map(|&i| self.kinds[i]).collect(),
            weights: rows.iter().map(|&i| self.weights[i]).collect(),
        }
    }

    fn concatenate(&self, other: &Self) -> Result<Self> {
        let alleles = match (&self.alleles, &other.alleles) {
            (Some(a), Some(b)) => Some(a.concatenate(b)?),
            (None, None) => None,
            _ => return Err(anyhow!("Cannot mix pan-allele and allele-specific rows")),
        };
        Ok(Self {
            peptides: self.peptides.concatenate(&other.peptides)?,
            alleles,
            targets: [self.targets.as_slice(), other.targets.as_slice()].concat(),
            kinds: [self.kinds.as_slice(), other.kinds.as_slice()].concat(),
            weights: [self.weights.as_slice(), other.weights.as_slice()].concat(),
        })
    }

    fn tensors(&self, device: &Device) -> Result<(Tensor, Option<Tensor>, Tensor, Tensor, Tensor)> {
        let n = self.len();
        let peptides = self.peptides.to_tensor(device)?;
        let alleles = self.alleles.as_ref().map(|a| a.to_tensor(device)).transpose()?;
        let targets = Tensor::from_vec(self.targets.clone(), n, device)?;
        let kinds: Vec<f32> = self
            .kinds
            .iter()
            .flat_map(|k| match k {
                Inequality::Equal => [1.0, 0.0, 0.0],
                Inequality::Greater => [0.0, 1.0, 0.0],
                Inequality::Less => [0.0, 0.0, 1.0],
            })
            .collect();
        let kinds = Tensor::from_vec(kinds, (n, 3), device)?;
        let weights = Tensor::from_vec(self.weights.clone(), n, device)?;
        Ok((peptides, alleles, targets, kinds, weights))
    }
}

/// One regression network: build, fit, predict and (de)serialize.
///
/// Each instance owns its `VarMap` exclusively; ensemble members never share
/// weight storage.
pub struct AffinityNetwork {
    hyperparameters: Hyperparameters,
    device: Device,
    varmap: VarMap,
    topology: Option<Topology>,
    pseudosequence_length: Option<usize>,
    state: ModelState,
    fit_info: Vec<FitInfo>,
}

impl AffinityNetwork {
    pub fn new(hyperparameters: Hyperparameters, device: Device) -> Self {
        Self {
            hyperparameters,
            device,
            varmap: VarMap::new(),
            topology: None,
            pseudosequence_length: None,
            state: ModelState::Unbuilt,
            fit_info: Vec::new(),
        }
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn fit_info(&self) -> &[FitInfo] {
        &self.fit_info
    }

    pub fn is_pan_allele(&self) -> bool {
        self.pseudosequence_length.is_some()
    }

    pub fn pseudosequence_length(&self) -> Option<usize> {
        self.pseudosequence_length
    }

    pub fn supported_peptide_lengths(&self) -> RangeInclusive<usize> {
        self.hyperparameters.encoding.supported_lengths()
    }

    pub fn signature(&self) -> Result<NetworkSignature> {
        NetworkSignature::new(&self.hyperparameters, self.pseudosequence_length)
    }

    /// Create freshly initialized weights; any previous weights are discarded.
    pub fn build(
        &mut self,
        pseudosequence_length: Option<usize>,
        seed: u64,
    ) -> Result<NetworkSignature> {
        self.hyperparameters.validate()?;
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let topology = {
            let mut init = WeightInitializer::new(&varmap, &self.device, &mut rng);
            Topology::build(&mut init, &self.hyperparameters, pseudosequence_length)?
        };
        self.varmap = varmap;
        self.topology = Some(topology);
        self.pseudosequence_length = pseudosequence_length;
        self.state = ModelState::Compiled;
        debug!(
            "Built network with {} weight tensors (pan-allele: {})",
            self.varmap.all_vars().len(),
            pseudosequence_length.is_some()
        );
        self.signature()
    }

    fn topology(&self) -> Result<&Topology> {
        self.topology
            .as_ref()
            .ok_or_else(|| anyhow!("Network has not been built"))
    }

    fn encode_alleles(
        &self,
        pseudosequences: Option<&[String]>,
        n: usize,
    ) -> Result<Option<EncodedPeptides>> {
        match (self.pseudosequence_length, pseudosequences) {
            (None, _) => Ok(None),
            (Some(_), None) => Err(AffinityError::InvalidInput(
                "pan-allele network needs allele pseudosequences".to_string(),
            )
            .into()),
            (Some(expected), Some(seqs)) => {
                if seqs.len() != n {
                    return Err(AffinityError::InvalidInput(format!(
                        "{} pseudosequences for {} peptides",
                        seqs.len(),
                        n
                    ))
                    .into());
                }
                let encoded = vector_encode_fixed_length(seqs, VectorEncoding::Blosum62)?;
                if n > 0 && encoded.dim().1 != expected {
                    return Err(AffinityError::InvalidInput(format!(
                        "pseudosequence length {} does not match network ({})",
                        encoded.dim().1,
                        expected
                    ))
                    .into());
                }
                Ok(Some(EncodedPeptides::Vector(encoded)))
            }
        }
    }

    /// Train on `affinities` (nM) for `peptides`.
    ///
    /// Builds the network first when it has not been built. Random negatives
    /// are regenerated every epoch; the weights of the best monitored epoch
    /// are restored before returning.
    pub fn fit(
        &mut self,
        peptides: &SequenceEncoder,
        affinities: &[f64],
        options: &FitOptions,
    ) -> Result<&FitInfo> {
        let n = peptides.len();
        self.check_fit_inputs(n, affinities, options)?;

        if self.topology.is_none() {
            let pseudo_len = options
                .allele_pseudosequences
                .as_ref()
                .and_then(|s| s.first())
                .map(|s| s.chars().count());
            self.build(pseudo_len, options.seed)?;
        }

        let start = Instant::now();
        let hp = self.hyperparameters.clone();
        let fit = &hp.fit;
        let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(1));
        let all_rows = self.fit_rows(peptides, affinities, options)?;

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rng);
        let num_train = ((n as f64) * (1.0 - fit.validation_split)).floor().max(1.0) as usize;
        let num_train = num_train.min(n);
        let train_rows = all_rows.select(&order[..num_train]);
        let validation_rows = (num_train < n).then(|| all_rows.select(&order[num_train..]));

        let train_peptides: Vec<&str> = order[..num_train]
            .iter()
            .map(|&i| peptides.sequences()[i].as_str())
            .collect();
        let decoy_plan = self.random_negative_plan(&train_peptides);
        let distribution = fit.random_negative_match_distribution.then(|| {
            amino_acid_distribution(&train_peptides, fit.random_negative_distribution_smoothing)
        });
        let num_random_negatives: usize = decoy_plan.values().sum();
        let train_pseudosequences: Option<Vec<String>> = options
            .allele_pseudosequences
            .as_ref()
            .map(|s| order[..num_train].iter().map(|&i| s[i].clone()).collect());

        info!(
            "Fitting network on {} measurements ({} train, {} validation) + {} random negatives \
             for up to {} epochs",
            n,
            num_train,
            n - num_train,
            num_random_negatives,
            fit.max_epochs
        );

        let mut optimizer =
            FitOptimizer::new(hp.compile.optimizer, &self.varmap, hp.compile.learning_rate)?;
        let mut history = TrainingHistory::default();
        let mut best: Option<(usize, f32, Vec<(String, Tensor)>)> = None;

        for epoch in 0..fit.max_epochs {
            let decoys = self.random_negatives(
                &decoy_plan,
                distribution.as_deref(),
                train_pseudosequences.as_deref(),
                &mut rng,
            )?;
            let epoch_rows = match &decoys {
                Some(d) => train_rows.concatenate(d)?,
                None => train_rows.select(&(0..train_rows.len()).collect::<Vec<_>>()),
            };

            let mut epoch_order: Vec<usize> = (0..epoch_rows.len()).collect();
            epoch_order.shuffle(&mut rng);
            let mut loss_sum = 0.0f64;
            for batch in epoch_order.chunks(fit.minibatch_size) {
                let (pep, all, y, k, w) = epoch_rows.select(batch).tensors(&self.device)?;
                let topology = self.topology()?;
                let predictions = topology.forward(&pep, all.as_ref(), true)?;
                let mut loss = mse_with_inequalities(&predictions, &y, &k, &w)?;
                let data_loss = loss.to_scalar::<f32>()? as f64;
                if let Some(penalty) = topology.regularization()? {
                    loss = (loss + penalty)?;
                }
                optimizer.backward_step(&loss)?;
                loss_sum += data_loss * batch.len() as f64;
            }
            let train_loss = (loss_sum / epoch_rows.len().max(1) as f64) as f32;
            history.record(epoch, TrainingPhase::Train, train_loss, hp.compile.learning_rate);

            let monitored = match &validation_rows {
                Some(rows) => {
                    let val_loss = self.evaluate_loss(rows)?;
                    history.record(
                        epoch,
                        TrainingPhase::Validation,
                        val_loss,
                        hp.compile.learning_rate,
                    );
                    debug!(
                        "Epoch {}: train loss {:.5}, validation loss {:.5}",
                        epoch, train_loss, val_loss
                    );
                    val_loss
                }
                None => {
                    debug!("Epoch {}: train loss {:.5}", epoch, train_loss);
                    train_loss
                }
            };

            let improved = match &best {
                None => true,
                Some((_, best_loss, _)) => {
                    (monitored as f64) < *best_loss as f64 - hp.early_stopping.min_delta
                }
            };
            if improved {
                best = Some((epoch, monitored, self.get_weights()?));
            } else if let Some((best_epoch, _, _)) = &best {
                if fit.early_stopping && epoch - best_epoch >= hp.early_stopping.patience {
                    info!(
                        "Early stopping at epoch {} (best epoch {})",
                        epoch, best_epoch
                    );
                    break;
                }
            }
        }

        if let Some((best_epoch, best_loss, weights)) = best {
            self.set_weights(&weights)?;
            history.best_epoch = Some(best_epoch);
            history.best_loss = Some(best_loss);
        }

        self.state = ModelState::Fit;
        self.fit_info.push(FitInfo {
            history,
            num_points: n,
            num_random_negatives,
            fit_seconds: start.elapsed().as_secs_f64(),
            fit_timestamp: chrono::Utc::now().to_rfc3339(),
            validation_rows: order[num_train..].to_vec(),
        });
        self.fit_info
            .last()
            .ok_or_else(|| anyhow!("Fit info missing after training"))
    }

    /// Decoy count per peptide length: round(rate * n_len) + constant.
    fn random_negative_plan(&self, train_peptides: &[&str]) -> BTreeMap<usize, usize> {
        let fit = &self.hyperparameters.fit;
        let mut by_length: BTreeMap<usize, usize> = BTreeMap::new();
        for p in train_peptides {
            *by_length.entry(p.len()).or_default() += 1;
        }
        by_length
            .into_iter()
            .map(|(len, count)| {
                let num = (fit.random_negative_rate * count as f64).round() as usize
                    + fit.random_negative_constant;
                (len, num)
            })
            .filter(|(_, num)| *num > 0)
            .collect()
    }

    fn random_negatives(
        &self,
        plan: &BTreeMap<usize, usize>,
        distribution: Option<&[f64]>,
        train_pseudosequences: Option<&[String]>,
        rng: &mut StdRng,
    ) -> Result<Option<FitRows>> {
        if plan.is_empty() {
            return Ok(None);
        }
        let mut decoys = Vec::new();
        for (length, count) in plan {
            decoys.extend(random_peptides(*count, *length, distribution, rng)?);
        }
        let n = decoys.len();
        let encoded = SequenceEncoder::create(&decoys)?.encode(&self.hyperparameters.encoding)?;
        let pseudosequences: Option<Vec<String>> = match train_pseudosequences {
            Some(pool) if !pool.is_empty() => {
                Some((0..n).map(|_| pool[rng.gen_range(0..pool.len())].clone()).collect())
            }
            _ => None,
        };
        let fit = &self.hyperparameters.fit;
        Ok(Some(FitRows {
            peptides: encoded.as_ref().clone(),
            alleles: self.encode_alleles(pseudosequences.as_deref(), n)?,
            targets: vec![from_ic50(fit.random_negative_affinity, fit.max_ic50) as f32; n],
            kinds: vec![Inequality::Greater; n],
            weights: vec![1.0; n],
        }))
    }

    fn check_fit_inputs(&self, n: usize, affinities: &[f64], options: &FitOptions) -> Result<()> {
        if n == 0 || affinities.len() != n {
            return Err(AffinityError::InvalidInput(format!(
                "{} peptides but {} affinities",
                n,
                affinities.len()
            ))
            .into());
        }
        if let Some(w) = &options.sample_weights {
            if w.len() != n {
                return Err(AffinityError::InvalidInput(format!(
                    "{} sample weights for {} peptides",
                    w.len(),
                    n
                ))
                .into());
            }
            if let Some(bad) = w.iter().find(|v| !v.is_finite() || **v < 0.0) {
                return Err(AffinityError::InvalidInput(format!(
                    "Sample weights must be finite and non-negative, got {}",
                    bad
                ))
                .into());
            }
        }
        if let Some(ineq) = &options.inequalities {
            if ineq.len() != n {
                return Err(AffinityError::InvalidInput(format!(
                    "{} inequalities for {} peptides",
                    ineq.len(),
                    n
                ))
                .into());
            }
        }
        Ok(())
    }

    fn fit_rows(
        &self,
        peptides: &SequenceEncoder,
        affinities: &[f64],
        options: &FitOptions,
    ) -> Result<FitRows> {
        let n = peptides.len();
        let hp = &self.hyperparameters;
        let encoded = peptides.encode(&hp.encoding)?;
        let alleles = self.encode_alleles(options.allele_pseudosequences.as_deref(), n)?;
        let kinds = match (hp.compile.loss, &options.inequalities) {
            (LossKind::MseWithInequalities, Some(ineq)) => ineq.clone(),
            _ => vec![Inequality::Equal; n],
        };
        Ok(FitRows {
            peptides: encoded.as_ref().clone(),
            alleles,
            targets: affinities
                .iter()
                .map(|a| from_ic50(*a, hp.fit.max_ic50) as f32)
                .collect(),
            kinds,
            weights: options
                .sample_weights
                .as_ref()
                .map(|w| w.iter().map(|v| *v as f32).collect())
                .unwrap_or_else(|| vec![1.0; n]),
        })
    }

    /// Weighted loss of the current weights on the given measurements,
    /// without random negatives or dropout.
    pub fn evaluate(
        &self,
        peptides: &SequenceEncoder,
        affinities: &[f64],
        options: &FitOptions,
    ) -> Result<f32> {
        self.check_fit_inputs(peptides.len(), affinities, options)?;
        let rows = self.fit_rows(peptides, affinities, options)?;
        self.evaluate_loss(&rows)
    }

    fn evaluate_loss(&self, rows: &FitRows) -> Result<f32> {
        let topology = self.topology()?;
        let mut weighted = 0.0f64;
        let mut total_weight = 0.0f64;
        let all: Vec<usize> = (0..rows.len()).collect();
        for batch in all.chunks(PREDICT_BATCH_SIZE) {
            let subset = rows.select(batch);
            let (pep, alleles, y, k, w) = subset.tensors(&self.device)?;
            let predictions = topology.forward(&pep, alleles.as_ref(), false)?;
            let batch_weight: f64 = subset.weights.iter().map(|v| *v as f64).sum();
            let loss = mse_with_inequalities(&predictions, &y, &k, &w)?.to_scalar::<f32>()? as f64;
            weighted += loss * batch_weight;
            total_weight += batch_weight;
        }
        Ok((weighted / total_weight.max(f64::EPSILON)) as f32)
    }

    /// Predicted affinities (nM), in input order.
    pub fn predict(
        &self,
        peptides: &SequenceEncoder,
        allele_pseudosequences: Option<&[String]>,
    ) -> Result<Vec<f64>> {
        let topology = self.topology()?;
        let encoded = peptides.encode(&self.hyperparameters.encoding)?;
        let alleles = self.encode_alleles(allele_pseudosequences, peptides.len())?;
        let max_ic50 = self.hyperparameters.fit.max_ic50;

        let rows: Vec<usize> = (0..peptides.len()).collect();
        let mut result = Vec::with_capacity(rows.len());
        for batch in rows.chunks(PREDICT_BATCH_SIZE) {
            let pep = encoded.select(batch).to_tensor(&self.device)?;
            let all = alleles
                .as_ref()
                .map(|a| a.select(batch).to_tensor(&self.device))
                .transpose()?;
            let output = topology.forward(&pep, all.as_ref(), false)?;
            let values: Vec<f32> = output.to_dtype(DType::F32)?.to_vec1()?;
            result.extend(values.into_iter().map(|v| to_ic50(v as f64, max_ic50)));
        }
        Ok(result)
    }

    /// Deep copies of every weight tensor.
    pub fn get_weights(&self) -> Result<Vec<(String, Tensor)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("VarMap lock poisoned"))?;
        let mut weights = data
            .iter()
            .map(|(name, var)| -> Result<(String, Tensor)> {
                let t = var.as_tensor();
                let copy =
                    Tensor::from_vec(t.flatten_all()?.to_vec1::<f32>()?, t.dims(), t.device())?;
                Ok((name.clone(), copy))
            })
            .collect::<Result<Vec<_>>>()?;
        weights.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(weights)
    }

    pub fn set_weights(&mut self, weights: &[(String, Tensor)]) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("VarMap lock poisoned"))?;
        for (name, tensor) in weights {
            let var = data
                .get(name)
                .ok_or_else(|| anyhow!("Unknown weight tensor: {}", name))?;
            var.set(tensor)
                .with_context(|| format!("Shape mismatch for weight tensor {}", name))?;
        }
        Ok(())
    }

    /// Save model weights to a file in safetensors format.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.topology()?;
        self.varmap
            .save(path.as_ref())
            .with_context(|| format!("Failed to save weights to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load weights saved by `save_weights` into this network's topology.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        if self.topology.is_none() {
            self.build(self.pseudosequence_length, 0)?;
        }
        self.varmap
            .load(path.as_ref())
            .with_context(|| format!("Failed to load weights from {:?}", path.as_ref()))?;
        self.state = ModelState::Fit;
        Ok(())
    }

    /// Architecture + hyperparameter description, without weights.
    pub fn get_config(&self) -> Result<Value> {
        Ok(serde_json::json!({
            "hyperparameters": self.hyperparameters.to_map()?,
            "pseudosequence_length": self.pseudosequence_length,
            "fit_info": self.fit_info,
        }))
    }

    /// Rebuild an unweighted network from `get_config` output.
    pub fn from_config(config: &Value, device: Device) -> Result<Self> {
        let hyperparameters = match config.get("hyperparameters") {
            Some(Value::Object(map)) => Hyperparameters::from_map(map)?,
            _ => return Err(anyhow!("Model config is missing hyperparameters")),
        };
        let pseudosequence_length = match config.get("pseudosequence_length") {
            Some(Value::Null) | None => None,
            Some(v) => Some(serde_json::from_value::<usize>(v.clone())?),
        };
        let fit_info = match config.get("fit_info") {
            Some(v) => serde_json::from_value::<Vec<FitInfo>>(v.clone())?,
            None => Vec::new(),
        };
        let mut network = Self::new(hyperparameters, device);
        network.pseudosequence_length = pseudosequence_length;
        network.fit_info = fit_info;
        Ok(network)
    }

    /// Independent copy with identical weights.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::from_config(&self.get_config()?, self.device.clone())?;
        if self.topology.is_some() {
            copy.build(self.pseudosequence_length, 0)?;
            copy.set_weights(&self.get_weights()?)?;
            copy.state = self.state;
        }
        Ok(copy)
    }
}
