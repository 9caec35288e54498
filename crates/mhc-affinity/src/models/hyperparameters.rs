use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::building_blocks::featurize::EncodingConfig;
use crate::building_blocks::nn::Activation;
use crate::error::AffinityError;
use crate::utils::data_handling::MAX_IC50;

/// Mapping from option name to default value.
///
/// Schemas are composed with `extend`, which refuses to merge two schemas
/// declaring the same key with different defaults.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HyperparameterSchema {
    defaults: BTreeMap<String, Value>,
}

impl HyperparameterSchema {
    pub fn new(defaults: BTreeMap<String, Value>) -> Self {
        Self { defaults }
    }

    /// Schema whose keys and defaults are the serialized fields of `T::default()`.
    pub fn from_record<T: Serialize + Default>() -> Result<Self> {
        match serde_json::to_value(T::default())? {
            Value::Object(map) => Ok(Self {
                defaults: map.into_iter().collect(),
            }),
            other => Err(anyhow!(
                "Hyperparameter record must serialize to an object, got {}",
                other
            )),
        }
    }

    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }

    pub fn contains(&self, key: &str) -> bool {
        self.defaults.contains_key(key)
    }

    pub fn extend(&self, other: &HyperparameterSchema) -> Result<HyperparameterSchema> {
        let mut defaults = self.defaults.clone();
        for (key, value) in &other.defaults {
            match defaults.get(key) {
                Some(existing) if existing != value => {
                    return Err(AffinityError::ConflictingHyperparameterDefault(key.clone()).into());
                }
                _ => {
                    defaults.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(HyperparameterSchema { defaults })
    }

    pub fn check_valid_keys(&self, supplied: &Map<String, Value>) -> Result<()> {
        let mut invalid: Vec<&str> = supplied
            .keys()
            .filter(|k| !self.defaults.contains_key(*k))
            .map(|k| k.as_str())
            .collect();
        if invalid.is_empty() {
            return Ok(());
        }
        invalid.sort_unstable();
        Err(AffinityError::UnsupportedHyperparameter(invalid.join(", ")).into())
    }

    /// `supplied` with every missing key filled from the defaults.
    pub fn with_defaults(&self, supplied: &Map<String, Value>) -> Result<Map<String, Value>> {
        self.check_valid_keys(supplied)?;
        let mut result: Map<String, Value> = self
            .defaults
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in supplied {
            result.insert(k.clone(), v.clone());
        }
        Ok(result)
    }

    /// Schema restricted to `keys`.
    pub fn subselect(&self, keys: &[&str]) -> Result<HyperparameterSchema> {
        let mut defaults = BTreeMap::new();
        for key in keys {
            let value = self
                .defaults
                .get(*key)
                .ok_or_else(|| AffinityError::UnsupportedHyperparameter(key.to_string()))?;
            defaults.insert(key.to_string(), value.clone());
        }
        Ok(HyperparameterSchema { defaults })
    }

    /// Cartesian product of `value_lists`, each combination filled with
    /// defaults. The last key (in sorted order) varies fastest.
    pub fn grid(
        &self,
        value_lists: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<Map<String, Value>>> {
        let supplied: Map<String, Value> = value_lists
            .keys()
            .map(|k| (k.clone(), Value::Null))
            .collect();
        self.check_valid_keys(&supplied)?;

        let mut combos: Vec<Map<String, Value>> = vec![Map::new()];
        for (key, values) in value_lists {
            combos = combos
                .into_iter()
                .flat_map(|partial| {
                    values.iter().map(move |v| {
                        let mut next = partial.clone();
                        next.insert(key.clone(), v.clone());
                        next
                    })
                })
                .collect();
        }
        combos.iter().map(|c| self.with_defaults(c)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocallyConnectedLayer {
    pub filters: usize,
    pub kernel_size: usize,
    pub activation: Activation,
}

/// How the peptide and allele branches of a pan-allele network are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Concatenate,
    Multiply,
}

/// Architecture options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkHyperparameters {
    /// Only used with index encoding.
    pub embedding_output_dim: usize,
    pub locally_connected_layers: Vec<LocallyConnectedLayer>,
    pub layer_sizes: Vec<usize>,
    pub activation: Activation,
    pub output_activation: Activation,
    pub dropout_probability: f32,
    pub dense_layer_l1_regularization: f64,
    pub allele_dense_layer_sizes: Vec<usize>,
    pub peptide_allele_merge_method: MergeMethod,
    pub peptide_allele_merge_activation: Activation,
}

impl Default for NetworkHyperparameters {
    fn default() -> Self {
        Self {
            embedding_output_dim: 8,
            locally_connected_layers: vec![LocallyConnectedLayer {
                filters: 8,
                kernel_size: 3,
                activation: Activation::Tanh,
            }],
            layer_sizes: vec![32],
            activation: Activation::Tanh,
            output_activation: Activation::Sigmoid,
            dropout_probability: 0.0,
            dense_layer_l1_regularization: 0.001,
            allele_dense_layer_sizes: vec![],
            peptide_allele_merge_method: MergeMethod::Multiply,
            peptide_allele_merge_activation: Activation::Linear,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Plain MSE; every row treated as `=`.
    Mse,
    MseWithInequalities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileHyperparameters {
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub loss: LossKind,
}

impl Default for CompileHyperparameters {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.001,
            loss: LossKind::MseWithInequalities,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitHyperparameters {
    pub max_epochs: usize,
    pub validation_split: f64,
    pub early_stopping: bool,
    pub minibatch_size: usize,
    /// Decoys per real example of each length.
    pub random_negative_rate: f64,
    /// Decoys added per peptide length on top of the rate.
    pub random_negative_constant: usize,
    /// Affinity (nM) decoys are labeled with, as a `>` measurement.
    pub random_negative_affinity: f64,
    pub random_negative_match_distribution: bool,
    pub random_negative_distribution_smoothing: f64,
    pub max_ic50: f64,
}

impl Default for FitHyperparameters {
    fn default() -> Self {
        Self {
            max_epochs: 500,
            validation_split: 0.1,
            early_stopping: true,
            minibatch_size: 128,
            random_negative_rate: 0.0,
            random_negative_constant: 25,
            random_negative_affinity: 20000.0,
            random_negative_match_distribution: true,
            random_negative_distribution_smoothing: 0.0,
            max_ic50: MAX_IC50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingHyperparameters {
    pub patience: usize,
    /// Improvement smaller than this does not reset patience.
    pub min_delta: f64,
}

impl Default for EarlyStoppingHyperparameters {
    fn default() -> Self {
        Self {
            patience: 20,
            min_delta: 0.0,
        }
    }
}

/// Full, validated option set for one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Hyperparameters {
    #[serde(flatten)]
    pub encoding: EncodingConfig,
    #[serde(flatten)]
    pub network: NetworkHyperparameters,
    #[serde(flatten)]
    pub compile: CompileHyperparameters,
    #[serde(flatten)]
    pub fit: FitHyperparameters,
    #[serde(flatten)]
    pub early_stopping: EarlyStoppingHyperparameters,
}

impl Hyperparameters {
    pub fn schema() -> Result<HyperparameterSchema> {
        HyperparameterSchema::from_record::<EncodingConfig>()?
            .extend(&HyperparameterSchema::from_record::<NetworkHyperparameters>()?)?
            .extend(&HyperparameterSchema::from_record::<CompileHyperparameters>()?)?
            .extend(&HyperparameterSchema::from_record::<FitHyperparameters>()?)?
            .extend(&HyperparameterSchema::from_record::<EarlyStoppingHyperparameters>()?)
    }

    /// Validate a partial mapping, fill in defaults and build the typed record.
    pub fn from_map(supplied: &Map<String, Value>) -> Result<Self> {
        let full = Self::schema()?.with_defaults(supplied)?;
        let hyperparameters: Hyperparameters = typed(full)?;
        hyperparameters.validate()?;
        Ok(hyperparameters)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(map) => Self::from_map(&map),
            _ => Err(AffinityError::InvalidHyperparameter(
                "hyperparameters must be a JSON object".to_string(),
            )
            .into()),
        }
    }

    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!("Hyperparameters did not serialize to an object")),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.encoding.validate()?;
        let invalid = |msg: String| -> Result<()> {
            Err(AffinityError::InvalidHyperparameter(msg).into())
        };
        if !self.network.output_activation.is_unit_bounded() {
            return invalid(format!(
                "output_activation must map onto [0, 1], got {:?}",
                self.network.output_activation
            ));
        }
        if !(0.0..1.0).contains(&self.network.dropout_probability) {
            return invalid(format!(
                "dropout_probability must be in [0, 1), got {}",
                self.network.dropout_probability
            ));
        }
        let mut length = self.encoding.kmer_size;
        for (i, layer) in self.network.locally_connected_layers.iter().enumerate() {
            if layer.kernel_size == 0 || layer.kernel_size > length || layer.filters == 0 {
                return invalid(format!(
                    "locally connected layer {} (filters {}, kernel {}) does not fit input length {}",
                    i, layer.filters, layer.kernel_size, length
                ));
            }
            length = length - layer.kernel_size + 1;
        }
        if self
            .network
            .layer_sizes
            .iter()
            .chain(&self.network.allele_dense_layer_sizes)
            .any(|s| *s == 0)
        {
            return invalid("dense layer sizes must be positive".to_string());
        }
        if self.compile.learning_rate <= 0.0 {
            return invalid(format!(
                "learning_rate must be positive, got {}",
                self.compile.learning_rate
            ));
        }
        if !(0.0..1.0).contains(&self.fit.validation_split) {
            return invalid(format!(
                "validation_split must be in [0, 1), got {}",
                self.fit.validation_split
            ));
        }
        if self.fit.minibatch_size == 0 {
            return invalid("minibatch_size must be positive".to_string());
        }
        if self.fit.random_negative_rate < 0.0
            || self.fit.random_negative_distribution_smoothing < 0.0
        {
            return invalid("random negative rate and smoothing must be non-negative".to_string());
        }
        if self.fit.max_ic50 <= 1.0 {
            return invalid(format!("max_ic50 must exceed 1 nM, got {}", self.fit.max_ic50));
        }
        if self.fit.random_negative_affinity <= 0.0 {
            return invalid(format!(
                "random_negative_affinity must be positive, got {}",
                self.fit.random_negative_affinity
            ));
        }
        Ok(())
    }
}

fn typed<T: DeserializeOwned>(map: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| AffinityError::InvalidHyperparameter(e.to_string()).into())
}
