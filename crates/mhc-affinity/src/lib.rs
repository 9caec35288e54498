//! Peptide / MHC binding affinity prediction with ensembles of small
//! locally connected networks.
//!
//! [`AffinityPredictor`] owns per-allele ensembles of [`AffinityNetwork`]s
//! (plus an optional pan-allele ensemble), aggregates member predictions by
//! geometric mean, maps them to percentile ranks and persists everything as a
//! manifest of independently stored members.

pub mod building_blocks;
pub mod error;
pub mod models;
pub mod utils;

pub use building_blocks::featurize::{EncodingConfig, PeptideEncoding, SequenceEncoder};
pub use error::{AffinityError, EncodingError};
pub use models::affinity_predictor::{
    AffinityPredictor, CalibrationOptions, EnsembleMember, PredictOptions,
};
pub use models::hyperparameters::{HyperparameterSchema, Hyperparameters};
pub use models::neural_network::{AffinityNetwork, FitOptions, NetworkSignature};
pub use models::percentile_rank::PercentileCalibrator;
pub use models::prediction_table::{PredictionRow, PredictionTable};
pub use models::training::{
    RayonExecutor, SequentialExecutor, TaskExecutor, TrainingFailurePolicy, TrainingOptions,
    TrainingTask,
};
pub use utils::data_handling::{
    from_ic50, normalize_allele_name, to_ic50, AffinityMeasurement, Inequality, MeasurementType,
};
