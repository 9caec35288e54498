pub mod affinity_predictor;
pub mod hyperparameters;
pub mod manifest;
pub mod neural_network;
pub mod percentile_rank;
pub mod prediction_table;
pub mod training;
