//! Integration tests for single-network training, configuration and hyperparameters.

use candle_core::Device;
use mhc_affinity::building_blocks::amino_acid::random_peptides;
use mhc_affinity::models::neural_network::ModelState;
use mhc_affinity::utils::stats::TrainingPhase;
use mhc_affinity::{
    AffinityError, AffinityNetwork, FitOptions, Hyperparameters, Inequality, SequenceEncoder,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn hyperparameters(value: Value) -> Hyperparameters {
    Hyperparameters::from_map(value.as_object().unwrap()).unwrap()
}

fn peptides(n: usize, length: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    random_peptides(n, length, None, &mut rng).unwrap()
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

#[test]
fn fit_records_history_and_decoy_counts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut train = peptides(30, 9, 1);
    train.extend(peptides(10, 10, 2));
    let affinities: Vec<f64> = (0..train.len()).map(|i| 10.0 + 100.0 * i as f64).collect();
    let encoder = SequenceEncoder::create(&train).unwrap();

    let mut network = AffinityNetwork::new(
        hyperparameters(json!({
            "max_epochs": 4,
            "early_stopping": false,
            "validation_split": 0.0,
            "random_negative_rate": 0.5,
            "random_negative_constant": 3,
        })),
        Device::Cpu,
    );
    assert_eq!(network.state(), ModelState::Unbuilt);

    let info = network
        .fit(&encoder, &affinities, &FitOptions::default())
        .unwrap()
        .clone();
    // 9-mers: round(0.5 * 30) + 3, 10-mers: round(0.5 * 10) + 3
    assert_eq!(info.num_random_negatives, 18 + 8);
    assert_eq!(info.num_points, 40);
    assert_eq!(info.history.losses_for(TrainingPhase::Train).len(), 4);
    assert!(info.history.losses_for(TrainingPhase::Validation).is_empty());
    assert!(info.history.best_epoch.is_some());
    assert!(!info.fit_timestamp.is_empty());
    assert_eq!(network.state(), ModelState::Fit);
    assert_eq!(network.fit_info().len(), 1);
}

#[test]
fn index_encoding_and_sgd_train() {
    let train = peptides(40, 9, 3);
    let affinities = vec![500.0; train.len()];
    let inequalities = (0..train.len())
        .map(|i| if i % 2 == 0 { Inequality::Equal } else { Inequality::Greater })
        .collect();
    let encoder = SequenceEncoder::create(&train).unwrap();
    let mut network = AffinityNetwork::new(
        hyperparameters(json!({
            "peptide_encoding": "index",
            "optimizer": "sgd",
            "learning_rate": 0.01,
            "max_epochs": 3,
            "random_negative_constant": 0,
        })),
        Device::Cpu,
    );
    let options = FitOptions {
        inequalities: Some(inequalities),
        seed: 4,
        ..Default::default()
    };
    let info = network.fit(&encoder, &affinities, &options).unwrap();
    assert_eq!(info.num_random_negatives, 0);
    assert_eq!(info.history.losses_for(TrainingPhase::Validation).len(), 3);

    let predictions = network.predict(&encoder, None).unwrap();
    assert!(predictions.iter().all(|p| p.is_finite() && *p > 0.0));
}

#[test]
fn same_seed_gives_same_network() {
    let train = peptides(30, 9, 5);
    let affinities: Vec<f64> = (0..train.len()).map(|i| 50.0 * (i + 1) as f64).collect();
    let encoder = SequenceEncoder::create(&train).unwrap();
    let hp = hyperparameters(json!({"max_epochs": 2, "random_negative_constant": 4}));
    let options = FitOptions {
        seed: 17,
        ..Default::default()
    };

    let mut first = AffinityNetwork::new(hp.clone(), Device::Cpu);
    first.fit(&encoder, &affinities, &options).unwrap();
    let mut second = AffinityNetwork::new(hp, Device::Cpu);
    second.fit(&encoder, &affinities, &options).unwrap();

    assert_eq!(
        first.predict(&encoder, None).unwrap(),
        second.predict(&encoder, None).unwrap()
    );
}

#[test]
fn mismatched_inputs_are_rejected() {
    let train = peptides(5, 9, 6);
    let encoder = SequenceEncoder::create(&train).unwrap();
    let mut network = AffinityNetwork::new(Hyperparameters::default(), Device::Cpu);
    let err = network
        .fit(&encoder, &[100.0, 200.0], &FitOptions::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AffinityError>(),
        Some(AffinityError::InvalidInput(_))
    ));
}

#[test]
fn invalid_sample_weights_are_rejected() {
    let train = peptides(4, 9, 6);
    let encoder = SequenceEncoder::create(&train).unwrap();
    let mut network = AffinityNetwork::new(Hyperparameters::default(), Device::Cpu);
    for weights in [vec![1.0, -0.5, 1.0, 1.0], vec![1.0, f64::NAN, 1.0, 1.0]] {
        let options = FitOptions {
            sample_weights: Some(weights),
            ..Default::default()
        };
        let err = network
            .fit(&encoder, &[100.0; 4], &options)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AffinityError>(),
            Some(AffinityError::InvalidInput(_))
        ));
    }
    assert_eq!(network.state(), ModelState::Unbuilt);
}

#[test]
fn zero_weight_rows_do_not_pull_predictions() {
    // Every peptide appears twice: once as a strong binder, once as a non-binder.
    let unique = peptides(30, 9, 12);
    let mut train = unique.clone();
    train.extend(unique.iter().cloned());
    let mut affinities = vec![10.0; unique.len()];
    affinities.extend(vec![40000.0; unique.len()]);
    let encoder = SequenceEncoder::create(&train).unwrap();
    let hp = hyperparameters(json!({
        "max_epochs": 30,
        "early_stopping": false,
        "validation_split": 0.0,
        "learning_rate": 0.01,
        "minibatch_size": 16,
        "random_negative_constant": 0,
    }));

    let fit_with = |weights: Vec<f64>| {
        let mut network = AffinityNetwork::new(hp.clone(), Device::Cpu);
        let options = FitOptions {
            sample_weights: Some(weights),
            seed: 3,
            ..Default::default()
        };
        network.fit(&encoder, &affinities, &options).unwrap();
        network.predict(&encoder, None).unwrap()
    };
    let mut binders_only = vec![1.0; unique.len()];
    binders_only.extend(vec![0.0; unique.len()]);
    let ignoring_conflicts = fit_with(binders_only);
    let balanced = fit_with(vec![1.0; train.len()]);
    assert_ne!(ignoring_conflicts, balanced);

    let mean_log =
        |values: &[f64]| values.iter().map(|v| v.ln()).sum::<f64>() / values.len() as f64;
    assert!(
        mean_log(&ignoring_conflicts) < mean_log(&balanced),
        "zero-weighted non-binders still raised predictions"
    );
}

#[test]
fn early_stopping_restores_best_validation_weights() {
    let _ = env_logger::builder().is_test(true).try_init();
    let train = peptides(60, 9, 8);
    let affinities: Vec<f64> = (0..train.len())
        .map(|i| 15.0 * ((i * 7919) % 23 + 1) as f64 * ((i * 104729) % 11 + 1) as f64)
        .collect();
    let encoder = SequenceEncoder::create(&train).unwrap();
    let patience = 2;
    let max_epochs = 200;
    let mut network = AffinityNetwork::new(
        hyperparameters(json!({
            "max_epochs": max_epochs,
            "patience": patience,
            "validation_split": 0.25,
            "learning_rate": 0.01,
            "minibatch_size": 16,
            "random_negative_constant": 0,
        })),
        Device::Cpu,
    );
    let info = network
        .fit(&encoder, &affinities, &FitOptions { seed: 21, ..Default::default() })
        .unwrap()
        .clone();

    let validation = info.history.losses_for(TrainingPhase::Validation);
    let best_epoch = info.history.best_epoch.unwrap();
    let (last_epoch, _) = *validation.last().unwrap();
    assert!(validation.len() < max_epochs);
    assert_eq!(last_epoch, best_epoch + patience);

    let lowest = validation
        .iter()
        .map(|(_, loss)| *loss)
        .fold(f32::INFINITY, f32::min);
    assert_eq!(info.history.best_loss, Some(lowest));
    assert_eq!(info.validation_rows.len(), 15);

    let held_out: Vec<&str> = info.validation_rows.iter().map(|&i| train[i].as_str()).collect();
    let held_out_affinities: Vec<f64> =
        info.validation_rows.iter().map(|&i| affinities[i]).collect();
    let restored = network
        .evaluate(
            &SequenceEncoder::create(&held_out).unwrap(),
            &held_out_affinities,
            &FitOptions::default(),
        )
        .unwrap();
    assert!((restored - lowest).abs() < 1e-6, "{} vs {}", restored, lowest);
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn config_and_weights_rebuild_an_identical_network() {
    let query = ["SIINFEKL", "GILGFVFTL", "NLVPMVATVQ"];
    let encoder = SequenceEncoder::create(&query).unwrap();
    let mut network = AffinityNetwork::new(
        hyperparameters(json!({"layer_sizes": [16, 8], "dropout_probability": 0.2})),
        Device::Cpu,
    );
    let signature = network.build(None, 9).unwrap();

    let text = serde_json::to_string(&network.get_config().unwrap()).unwrap();
    let config: Value = serde_json::from_str(&text).unwrap();
    let mut rebuilt = AffinityNetwork::from_config(&config, Device::Cpu).unwrap();
    assert_eq!(rebuilt.hyperparameters(), network.hyperparameters());
    assert_eq!(rebuilt.build(None, 1234).unwrap(), signature);

    assert_ne!(
        rebuilt.predict(&encoder, None).unwrap(),
        network.predict(&encoder, None).unwrap()
    );
    rebuilt.set_weights(&network.get_weights().unwrap()).unwrap();
    assert_eq!(
        rebuilt.predict(&encoder, None).unwrap(),
        network.predict(&encoder, None).unwrap()
    );
}

#[test]
fn clones_do_not_share_weights() {
    let train = peptides(20, 9, 7);
    let encoder = SequenceEncoder::create(&train).unwrap();
    let mut network = AffinityNetwork::new(
        hyperparameters(json!({"max_epochs": 2, "random_negative_constant": 0})),
        Device::Cpu,
    );
    network.build(None, 3).unwrap();
    let copy = network.try_clone().unwrap();
    let before = copy.predict(&encoder, None).unwrap();

    network
        .fit(&encoder, &vec![30.0; train.len()], &FitOptions::default())
        .unwrap();
    assert_eq!(copy.predict(&encoder, None).unwrap(), before);
    assert_ne!(network.predict(&encoder, None).unwrap(), before);
}

// ---------------------------------------------------------------------------
// Hyperparameters
// ---------------------------------------------------------------------------

#[test]
fn json_hyperparameters_fill_defaults() {
    let hp = Hyperparameters::from_json_str(r#"{"kmer_size": 13, "max_length": 14, "patience": 3}"#)
        .unwrap();
    assert_eq!(hp.encoding.kmer_size, 13);
    assert_eq!(hp.encoding.supported_lengths(), 8..=14);
    assert_eq!(hp.early_stopping.patience, 3);
    assert_eq!(hp.fit.minibatch_size, 128);

    let err = Hyperparameters::from_json_str(r#"{"not_a_key": 1}"#).unwrap_err();
    assert_eq!(
        err.downcast_ref::<AffinityError>(),
        Some(&AffinityError::UnsupportedHyperparameter("not_a_key".to_string()))
    );
    assert!(Hyperparameters::from_json_str("[1, 2]").is_err());
}

#[test]
fn every_grid_point_is_a_valid_configuration() {
    let schema = Hyperparameters::schema().unwrap();
    let mut values = BTreeMap::new();
    values.insert("layer_sizes".to_string(), vec![json!([8]), json!([16, 8])]);
    values.insert(
        "peptide_encoding".to_string(),
        vec![json!("BLOSUM62"), json!("one-hot"), json!("index")],
    );
    let grid = schema.grid(&values).unwrap();
    assert_eq!(grid.len(), 6);
    for point in &grid {
        let hp = Hyperparameters::from_map(point).unwrap();
        assert_eq!(hp.to_map().unwrap().len(), point.len());
    }
    assert_eq!(grid[1]["peptide_encoding"], json!("one-hot"));
    assert_eq!(grid[3]["layer_sizes"], json!([16, 8]));
}
