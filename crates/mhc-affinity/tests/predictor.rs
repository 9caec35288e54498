//! Integration tests for ensemble training, prediction, persistence and merging.

use candle_core::Device;
use mhc_affinity::building_blocks::amino_acid::random_peptides;
use mhc_affinity::utils::stats::make_scores;
use mhc_affinity::{
    AffinityError, AffinityMeasurement, AffinityNetwork, AffinityPredictor, CalibrationOptions,
    Hyperparameters, PredictOptions, RayonExecutor, SequenceEncoder, SequentialExecutor,
    TrainingOptions,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::collections::BTreeMap;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quick_hyperparameters() -> Hyperparameters {
    let map = json!({
        "max_epochs": 5,
        "minibatch_size": 16,
        "random_negative_constant": 5,
        "patience": 2,
    });
    Hyperparameters::from_map(map.as_object().unwrap()).unwrap()
}

/// 9-mers where a hydrophobic residue at position 2 makes a strong binder.
fn synthetic_measurements(allele: &str, n: usize, seed: u64) -> Vec<AffinityMeasurement> {
    let mut rng = StdRng::seed_from_u64(seed);
    random_peptides(n, 9, None, &mut rng)
        .unwrap()
        .into_iter()
        .map(|peptide| {
            let affinity = if b"LMI".contains(&peptide.as_bytes()[1]) { 40.0 } else { 8000.0 };
            AffinityMeasurement::new(&peptide, allele, affinity)
        })
        .collect()
}

fn untrained_network(seed: u64) -> AffinityNetwork {
    let mut network = AffinityNetwork::new(quick_hyperparameters(), Device::Cpu);
    network.build(None, seed).unwrap();
    network
}

fn calibration_options() -> CalibrationOptions {
    CalibrationOptions {
        num_peptides_per_length: 200,
        num_quantiles: 100,
        seed: 11,
    }
}

const QUERY: [&str; 4] = ["SIINFEKL", "GILGFVFTL", "NLVPMVATV", "KLVALGINAVL"];

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[test]
fn fit_predict_calibrate_single_allele() {
    init_logging();
    let data = synthetic_measurements("A0201", 50, 1);
    let options = TrainingOptions {
        n_models: 1,
        min_measurements_per_allele: 10,
        ..Default::default()
    };

    let mut predictor = AffinityPredictor::new(Device::Cpu);
    let names = predictor
        .fit_allele_specific(&data, &quick_hyperparameters(), &options, &SequentialExecutor)
        .unwrap();
    assert_eq!(names.len(), 1);
    assert_eq!(predictor.supported_alleles(), vec!["HLA-A0201".to_string()]);

    let prediction = predictor
        .predict(&["SIINFEKL"], &["A0201"], &PredictOptions::default())
        .unwrap();
    assert_eq!(prediction.len(), 1);
    assert!(prediction[0].is_finite() && prediction[0] > 0.0);

    predictor
        .calibrate_percentile_ranks(None, &calibration_options())
        .unwrap();
    let table = predictor
        .predict_to_table(
            &["SIINFEKL"],
            &["A0201"],
            &PredictOptions {
                include_percentile_ranks: true,
                include_individual_model_predictions: true,
                ..Default::default()
            },
        )
        .unwrap();
    let row = &table.rows()[0];
    let rank = row.prediction_percentile.unwrap();
    assert!((0.0..=100.0).contains(&rank));
    assert_eq!(row.individual.as_ref().unwrap().len(), 1);
    assert_eq!(row.allele, "HLA-A0201");
}

#[test]
fn alleles_below_threshold_are_not_trained() {
    init_logging();
    let mut data = synthetic_measurements("A0201", 20, 2);
    data.extend(synthetic_measurements("B0702", 5, 3));
    let options = TrainingOptions {
        n_models: 2,
        min_measurements_per_allele: 10,
        ..Default::default()
    };
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    predictor
        .fit_allele_specific(&data, &quick_hyperparameters(), &options, &RayonExecutor::default())
        .unwrap();
    assert_eq!(predictor.num_models(), 2);
    assert_eq!(predictor.ensemble("HLA-A*02:01").unwrap().len(), 2);
    assert!(predictor.ensemble("B0702").is_none());

    let err = predictor
        .predict(&["SIINFEKL"], &["B0702"], &PredictOptions::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AffinityError>(),
        Some(AffinityError::UnsupportedAllele(_))
    ));
}

#[test]
fn bad_residues_in_training_data_fail_the_fit() {
    init_logging();
    let mut data = synthetic_measurements("A0201", 20, 2);
    data.push(AffinityMeasurement::new("SIINFEKLB", "A0201", 100.0));
    let options = TrainingOptions {
        n_models: 2,
        min_measurements_per_allele: 10,
        ..Default::default()
    };
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    let err = predictor
        .fit_allele_specific(&data, &quick_hyperparameters(), &options, &SequentialExecutor)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AffinityError>(),
        Some(AffinityError::Encoding(_))
    ));
    assert_eq!(predictor.num_models(), 0);
}

#[test]
fn trained_ensemble_ranks_binders_above_non_binders() {
    init_logging();
    let data = synthetic_measurements("A0201", 300, 4);
    let map = json!({
        "max_epochs": 100,
        "minibatch_size": 32,
        "learning_rate": 0.005,
        "random_negative_constant": 0,
        "patience": 20,
    });
    let hyperparameters = Hyperparameters::from_map(map.as_object().unwrap()).unwrap();
    let options = TrainingOptions {
        min_measurements_per_allele: 10,
        seed: 5,
        ..Default::default()
    };
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    predictor
        .fit_allele_specific(&data, &hyperparameters, &options, &SequentialExecutor)
        .unwrap();

    let test = synthetic_measurements("A0201", 200, 99);
    let peptides: Vec<&str> = test.iter().map(|m| m.peptide.as_str()).collect();
    let alleles = vec!["A0201"; peptides.len()];
    let predicted = predictor
        .predict(&peptides, &alleles, &PredictOptions::default())
        .unwrap();
    let truth: Vec<f64> = test.iter().map(|m| m.measurement_value).collect();
    let scores = make_scores(&truth, &predicted);
    assert!(scores.auc.unwrap() > 0.7, "auc {:?}", scores.auc);
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[test]
fn ensemble_of_identical_copies_matches_single_model() {
    let network = untrained_network(21);
    let encoder = SequenceEncoder::create(&QUERY).unwrap();
    let single = network.predict(&encoder, None).unwrap();

    let mut predictor = AffinityPredictor::new(Device::Cpu);
    for _ in 0..3 {
        predictor.add_network("A0201", network.try_clone().unwrap()).unwrap();
    }
    let alleles = vec!["HLA-A0201"; QUERY.len()];
    let ensemble = predictor
        .predict(&QUERY, &alleles, &PredictOptions::default())
        .unwrap();
    for (a, b) in single.iter().zip(&ensemble) {
        assert!((a - b).abs() / a < 1e-9, "{} vs {}", a, b);
    }
}

#[test]
fn merge_yields_geometric_mean_of_members() {
    let mut first = AffinityPredictor::new(Device::Cpu);
    first.add_network("A0201", untrained_network(1)).unwrap();
    let mut second = AffinityPredictor::new(Device::Cpu);
    second.add_network("A0201", untrained_network(2)).unwrap();

    let alleles = vec!["A0201"; QUERY.len()];
    let options = PredictOptions::default();
    let a = first.predict(&QUERY, &alleles, &options).unwrap();
    let b = second.predict(&QUERY, &alleles, &options).unwrap();

    let merged = AffinityPredictor::merge(vec![first, second]).unwrap();
    assert_eq!(merged.num_models(), 2);
    let members = merged.ensemble("A0201").unwrap();
    assert_eq!(members[0].row.member_index, 0);
    assert_eq!(members[1].row.member_index, 1);
    for (i, member) in members.iter().enumerate() {
        assert!(member.row.model_name.starts_with(&format!("HLA-A0201-{}-", i)));
        assert_eq!(member.row.config_file, format!("{}.json", member.row.model_name));
    }

    let combined = merged.predict(&QUERY, &alleles, &options).unwrap();
    for i in 0..QUERY.len() {
        let expected = (a[i] * b[i]).sqrt();
        assert!((combined[i] - expected).abs() / expected < 1e-9);
    }
}

#[test]
fn merge_drops_calibration_of_changed_ensembles() {
    let mut first = AffinityPredictor::new(Device::Cpu);
    first.add_network("A0201", untrained_network(1)).unwrap();
    first.add_network("B0702", untrained_network(3)).unwrap();
    first
        .calibrate_percentile_ranks(None, &calibration_options())
        .unwrap();
    let mut second = AffinityPredictor::new(Device::Cpu);
    second.add_network("A0201", untrained_network(2)).unwrap();

    let merged = AffinityPredictor::merge(vec![first, second]).unwrap();
    assert!(merged.calibrator("A0201").is_none());
    assert!(merged.calibrator("B0702").is_some());
}

#[test]
fn output_order_and_no_throw_sentinels() {
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    predictor.add_network("A0201", untrained_network(8)).unwrap();
    predictor.add_network("B0702", untrained_network(9)).unwrap();

    let peptides = ["SIINFEKL", "GILGFVFTL", "SIINFEKL", "AAAAAAAAAAAAAAAAAAAA", "NLVPMVATV"];
    let alleles = ["A0201", "B0702", "C0702", "A0201", "A0201"];

    let err = predictor
        .predict(&peptides, &alleles, &PredictOptions::default())
        .unwrap_err();
    assert!(err.downcast_ref::<AffinityError>().unwrap().is_coverage_error());

    let table = predictor
        .predict_to_table(
            &peptides,
            &alleles,
            &PredictOptions {
                no_throw: true,
                ..Default::default()
            },
        )
        .unwrap();
    let predictions = table.predictions();
    assert!(predictions[0].is_finite());
    assert!(predictions[1].is_finite());
    assert!(predictions[2].is_nan());
    assert!(predictions[3].is_nan());
    assert!(predictions[4].is_finite());
    for (row, peptide) in table.rows().iter().zip(peptides) {
        assert_eq!(row.peptide, peptide);
    }

    let alone = predictor
        .predict(&["GILGFVFTL"], &["B0702"], &PredictOptions::default())
        .unwrap();
    assert_eq!(alone[0], predictions[1]);
}

#[test]
fn invalid_residues_raise_even_with_no_throw() {
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    predictor.add_network("A0201", untrained_network(8)).unwrap();
    let options = PredictOptions {
        no_throw: true,
        ..Default::default()
    };
    let err = predictor.predict(&["SIINFEKB"], &["A0201"], &options).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AffinityError>(),
        Some(AffinityError::Encoding(_))
    ));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn save_load_round_trip_reproduces_predictions() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let data = synthetic_measurements("A0201", 30, 6);
    let options = TrainingOptions {
        n_models: 2,
        min_measurements_per_allele: 10,
        ..Default::default()
    };
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    predictor
        .fit_allele_specific(&data, &quick_hyperparameters(), &options, &SequentialExecutor)
        .unwrap();
    predictor
        .calibrate_percentile_ranks(None, &calibration_options())
        .unwrap();
    predictor.save(dir.path(), None).unwrap();

    let loaded = AffinityPredictor::load(dir.path(), None, Device::Cpu).unwrap();
    assert_eq!(loaded.num_models(), 2);
    assert_eq!(loaded.model_names(), predictor.model_names());

    let alleles = vec!["A0201"; QUERY.len()];
    let options = PredictOptions {
        include_percentile_ranks: true,
        ..Default::default()
    };
    let before = predictor.predict_to_table(&QUERY, &alleles, &options).unwrap();
    let after = loaded.predict_to_table(&QUERY, &alleles, &options).unwrap();
    assert_eq!(before.predictions(), after.predictions());
    assert_eq!(before.percentiles(), after.percentiles());

    assert!(loaded.calibrator("A0201").is_some());

    let capped = AffinityPredictor::load(dir.path(), Some(1), Device::Cpu).unwrap();
    assert_eq!(capped.num_models(), 1);
    assert!(capped.calibrator("A0201").is_none());
}

#[test]
fn selective_save_writes_only_named_members() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    let keep = predictor.add_network("A0201", untrained_network(1)).unwrap();
    predictor.add_network("A0201", untrained_network(2)).unwrap();

    predictor.save(dir.path(), Some(&[keep.clone()])).unwrap();
    let manifest = std::fs::read_to_string(dir.path().join("manifest.csv")).unwrap();
    assert_eq!(manifest.lines().count(), 3);

    let weights: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".safetensors"))
        .collect();
    assert_eq!(weights, vec![format!("weights_{}.safetensors", keep)]);
}

#[test]
fn missing_weights_report_allele_and_member() {
    let dir = tempfile::tempdir().unwrap();
    let mut predictor = AffinityPredictor::new(Device::Cpu);
    predictor.add_network("A0201", untrained_network(1)).unwrap();
    let second = predictor.add_network("A0201", untrained_network(2)).unwrap();
    predictor.save(dir.path(), None).unwrap();
    std::fs::remove_file(dir.path().join(format!("weights_{}.safetensors", second))).unwrap();

    let err = AffinityPredictor::load(dir.path(), None, Device::Cpu)
        .err()
        .unwrap();
    match err.downcast_ref::<AffinityError>() {
        Some(AffinityError::CorruptArtifact {
            allele,
            member_index,
            ..
        }) => {
            assert_eq!(allele, "HLA-A0201");
            assert_eq!(*member_index, Some(1));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Pan-allele
// ---------------------------------------------------------------------------

#[test]
fn pan_allele_ensemble_covers_alleles_without_data() {
    init_logging();
    let pseudosequences: BTreeMap<String, String> = [
        ("HLA-A*02:01", "YFAMYGEKVAHTHVDTLYVRYHYYTWAVLAYTWY"),
        ("HLA-A*03:01", "YFAMYQENVAQTDVDTLYIIYRDYTWAELAYTWY"),
        ("HLA-B*07:02", "YYSEYRNIYAQTDESNLYLSYDYYTWAERAYEWY"),
    ]
    .into_iter()
    .map(|(allele, seq)| (allele.to_string(), seq.to_string()))
    .collect();

    let mut data = synthetic_measurements("A0201", 20, 7);
    data.extend(synthetic_measurements("A0301", 20, 8));

    let mut predictor = AffinityPredictor::new(Device::Cpu).with_pseudosequences(pseudosequences);
    let options = TrainingOptions {
        n_models: 1,
        ..Default::default()
    };
    predictor
        .fit_pan_allele(&data, &quick_hyperparameters(), &options, &SequentialExecutor)
        .unwrap();
    assert_eq!(predictor.pan_allele_ensemble().len(), 1);
    assert!(predictor.supported_alleles().contains(&"HLA-B0702".to_string()));

    let predictions = predictor
        .predict(&["SIINFEKL", "SIINFEKL"], &["B0702", "A0201"], &PredictOptions::default())
        .unwrap();
    assert!(predictions.iter().all(|p| p.is_finite()));

    let dir = tempfile::tempdir().unwrap();
    predictor.save(dir.path(), None).unwrap();
    let loaded = AffinityPredictor::load(dir.path(), None, Device::Cpu).unwrap();
    assert_eq!(loaded.pseudosequences().len(), 3);
    let reloaded = loaded
        .predict(&["SIINFEKL", "SIINFEKL"], &["B0702", "A0201"], &PredictOptions::default())
        .unwrap();
    assert_eq!(predictions, reloaded);
}
