//! Weight checkpoint save/load behaviour.
//!
//! These tests verify:
//! - Exact round trip of every weight parameter
//! - Shape mismatches abort the whole load and name every offender
//! - Missing parameters are tolerated and reported
//! - Unknown ids and unknown paths are ignored
//! - Diverged (non-finite) weights survive a save/load cycle

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use pcx::checkpoint::{load_weights, save_weights, StoredTensor, ID_TO_NAME_FILE, WEIGHTS_FILE};
use pcx::core::TanhActivation;
use pcx::{zeros_init, PCNError, PcGraph};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn graph(dims: Vec<usize>, prior: bool, seed: u64) -> PcGraph {
    let mut rng = StdRng::seed_from_u64(seed);
    PcGraph::with_dims(dims, Box::new(TanhActivation), prior, zeros_init(), &mut rng)
        .expect("valid dims")
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pcx_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

#[test]
fn test_round_trip_is_exact() {
    let dir = scratch_dir("round_trip");
    let source = graph(vec![3, 5, 4], true, 1);
    save_weights(&source, &dir).expect("save");

    let mut target = graph(vec![3, 5, 4], true, 2);
    assert_ne!(target.layers(), source.layers());

    let report = load_weights(&mut target, &dir).expect("load");
    assert_eq!(report.loaded.len(), 6);
    assert!(report.missing.is_empty());
    assert!(report.ignored.is_empty());
    report.require_complete().unwrap();

    assert_eq!(target.layers(), source.layers());
    assert_eq!(target.prior(), source.prior());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_shape_mismatch_aborts_everything() {
    let dir = scratch_dir("mismatch");
    save_weights(&graph(vec![2, 3, 4], false, 1), &dir).expect("save");

    let mut target = graph(vec![2, 5, 4], false, 2);
    let before = target.layers().to_vec();

    match load_weights(&mut target, &dir) {
        Err(PCNError::ShapeMismatch(mismatches)) => {
            let names: Vec<&str> = mismatches.iter().map(|m| m.name.as_str()).collect();
            assert_eq!(
                names,
                vec!["fc_layers[0].bias", "fc_layers[0].weight", "fc_layers[1].weight"]
            );
            let w0 = &mismatches[1];
            assert_eq!(w0.expected, vec![5, 2]);
            assert_eq!(w0.found, vec![3, 2]);
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
    // fc_layers[1].bias matched but must not have been written
    assert_eq!(target.layers(), before.as_slice());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_missing_parameters_are_tolerated() {
    let dir = scratch_dir("missing");
    let source = graph(vec![2, 3], false, 1);
    save_weights(&source, &dir).expect("save");

    let mut target = graph(vec![2, 3], true, 2);
    let prior_before = target.prior().cloned();

    let report = load_weights(&mut target, &dir).expect("load");
    let missing: Vec<&str> = report.missing.iter().map(String::as_str).collect();
    assert_eq!(missing, vec!["prior_layer.bias", "prior_layer.weight"]);
    assert_eq!(target.layers(), source.layers());
    assert_eq!(target.prior().cloned(), prior_before);

    assert!(matches!(
        report.require_complete(),
        Err(PCNError::MissingParameters(p)) if p.len() == 2
    ));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_unknown_entries_are_ignored() {
    let dir = scratch_dir("ignored");
    let source = graph(vec![2, 3], true, 1);
    save_weights(&source, &dir).expect("save");

    // an archive id with no name
    let weights_path = dir.join(WEIGHTS_FILE);
    let mut tensors: BTreeMap<String, StoredTensor> =
        serde_json::from_str(&fs::read_to_string(&weights_path).unwrap()).unwrap();
    tensors.insert(
        "orphan".to_string(),
        StoredTensor {
            shape: vec![1],
            data: vec![9.0],
        },
    );
    fs::write(&weights_path, serde_json::to_string(&tensors).unwrap()).unwrap();

    let mut target = graph(vec![2, 3], false, 2);
    let report = load_weights(&mut target, &dir).expect("load");

    assert!(report.ignored.contains(&"orphan".to_string()));
    assert!(report.ignored.contains(&"prior_layer.weight".to_string()));
    assert!(report.ignored.contains(&"prior_layer.bias".to_string()));
    assert!(report.missing.is_empty());
    assert_eq!(target.layers(), source.layers());

    let names: BTreeMap<String, String> =
        serde_json::from_str(&fs::read_to_string(dir.join(ID_TO_NAME_FILE)).unwrap()).unwrap();
    assert_eq!(names.len(), 4);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_resave_uses_fresh_ids() {
    let dir_a = scratch_dir("ids_a");
    let dir_b = scratch_dir("ids_b");
    let source = graph(vec![2, 2], false, 1);
    save_weights(&source, &dir_a).unwrap();
    save_weights(&source, &dir_b).unwrap();

    let read = |dir: &PathBuf| -> BTreeMap<String, String> {
        serde_json::from_str(&fs::read_to_string(dir.join(ID_TO_NAME_FILE)).unwrap()).unwrap()
    };
    let a = read(&dir_a);
    let b = read(&dir_b);
    assert!(a.keys().all(|id| !b.contains_key(id)));
    let mut paths_a: Vec<_> = a.values().collect();
    let mut paths_b: Vec<_> = b.values().collect();
    paths_a.sort();
    paths_b.sort();
    assert_eq!(paths_a, paths_b);

    let _ = fs::remove_dir_all(&dir_a);
    let _ = fs::remove_dir_all(&dir_b);
}

#[test]
fn test_non_finite_weights_round_trip() {
    let dir = scratch_dir("non_finite");
    let mut source = graph(vec![2, 3], false, 1);
    source.layers_mut()[0].weights[[0, 0]] = f32::NAN;
    source.layers_mut()[0].bias[0] = f32::INFINITY;
    source.layers_mut()[0].bias[1] = f32::NEG_INFINITY;
    save_weights(&source, &dir).expect("save");

    let text = fs::read_to_string(dir.join(WEIGHTS_FILE)).unwrap();
    assert!(!text.contains("null"));

    let mut target = graph(vec![2, 3], false, 2);
    let report = load_weights(&mut target, &dir).expect("load");
    assert!(report.is_complete());

    let layer = &target.layers()[0];
    assert!(layer.weights[[0, 0]].is_nan());
    assert_eq!(layer.bias[0], f32::INFINITY);
    assert_eq!(layer.bias[1], f32::NEG_INFINITY);
    assert_eq!(layer.bias[2], source.layers()[0].bias[2]);
    assert_eq!(layer.weights[[1, 1]], source.layers()[0].weights[[1, 1]]);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_unknown_scalar_text_is_rejected() {
    let dir = scratch_dir("bad_scalar");
    save_weights(&graph(vec![2, 2], false, 1), &dir).expect("save");

    let weights_path = dir.join(WEIGHTS_FILE);
    let mut raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&fs::read_to_string(&weights_path).unwrap()).unwrap();
    for tensor in raw.values_mut() {
        tensor["data"][0] = serde_json::Value::from("1.5");
    }
    fs::write(&weights_path, serde_json::to_string(&raw).unwrap()).unwrap();

    let mut target = graph(vec![2, 2], false, 2);
    assert!(matches!(
        load_weights(&mut target, &dir),
        Err(PCNError::Json(_))
    ));

    let _ = fs::remove_dir_all(&dir);
}
