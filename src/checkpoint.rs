//! Weight checkpoint save/load.
//!
//! A checkpoint directory holds two JSON files:
//! - `w_params.json`: `{id: {shape, data}}`, one entry per weight parameter
//! - `w_params_id_to_name.json`: `{id: structural_path}`
//!
//! Ids are fresh UUID v4 strings on every save; structural paths
//! (`fc_layers[1].weight`, `prior_layer.bias`, ...) are what ties a stored
//! tensor to a live parameter. Latent states are never saved.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use log::{info, warn};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Mismatch, PCNError, PCNResult, ParamKey, Partition, PcGraph};

pub const WEIGHTS_FILE: &str = "w_params.json";
pub const ID_TO_NAME_FILE: &str = "w_params_id_to_name.json";

/// A tensor as stored in the archive, data in row-major order.
///
/// Finite values are JSON numbers; `NaN`, `inf` and `-inf` are stored as
/// strings, since JSON has no literal for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    #[serde(with = "scalars")]
    pub data: Vec<f32>,
}

mod scalars {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Number(f32),
        Special(String),
    }

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|&v| {
            if v.is_finite() {
                Scalar::Number(v)
            } else {
                Scalar::Special(v.to_string())
            }
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        Vec::<Scalar>::deserialize(deserializer)?
            .into_iter()
            .map(|s| match s {
                Scalar::Number(v) => Ok(v),
                Scalar::Special(text) => match text.parse::<f32>() {
                    Ok(v) if !v.is_finite() => Ok(v),
                    _ => Err(D::Error::custom(format!(
                        "expected a number, \"NaN\", \"inf\" or \"-inf\", got {text:?}"
                    ))),
                },
            })
            .collect()
    }
}

/// What [`load_weights`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Paths overwritten from the checkpoint
    pub loaded: BTreeSet<String>,
    /// Model weight paths the checkpoint did not provide (left as they were)
    pub missing: BTreeSet<String>,
    /// Archive ids without a name, and names the model does not have
    pub ignored: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// # Errors
    /// `MissingParameters` listing every missing path.
    pub fn require_complete(&self) -> PCNResult<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(PCNError::MissingParameters(
                self.missing.iter().cloned().collect(),
            ))
        }
    }
}

/// Save every weight parameter of `graph` into `dir`, creating it if needed.
///
/// # Errors
/// `Io`/`Json` if the files cannot be written.
pub fn save_weights(graph: &PcGraph, dir: &Path) -> PCNResult<()> {
    fs::create_dir_all(dir)?;

    let mut tensors = BTreeMap::new();
    let mut names = BTreeMap::new();
    for key in graph.registry().keys(Partition::W) {
        let value = graph
            .param(key)
            .ok_or_else(|| PCNError::InvalidCheckpoint(format!("{key} has no value")))?;
        let id = Uuid::new_v4().to_string();
        tensors.insert(
            id.clone(),
            StoredTensor {
                shape: value.shape().to_vec(),
                data: value.iter().copied().collect(),
            },
        );
        names.insert(id, key.path());
    }

    fs::write(dir.join(WEIGHTS_FILE), serde_json::to_string(&tensors)?)?;
    fs::write(
        dir.join(ID_TO_NAME_FILE),
        serde_json::to_string_pretty(&names)?,
    )?;
    info!("saved {} weight tensors to {}", names.len(), dir.display());
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> PCNResult<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Load weights saved by [`save_weights`] into `graph`.
///
/// Archive ids without a name and names the model does not have are ignored.
/// Every shape is checked before anything is written: if any stored tensor
/// disagrees with its live parameter, nothing is modified and the error lists
/// every offender. Model parameters absent from the checkpoint are reported
/// in [`LoadReport::missing`] and keep their current values.
///
/// # Errors
/// - `ShapeMismatch` with one entry per mismatched parameter
/// - `InvalidCheckpoint` if a tensor's data does not fill its shape or two
///   ids name the same parameter
/// - `Io`/`Json` if the files cannot be read
pub fn load_weights(graph: &mut PcGraph, dir: &Path) -> PCNResult<LoadReport> {
    let tensors: BTreeMap<String, StoredTensor> = read_json(&dir.join(WEIGHTS_FILE))?;
    let names: BTreeMap<String, String> = read_json(&dir.join(ID_TO_NAME_FILE))?;

    let live: BTreeMap<String, ParamKey> = graph
        .registry()
        .keys(Partition::W)
        .map(|key| (key.path(), key))
        .collect();

    let mut report = LoadReport::default();
    let mut staged: Vec<(ParamKey, ArrayD<f32>)> = Vec::new();
    let mut mismatches = Vec::new();

    for (id, tensor) in &tensors {
        let Some(path) = names.get(id) else {
            report.ignored.push(id.clone());
            continue;
        };
        let Some(&key) = live.get(path) else {
            report.ignored.push(path.clone());
            continue;
        };
        if !report.loaded.insert(path.clone()) {
            return Err(PCNError::InvalidCheckpoint(format!(
                "{path} is stored more than once"
            )));
        }

        let expected = graph
            .param(key)
            .map(|p| p.shape().to_vec())
            .unwrap_or_default();
        if tensor.shape != expected {
            mismatches.push(Mismatch::new(path.as_str(), &expected, &tensor.shape));
            continue;
        }
        let value = ArrayD::from_shape_vec(IxDyn(&tensor.shape), tensor.data.clone())
            .map_err(|e| PCNError::InvalidCheckpoint(format!("{path}: {e}")))?;
        staged.push((key, value));
    }

    if !mismatches.is_empty() {
        mismatches.sort_by(|a, b| a.name.cmp(&b.name));
        return Err(PCNError::ShapeMismatch(mismatches));
    }

    for (key, value) in &staged {
        if let Some(mut param) = graph.param_mut(*key) {
            param.assign(value);
        }
    }

    report.missing = live
        .keys()
        .filter(|path| !report.loaded.contains(*path))
        .cloned()
        .collect();
    if !report.missing.is_empty() {
        let missing: Vec<&str> = report.missing.iter().map(String::as_str).collect();
        warn!(
            "checkpoint {} is missing {} parameters: {}",
            dir.display(),
            missing.len(),
            missing.join(", ")
        );
    }
    info!(
        "loaded {} weight tensors from {}",
        report.loaded.len(),
        dir.display()
    );
    Ok(report)
}
