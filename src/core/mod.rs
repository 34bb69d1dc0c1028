//! Core predictive-coding graph.
//!
//! This module provides the state-bearing structures and their energy:
//! - [`Node`]: latent activation `x` plus the cached prediction `u`
//! - [`Layer`]: affine map between consecutive nodes
//! - [`PcGraph`]: the ordered node/layer chain with forward, energy and gradients
//! - [`ParamKey`] / [`ParamRegistry`]: the explicit x/w parameter partition
//!
//! ## Energy
//!
//! ```text
//! E = (1/2) * Σ_i ||u_i - x_i||²
//!
//! where u_i = f(W_i x_{i-1} + b_i)   (f = identity on the last layer)
//! ```
//!
//! Relaxation lowers `E` by moving the free activations `x`; learning lowers it
//! by moving the weights `W`, `b`.

mod graph;
mod layer;
mod node;
mod params;

pub use graph::{uniform_init, zeros_init, EntrySource, ModelParams, PcGraph, StateInitFn};
pub use layer::Layer;
pub use node::Node;
pub use params::{Gradients, Group, Kind, ParamKey, ParamRegistry, Partition};

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::utils;

/// A single tensor whose shape disagrees with what the graph expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Structural path or description of the offending tensor.
    pub name: String,
    /// Shape the live graph requires.
    pub expected: Vec<usize>,
    /// Shape that was supplied.
    pub found: Vec<usize>,
}

impl Mismatch {
    pub fn new(name: impl Into<String>, expected: &[usize], found: &[usize]) -> Self {
        Self {
            name: name.into(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

fn describe_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(|m| format!("{} expected {:?}, found {:?}", m.name, m.expected, m.found))
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_names(names: &[String]) -> String {
    names.join(", ")
}

/// Error type for PC graph, optimizer and checkpoint operations.
#[derive(Debug, Error)]
pub enum PCNError {
    /// Energy or prediction read before a forward pass populated the cache
    #[error("state not ready: {0}")]
    StateNotReady(String),
    /// The entry node never received an initial value
    #[error("uninitialized state: {0}")]
    UninitializedState(String),
    /// One or more tensors disagree with the live shapes
    #[error("shape mismatch: {}", describe_mismatches(.0))]
    ShapeMismatch(Vec<Mismatch>),
    /// Live weight parameters absent from a checkpoint
    #[error("missing parameters: {}", join_names(.0))]
    MissingParameters(Vec<String>),
    /// Training mode other than `pc` or `ppc`
    #[error("invalid mode: {0:?} (expected \"pc\" or \"ppc\")")]
    InvalidMode(String),
    /// Invalid network or optimizer configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// An optimizer tried to write a parameter it does not own
    #[error("parameter {path} is not in the {expected:?} partition")]
    WrongPartition { path: String, expected: Partition },
    /// Checkpoint files are readable but internally inconsistent
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type PCNResult<T> = Result<T, PCNError>;

impl PCNError {
    /// Shorthand for a single-tensor [`PCNError::ShapeMismatch`].
    pub fn shape(name: impl Into<String>, expected: &[usize], found: &[usize]) -> Self {
        PCNError::ShapeMismatch(vec![Mismatch::new(name, expected, found)])
    }
}

/// Activation function trait for layer nonlinearities.
///
/// Implementations provide both the activation and its derivative; the
/// derivative is evaluated at the pre-activation drive.
pub trait Activation: Send + Sync {
    /// Apply activation function: f(x)
    fn apply(&self, x: &Array1<f32>) -> Array1<f32>;

    /// Apply activation to a matrix (elementwise): f(X)
    fn apply_matrix(&self, x: &Array2<f32>) -> Array2<f32>;

    /// Derivative of activation: f'(x)
    fn derivative(&self, x: &Array1<f32>) -> Array1<f32>;

    /// Name used in configuration files
    fn name(&self) -> &'static str;
}

macro_rules! scalar_activation {
    ($(#[$meta:meta])* $ty:ident, $name:literal, $f:path, $df:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $ty;

        impl Activation for $ty {
            fn apply(&self, x: &Array1<f32>) -> Array1<f32> {
                x.mapv($f)
            }

            fn apply_matrix(&self, x: &Array2<f32>) -> Array2<f32> {
                x.mapv($f)
            }

            fn derivative(&self, x: &Array1<f32>) -> Array1<f32> {
                x.mapv($df)
            }

            fn name(&self) -> &'static str {
                $name
            }
        }
    };
}

scalar_activation!(
    /// Identity activation: f(x) = x, f'(x) = 1
    IdentityActivation,
    "identity",
    utils::identity,
    utils::d_identity
);

scalar_activation!(
    /// Tanh activation: f(x) = tanh(x), f'(x) = 1 - tanh²(x)
    TanhActivation,
    "tanh",
    utils::tanh,
    utils::d_tanh
);

scalar_activation!(
    /// ReLU activation: f(x) = max(x, 0)
    ReluActivation,
    "relu",
    utils::relu,
    utils::d_relu
);

scalar_activation!(
    /// Logistic sigmoid: f(x) = 1 / (1 + e^-x)
    SigmoidActivation,
    "sigmoid",
    utils::sigmoid,
    utils::d_sigmoid
);

scalar_activation!(
    /// GELU with the tanh approximation.
    GeluActivation,
    "gelu",
    utils::gelu,
    utils::d_gelu
);

/// Reconstruct an activation function from its name.
pub fn activation_from_name(name: &str) -> PCNResult<Box<dyn Activation>> {
    match name {
        "identity" => Ok(Box::new(IdentityActivation)),
        "tanh" => Ok(Box::new(TanhActivation)),
        "relu" => Ok(Box::new(ReluActivation)),
        "sigmoid" => Ok(Box::new(SigmoidActivation)),
        "gelu" => Ok(Box::new(GeluActivation)),
        _ => Err(PCNError::InvalidConfig(format!(
            "unknown activation function: {name}"
        ))),
    }
}
