//! # pcx
//!
//! Predictive-coding training: relaxation of latent states followed by
//! weight learning, driven by two separately configured optimizers.
//!
//! ## Overview
//!
//! A layered generative model predicts each node from the one before it. For
//! every batch the latent activations (`x`) are relaxed toward a local minimum
//! of the prediction-error energy while the batch is clamped to the output
//! node; the weights (`w`) are then updated from the same energy, either once
//! after relaxation (`pc`) or at every relaxation step (`ppc`).
//!
//! ## Structure
//!
//! - [`core`] — Nodes, layers, the graph, energy and closed-form gradients
//! - [`batch`] — Per-example parallel map over the batch axis
//! - [`optim`] — Gradient transforms and the dual x/w optimizer
//! - [`training`] — Relaxation loop, training and test steps, step records
//! - [`checkpoint`] — Weight save/load
//! - [`data`] — Fixed-size batching, standardisation, train/eval split
//! - [`utils`] — Scalar activation kernels and statistics

pub mod batch;
pub mod checkpoint;
pub mod core;
pub mod data;
pub mod optim;
pub mod training;
pub mod utils;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use crate::core::{
    uniform_init, zeros_init, Activation, EntrySource, Gradients, Layer, ModelParams, Node,
    PCNError, PCNResult, ParamKey, Partition, PcGraph, StateInitFn,
};
pub use optim::{DualOptimizer, Optimizer, WarmupCosineSchedule};
pub use training::{
    internal_states, relax, test_on_batch, train_on_batch, BatchReport, Mode, StepRecord,
    StepSummary,
};

/// When the weights are updated relative to relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PcMode {
    /// One weight update after all relaxation steps
    #[default]
    Pc,
    /// A weight update at every relaxation step
    Ppc,
}

impl FromStr for PcMode {
    type Err = PCNError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pc" => Ok(PcMode::Pc),
            "ppc" => Ok(PcMode::Ppc),
            other => Err(PCNError::InvalidMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for PcMode {
    type Error = PCNError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PcMode> for String {
    fn from(mode: PcMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for PcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PcMode::Pc => "pc",
            PcMode::Ppc => "ppc",
        })
    }
}

/// Training configuration for relaxation and weight updates.
///
/// Learning rates are per batch; the optimizers divide them by the batch size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relaxation steps per training batch (`T`)
    pub relax_steps: usize,
    /// Test-time relaxation runs `relax_steps * convergence_multiplier` steps
    pub convergence_multiplier: usize,
    pub x_lr: f32,
    /// L2 penalty on the latent states
    pub x_weight_decay: f32,
    pub x_momentum: Option<f32>,
    pub w_lr: f32,
    /// Decoupled weight decay of the w optimizer
    pub w_weight_decay: f32,
    /// Learning-rate schedule of the w optimizer, counted in weight updates
    pub w_schedule: Option<WarmupCosineSchedule>,
    pub pc_mode: PcMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relax_steps: 20,
            convergence_multiplier: 2,
            x_lr: 0.1,
            x_weight_decay: 0.0,
            x_momentum: None,
            w_lr: 1e-3,
            w_weight_decay: 0.0,
            w_schedule: None,
            pc_mode: PcMode::Pc,
        }
    }
}

impl Config {
    /// Read a JSON config; absent fields take their defaults.
    ///
    /// # Errors
    /// `Io`/`Json` on unreadable input (an unknown `pc_mode` is reported
    /// through `Json`), `InvalidConfig` if validation fails.
    pub fn from_json_file(path: &Path) -> PCNResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of relaxation steps used by test-time convergence.
    pub fn convergence_steps(&self) -> usize {
        self.relax_steps.saturating_mul(self.convergence_multiplier)
    }

    /// # Errors
    /// `InvalidConfig` for a negative or non-finite rate, or a zero multiplier.
    pub fn validate(&self) -> PCNResult<()> {
        let rates = [
            ("x_lr", self.x_lr),
            ("x_weight_decay", self.x_weight_decay),
            ("w_lr", self.w_lr),
            ("w_weight_decay", self.w_weight_decay),
        ];
        for (name, value) in rates {
            if !value.is_finite() || value < 0.0 {
                return Err(PCNError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if let Some(m) = self.x_momentum {
            if !(0.0..1.0).contains(&m) {
                return Err(PCNError::InvalidConfig(format!(
                    "x_momentum must be in [0, 1), got {m}"
                )));
            }
        }
        if self.convergence_multiplier == 0 {
            return Err(PCNError::InvalidConfig(
                "convergence_multiplier must be at least 1".to_string(),
            ));
        }
        if let Some(schedule) = &self.w_schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}
