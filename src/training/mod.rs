//! Relaxation loop, training and test steps, and per-step records.
//!
//! Every batch is an episode: the node states are cleared, the batch is
//! clamped to the output node, and the latent states are relaxed for a fixed
//! number of steps. Training additionally updates the weights, either once
//! after relaxation ([`PcMode::Pc`]) or at every step ([`PcMode::Ppc`]).

use std::collections::BTreeMap;

use log::{debug, trace};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::core::{Gradients, PCNError, PCNResult, Partition, PcGraph};
use crate::optim::{DualOptimizer, Optimizer};
use crate::{utils, Config, PcMode};

/// Which partitions a step differentiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Latent states and weights
    Train,
    /// Latent states only
    Eval,
}

impl Mode {
    pub fn partitions(self) -> &'static [Partition] {
        match self {
            Mode::Train => &[Partition::X, Partition::W],
            Mode::Eval => &[Partition::X],
        }
    }
}

/// Energies and gradients observed at one relaxation step.
///
/// All fields come from the same forward pass.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub total_energy: f32,
    /// Energy per node, summed over the batch
    pub node_energies: Vec<f32>,
    pub gradients: Gradients,
}

impl StepRecord {
    /// Serialisable digest for metric sinks.
    pub fn summary(&self, t_step: usize) -> StepSummary {
        StepSummary {
            t_step,
            total_energy: self.total_energy,
            node_energies: self.node_energies.clone(),
            total_gradient: self.gradients.total_abs_sum(),
            gradients: self
                .gradients
                .iter()
                .map(|(key, g)| (key.path(), utils::abs_sum(g)))
                .collect(),
        }
    }
}

/// One line of the step metrics stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub t_step: usize,
    pub total_energy: f32,
    pub node_energies: Vec<f32>,
    /// Sum of absolute values over every gradient of the step
    pub total_gradient: f32,
    /// Structural path to the sum of absolute gradient values
    pub gradients: BTreeMap<String, f32>,
}

/// Outcome of [`train_on_batch`].
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// One record per relaxation step
    pub steps: Vec<StepRecord>,
    /// Energy after the last relaxation update
    pub final_energy: f32,
    /// Reconstruction error of the settled internal state
    pub mse: f32,
}

fn ensure_partition(optimizer: &Optimizer, expected: Partition) -> PCNResult<()> {
    if optimizer.partition() == expected {
        Ok(())
    } else {
        Err(PCNError::InvalidConfig(format!(
            "expected a {expected:?} optimizer, got {:?}",
            optimizer.partition()
        )))
    }
}

/// Start a new episode for `examples`.
///
/// Clears every node, resets the x optimizer's in-flight state and runs an
/// initialising forward pass with the batch clamped.
///
/// # Errors
/// `UninitializedState` if the entry node does not end up with one row per
/// example.
pub fn begin_episode(
    graph: &mut PcGraph,
    examples: &Array2<f32>,
    optim_x: &mut Optimizer,
) -> PCNResult<()> {
    ensure_partition(optim_x, Partition::X)?;
    graph.clear_nodes();
    optim_x.reset();
    graph.forward(Some(examples), None)?;
    match graph.internal_state() {
        Some(state) if state.nrows() == examples.nrows() => Ok(()),
        Some(state) => Err(PCNError::UninitializedState(format!(
            "internal state has {} rows for a batch of {}",
            state.nrows(),
            examples.nrows()
        ))),
        None => Err(PCNError::UninitializedState(
            "internal state was not initialised".to_string(),
        )),
    }
}

fn measure(graph: &mut PcGraph, examples: &Array2<f32>, mode: Mode) -> PCNResult<StepRecord> {
    graph.forward(Some(examples), None)?;
    let node_energies = graph.node_energies()?;
    let total_energy = node_energies.iter().sum();
    let gradients = graph.gradients(mode.partitions())?;
    Ok(StepRecord {
        total_energy,
        node_energies,
        gradients,
    })
}

/// Relax the latent states on `examples` for exactly `steps` steps.
///
/// Only the x partition is differentiated and updated. Returns the total
/// energy measured at each step, before that step's update.
///
/// # Errors
/// Propagates episode initialisation, forward and optimizer errors.
pub fn relax(
    graph: &mut PcGraph,
    examples: &Array2<f32>,
    steps: usize,
    optim_x: &mut Optimizer,
) -> PCNResult<Vec<f32>> {
    begin_episode(graph, examples, optim_x)?;
    let mut energies = Vec::with_capacity(steps);
    for t in 0..steps {
        let record = measure(graph, examples, Mode::Eval)?;
        trace!("relax step {t}: energy={:.6}", record.total_energy);
        optim_x.step(graph, &record.gradients)?;
        energies.push(record.total_energy);
    }
    Ok(energies)
}

/// Mean squared error between the feed-forward prediction of the current
/// internal state and `examples`.
///
/// # Errors
/// `UninitializedState` if no internal state is held.
pub fn reconstruction_mse(graph: &PcGraph, examples: &Array2<f32>) -> PCNResult<f32> {
    let predictions = graph.feed_forward_predict(None)?;
    Ok(utils::mse(&predictions, examples))
}

/// Relax on `examples` and update the weights.
///
/// `pc`: every step differentiates x and w (both recorded) but applies only
/// the x optimizer; one more forward and a w-only gradient pass then drive a
/// single w step. `ppc`: both optimizers consume each step's gradient.
///
/// # Errors
/// Propagates episode initialisation, forward and optimizer errors.
pub fn train_on_batch(
    graph: &mut PcGraph,
    examples: &Array2<f32>,
    optim: &mut DualOptimizer,
    config: &Config,
) -> PCNResult<BatchReport> {
    ensure_partition(&optim.w, Partition::W)?;
    begin_episode(graph, examples, &mut optim.x)?;

    let mut steps = Vec::with_capacity(config.relax_steps);
    for t in 0..config.relax_steps {
        let record = measure(graph, examples, Mode::Train)?;
        trace!(
            "train step {t}: energy={:.6} grad={:.6}",
            record.total_energy,
            record.gradients.total_abs_sum()
        );
        optim.x.step(graph, &record.gradients)?;
        if config.pc_mode == PcMode::Ppc {
            optim.w.step(graph, &record.gradients)?;
        }
        steps.push(record);
    }

    graph.forward(Some(examples), None)?;
    let final_energy = graph.energy()?;
    if config.pc_mode == PcMode::Pc {
        let grads = graph.gradients(&[Partition::W])?;
        optim.w.step(graph, &grads)?;
    }

    let mse = reconstruction_mse(graph, examples)?;
    debug!(
        "{} batch of {}: {} steps, final energy={:.6}, mse={:.6}",
        config.pc_mode,
        examples.nrows(),
        steps.len(),
        final_energy,
        mse
    );
    Ok(BatchReport {
        steps,
        final_energy,
        mse,
    })
}

/// Relax for `relax_steps * convergence_multiplier` steps and return the
/// reconstruction MSE. Weights are not touched.
///
/// # Errors
/// Propagates relaxation errors.
pub fn test_on_batch(
    graph: &mut PcGraph,
    examples: &Array2<f32>,
    optim_x: &mut Optimizer,
    config: &Config,
) -> PCNResult<f32> {
    relax(graph, examples, config.convergence_steps(), optim_x)?;
    let mse = reconstruction_mse(graph, examples)?;
    debug!("test batch of {}: mse={mse:.6}", examples.nrows());
    Ok(mse)
}

/// Settled internal states for `examples` after test-time relaxation.
///
/// # Errors
/// Propagates relaxation errors.
pub fn internal_states(
    graph: &mut PcGraph,
    examples: &Array2<f32>,
    optim_x: &mut Optimizer,
    config: &Config,
) -> PCNResult<Array2<f32>> {
    relax(graph, examples, config.convergence_steps(), optim_x)?;
    graph
        .internal_state()
        .cloned()
        .ok_or_else(|| PCNError::UninitializedState("internal state was cleared".to_string()))
}
