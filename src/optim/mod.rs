//! Composable gradient transforms and the dual x/w optimizer.
//!
//! A transform rewrites a [`Gradients`] map in place into parameter updates.
//! Transforms chain: the x optimizer is `add_decayed_weights -> sgd`, the w
//! optimizer is `adamw`, optionally followed by a warmup-cosine learning-rate
//! schedule. An [`Optimizer`] owns one chain and one partition and
//! is the only writer of that partition.

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::core::{Gradients, PCNError, PCNResult, ParamKey, Partition, PcGraph};
use crate::Config;

/// A stateful rewrite of gradients into updates.
pub trait GradientTransform: Send {
    /// Transform `updates` in place. `graph` gives read access to the
    /// current parameter values.
    fn update(&mut self, updates: &mut Gradients, graph: &PcGraph) -> PCNResult<()>;

    /// Drop any in-flight state (momentum traces, moment estimates).
    fn reset(&mut self);
}

/// Look up the current value of a parameter an update refers to.
fn current_param<'a>(graph: &'a PcGraph, key: ParamKey) -> PCNResult<ndarray::ArrayViewD<'a, f32>> {
    graph
        .param(key)
        .ok_or_else(|| PCNError::StateNotReady(format!("{key} has no value")))
}

/// Apply transforms left to right.
#[derive(Default)]
pub struct Chain {
    transforms: Vec<Box<dyn GradientTransform>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then(mut self, transform: impl GradientTransform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl GradientTransform for Chain {
    fn update(&mut self, updates: &mut Gradients, graph: &PcGraph) -> PCNResult<()> {
        for transform in &mut self.transforms {
            transform.update(updates, graph)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        for transform in &mut self.transforms {
            transform.reset();
        }
    }
}

/// L2 penalty: `g += weight_decay * param`.
#[derive(Debug, Clone, Copy)]
pub struct AddDecayedWeights {
    pub weight_decay: f32,
}

impl AddDecayedWeights {
    pub fn new(weight_decay: f32) -> Self {
        Self { weight_decay }
    }
}

impl GradientTransform for AddDecayedWeights {
    fn update(&mut self, updates: &mut Gradients, graph: &PcGraph) -> PCNResult<()> {
        if self.weight_decay == 0.0 {
            return Ok(());
        }
        for (key, g) in updates.iter_mut() {
            let param = current_param(graph, key)?;
            g.scaled_add(self.weight_decay, &param);
        }
        Ok(())
    }

    fn reset(&mut self) {}
}

/// Stochastic gradient descent with optional heavy-ball momentum.
///
/// ```text
/// v = g + momentum * v     (when momentum is set)
/// update = -lr * v
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f32,
    pub momentum: Option<f32>,
    trace: BTreeMap<ParamKey, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: Option<f32>) -> Self {
        Self {
            learning_rate,
            momentum,
            trace: BTreeMap::new(),
        }
    }
}

impl GradientTransform for Sgd {
    fn update(&mut self, updates: &mut Gradients, _graph: &PcGraph) -> PCNResult<()> {
        for (key, g) in updates.iter_mut() {
            if let Some(momentum) = self.momentum {
                let fresh = self
                    .trace
                    .get(&key)
                    .map_or(true, |v| v.shape() != g.shape());
                if fresh {
                    self.trace.insert(key, g.clone());
                } else if let Some(v) = self.trace.get_mut(&key) {
                    *v *= momentum;
                    *v += &*g;
                    g.assign(v);
                }
            }
            *g *= -self.learning_rate;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.trace.clear();
    }
}

/// Adam with decoupled weight decay.
///
/// ```text
/// m = b1 m + (1 - b1) g
/// v = b2 v + (1 - b2) g²
/// update = -lr * ( m̂ / (sqrt(v̂) + eps) + weight_decay * param )
/// ```
///
/// with bias-corrected `m̂ = m / (1 - b1^t)`, `v̂ = v / (1 - b2^t)`.
#[derive(Debug, Clone)]
pub struct AdamW {
    pub learning_rate: f32,
    pub b1: f32,
    pub b2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    count: i32,
    mu: BTreeMap<ParamKey, ArrayD<f32>>,
    nu: BTreeMap<ParamKey, ArrayD<f32>>,
}

impl AdamW {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            b1: 0.9,
            b2: 0.999,
            eps: 1e-8,
            weight_decay,
            count: 0,
            mu: BTreeMap::new(),
            nu: BTreeMap::new(),
        }
    }

    /// Number of updates applied since construction or the last reset.
    pub fn count(&self) -> i32 {
        self.count
    }
}

impl GradientTransform for AdamW {
    fn update(&mut self, updates: &mut Gradients, graph: &PcGraph) -> PCNResult<()> {
        self.count = self.count.saturating_add(1);
        let c1 = 1.0 - self.b1.powi(self.count);
        let c2 = 1.0 - self.b2.powi(self.count);
        let (b1, b2, eps) = (self.b1, self.b2, self.eps);

        for (key, g) in updates.iter_mut() {
            let mu = self
                .mu
                .entry(key)
                .or_insert_with(|| ArrayD::zeros(g.raw_dim()));
            if mu.shape() != g.shape() {
                *mu = ArrayD::zeros(g.raw_dim());
            }
            mu.zip_mut_with(g, |m, &gi| *m = b1 * *m + (1.0 - b1) * gi);

            let nu = self
                .nu
                .entry(key)
                .or_insert_with(|| ArrayD::zeros(g.raw_dim()));
            if nu.shape() != g.shape() {
                *nu = ArrayD::zeros(g.raw_dim());
            }
            nu.zip_mut_with(g, |v, &gi| *v = b2 * *v + (1.0 - b2) * gi * gi);

            ndarray::Zip::from(&mut *g)
                .and(&*mu)
                .and(&*nu)
                .for_each(|u, &m, &v| *u = (m / c1) / ((v / c2).sqrt() + eps));

            if self.weight_decay != 0.0 {
                let param = current_param(graph, key)?;
                g.scaled_add(self.weight_decay, &param);
            }
            *g *= -self.learning_rate;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.count = 0;
        self.mu.clear();
        self.nu.clear();
    }
}

/// Learning-rate multiplier: linear warmup, then cosine decay.
///
/// ```text
/// t < warmup:  init + (peak - init) * t / warmup
/// t >= warmup: peak * ((1 - a) * c^exponent + a),  a = end / peak
///              c = 0.5 * (1 + cos(pi * min(t - warmup, span) / span))
///              span = decay_steps - warmup_steps
/// ```
///
/// Values are relative to the optimizer's own learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupCosineSchedule {
    pub init_scale: f32,
    pub peak_scale: f32,
    pub end_scale: f32,
    pub warmup_steps: usize,
    /// Total schedule length, warmup included
    pub decay_steps: usize,
    #[serde(default = "unit_exponent")]
    pub exponent: f32,
}

fn unit_exponent() -> f32 {
    1.0
}

impl WarmupCosineSchedule {
    /// # Errors
    /// `InvalidConfig` for a non-finite or negative scale, or a warmup longer
    /// than the schedule.
    pub fn validate(&self) -> PCNResult<()> {
        let scales = [self.init_scale, self.peak_scale, self.end_scale, self.exponent];
        if scales.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(PCNError::InvalidConfig(format!(
                "schedule scales must be non-negative numbers, got {self:?}"
            )));
        }
        if self.warmup_steps > self.decay_steps {
            return Err(PCNError::InvalidConfig(format!(
                "warmup_steps ({}) exceeds decay_steps ({})",
                self.warmup_steps, self.decay_steps
            )));
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn value(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            let frac = step as f32 / self.warmup_steps as f32;
            return self.init_scale + (self.peak_scale - self.init_scale) * frac;
        }
        let span = self.decay_steps.saturating_sub(self.warmup_steps);
        if span == 0 || self.peak_scale == 0.0 {
            return self.end_scale;
        }
        let t = (step - self.warmup_steps).min(span) as f32 / span as f32;
        let cosine = 0.5 * (1.0 + (std::f32::consts::PI * t).cos());
        let alpha = self.end_scale / self.peak_scale;
        self.peak_scale * ((1.0 - alpha) * cosine.powf(self.exponent) + alpha)
    }
}

/// Multiply every update by a schedule evaluated at the step count.
#[derive(Debug, Clone)]
pub struct ScaleBySchedule {
    pub schedule: WarmupCosineSchedule,
    count: usize,
}

impl ScaleBySchedule {
    pub fn new(schedule: WarmupCosineSchedule) -> Self {
        Self { schedule, count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl GradientTransform for ScaleBySchedule {
    fn update(&mut self, updates: &mut Gradients, _graph: &PcGraph) -> PCNResult<()> {
        let scale = self.schedule.value(self.count);
        self.count = self.count.saturating_add(1);
        for (_, g) in updates.iter_mut() {
            *g *= scale;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// A transform chain bound to one partition.
pub struct Optimizer {
    partition: Partition,
    chain: Chain,
}

impl Optimizer {
    pub fn new(partition: Partition, chain: Chain) -> Self {
        Self { partition, chain }
    }

    /// `add_decayed_weights(x_weight_decay) -> sgd(x_lr / batch, x_momentum)`.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero batch size.
    pub fn x_from_config(config: &Config, batch_size: usize) -> PCNResult<Self> {
        let lr = per_example(config.x_lr, batch_size)?;
        let chain = Chain::new()
            .then(AddDecayedWeights::new(config.x_weight_decay))
            .then(Sgd::new(lr, config.x_momentum));
        Ok(Self::new(Partition::X, chain))
    }

    /// `adamw(w_lr / batch, w_weight_decay)`, followed by the learning-rate
    /// schedule when `w_schedule` is set.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero batch size.
    pub fn w_from_config(config: &Config, batch_size: usize) -> PCNResult<Self> {
        let lr = per_example(config.w_lr, batch_size)?;
        let mut chain = Chain::new().then(AdamW::new(lr, config.w_weight_decay));
        if let Some(schedule) = config.w_schedule {
            chain = chain.then(ScaleBySchedule::new(schedule));
        }
        Ok(Self::new(Partition::W, chain))
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Transform this partition's share of `grads` and write it into `graph`.
    ///
    /// Gradients of the other partition are ignored; parameters without a
    /// gradient are left untouched.
    ///
    /// # Errors
    /// Propagates transform and [`PcGraph::apply_updates`] errors.
    pub fn step(&mut self, graph: &mut PcGraph, grads: &Gradients) -> PCNResult<()> {
        let mut updates = grads.restrict(self.partition);
        if updates.is_empty() {
            return Ok(());
        }
        self.chain.update(&mut updates, graph)?;
        graph.apply_updates(self.partition, &updates)
    }

    pub fn reset(&mut self) {
        self.chain.reset();
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_example(lr: f32, batch_size: usize) -> PCNResult<f32> {
    if batch_size == 0 {
        return Err(PCNError::InvalidConfig("batch size must be positive".to_string()));
    }
    Ok(lr / batch_size as f32)
}

/// The pair of optimizers driving relaxation (x) and learning (w).
pub struct DualOptimizer {
    pub x: Optimizer,
    pub w: Optimizer,
}

impl DualOptimizer {
    /// # Errors
    /// `InvalidConfig` if the optimizers are bound to the wrong partitions.
    pub fn new(x: Optimizer, w: Optimizer) -> PCNResult<Self> {
        if x.partition() != Partition::X || w.partition() != Partition::W {
            return Err(PCNError::InvalidConfig(
                "dual optimizer needs an X optimizer and a W optimizer".to_string(),
            ));
        }
        Ok(Self { x, w })
    }

    /// Build both optimizers from the hyperparameters in `config`.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero batch size.
    pub fn from_config(config: &Config, batch_size: usize) -> PCNResult<Self> {
        Self::new(
            Optimizer::x_from_config(config, batch_size)?,
            Optimizer::w_from_config(config, batch_size)?,
        )
    }
}
