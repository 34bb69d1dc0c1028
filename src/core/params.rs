//! Explicit parameter registry and the x/w partition.
//!
//! Every tunable tensor in a [`PcGraph`](super::PcGraph) is addressed by a
//! [`ParamKey`] assigned at construction. The key's kind fixes its
//! [`Partition`]: node activations are x-parameters, layer weights and biases
//! are w-parameters.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::{PCNError, PCNResult};
use crate::utils;

/// The two disjoint groups of tunable tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Latent node activations (relaxed by the x optimizer)
    X,
    /// Layer weights and biases (learned by the w optimizer)
    W,
}

/// Which structural group a parameter lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Group {
    PriorLayer,
    FcLayer,
    PcNode,
}

/// Which tensor of its owner a parameter is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Weight,
    Bias,
    Activation,
}

/// Stable `(group, index, kind)` address of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamKey {
    pub group: Group,
    pub index: usize,
    pub kind: Kind,
}

impl ParamKey {
    pub fn prior_weight() -> Self {
        Self {
            group: Group::PriorLayer,
            index: 0,
            kind: Kind::Weight,
        }
    }

    pub fn prior_bias() -> Self {
        Self {
            group: Group::PriorLayer,
            index: 0,
            kind: Kind::Bias,
        }
    }

    pub fn layer_weight(index: usize) -> Self {
        Self {
            group: Group::FcLayer,
            index,
            kind: Kind::Weight,
        }
    }

    pub fn layer_bias(index: usize) -> Self {
        Self {
            group: Group::FcLayer,
            index,
            kind: Kind::Bias,
        }
    }

    pub fn node(index: usize) -> Self {
        Self {
            group: Group::PcNode,
            index,
            kind: Kind::Activation,
        }
    }

    /// Partition implied by the key's kind.
    pub fn partition(&self) -> Partition {
        match self.kind {
            Kind::Activation => Partition::X,
            Kind::Weight | Kind::Bias => Partition::W,
        }
    }

    /// Whether group and kind describe a tensor that can exist.
    fn is_well_formed(&self) -> bool {
        match self.group {
            Group::PcNode => self.kind == Kind::Activation,
            Group::PriorLayer => self.index == 0 && self.kind != Kind::Activation,
            Group::FcLayer => self.kind != Kind::Activation,
        }
    }

    /// Dotted structural path, e.g. `fc_layers[1].weight`.
    pub fn path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::Weight => "weight",
            Kind::Bias => "bias",
            Kind::Activation => "x",
        };
        match self.group {
            Group::PriorLayer => write!(f, "prior_layer.{kind}"),
            Group::FcLayer => write!(f, "fc_layers[{}].{kind}", self.index),
            Group::PcNode => write!(f, "pc_nodes[{}].{kind}", self.index),
        }
    }
}

/// Registration-time record of every tunable parameter and its partition.
#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    entries: Vec<(ParamKey, Partition)>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under an explicit partition.
    ///
    /// # Errors
    /// `InvalidConfig` if the key is malformed, already registered, or its kind
    /// belongs to the other partition.
    pub fn register(&mut self, key: ParamKey, partition: Partition) -> PCNResult<()> {
        if !key.is_well_formed() {
            return Err(PCNError::InvalidConfig(format!("malformed parameter key {key:?}")));
        }
        if key.partition() != partition {
            return Err(PCNError::InvalidConfig(format!(
                "{key} cannot be registered as {partition:?}"
            )));
        }
        if self.contains(key) {
            return Err(PCNError::InvalidConfig(format!("{key} registered twice")));
        }
        self.entries.push((key, partition));
        Ok(())
    }

    pub fn contains(&self, key: ParamKey) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    pub fn partition_of(&self, key: ParamKey) -> Option<Partition> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, p)| *p)
    }

    /// Keys of one partition, in registration order.
    pub fn keys(&self, partition: Partition) -> impl Iterator<Item = ParamKey> + '_ {
        self.entries
            .iter()
            .filter(move |(_, p)| *p == partition)
            .map(|(k, _)| *k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, Partition)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-parameter gradients (or optimizer updates) keyed by [`ParamKey`].
///
/// A key that was not differentiated is absent; absence is not the same as a
/// zero gradient.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    entries: BTreeMap<ParamKey, ArrayD<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ParamKey, value: ArrayD<f32>) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: ParamKey) -> Option<&ArrayD<f32>> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: ParamKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = ParamKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamKey, &ArrayD<f32>)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamKey, &mut ArrayD<f32>)> {
        self.entries.iter_mut().map(|(k, v)| (*k, v))
    }

    /// Copy of the entries belonging to one partition.
    pub fn restrict(&self, partition: Partition) -> Gradients {
        Gradients {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| k.partition() == partition)
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }

    /// Sum of absolute gradient values of one parameter, `None` if absent.
    pub fn abs_sum(&self, key: ParamKey) -> Option<f32> {
        self.get(key).map(utils::abs_sum)
    }

    /// Sum of absolute values over every present gradient.
    pub fn total_abs_sum(&self) -> f32 {
        self.entries.values().map(utils::abs_sum).sum()
    }
}
