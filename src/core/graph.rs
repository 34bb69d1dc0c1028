use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    activation_from_name, Activation, Gradients, Group, Kind, Layer, Node, PCNError, PCNResult,
    ParamKey, ParamRegistry, Partition,
};
use crate::batch;

/// Produces one example's initial entry-node state: `(rng, internal_dim) -> x0`.
pub type StateInitFn = Box<dyn Fn(&mut StdRng, usize) -> Array1<f32> + Send + Sync>;

/// Entry-node initializer that starts every example at the origin.
pub fn zeros_init() -> StateInitFn {
    Box::new(|_, dim| Array1::zeros(dim))
}

/// Entry-node initializer drawing uniformly from `[-limit, limit]`.
///
/// A zero limit gives [`zeros_init`].
///
/// # Errors
/// `InvalidConfig` if `limit` is negative, NaN, or so large that the range
/// `2 * limit` is not finite.
pub fn uniform_init(limit: f32) -> PCNResult<StateInitFn> {
    if !(limit >= 0.0 && (2.0 * limit).is_finite()) {
        return Err(PCNError::InvalidConfig(format!(
            "initial state limit must be finite and non-negative, got {limit}"
        )));
    }
    if limit == 0.0 {
        return Ok(zeros_init());
    }
    let dist = Uniform::new_inclusive(-limit, limit);
    Ok(Box::new(move |rng, dim| Array1::random_using(dim, dist, rng)))
}

/// Architecture of a decoder-style PC graph.
///
/// Dimensions run `internal_dim -> hidden_dim -> ... -> output_dim` with
/// `num_hidden_layers` extra `hidden_dim -> hidden_dim` layers in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub internal_dim: usize,
    pub hidden_dim: usize,
    pub num_hidden_layers: usize,
    pub output_dim: usize,
    /// One of `identity`, `tanh`, `relu`, `sigmoid`, `gelu`.
    pub activation: String,
    /// Produce the entry node's prediction from a learned `Linear(1, internal_dim)`.
    pub use_prior_layer: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            internal_dim: 64,
            hidden_dim: 256,
            num_hidden_layers: 1,
            output_dim: 784,
            activation: "gelu".to_string(),
            use_prior_layer: false,
        }
    }
}

impl ModelParams {
    pub fn num_layers(&self) -> usize {
        self.num_hidden_layers + 2
    }

    /// Node dimensions `[d0, ..., dL]`.
    pub fn dims(&self) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.num_layers() + 1);
        dims.push(self.internal_dim);
        dims.extend(std::iter::repeat(self.hidden_dim).take(self.num_hidden_layers + 1));
        dims.push(self.output_dim);
        dims
    }
}

/// Where the entry node's prediction came from on the last forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    /// The prior layer applied to a constant `1`
    Prior,
    /// An `internal_state` passed to [`PcGraph::forward`]
    External,
    /// The entry node's own activation (zero self-energy)
    Persisted,
}

/// A chain of nodes interleaved with layers.
///
/// # Architecture
///
/// - **Nodes:** `nodes[0..=L]`, one row per example in each tensor
/// - **Layers:** `layers[i]` maps `nodes[i]` to the prediction of `nodes[i + 1]`
/// - **Activation:** applied after every layer except the last
/// - **Output:** `nodes[L]` is frozen; it is clamped to the target during training
///
/// Parameters are addressed through the [`ParamRegistry`] built at construction.
pub struct PcGraph {
    dims: Vec<usize>,
    activation: Box<dyn Activation>,
    prior: Option<Layer>,
    layers: Vec<Layer>,
    nodes: Vec<Node>,
    registry: ParamRegistry,
    init_fn: StateInitFn,
    rng: StdRng,
    entry_source: Option<EntrySource>,
}

impl std::fmt::Debug for PcGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcGraph")
            .field("dims", &self.dims)
            .field("prior", &self.prior.is_some())
            .field("layers", &format!("<{} layers>", self.layers.len()))
            .field(
                "activation",
                &format!("<{} activation>", self.activation.name()),
            )
            .field("entry_source", &self.entry_source)
            .finish()
    }
}

/// One example's share of the gradient, before reduction over the batch.
struct ExampleGradients {
    nodes: Vec<Option<Array1<f32>>>,
    layers: Vec<(Array2<f32>, Array1<f32>)>,
    prior: Option<Array1<f32>>,
}

impl PcGraph {
    /// Build a graph from model parameters.
    ///
    /// `rng` seeds both the layer initialisation and the graph's own stream
    /// used by `init_fn`.
    ///
    /// # Errors
    /// `InvalidConfig` for an unknown activation or a zero dimension.
    pub fn new<R: Rng + ?Sized>(
        params: &ModelParams,
        init_fn: StateInitFn,
        rng: &mut R,
    ) -> PCNResult<Self> {
        let activation = activation_from_name(&params.activation)?;
        Self::with_dims(
            params.dims(),
            activation,
            params.use_prior_layer,
            init_fn,
            rng,
        )
    }

    /// Build a graph over explicit node dimensions `[d0, ..., dL]`.
    ///
    /// # Errors
    /// `InvalidConfig` if fewer than two nodes are given or a dimension is zero.
    pub fn with_dims<R: Rng + ?Sized>(
        dims: Vec<usize>,
        activation: Box<dyn Activation>,
        use_prior_layer: bool,
        init_fn: StateInitFn,
        rng: &mut R,
    ) -> PCNResult<Self> {
        if dims.len() < 2 {
            return Err(PCNError::InvalidConfig(
                "need at least 2 nodes (entry and output)".to_string(),
            ));
        }
        if dims.contains(&0) {
            return Err(PCNError::InvalidConfig(format!(
                "node dimensions must be positive, got {dims:?}"
            )));
        }

        let prior = use_prior_layer.then(|| Layer::new(1, dims[0], rng));
        let layers: Vec<Layer> = dims
            .windows(2)
            .map(|pair| Layer::new(pair[0], pair[1], rng))
            .collect();

        let mut nodes: Vec<Node> = (0..layers.len()).map(|_| Node::new()).collect();
        nodes.push(Node::frozen());

        let mut registry = ParamRegistry::new();
        if prior.is_some() {
            registry.register(ParamKey::prior_weight(), Partition::W)?;
            registry.register(ParamKey::prior_bias(), Partition::W)?;
        }
        for l in 0..layers.len() {
            registry.register(ParamKey::layer_weight(l), Partition::W)?;
            registry.register(ParamKey::layer_bias(l), Partition::W)?;
        }
        for (i, node) in nodes.iter().enumerate() {
            if !node.is_frozen() {
                registry.register(ParamKey::node(i), Partition::X)?;
            }
        }

        let stream = StdRng::seed_from_u64(rng.gen());

        Ok(Self {
            dims,
            activation,
            prior,
            layers,
            nodes,
            registry,
            init_fn,
            rng: stream,
            entry_source: None,
        })
    }

    /// Node dimensions `[d0, ..., dL]`.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn prior(&self) -> Option<&Layer> {
        self.prior.as_ref()
    }

    pub fn activation_name(&self) -> &'static str {
        self.activation.name()
    }

    pub fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    pub fn entry_source(&self) -> Option<EntrySource> {
        self.entry_source
    }

    /// The entry node's latent state, if it has been initialised.
    pub fn internal_state(&self) -> Option<&Array2<f32>> {
        self.nodes[0].activation()
    }

    /// Explicitly assign the entry node's latent state.
    ///
    /// # Errors
    /// `ShapeMismatch` if the width differs from the internal dimension.
    pub fn set_internal_state(&mut self, value: Array2<f32>) -> PCNResult<()> {
        if value.ncols() != self.dims[0] {
            return Err(PCNError::shape(
                ParamKey::node(0).path(),
                &[value.nrows(), self.dims[0]],
                value.shape(),
            ));
        }
        self.nodes[0].set_activation(value);
        Ok(())
    }

    /// Reset every node's latent state and prediction cache.
    pub fn clear_nodes(&mut self) {
        for node in &mut self.nodes {
            node.clear();
        }
        self.entry_source = None;
    }

    /// Drop every node's prediction cache, keeping latent states.
    pub fn clear_cache(&mut self) {
        for node in &mut self.nodes {
            node.clear_cache();
        }
        self.entry_source = None;
    }

    fn initial_internal_state(&mut self, batch_size: usize) -> PCNResult<Array2<f32>> {
        let dim = self.dims[0];
        let mut value = Array2::zeros((batch_size, dim));
        for mut row in value.rows_mut() {
            let sample = (self.init_fn)(&mut self.rng, dim);
            if sample.len() != dim {
                return Err(PCNError::UninitializedState(format!(
                    "internal state initializer produced {} values, expected {dim}",
                    sample.len()
                )));
            }
            row.assign(&sample);
        }
        Ok(value)
    }

    /// Evaluate the graph, refreshing every node's cached prediction.
    ///
    /// # Algorithm
    ///
    /// ```text
    /// u_0 = internal_state | prior(1) | x_0
    /// u_i = f(W_i x_{i-1} + b_i)       for i in 1..L   (no f on layer L)
    /// x_L = example                    if given, else x_L = u_L
    /// ```
    ///
    /// On first touch the entry node is initialised through the graph's
    /// initializer and every other node starts at its prediction.
    ///
    /// Returns the output node's activation: the clamped example, or the
    /// prediction when nothing is clamped.
    ///
    /// # Errors
    /// - `UninitializedState` if the entry node has no value and no batch size
    ///   can be inferred, or the initializer returns the wrong width
    /// - `ShapeMismatch` on example/internal-state width or batch-size changes
    pub fn forward(
        &mut self,
        example: Option<&Array2<f32>>,
        internal_state: Option<&Array2<f32>>,
    ) -> PCNResult<Array2<f32>> {
        let l_max = self.layers.len();
        let output_dim = self.dims[l_max];

        if let Some(e) = example {
            if e.ncols() != output_dim {
                return Err(PCNError::shape(
                    "example",
                    &[e.nrows(), output_dim],
                    e.shape(),
                ));
            }
        }
        if let Some(s) = internal_state {
            if s.ncols() != self.dims[0] {
                return Err(PCNError::shape(
                    "internal_state",
                    &[s.nrows(), self.dims[0]],
                    s.shape(),
                ));
            }
        }

        // a failed pass must not leave the previous pass's predictions behind
        self.clear_cache();

        if self.nodes[0].activation().is_none() {
            let batch_size = example
                .map(|e| e.nrows())
                .or_else(|| internal_state.map(|s| s.nrows()))
                .ok_or_else(|| {
                    PCNError::UninitializedState(
                        "entry node has no value and the batch size is unknown".to_string(),
                    )
                })?;
            let value = self.initial_internal_state(batch_size)?;
            self.nodes[0].set_activation(value);
        }

        let batch_size = self.nodes[0].batch_size().unwrap_or(0);
        if let Some(e) = example {
            if e.nrows() != batch_size {
                return Err(PCNError::shape(
                    "example",
                    &[batch_size, output_dim],
                    e.shape(),
                ));
            }
        }

        let (entry_prediction, source) = match (internal_state, &self.prior) {
            (Some(s), _) => (s.clone(), EntrySource::External),
            (None, Some(prior)) => (
                prior.apply(&Array2::ones((batch_size, 1))),
                EntrySource::Prior,
            ),
            (None, None) => match self.nodes[0].activation() {
                Some(x0) => (x0.clone(), EntrySource::Persisted),
                None => {
                    return Err(PCNError::UninitializedState(
                        "entry node has no value".to_string(),
                    ))
                }
            },
        };
        self.nodes[0].cache_prediction(entry_prediction, None)?;
        self.entry_source = Some(source);

        for i in 1..=l_max {
            let drive = match self.nodes[i - 1].activation() {
                Some(x) => self.layers[i - 1].apply(x),
                None => {
                    return Err(PCNError::UninitializedState(format!(
                        "node {} has no value",
                        i - 1
                    )))
                }
            };
            let prediction = if i < l_max {
                self.activation.apply_matrix(&drive)
            } else {
                drive.clone()
            };
            self.nodes[i].cache_prediction(prediction, Some(drive))?;
        }

        let output = &mut self.nodes[l_max];
        let clamped = match example {
            Some(e) => e.clone(),
            None => output.prediction().cloned().unwrap_or_default(),
        };
        output.set_activation(clamped.clone());
        Ok(clamped)
    }

    /// Run the layers on an internal state without touching any node.
    ///
    /// Uses the entry node's activation when `internal_state` is `None`.
    ///
    /// # Errors
    /// `UninitializedState` if no internal state is available,
    /// `ShapeMismatch` on a width mismatch.
    pub fn feed_forward_predict(
        &self,
        internal_state: Option<&Array2<f32>>,
    ) -> PCNResult<Array2<f32>> {
        let start = match internal_state.or_else(|| self.internal_state()) {
            Some(s) => s,
            None => {
                return Err(PCNError::UninitializedState(
                    "internal state is empty; relax a batch or pass one explicitly".to_string(),
                ))
            }
        };
        if start.ncols() != self.dims[0] {
            return Err(PCNError::shape(
                "internal_state",
                &[start.nrows(), self.dims[0]],
                start.shape(),
            ));
        }

        let l_max = self.layers.len();
        let mut x = start.clone();
        for (l, layer) in self.layers.iter().enumerate() {
            let drive = layer.apply(&x);
            x = if l + 1 < l_max {
                self.activation.apply_matrix(&drive)
            } else {
                drive
            };
        }
        Ok(x)
    }

    /// Energy contributed by each node, summed over the batch.
    ///
    /// # Errors
    /// `StateNotReady` if any node's cache is empty.
    pub fn node_energies(&self) -> PCNResult<Vec<f32>> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| node.energy(i))
            .collect()
    }

    /// Total energy `E = (1/2) Σ_i ||u_i - x_i||²` over nodes and examples.
    ///
    /// # Errors
    /// `StateNotReady` before a forward pass.
    pub fn energy(&self) -> PCNResult<f32> {
        Ok(self.node_energies()?.iter().sum())
    }

    /// Gradient of [`energy`](Self::energy) with respect to the requested
    /// partitions, using the caches of the last forward pass.
    ///
    /// ```text
    /// e_i  = x_i - u_i
    /// δ_i  = e_i ⊙ f'(W_i x_{i-1} + b_i)          (δ_L = e_L)
    /// ∂E/∂x_i = e_i - W_{i+1}ᵀ δ_{i+1}             (no second term for i = L)
    /// ∂E/∂W_i = -δ_i x_{i-1}ᵀ,   ∂E/∂b_i = -δ_i
    /// ∂E/∂W_prior = ∂E/∂b_prior = -e_0            (only when the prior fed node 0)
    /// ```
    ///
    /// x-gradients have one row per example; w-gradients are summed over the
    /// batch. Keys outside the requested partitions are absent, as are prior
    /// gradients when the prior did not take part in the forward pass.
    ///
    /// # Errors
    /// `StateNotReady` before a forward pass.
    pub fn gradients(&self, partitions: &[Partition]) -> PCNResult<Gradients> {
        let want_x = partitions.contains(&Partition::X);
        let want_w = partitions.contains(&Partition::W);
        let l_max = self.layers.len();

        let source = self.entry_source.ok_or_else(|| {
            PCNError::StateNotReady("no forward pass since the cache was cleared".to_string())
        })?;
        let states = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| node.state(i))
            .collect::<PCNResult<Vec<_>>>()?;
        let mut drives = Vec::with_capacity(l_max);
        for i in 1..=l_max {
            let drive = self.nodes[i].drive().ok_or_else(|| {
                PCNError::StateNotReady(format!("node {i} has no cached drive"))
            })?;
            drives.push(drive);
        }
        let batch_size = states[0].0.nrows();

        let per_example = batch::map_examples(batch_size, |b| {
            Ok(self.example_gradients(b, &states, &drives, source, want_x, want_w))
        })?;

        let mut grads = Gradients::new();
        if want_x {
            for (i, node) in self.nodes.iter().enumerate() {
                if node.is_frozen() {
                    continue;
                }
                let mut g = Array2::zeros((batch_size, self.dims[i]));
                for (b, ex) in per_example.iter().enumerate() {
                    if let Some(row) = &ex.nodes[i] {
                        g.row_mut(b).assign(row);
                    }
                }
                grads.insert(ParamKey::node(i), g.into_dyn());
            }
        }
        if want_w {
            for (l, layer) in self.layers.iter().enumerate() {
                let mut dw = Array2::zeros(layer.weights.dim());
                let mut db = Array1::zeros(layer.bias.len());
                for ex in &per_example {
                    dw += &ex.layers[l].0;
                    db += &ex.layers[l].1;
                }
                grads.insert(ParamKey::layer_weight(l), dw.into_dyn());
                grads.insert(ParamKey::layer_bias(l), db.into_dyn());
            }
            if self.prior.is_some() && source == EntrySource::Prior {
                let mut db = Array1::zeros(self.dims[0]);
                for ex in &per_example {
                    if let Some(g) = &ex.prior {
                        db += g;
                    }
                }
                let dw = db.clone().insert_axis(Axis(1));
                grads.insert(ParamKey::prior_weight(), dw.into_dyn());
                grads.insert(ParamKey::prior_bias(), db.into_dyn());
            }
        }
        Ok(grads)
    }

    fn example_gradients(
        &self,
        b: usize,
        states: &[(&Array2<f32>, &Array2<f32>)],
        drives: &[&Array2<f32>],
        source: EntrySource,
        want_x: bool,
        want_w: bool,
    ) -> ExampleGradients {
        let l_max = self.layers.len();
        let errors: Vec<Array1<f32>> = states
            .iter()
            .map(|(x, u)| &x.row(b) - &u.row(b))
            .collect();

        // deltas[i] for i >= 1; the entry node has no upstream layer
        let mut deltas: Vec<Array1<f32>> = Vec::with_capacity(l_max + 1);
        deltas.push(Array1::zeros(0));
        for i in 1..=l_max {
            let delta = if i < l_max {
                let drive = drives[i - 1].row(b).to_owned();
                &errors[i] * &self.activation.derivative(&drive)
            } else {
                errors[i].clone()
            };
            deltas.push(delta);
        }

        let nodes = if want_x {
            (0..=l_max)
                .map(|i| {
                    if self.nodes[i].is_frozen() {
                        return None;
                    }
                    let mut g = errors[i].clone();
                    if i < l_max {
                        g -= &self.layers[i].weights.t().dot(&deltas[i + 1]);
                    }
                    Some(g)
                })
                .collect()
        } else {
            Vec::new()
        };

        let layers = if want_w {
            (1..=l_max)
                .map(|i| {
                    let delta = &deltas[i];
                    let input = states[i - 1].0.row(b);
                    let col = delta.view().insert_axis(Axis(1));
                    let row = input.insert_axis(Axis(0));
                    (-(&col * &row), -delta)
                })
                .collect()
        } else {
            Vec::new()
        };

        let prior = (want_w && self.prior.is_some() && source == EntrySource::Prior)
            .then(|| -&errors[0]);

        ExampleGradients {
            nodes,
            layers,
            prior,
        }
    }

    /// Read-only view of a registered parameter.
    pub fn param(&self, key: ParamKey) -> Option<ArrayViewD<'_, f32>> {
        match (key.group, key.kind) {
            (Group::PriorLayer, Kind::Weight) => {
                self.prior.as_ref().map(|l| l.weights.view().into_dyn())
            }
            (Group::PriorLayer, Kind::Bias) => {
                self.prior.as_ref().map(|l| l.bias.view().into_dyn())
            }
            (Group::FcLayer, Kind::Weight) => {
                self.layers.get(key.index).map(|l| l.weights.view().into_dyn())
            }
            (Group::FcLayer, Kind::Bias) => {
                self.layers.get(key.index).map(|l| l.bias.view().into_dyn())
            }
            (Group::PcNode, Kind::Activation) => self
                .nodes
                .get(key.index)
                .and_then(Node::activation)
                .map(|a| a.view().into_dyn()),
            _ => None,
        }
    }

    pub(crate) fn param_mut(&mut self, key: ParamKey) -> Option<ArrayViewMutD<'_, f32>> {
        match (key.group, key.kind) {
            (Group::PriorLayer, Kind::Weight) => {
                self.prior.as_mut().map(|l| l.weights.view_mut().into_dyn())
            }
            (Group::PriorLayer, Kind::Bias) => {
                self.prior.as_mut().map(|l| l.bias.view_mut().into_dyn())
            }
            (Group::FcLayer, Kind::Weight) => self
                .layers
                .get_mut(key.index)
                .map(|l| l.weights.view_mut().into_dyn()),
            (Group::FcLayer, Kind::Bias) => self
                .layers
                .get_mut(key.index)
                .map(|l| l.bias.view_mut().into_dyn()),
            (Group::PcNode, Kind::Activation) => self
                .nodes
                .get_mut(key.index)
                .and_then(Node::activation_mut)
                .map(|a| a.view_mut().into_dyn()),
            _ => None,
        }
    }

    /// Add `updates` to the parameters of one partition.
    ///
    /// Every key is checked before anything is written, so a rejected call
    /// leaves the graph untouched.
    ///
    /// # Errors
    /// - `WrongPartition` if a key is not registered under `partition`
    ///   (this includes the frozen output node)
    /// - `StateNotReady` if an x-parameter has no value yet
    /// - `ShapeMismatch` if an update's shape differs from its parameter
    pub fn apply_updates(&mut self, partition: Partition, updates: &Gradients) -> PCNResult<()> {
        for (key, update) in updates.iter() {
            if self.registry.partition_of(key) != Some(partition) {
                return Err(PCNError::WrongPartition {
                    path: key.path(),
                    expected: partition,
                });
            }
            let current = self
                .param(key)
                .ok_or_else(|| PCNError::StateNotReady(format!("{key} has no value")))?;
            if current.shape() != update.shape() {
                return Err(PCNError::shape(key.path(), current.shape(), update.shape()));
            }
        }
        for (key, update) in updates.iter() {
            if let Some(mut param) = self.param_mut(key) {
                param += update;
            }
        }
        Ok(())
    }
}
