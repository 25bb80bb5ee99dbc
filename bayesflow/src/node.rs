//! The node-type interface.
//!
//! A node type declares its parameter slots, how to infer its output
//! shape/dtype from its parents, how to draw a sample given parent
//! samples, and how to score a value. The [`BayesNet`](crate::graph::BayesNet)
//! arena drives these hooks; node types never touch graph state.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Shape, Tensor};
use candle_util::qdist::QDistribution;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Posterior shared between the graph and its callers
pub type SharedQ = Arc<dyn QDistribution>;

/// Handle of a node inside a [`BayesNet`](crate::graph::BayesNet)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named parameter slot of a node type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub name: &'static str,
    pub required: bool,
}

impl InputSlot {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// What a caller plugs into a parameter slot.
///
/// Raw values are wrapped into fixed flat nodes when the node is added.
#[derive(Debug, Clone)]
pub enum Input {
    Node(NodeId),
    Value(Tensor),
    Scalar(f64),
    Absent,
}

impl From<NodeId> for Input {
    fn from(id: NodeId) -> Self {
        Input::Node(id)
    }
}

impl From<Option<NodeId>> for Input {
    fn from(id: Option<NodeId>) -> Self {
        id.map_or(Input::Absent, Input::Node)
    }
}

impl From<Tensor> for Input {
    fn from(value: Tensor) -> Self {
        Input::Value(value)
    }
}

impl From<&Tensor> for Input {
    fn from(value: &Tensor) -> Self {
        Input::Value(value.clone())
    }
}

impl From<f64> for Input {
    fn from(x: f64) -> Self {
        Input::Scalar(x)
    }
}

impl From<f32> for Input {
    fn from(x: f32) -> Self {
        Input::Scalar(x as f64)
    }
}

/// Values keyed by parameter slot, in declaration order
#[derive(Debug, Clone)]
pub struct Params<T> {
    entries: Vec<(&'static str, T)>,
}

impl<T> Default for Params<T> {
    fn default() -> Self {
        Self { entries: vec![] }
    }
}

impl<T> Params<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &'static str, value: T) {
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Result<&T> {
        match self.get_opt(name) {
            Some(v) => Ok(v),
            None => bail!("no input named `{}`", name),
        }
    }

    pub fn get_opt(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &T)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-only view of a wired node, handed to the node-type hooks
pub struct NodeContext<'a> {
    pub name: &'a str,
    pub output_shape: &'a Shape,
    pub dtype: DType,
    pub device: &'a Device,
    pub input_shapes: &'a Params<Shape>,
}

impl NodeContext<'_> {
    /// Size of dimension `dim` of the input in slot `name`
    pub fn input_dim(&self, name: &str, dim: usize) -> Result<usize> {
        let shape = self.input_shapes.get(name)?;
        match shape.dims().get(dim) {
            Some(&d) => Ok(d),
            None => bail!(
                "{}: input `{}` of shape {:?} has no dimension {}",
                self.name,
                name,
                shape,
                dim
            ),
        }
    }
}

/// A random variable conditioned on its parents.
///
/// Unconditional distributions are the special case with no inputs.
pub trait ConditionalDistribution: Send + Sync {
    /// Used for auto-generated node names
    fn type_name(&self) -> &'static str;

    /// Parameter slots, in order
    fn inputs(&self) -> &'static [InputSlot];

    /// Output shape from `input_shapes`, only called if no shape was given
    fn compute_shape(&self, input_shapes: &Params<Shape>) -> Result<Shape>;

    /// Output dtype from `input_dtypes`, only called if no dtype was given
    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType>;

    /// Draw from the generative model given concrete parent values
    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng)
        -> Result<Tensor>;

    /// Exact log-density of `result` given concrete parent values, a scalar
    fn logp(&self, ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor>;

    /// E_q[log p(result | inputs)] under the mean-field posteriors.
    ///
    /// The default is a single Monte Carlo draw from every posterior
    /// plugged into [`logp`](Self::logp).
    fn expected_logp(
        &self,
        ctx: &NodeContext,
        q_result: &dyn QDistribution,
        q_inputs: &Params<SharedQ>,
    ) -> Result<Tensor> {
        let result = q_result.sample()?;
        let mut samples = Params::new();
        for (name, q) in q_inputs.iter() {
            samples.insert(name, q.sample()?);
        }
        self.logp(ctx, &result, &samples)
    }

    /// Constant added to the expected log-probability to account for
    /// label/sign non-identifiability
    fn symmetry_correction(&self, _ctx: &NodeContext) -> Result<f64> {
        Ok(0.0)
    }

    /// Posterior attached when none was attached by the caller
    fn default_q(&self, ctx: &NodeContext) -> Result<SharedQ> {
        bail!(
            "default Q distribution not implemented for {} ({})",
            ctx.name,
            self.type_name()
        )
    }

    /// Posterior attached right after construction
    fn initial_q(&self) -> Option<SharedQ> {
        None
    }
}

/// Everything needed to add one node to a [`BayesNet`](crate::graph::BayesNet)
pub struct NodeBuilder {
    pub(crate) kind: Box<dyn ConditionalDistribution>,
    pub(crate) inputs: Vec<(String, Input)>,
    pub(crate) output_shape: Option<Shape>,
    pub(crate) dtype: Option<DType>,
    pub(crate) minibatch_scale_factor: Option<f64>,
    pub(crate) name: Option<String>,
}

impl NodeBuilder {
    pub fn new<D: ConditionalDistribution + 'static>(kind: D) -> Self {
        Self {
            kind: Box::new(kind),
            inputs: vec![],
            output_shape: None,
            dtype: None,
            minibatch_scale_factor: None,
            name: None,
        }
    }

    /// Plug a value into the parameter slot `name`
    pub fn input<I: Into<Input>>(mut self, name: &str, value: I) -> Self {
        let value = value.into();
        match self.inputs.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.inputs.push((name.to_string(), value)),
        }
        self
    }

    pub fn shape<S: Into<Shape>>(mut self, shape: S) -> Self {
        self.output_shape = Some(shape.into());
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Multiplier on the expected log-probability and entropy, for
    /// minibatch estimates of the ELBO
    pub fn minibatch_scale_factor(mut self, scale: f64) -> Self {
        self.minibatch_scale_factor = Some(scale);
        self
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Fails unless all `dtypes` agree; returns the common one
pub(crate) fn same_dtype(node: &str, dtypes: &[DType]) -> Result<DType> {
    let Some(&first) = dtypes.first() else {
        bail!("{}: no input dtypes", node);
    };
    if let Some(other) = dtypes.iter().find(|&&d| d != first) {
        bail!("{}: mismatched input dtypes {:?} vs {:?}", node, first, other);
    }
    Ok(first)
}

/// Standard normal noise of `shape` scaled elementwise by `std`
pub(crate) fn gaussian_noise(
    rng: &mut StdRng,
    shape: &Shape,
    std: &Tensor,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    use rand_distr::{Distribution, StandardNormal};

    let eps: Vec<f64> = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect();
    let eps = Tensor::from_vec(eps, shape.clone(), device)?.to_dtype(dtype)?;
    Ok(eps.broadcast_mul(&std.to_dtype(dtype)?)?)
}

/// Mean-field Gaussian posterior over the node's output
pub(crate) fn gaussian_default_q(ctx: &NodeContext) -> Result<SharedQ> {
    let q = candle_util::qdist::GaussianQ::new(ctx.output_shape.clone(), ctx.dtype, ctx.device)?;
    Ok(Arc::new(q))
}

/// `a · bᵗ` for 2-D tensors
pub(crate) fn matmul_t(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok(a.matmul(&b.t()?.contiguous()?)?)
}

/// Shape of a 2-D input, or an error naming the slot
pub(crate) fn dims2(input_shapes: &Params<Shape>, name: &str) -> Result<(usize, usize)> {
    match input_shapes.get(name)?.dims() {
        &[rows, cols] => Ok((rows, cols)),
        other => bail!("input `{}` must be a matrix, got shape {:?}", name, other),
    }
}
