//! Arena holding a directed graphical model.
//!
//! Nodes are addressed by [`NodeId`]. A node can only be wired to nodes
//! that already exist, so the graph is a DAG by construction and node ids
//! are a topological order.

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_util::qdist::{ObservedQ, QDistribution};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::flat::FlatDistribution;
use crate::node::{ConditionalDistribution, Input, NodeBuilder, NodeContext, NodeId, Params, SharedQ};

struct NodeEntry {
    name: String,
    kind: Box<dyn ConditionalDistribution>,
    input_nodes: Vec<(&'static str, NodeId)>,
    input_shapes: Params<Shape>,
    output_shape: Shape,
    dtype: DType,
    minibatch_scale_factor: Option<f64>,
    ancestors: BTreeSet<NodeId>,
    /// (seed, value) of the most recent draw
    sampled: Option<(u64, Tensor)>,
    q: Option<SharedQ>,
}

impl NodeEntry {
    fn context<'a>(&'a self, device: &'a Device) -> NodeContext<'a> {
        NodeContext {
            name: &self.name,
            output_shape: &self.output_shape,
            dtype: self.dtype,
            device,
            input_shapes: &self.input_shapes,
        }
    }
}

/// Expected log-probability and entropy, summed over a set of nodes
#[derive(Debug, Clone)]
pub struct Elbo {
    pub expected_logp: Tensor,
    pub entropy: Tensor,
}

impl Elbo {
    /// E_q[log p] + H[q]
    pub fn total(&self) -> Result<Tensor> {
        Ok((&self.expected_logp + &self.entropy)?)
    }
}

/// A Bayesian network: conditional-distribution nodes wired into a DAG
pub struct BayesNet {
    device: Device,
    default_dtype: DType,
    nodes: Vec<NodeEntry>,
    names: HashMap<String, NodeId>,
}

impl BayesNet {
    /// Empty network; scalar constants become F32 tensors on `device`
    pub fn new(device: Device) -> Self {
        Self {
            device,
            default_dtype: DType::F32,
            nodes: vec![],
            names: HashMap::new(),
        }
    }

    /// Element type used for scalar constants
    pub fn with_default_dtype(mut self, dtype: DType) -> Self {
        self.default_dtype = dtype;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wire a new node to its parents and infer its shape and dtype.
    ///
    /// Raw values in parameter slots become fixed flat nodes named
    /// `<node>_<param>_fixed`. On error the network is left unchanged.
    pub fn add(&mut self, builder: NodeBuilder) -> Result<NodeId> {
        let checkpoint = self.nodes.len();
        let ret = self.add_node(builder);
        if ret.is_err() {
            for entry in self.nodes.drain(checkpoint..) {
                self.names.remove(&entry.name);
            }
        }
        ret
    }

    fn add_node(&mut self, builder: NodeBuilder) -> Result<NodeId> {
        let NodeBuilder {
            kind,
            mut inputs,
            output_shape,
            dtype,
            minibatch_scale_factor,
            name,
        } = builder;

        let name = match name {
            Some(name) => {
                ensure!(
                    !self.names.contains_key(&name),
                    "a node named `{}` already exists",
                    name
                );
                name
            }
            None => {
                let name = self.fresh_name(kind.type_name());
                debug!("constructed name {}", name);
                name
            }
        };

        if let Some((unknown, _)) = inputs
            .iter()
            .find(|(k, _)| !kind.inputs().iter().any(|s| s.name == k))
        {
            bail!(
                "{} ({}) has no input named `{}`",
                name,
                kind.type_name(),
                unknown
            );
        }

        let mut input_nodes: Vec<(&'static str, NodeId)> = vec![];
        for slot in kind.inputs() {
            let pos = inputs.iter().position(|(k, _)| k == slot.name);
            let value = match pos {
                Some(pos) => inputs.swap_remove(pos).1,
                None => Input::Absent,
            };

            let parent = match value {
                Input::Node(parent) => {
                    ensure!(
                        parent.0 < self.nodes.len(),
                        "{}: input `{}` refers to unknown node {}",
                        name,
                        slot.name,
                        parent
                    );
                    parent
                }
                Input::Value(value) => {
                    let value = value.to_device(&self.device)?;
                    self.add_constant(&name, slot.name, value)?
                }
                Input::Scalar(x) => {
                    let value = Tensor::new(x, &self.device)?.to_dtype(self.default_dtype)?;
                    self.add_constant(&name, slot.name, value)?
                }
                Input::Absent if slot.required => {
                    bail!(
                        "{} ({}) is missing required input `{}`",
                        name,
                        kind.type_name(),
                        slot.name
                    )
                }
                Input::Absent => continue,
            };
            input_nodes.push((slot.name, parent));
        }

        let mut input_shapes = Params::new();
        let mut input_dtypes = Params::new();
        for &(slot, parent) in input_nodes.iter() {
            let parent = &self.nodes[parent.0];
            input_shapes.insert(slot, parent.output_shape.clone());
            input_dtypes.insert(slot, parent.dtype);
        }

        let output_shape = match output_shape {
            Some(shape) => shape,
            None => kind
                .compute_shape(&input_shapes)
                .with_context(|| format!("cannot infer the output shape of {}", name))?,
        };

        let dtype = match dtype {
            Some(dtype) => dtype,
            None => kind
                .compute_dtype(&input_dtypes)
                .with_context(|| format!("cannot infer the dtype of {}", name))?,
        };

        // constants wrapped above precede this node
        let id = NodeId(self.nodes.len());
        let mut ancestors = BTreeSet::from([id]);
        for &(_, parent) in input_nodes.iter() {
            ancestors.extend(self.nodes[parent.0].ancestors.iter().copied());
        }

        let initial_q = kind.initial_q();

        self.names.insert(name.clone(), id);
        self.nodes.push(NodeEntry {
            name,
            kind,
            input_nodes,
            input_shapes,
            output_shape,
            dtype,
            minibatch_scale_factor,
            ancestors,
            sampled: None,
            q: None,
        });

        if let Some(q) = initial_q {
            self.attach_q(id, q)?;
        }

        Ok(id)
    }

    fn add_constant(&mut self, node: &str, param: &str, value: Tensor) -> Result<NodeId> {
        let builder = FlatDistribution::new(value, true)
            .build()
            .name(format!("{}_{}_fixed", node, param));
        self.add_node(builder)
    }

    fn fresh_name(&self, type_name: &str) -> String {
        let mut rng = rand::rng();
        loop {
            let salt: u32 = rng.random_range(0..(1 << 24));
            let name = format!("{}_{:06x}", type_name, salt);
            if !self.names.contains_key(&name) {
                return name;
            }
        }
    }

    fn entry(&self, id: NodeId) -> Result<&NodeEntry> {
        match self.nodes.get(id.0) {
            Some(entry) => Ok(entry),
            None => bail!("unknown node {}", id),
        }
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry> {
        match self.nodes.get_mut(id.0) {
            Some(entry) => Ok(entry),
            None => bail!("unknown node {}", id),
        }
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn name(&self, id: NodeId) -> Result<&str> {
        Ok(&self.entry(id)?.name)
    }

    pub fn output_shape(&self, id: NodeId) -> Result<&Shape> {
        Ok(&self.entry(id)?.output_shape)
    }

    pub fn dtype(&self, id: NodeId) -> Result<DType> {
        Ok(self.entry(id)?.dtype)
    }

    pub fn minibatch_scale_factor(&self, id: NodeId) -> Result<Option<f64>> {
        Ok(self.entry(id)?.minibatch_scale_factor)
    }

    /// Parent nodes keyed by parameter slot
    pub fn input_nodes(&self, id: NodeId) -> Result<&[(&'static str, NodeId)]> {
        Ok(&self.entry(id)?.input_nodes)
    }

    /// The node itself and everything reachable through its inputs
    pub fn ancestors(&self, id: NodeId) -> Result<&BTreeSet<NodeId>> {
        Ok(&self.entry(id)?.ancestors)
    }

    /// Draw from the generative model, deterministically given `seed`.
    ///
    /// Parents are sampled first with the same seed. Each node keeps its
    /// last draw; asking again with the same seed returns it unchanged.
    pub fn sample(&mut self, id: NodeId, seed: u64) -> Result<Tensor> {
        let entry = self.entry(id)?;
        if let Some((last_seed, value)) = &entry.sampled {
            if *last_seed == seed {
                return Ok(value.clone());
            }
        }

        let parents = entry.input_nodes.clone();
        let mut inputs = Params::new();
        for (slot, parent) in parents {
            inputs.insert(slot, self.sample(parent, seed)?);
        }

        let mut rng = StdRng::seed_from_u64(local_seed(seed, id));
        let entry = &self.nodes[id.0];
        let value = entry
            .kind
            .sample(&entry.context(&self.device), &inputs, &mut rng)
            .with_context(|| format!("failed to sample {}", entry.name))?;

        self.nodes[id.0].sampled = Some((seed, value.clone()));
        Ok(value)
    }

    /// Most recent draw, if any
    pub fn cached_sample(&self, id: NodeId) -> Result<Option<&Tensor>> {
        Ok(self.entry(id)?.sampled.as_ref().map(|(_, v)| v))
    }

    /// Seed of the most recent draw, if any
    pub fn cached_seed(&self, id: NodeId) -> Result<Option<u64>> {
        Ok(self.entry(id)?.sampled.as_ref().map(|(s, _)| *s))
    }

    /// Exact log-density of `value` at `id` given concrete parent values
    pub fn logp(&self, id: NodeId, value: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        let entry = self.entry(id)?;
        entry.kind.logp(&entry.context(&self.device), value, inputs)
    }

    /// The posterior attached at `id`, attaching the node type's default
    /// the first time none is present
    pub fn q_distribution(&mut self, id: NodeId) -> Result<SharedQ> {
        let entry = self.entry(id)?;
        if let Some(q) = &entry.q {
            return Ok(q.clone());
        }
        let q = entry.kind.default_q(&entry.context(&self.device))?;
        self.attach_q(id, q.clone())?;
        Ok(q)
    }

    /// Attach a posterior; at most one per node, with the node's shape
    /// and dtype
    pub fn attach_q(&mut self, id: NodeId, q: SharedQ) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if let Some(existing) = &entry.q {
            bail!(
                "trying to attach Q distribution {:?} at {}, but another distribution {:?} is already attached!",
                q,
                entry.name,
                existing
            );
        }
        let q_shape = q.output_shape();
        ensure!(
            q_shape == entry.output_shape,
            "Q distribution of shape {:?} does not match the shape {:?} of {}",
            q_shape,
            entry.output_shape,
            entry.name
        );
        ensure!(
            q.dtype() == entry.dtype,
            "Q distribution of dtype {:?} does not match the dtype {:?} of {}",
            q.dtype(),
            entry.dtype,
            entry.name
        );
        entry.q = Some(q);
        Ok(())
    }

    /// Remove the attached posterior, if any
    pub fn detach_q(&mut self, id: NodeId) -> Result<Option<SharedQ>> {
        Ok(self.entry_mut(id)?.q.take())
    }

    /// Condition on data: pin the posterior at `id` to `value`
    pub fn observe(&mut self, id: NodeId, value: Tensor) -> Result<SharedQ> {
        let value = value.to_device(&self.device)?;
        let q: SharedQ = Arc::new(ObservedQ::new(value));
        self.attach_q(id, q.clone())?;
        Ok(q)
    }

    /// This node's contribution (expected log-probability, entropy) to the ELBO
    pub fn elbo_term(&mut self, id: NodeId) -> Result<(Tensor, Tensor)> {
        let parents = self.entry(id)?.input_nodes.clone();
        let mut q_inputs = Params::new();
        for (slot, parent) in parents {
            q_inputs.insert(slot, self.q_distribution(parent)?);
        }
        let q = self.q_distribution(id)?;

        let entry = &self.nodes[id.0];
        let ctx = entry.context(&self.device);
        let mut expected_logp = entry
            .kind
            .expected_logp(&ctx, q.as_ref(), &q_inputs)
            .with_context(|| format!("failed to compute E[log p] at {}", entry.name))?;
        let mut entropy = q.entropy()?;

        if let Some(scale) = entry.minibatch_scale_factor {
            expected_logp = (expected_logp * scale)?;
            entropy = (entropy * scale)?;
        }

        let correction = entry.kind.symmetry_correction(&ctx)?;
        if correction != 0.0 {
            expected_logp = (expected_logp + correction)?;
        }

        Ok((expected_logp, entropy))
    }

    /// ELBO terms summed over every ancestor of `root` (root included)
    pub fn elbo(&mut self, root: NodeId) -> Result<Elbo> {
        let ancestors: Vec<NodeId> = self.ancestors(root)?.iter().copied().collect();

        let mut expected_logp = Tensor::zeros((), DType::F64, &self.device)?;
        let mut entropy = Tensor::zeros((), DType::F64, &self.device)?;
        for id in ancestors {
            let (lp, h) = self.elbo_term(id)?;
            expected_logp = (expected_logp + lp.to_dtype(DType::F64)?)?;
            entropy = (entropy + h.to_dtype(DType::F64)?)?;
        }

        Ok(Elbo {
            expected_logp,
            entropy,
        })
    }

    /// Warm-start every non-observed posterior among the ancestors of `id`
    /// at that node's most recent sample.
    ///
    /// Posteriors that cannot be point-initialized are reported and skipped.
    pub fn init_q_true(&mut self, id: NodeId) -> Result<()> {
        let ancestors: Vec<NodeId> = self.ancestors(id)?.iter().copied().collect();

        for node in ancestors {
            let q = self.q_distribution(node)?;
            if q.is_observed() {
                continue;
            }
            let entry = &self.nodes[node.0];
            let Some((_, value)) = &entry.sampled else {
                warn!("cannot initialize node {} qdist {:?}: never sampled", entry.name, q);
                continue;
            };
            match q.initialize_to_value(value) {
                Ok(()) => info!("initialized {} {:?}", entry.name, q),
                Err(e) => warn!("cannot initialize node {} qdist {:?}: {}", entry.name, q, e),
            }
        }
        Ok(())
    }

    /// Trainable parameters of all attached posteriors
    pub fn variables(&self) -> Vec<Var> {
        let mut seen = HashSet::new();
        let mut vars = vec![];
        for entry in self.nodes.iter() {
            let Some(q) = &entry.q else {
                continue;
            };
            for var in q.vars() {
                if seen.insert(var.as_tensor().id()) {
                    vars.push(var);
                }
            }
        }
        vars
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Per-node seed: independent noise at every node under one global seed
pub(crate) fn local_seed(seed: u64, id: NodeId) -> u64 {
    splitmix64(seed ^ splitmix64(id.0 as u64)) % (1 << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_seed_depends_on_node() {
        let a = local_seed(7, NodeId(0));
        let b = local_seed(7, NodeId(1));
        assert_ne!(a, b);
        assert_eq!(a, local_seed(7, NodeId(0)));
        assert!(a < (1 << 32));
    }
}
