use anyhow::Result;
use candle_core::{DType, Shape, Tensor};
use candle_util::qdist::ObservedQ;
use rand::rngs::StdRng;
use std::sync::Arc;

use crate::node::{ConditionalDistribution, InputSlot, NodeBuilder, NodeContext, Params, SharedQ};

/// A flat (improper) prior that always samples a stored value.
///
/// Parameters with known or fixed values are a flat prior plus an
/// observed posterior pinned to the value; `fixed = true` attaches that
/// posterior as soon as the node is added.
#[derive(Debug, Clone)]
pub struct FlatDistribution {
    value: Tensor,
    fixed: bool,
}

impl FlatDistribution {
    pub fn new(value: Tensor, fixed: bool) -> Self {
        Self { value, fixed }
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Builder with shape and dtype taken from the value
    pub fn build(self) -> NodeBuilder {
        let shape = self.value.shape().clone();
        let dtype = self.value.dtype();
        NodeBuilder::new(self).shape(shape).dtype(dtype)
    }
}

impl ConditionalDistribution for FlatDistribution {
    fn type_name(&self) -> &'static str {
        "FlatDistribution"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        &[]
    }

    fn compute_shape(&self, _input_shapes: &Params<Shape>) -> Result<Shape> {
        Ok(self.value.shape().clone())
    }

    fn compute_dtype(&self, _input_dtypes: &Params<DType>) -> Result<DType> {
        Ok(self.value.dtype())
    }

    fn sample(
        &self,
        _ctx: &NodeContext,
        _inputs: &Params<Tensor>,
        _rng: &mut StdRng,
    ) -> Result<Tensor> {
        Ok(self.value.clone())
    }

    /// A flat prior contributes nothing
    fn logp(&self, ctx: &NodeContext, _result: &Tensor, _inputs: &Params<Tensor>) -> Result<Tensor> {
        Ok(Tensor::zeros((), ctx.dtype, ctx.device)?)
    }

    fn initial_q(&self) -> Option<SharedQ> {
        if self.fixed {
            Some(Arc::new(ObservedQ::new(self.value.clone())))
        } else {
            None
        }
    }
}
