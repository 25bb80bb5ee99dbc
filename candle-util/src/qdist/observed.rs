use candle_core::{DType, Result, Shape, Tensor};

use super::traits::QDistribution;

/// Degenerate posterior pinned to an observed (or fixed) value.
///
/// mean = value, variance = 0, entropy = 0
#[derive(Debug, Clone)]
pub struct ObservedQ {
    value: Tensor,
}

impl ObservedQ {
    pub fn new(value: Tensor) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }
}

impl QDistribution for ObservedQ {
    fn output_shape(&self) -> Shape {
        self.value.shape().clone()
    }

    fn dtype(&self) -> DType {
        self.value.dtype()
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.value.clone())
    }

    fn variance(&self) -> Result<Tensor> {
        self.value.zeros_like()
    }

    fn sample(&self) -> Result<Tensor> {
        Ok(self.value.clone())
    }

    fn entropy(&self) -> Result<Tensor> {
        Tensor::zeros((), self.value.dtype(), self.value.device())
    }

    /// Observed binary data are their own probabilities
    fn probs(&self) -> Result<Tensor> {
        Ok(self.value.clone())
    }

    fn is_observed(&self) -> bool {
        true
    }
}
