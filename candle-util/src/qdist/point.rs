use candle_core::{DType, Device, Result, Shape, Tensor, Var};

use super::traits::QDistribution;

/// Trainable point mass q(x) = δ(x - μ)
///
/// A MAP-style estimate inside the mean-field family: the sample is the
/// location itself (gradients flow to μ) and the entropy is zero.
#[derive(Debug)]
pub struct PointQ {
    location: Var,
}

impl PointQ {
    /// Location starts at zero
    pub fn new<S: Into<Shape>>(shape: S, dtype: DType, device: &Device) -> Result<Self> {
        let location = Tensor::zeros(shape, dtype, device)?;
        Ok(Self {
            location: Var::from_tensor(&location)?,
        })
    }

    pub fn with_init(location: &Tensor) -> Result<Self> {
        Ok(Self {
            location: Var::from_tensor(location)?,
        })
    }
}

impl QDistribution for PointQ {
    fn output_shape(&self) -> Shape {
        self.location.shape().clone()
    }

    fn dtype(&self) -> DType {
        self.location.dtype()
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.location.as_tensor().clone())
    }

    fn variance(&self) -> Result<Tensor> {
        self.location.as_tensor().zeros_like()
    }

    fn sample(&self) -> Result<Tensor> {
        Ok(self.location.as_tensor().clone())
    }

    fn entropy(&self) -> Result<Tensor> {
        Tensor::zeros((), self.location.dtype(), self.location.device())
    }

    fn initialize_to_value(&self, value: &Tensor) -> Result<()> {
        self.location.set(&value.to_dtype(self.location.dtype())?)
    }

    fn vars(&self) -> Vec<Var> {
        vec![self.location.clone()]
    }
}
