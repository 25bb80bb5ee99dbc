use candle_core::{DType, Device, Result, Shape, Tensor, Var};

use super::traits::QDistribution;
use crate::candle_dists::gaussian_entropy;

/// Gaussian variational distribution q(x) = N(μ, σ²I)
///
/// Uses mean-field approximation with diagonal covariance.
/// Parameters are stored as mean μ and log standard deviation ln(σ).
#[derive(Debug)]
pub struct GaussianQ {
    /// Variational mean μ
    mean: Var,
    /// Log standard deviation ln(σ)
    ln_std: Var,
}

impl GaussianQ {
    /// Create a new Gaussian variational distribution.
    ///
    /// # Arguments
    /// * `shape` - shape of the variable
    /// * `dtype` - element type (F32 or F64)
    /// * `device` - where the parameters live
    ///
    /// # Returns
    /// Initialized GaussianQ with small random mean and ln_std = 0 (std = 1)
    pub fn new<S: Into<Shape>>(shape: S, dtype: DType, device: &Device) -> Result<Self> {
        let shape = shape.into();
        let mean = Tensor::randn(0f32, 0.01f32, shape.clone(), device)?.to_dtype(dtype)?;
        let ln_std = Tensor::zeros(shape, dtype, device)?;
        Ok(Self {
            mean: Var::from_tensor(&mean)?,
            ln_std: Var::from_tensor(&ln_std)?,
        })
    }

    /// Create a Gaussian variational distribution centered at `mean`
    /// with a constant standard deviation `std` for every element.
    pub fn with_init(mean: &Tensor, std: f64) -> Result<Self> {
        let ln_std = (mean.ones_like()? * std.ln())?;
        Ok(Self {
            mean: Var::from_tensor(mean)?,
            ln_std: Var::from_tensor(&ln_std)?,
        })
    }

    /// Get the variational standard deviation σ = exp(ln_std).
    pub fn std(&self) -> Result<Tensor> {
        self.ln_std.exp()
    }

    /// Get the log standard deviation ln(σ).
    pub fn ln_std(&self) -> &Tensor {
        self.ln_std.as_tensor()
    }

    /// Get the device of the parameters.
    pub fn device(&self) -> &Device {
        self.mean.device()
    }
}

impl QDistribution for GaussianQ {
    fn output_shape(&self) -> Shape {
        self.mean.shape().clone()
    }

    fn dtype(&self) -> DType {
        self.mean.dtype()
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.mean.as_tensor().clone())
    }

    fn variance(&self) -> Result<Tensor> {
        // σ² = exp(2 * ln_std)
        (self.ln_std.as_tensor() * 2.0)?.exp()
    }

    /// Reparameterized draw: x = μ + σ * ε where ε ~ N(0, I)
    fn sample(&self) -> Result<Tensor> {
        let epsilon = Tensor::randn(0f32, 1f32, self.mean.shape(), self.device())?
            .to_dtype(self.mean.dtype())?;
        self.mean.as_tensor() + (epsilon * self.std()?)?
    }

    fn entropy(&self) -> Result<Tensor> {
        gaussian_entropy(self.ln_std.as_tensor())
    }

    /// Moves the mean to `value`, keeps ln_std
    fn initialize_to_value(&self, value: &Tensor) -> Result<()> {
        let value = value.to_dtype(self.mean.dtype())?;
        self.mean.set(&value)
    }

    fn vars(&self) -> Vec<Var> {
        vec![self.mean.clone(), self.ln_std.clone()]
    }
}
