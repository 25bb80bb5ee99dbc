use candle_core::{DType, Device, Result, Shape, Tensor, Var};

use super::traits::QDistribution;
use crate::candle_dists::bernoulli_entropy;

/// Logit magnitude used when pinning a posterior to a 0/1 value
const INIT_LOGIT: f64 = 5.0;

/// Independent Bernoulli variational distribution q(b) = Bern(sigmoid(logits))
#[derive(Debug)]
pub struct BernoulliQ {
    /// Logits, same shape as the variable
    logits: Var,
}

impl BernoulliQ {
    /// Logits start at zero (p = 0.5 everywhere)
    pub fn new<S: Into<Shape>>(shape: S, dtype: DType, device: &Device) -> Result<Self> {
        let logits = Tensor::zeros(shape, dtype, device)?;
        Ok(Self {
            logits: Var::from_tensor(&logits)?,
        })
    }

    pub fn logits(&self) -> &Tensor {
        self.logits.as_tensor()
    }
}

impl QDistribution for BernoulliQ {
    fn output_shape(&self) -> Shape {
        self.logits.shape().clone()
    }

    fn dtype(&self) -> DType {
        self.logits.dtype()
    }

    fn mean(&self) -> Result<Tensor> {
        self.probs()
    }

    /// p (1 - p)
    fn variance(&self) -> Result<Tensor> {
        let p = self.probs()?;
        let q = (1.0 - &p)?;
        p * q
    }

    /// Hard 0/1 draw; no gradient flows through it
    fn sample(&self) -> Result<Tensor> {
        let p = self.probs()?.detach();
        let u = Tensor::rand(0f32, 1f32, p.shape(), p.device())?.to_dtype(p.dtype())?;
        u.lt(&p)?.to_dtype(p.dtype())
    }

    fn entropy(&self) -> Result<Tensor> {
        bernoulli_entropy(&self.probs()?)
    }

    fn probs(&self) -> Result<Tensor> {
        candle_nn::ops::sigmoid(self.logits.as_tensor())
    }

    /// Pins the logits to ±5 according to a 0/1 value
    fn initialize_to_value(&self, value: &Tensor) -> Result<()> {
        let value = value.to_dtype(self.logits.dtype())?;
        let logits = ((value * (2.0 * INIT_LOGIT))? - INIT_LOGIT)?;
        self.logits.set(&logits)
    }

    fn vars(&self) -> Vec<Var> {
        vec![self.logits.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_uniform_start() -> Result<()> {
        let q = BernoulliQ::new((3, 2), DType::F64, &Device::Cpu)?;
        for row in q.probs()?.to_vec2::<f64>()? {
            for p in row {
                assert_abs_diff_eq!(p, 0.5, epsilon = 1e-12);
            }
        }
        let v: f64 = q.variance()?.sum_all()?.to_scalar()?;
        assert_abs_diff_eq!(v, 6.0 * 0.25, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_sample_is_binary() -> Result<()> {
        let q = BernoulliQ::new((4, 4), DType::F32, &Device::Cpu)?;
        for row in q.sample()?.to_vec2::<f32>()? {
            for b in row {
                assert!(b == 0.0 || b == 1.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_initialize_to_value() -> Result<()> {
        let dev = Device::Cpu;
        let q = BernoulliQ::new(2, DType::F64, &dev)?;
        q.initialize_to_value(&Tensor::from_vec(vec![1f64, 0.], 2, &dev)?)?;
        let p = q.probs()?.to_vec1::<f64>()?;
        assert!(p[0] > 0.99 && p[1] < 0.01);
        Ok(())
    }
}
