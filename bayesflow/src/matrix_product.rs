use anyhow::{ensure, Result};
use candle_core::{DType, Shape, Tensor};
use candle_util::candle_dists::{gaussian_log_density, log_factorial};
use candle_util::qdist::QDistribution;
use rand::rngs::StdRng;

use crate::node::*;

/// Low-rank matrix factorization with Gaussian noise
///
/// ```text
/// X = A Bᵗ [/ K] + ε,   ε ~ N(0, std²)
/// ```
///
/// * `A` - N x K
/// * `B` - M x K
/// * `std` - noise standard deviation (broadcast against N x M)
///
/// With `rescale`, the product is divided by K so the marginal variance
/// of X matches that of the inputs.
#[derive(Debug, Clone)]
pub struct NoisyGaussianMatrixProduct {
    pub rescale: bool,
    /// Add ln(K!) + K ln 2 to E[log p] for the K! 2^K equivalent
    /// column permutations and sign flips
    pub symmetry_correction: bool,
}

impl Default for NoisyGaussianMatrixProduct {
    fn default() -> Self {
        Self {
            rescale: true,
            symmetry_correction: true,
        }
    }
}

impl NoisyGaussianMatrixProduct {
    pub fn build<A, B, S>(self, a: A, b: B, std: S) -> NodeBuilder
    where
        A: Into<Input>,
        B: Into<Input>,
        S: Into<Input>,
    {
        NodeBuilder::new(self)
            .input("A", a)
            .input("B", b)
            .input("std", std)
    }
}

const INPUTS: &[InputSlot] = &[
    InputSlot::required("A"),
    InputSlot::required("B"),
    InputSlot::required("std"),
];

impl ConditionalDistribution for NoisyGaussianMatrixProduct {
    fn type_name(&self) -> &'static str {
        "NoisyGaussianMatrixProduct"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        INPUTS
    }

    fn compute_shape(&self, input_shapes: &Params<Shape>) -> Result<Shape> {
        let (n, k) = dims2(input_shapes, "A")?;
        let (m, k2) = dims2(input_shapes, "B")?;
        ensure!(k == k2, "inner dimensions differ: A is {}x{}, B is {}x{}", n, k, m, k2);
        Ok(Shape::from((n, m)))
    }

    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType> {
        same_dtype(
            "NoisyGaussianMatrixProduct",
            &[
                *input_dtypes.get("A")?,
                *input_dtypes.get("B")?,
                *input_dtypes.get("std")?,
            ],
        )
    }

    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng) -> Result<Tensor> {
        let a = inputs.get("A")?;
        let b = inputs.get("B")?;
        let std = inputs.get("std")?;

        let noise = gaussian_noise(rng, ctx.output_shape, std, ctx.dtype, ctx.device)?;
        let mut prod = matmul_t(a, b)?.to_dtype(ctx.dtype)?;
        if self.rescale {
            prod = (prod / ctx.input_dim("A", 1)? as f64)?;
        }
        Ok((prod + noise)?)
    }

    fn logp(&self, ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        let std = inputs.get("std")?;
        let mut prod = matmul_t(inputs.get("A")?, inputs.get("B")?)?;
        if self.rescale {
            prod = (prod / ctx.input_dim("A", 1)? as f64)?;
        }
        let var = std.sqr()?;
        Ok(gaussian_log_density(result, &prod, &var)?.sum_all()?)
    }

    /// E_q[log N(X; A Bᵗ, std²)]
    ///
    /// The Gaussian density at the posterior means, minus half the
    /// posterior variance of each product entry over the noise variance:
    ///
    /// ```text
    /// Var[Σ_k a_k b_k] = Σ_k vA vB + vA mB² + mA² vB
    /// ```
    fn expected_logp(
        &self,
        ctx: &NodeContext,
        q_result: &dyn QDistribution,
        q_inputs: &Params<SharedQ>,
    ) -> Result<Tensor> {
        let q_a = q_inputs.get("A")?;
        let q_b = q_inputs.get("B")?;
        let std = q_inputs.get("std")?.sample()?;
        let var = q_result.variance()?.broadcast_add(&std.sqr()?)?;

        let (m_a, v_a) = (q_a.mean()?, q_a.variance()?);
        let (m_b, v_b) = (q_b.mean()?, q_b.variance()?);
        let k = ctx.input_dim("A", 1)? as f64;

        let mut expected_result = matmul_t(&m_a, &m_b)?;
        if self.rescale {
            expected_result = (expected_result / k)?;
        }

        let gaussian_lp = gaussian_log_density(&q_result.mean()?, &expected_result, &var)?.sum_all()?;

        let va_vb = matmul_t(&v_a, &v_b)?;
        let va_mb = matmul_t(&v_a, &m_b.sqr()?)?;
        let ma_vb = matmul_t(&m_a.sqr()?, &v_b)?;
        let mut correction = ((va_vb + va_mb)? + ma_vb)?.div(&var)?.sum_all()?;
        if self.rescale {
            // rescaling the product by 1/K is rescaling each input by
            // 1/sqrt(K): every variance product term scales by 1/K²
            correction = (correction / (k * k))?;
        }

        Ok((gaussian_lp - (correction * 0.5)?)?)
    }

    fn symmetry_correction(&self, ctx: &NodeContext) -> Result<f64> {
        if !self.symmetry_correction {
            return Ok(0.0);
        }
        let k = ctx.input_dim("A", 1)?;
        let permutation = log_factorial(k);
        let signflip = k as f64 * std::f64::consts::LN_2;
        Ok(permutation + signflip)
    }

    fn default_q(&self, ctx: &NodeContext) -> Result<SharedQ> {
        gaussian_default_q(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BayesNet;
    use crate::flat::FlatDistribution;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_util::qdist::GaussianQ;
    use std::sync::Arc;

    #[test]
    fn test_shape_inference() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone());
        let a = Tensor::zeros((5, 3), DType::F32, &dev)?;
        let b = Tensor::zeros((4, 3), DType::F32, &dev)?;
        let x = net.add(NoisyGaussianMatrixProduct::default().build(&a, &b, 0.1))?;
        assert_eq!(net.output_shape(x)?.dims(), &[5, 4]);

        let c = Tensor::zeros((4, 2), DType::F32, &dev)?;
        let n_before = net.len();
        assert!(net
            .add(NoisyGaussianMatrixProduct::default().build(&a, &c, 0.1))
            .is_err());
        assert_eq!(net.len(), n_before);
        Ok(())
    }

    #[test]
    fn test_rescaled_sample_without_noise() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone());
        let a = Tensor::ones((2, 3), DType::F32, &dev)?;
        let b = Tensor::ones((2, 3), DType::F32, &dev)?;
        let x = net.add(NoisyGaussianMatrixProduct::default().build(&a, &b, 0.0))?;
        let value = net.sample(x, 0)?;
        for row in value.to_vec2::<f32>()? {
            for v in row {
                assert_abs_diff_eq!(v, 1.0, epsilon = 1e-6);
            }
        }
        Ok(())
    }

    /// With point-mass inputs, only the variance correction distinguishes
    /// the rescaled and raw products; it must shrink by K².
    #[test]
    fn test_rescale_correction() -> Result<()> {
        let dev = Device::Cpu;
        let k = 3;
        let correction_of = |rescale: bool| -> Result<f64> {
            let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
            let a = net.add(
                FlatDistribution::new(Tensor::zeros((2, k), DType::F64, &dev)?, false).build(),
            )?;
            let b = net.add(
                FlatDistribution::new(Tensor::zeros((2, k), DType::F64, &dev)?, false).build(),
            )?;
            let ones = Tensor::ones((2, k), DType::F64, &dev)?;
            net.attach_q(a, Arc::new(GaussianQ::with_init(&ones, 1.0)?))?;
            net.attach_q(b, Arc::new(GaussianQ::with_init(&ones, 1.0)?))?;
            let node = NoisyGaussianMatrixProduct {
                rescale,
                symmetry_correction: false,
            };
            let x = net.add(node.build(a, b, 1.0))?;
            let expected = if rescale { 1.0 } else { k as f64 };
            net.observe(x, (Tensor::ones((2, 2), DType::F64, &dev)? * expected)?)?;

            // Gaussian part: mean matches exactly, so only -0.5 ln 2π per entry
            let (lp, _) = net.elbo_term(x)?;
            let lp = lp.to_scalar::<f64>()?;
            let gaussian = -0.5 * candle_util::candle_dists::LN_2PI * 4.0;
            Ok(-2.0 * (lp - gaussian))
        };

        let raw = correction_of(false)?;
        let rescaled = correction_of(true)?;
        // each entry: Σ_k (1·1 + 1·1 + 1·1) = 3K
        assert_abs_diff_eq!(raw, 4.0 * 3.0 * k as f64, epsilon = 1e-9);
        assert_abs_diff_eq!(rescaled, raw / (k * k) as f64, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_symmetry_correction() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone());
        let a = Tensor::zeros((5, 4), DType::F32, &dev)?;
        let b = Tensor::zeros((6, 4), DType::F32, &dev)?;
        let x = net.add(NoisyGaussianMatrixProduct::default().build(&a, &b, 1.0))?;
        let y = net.add(
            NoisyGaussianMatrixProduct {
                symmetry_correction: false,
                ..Default::default()
            }
            .build(&a, &b, 1.0),
        )?;
        let value = Tensor::zeros((5, 6), DType::F32, &dev)?;
        net.observe(x, value.clone())?;
        net.observe(y, value)?;

        let (with, _) = net.elbo_term(x)?;
        let (without, _) = net.elbo_term(y)?;
        let diff = (with.to_scalar::<f32>()? - without.to_scalar::<f32>()?) as f64;
        assert_abs_diff_eq!(diff, 24f64.ln() + 4.0 * 2f64.ln(), epsilon = 1e-3);
        Ok(())
    }
}
