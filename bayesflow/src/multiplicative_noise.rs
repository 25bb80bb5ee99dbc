use anyhow::Result;
use candle_core::{DType, Shape, Tensor};
use candle_util::candle_dists::gaussian_log_density_std;
use rand::rngs::StdRng;

use crate::node::*;

/// Elementwise multiplicative noise
///
/// ```text
/// X = A ⊙ ε,   ε ~ N(0, std²)
/// ```
///
/// `logp` scores the implied noise `X / A` under N(0, std²). Note that
/// with zero-mean ε the draws do not center on A; a model centered on A
/// would be `A ⊙ (1 + ε)`.
#[derive(Debug, Clone, Default)]
pub struct MultiplicativeGaussianNoise;

impl MultiplicativeGaussianNoise {
    pub fn build<A, S>(self, a: A, std: S) -> NodeBuilder
    where
        A: Into<Input>,
        S: Into<Input>,
    {
        NodeBuilder::new(self).input("A", a).input("std", std)
    }
}

const INPUTS: &[InputSlot] = &[InputSlot::required("A"), InputSlot::required("std")];

impl ConditionalDistribution for MultiplicativeGaussianNoise {
    fn type_name(&self) -> &'static str {
        "MultiplicativeGaussianNoise"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        INPUTS
    }

    fn compute_shape(&self, input_shapes: &Params<Shape>) -> Result<Shape> {
        Ok(input_shapes.get("A")?.clone())
    }

    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType> {
        same_dtype(
            "MultiplicativeGaussianNoise",
            &[*input_dtypes.get("A")?, *input_dtypes.get("std")?],
        )
    }

    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng) -> Result<Tensor> {
        let a = inputs.get("A")?.to_dtype(ctx.dtype)?;
        let noise = gaussian_noise(rng, ctx.output_shape, inputs.get("std")?, ctx.dtype, ctx.device)?;
        Ok(a.broadcast_mul(&noise)?)
    }

    fn logp(&self, _ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        let residuals = result.broadcast_div(inputs.get("A")?)?;
        let zero = residuals.zeros_like()?;
        Ok(gaussian_log_density_std(&residuals, &zero, inputs.get("std")?)?.sum_all()?)
    }

    fn default_q(&self, ctx: &NodeContext) -> Result<SharedQ> {
        gaussian_default_q(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BayesNet;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_util::candle_dists::LN_2PI;

    #[test]
    fn test_logp_scores_implied_noise() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
        let a = Tensor::from_vec(vec![2f64, -4.], 2, &dev)?;
        let x = net.add(MultiplicativeGaussianNoise.build(&a, 1.0))?;
        assert_eq!(net.output_shape(x)?.dims(), &[2]);

        // X = A ⊙ [0.5, 0.5]
        let value = Tensor::from_vec(vec![1f64, -2.], 2, &dev)?;
        let mut inputs = Params::new();
        inputs.insert("A", a);
        inputs.insert("std", Tensor::new(1f64, &dev)?);
        let lp = net.logp(x, &value, &inputs)?.to_scalar::<f64>()?;
        assert_abs_diff_eq!(lp, 2.0 * (-0.5 * LN_2PI - 0.125), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_sample_scales_with_a() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
        let a = Tensor::zeros(5, DType::F64, &dev)?;
        let x = net.add(MultiplicativeGaussianNoise.build(&a, 3.0))?;
        assert_eq!(net.sample(x, 2)?.to_vec1::<f64>()?, vec![0.0; 5]);
        Ok(())
    }
}
