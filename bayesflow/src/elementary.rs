//! Elementary priors used to build up larger models.

use anyhow::Result;
use candle_core::{DType, Shape, Tensor};
use candle_util::candle_dists::{gaussian_log_density, gaussian_log_density_std};
use candle_util::qdist::{BernoulliQ, QDistribution};
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;

use crate::node::*;

/// Elementwise Gaussian `x ~ N(mean, std²)`
#[derive(Debug, Clone, Default)]
pub struct Gaussian;

impl Gaussian {
    pub fn build<M, S>(self, mean: M, std: S) -> NodeBuilder
    where
        M: Into<Input>,
        S: Into<Input>,
    {
        NodeBuilder::new(self).input("mean", mean).input("std", std)
    }
}

const GAUSSIAN_INPUTS: &[InputSlot] = &[InputSlot::required("mean"), InputSlot::required("std")];

impl ConditionalDistribution for Gaussian {
    fn type_name(&self) -> &'static str {
        "Gaussian"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        GAUSSIAN_INPUTS
    }

    fn compute_shape(&self, input_shapes: &Params<Shape>) -> Result<Shape> {
        let mean = input_shapes.get("mean")?;
        let std = input_shapes.get("std")?;
        Ok(mean.broadcast_shape_binary_op(std, "gaussian")?)
    }

    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType> {
        same_dtype(
            "Gaussian",
            &[*input_dtypes.get("mean")?, *input_dtypes.get("std")?],
        )
    }

    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng) -> Result<Tensor> {
        let mean = inputs.get("mean")?.to_dtype(ctx.dtype)?;
        let noise = gaussian_noise(rng, ctx.output_shape, inputs.get("std")?, ctx.dtype, ctx.device)?;
        Ok(mean.broadcast_add(&noise)?)
    }

    fn logp(&self, _ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        let lp = gaussian_log_density_std(result, inputs.get("mean")?, inputs.get("std")?)?;
        Ok(lp.sum_all()?)
    }

    /// Σ [log N(E x; E μ, σ²) - (Var x + Var μ) / 2σ²]
    fn expected_logp(
        &self,
        _ctx: &NodeContext,
        q_result: &dyn QDistribution,
        q_inputs: &Params<SharedQ>,
    ) -> Result<Tensor> {
        let q_mean = q_inputs.get("mean")?;
        let var = q_inputs.get("std")?.sample()?.sqr()?;
        let x = q_result.mean()?;

        let gaussian_lp = gaussian_log_density(&x, &q_mean.mean()?, &var)?;
        let spread = q_result
            .variance()?
            .broadcast_add(&q_mean.variance()?)?
            .broadcast_div(&var)?;

        Ok((gaussian_lp.sum_all()? - (spread.sum_all()? * 0.5)?)?)
    }

    fn default_q(&self, ctx: &NodeContext) -> Result<SharedQ> {
        gaussian_default_q(ctx)
    }
}

/// Independent binary entries `b ~ Bernoulli(p)`
#[derive(Debug, Clone, Default)]
pub struct BernoulliMatrix;

impl BernoulliMatrix {
    pub fn build<P: Into<Input>>(self, p: P) -> NodeBuilder {
        NodeBuilder::new(self).input("p", p)
    }
}

const BERNOULLI_INPUTS: &[InputSlot] = &[InputSlot::required("p")];

/// Σ [x ln p + (1 - x) ln(1 - p)]
fn bernoulli_log_density(x: &Tensor, p: &Tensor) -> Result<Tensor> {
    let eps = 1e-6;
    let p = p.to_dtype(x.dtype())?.clamp(eps, 1.0 - eps)?;
    let on = x.broadcast_mul(&p.log()?)?;
    let off = (1.0 - x)?.broadcast_mul(&(1.0 - &p)?.log()?)?;
    Ok((on + off)?.sum_all()?)
}

impl ConditionalDistribution for BernoulliMatrix {
    fn type_name(&self) -> &'static str {
        "BernoulliMatrix"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        BERNOULLI_INPUTS
    }

    fn compute_shape(&self, input_shapes: &Params<Shape>) -> Result<Shape> {
        Ok(input_shapes.get("p")?.clone())
    }

    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType> {
        Ok(*input_dtypes.get("p")?)
    }

    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng) -> Result<Tensor> {
        let p: Vec<f64> = inputs
            .get("p")?
            .broadcast_as(ctx.output_shape)?
            .flatten_all()?
            .to_dtype(DType::F64)?
            .to_vec1()?;
        let draws: Vec<f64> = p
            .iter()
            .map(|&p| if rng.random::<f64>() < p { 1.0 } else { 0.0 })
            .collect();
        Ok(Tensor::from_vec(draws, ctx.output_shape.clone(), ctx.device)?.to_dtype(ctx.dtype)?)
    }

    fn logp(&self, _ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        bernoulli_log_density(result, inputs.get("p")?)
    }

    /// Σ [E x ln p + (1 - E x) ln(1 - p)], p drawn from its posterior
    fn expected_logp(
        &self,
        _ctx: &NodeContext,
        q_result: &dyn QDistribution,
        q_inputs: &Params<SharedQ>,
    ) -> Result<Tensor> {
        let p = q_inputs.get("p")?.sample()?;
        bernoulli_log_density(&q_result.mean()?, &p)
    }

    fn default_q(&self, ctx: &NodeContext) -> Result<SharedQ> {
        Ok(Arc::new(BernoulliQ::new(
            ctx.output_shape.clone(),
            ctx.dtype,
            ctx.device,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BayesNet;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_util::candle_dists::LN_2PI;
    use candle_util::qdist::GaussianQ;

    #[test]
    fn test_gaussian_shape_broadcast() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone());
        let mean = Tensor::zeros((3, 4), DType::F32, &dev)?;
        let x = net.add(Gaussian.build(mean, 1.0))?;
        assert_eq!(net.output_shape(x)?.dims(), &[3, 4]);
        assert_eq!(net.sample(x, 0)?.dims(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn test_gaussian_expected_logp() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
        let x = net.add(Gaussian.build(0.0, 1.0).shape(3))?;
        let zeros = Tensor::zeros(3, DType::F64, &dev)?;
        net.attach_q(x, Arc::new(GaussianQ::with_init(&zeros, 2.0)?))?;

        let (lp, h) = net.elbo_term(x)?;
        // E[log N(x; 0, 1)] for x ~ N(0, 4)
        assert_abs_diff_eq!(lp.to_scalar::<f64>()?, 3.0 * (-0.5 * LN_2PI - 2.0), epsilon = 1e-9);
        assert_abs_diff_eq!(
            h.to_scalar::<f64>()?,
            3.0 * (2f64.ln() + 0.5 * (1.0 + LN_2PI)),
            epsilon = 1e-9
        );
        Ok(())
    }

    #[test]
    fn test_bernoulli_samples_and_default_q() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone());
        let p = Tensor::from_vec(vec![0f32, 1., 0., 1.], (2, 2), &dev)?;
        let b = net.add(BernoulliMatrix.build(&p))?;
        assert_eq!(net.sample(b, 9)?.to_vec2::<f32>()?, p.to_vec2::<f32>()?);

        let q = net.q_distribution(b)?;
        assert_eq!(q.probs()?.dims(), &[2, 2]);
        Ok(())
    }
}
