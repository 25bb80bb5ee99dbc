use anyhow::{ensure, Result};
use candle_core::{DType, Shape, Tensor};
use candle_util::candle_dists::{gaussian_log_density, log_factorial};
use candle_util::qdist::QDistribution;
use rand::rngs::StdRng;

use crate::node::*;

/// Binary latent feature model
///
/// ```text
/// X = B G + ε,   ε ~ N(0, std²)
/// ```
///
/// * `B` - N x K binary feature memberships
/// * `G` - K x M real-valued feature values
/// * `std` - noise standard deviation
///
#[derive(Debug, Clone)]
pub struct NoisyLatentFeatures {
    /// Add ln(K!) to E[log p] for the K! equivalent feature orderings
    pub symmetry_correction: bool,
}

impl Default for NoisyLatentFeatures {
    fn default() -> Self {
        Self {
            symmetry_correction: true,
        }
    }
}

impl NoisyLatentFeatures {
    pub fn build<B, G, S>(self, b: B, g: G, std: S) -> NodeBuilder
    where
        B: Into<Input>,
        G: Into<Input>,
        S: Into<Input>,
    {
        NodeBuilder::new(self)
            .input("B", b)
            .input("G", g)
            .input("std", std)
    }
}

const INPUTS: &[InputSlot] = &[
    InputSlot::required("B"),
    InputSlot::required("G"),
    InputSlot::required("std"),
];

impl ConditionalDistribution for NoisyLatentFeatures {
    fn type_name(&self) -> &'static str {
        "NoisyLatentFeatures"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        INPUTS
    }

    fn compute_shape(&self, input_shapes: &Params<Shape>) -> Result<Shape> {
        let (n, k) = dims2(input_shapes, "B")?;
        let (k2, m) = dims2(input_shapes, "G")?;
        ensure!(k == k2, "inner dimensions differ: B is {}x{}, G is {}x{}", n, k, k2, m);
        Ok(Shape::from((n, m)))
    }

    /// B may be stored as any type; X follows G
    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType> {
        same_dtype(
            "NoisyLatentFeatures",
            &[*input_dtypes.get("G")?, *input_dtypes.get("std")?],
        )
    }

    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng) -> Result<Tensor> {
        let g = inputs.get("G")?.to_dtype(ctx.dtype)?;
        let b = inputs.get("B")?.to_dtype(ctx.dtype)?;
        let noise = gaussian_noise(rng, ctx.output_shape, inputs.get("std")?, ctx.dtype, ctx.device)?;
        Ok((b.matmul(&g)? + noise)?)
    }

    fn logp(&self, _ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        let g = inputs.get("G")?;
        let b = inputs.get("B")?.to_dtype(g.dtype())?;
        let var = inputs.get("std")?.sqr()?;
        Ok(gaussian_log_density(result, &b.matmul(g)?, &var)?.sum_all()?)
    }

    /// E_q[log N(X; B G, std²)] with q(B) Bernoulli(τ), q(G) N(μ, V):
    ///
    /// ```text
    /// E[X]   = τ μ
    /// Var[X] = τ V + (τ - τ²) μ²
    /// ```
    ///
    /// q(X) may itself carry variance, e.g. as an upward message.
    fn expected_logp(
        &self,
        _ctx: &NodeContext,
        q_result: &dyn QDistribution,
        q_inputs: &Params<SharedQ>,
    ) -> Result<Tensor> {
        let q_g = q_inputs.get("G")?;
        let std = q_inputs.get("std")?.sample()?;
        let var = q_result.variance()?.broadcast_add(&std.sqr()?)?;
        let x_means = q_result.mean()?;
        let tau = q_inputs.get("B")?.probs()?.to_dtype(x_means.dtype())?;

        let (mu, v) = (q_g.mean()?, q_g.variance()?);
        let expected_x = tau.matmul(&mu)?;
        let precisions = var.recip()?;
        let gaussian_lp = gaussian_log_density(&x_means, &expected_x, &var)?;

        let tau_v = tau.matmul(&v)?;
        let tau_tau2_mu2 = (&tau - tau.sqr()?)?.matmul(&mu.sqr()?)?;
        let lp_correction = (tau_v + tau_tau2_mu2)?.mul(&precisions)?;

        let pointwise = (gaussian_lp - (lp_correction * 0.5)?)?;
        Ok(pointwise.sum_all()?)
    }

    fn symmetry_correction(&self, ctx: &NodeContext) -> Result<f64> {
        if !self.symmetry_correction {
            return Ok(0.0);
        }
        Ok(log_factorial(ctx.input_dim("B", 1)?))
    }

    fn default_q(&self, ctx: &NodeContext) -> Result<SharedQ> {
        gaussian_default_q(ctx)
    }
}
