use anyhow::{bail, Result};
use candle_core::{DType, Shape, Tensor};
use candle_util::candle_dists::gaussian_log_density;
use candle_util::qdist::QDistribution;
use rand::rngs::StdRng;

use crate::node::*;

/// Random walk observed with Gaussian noise
///
/// ```text
/// X = cumsum(A, axis=0) + ε,   ε ~ N(0, std²)
/// ```
#[derive(Debug, Clone, Default)]
pub struct NoisyCumulativeSum;

impl NoisyCumulativeSum {
    pub fn build<A, S>(self, a: A, std: S) -> NodeBuilder
    where
        A: Into<Input>,
        S: Into<Input>,
    {
        NodeBuilder::new(self).input("A", a).input("std", std)
    }
}

const INPUTS: &[InputSlot] = &[InputSlot::required("A"), InputSlot::required("std")];

/// Lower-triangular ones: `L · A` is the cumulative sum of A's rows
fn cumsum_operator(ctx: &NodeContext) -> Result<Tensor> {
    let n = match ctx.output_shape.dims() {
        &[n, _] => n,
        other => bail!("{}: expected a matrix output, got shape {:?}", ctx.name, other),
    };
    Ok(Tensor::tril2(n, ctx.dtype, ctx.device)?)
}

impl ConditionalDistribution for NoisyCumulativeSum {
    fn type_name(&self) -> &'static str {
        "NoisyCumulativeSum"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        INPUTS
    }

    fn compute_shape(&self, input_shapes: &Params<Shape>) -> Result<Shape> {
        Ok(input_shapes.get("A")?.clone())
    }

    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType> {
        same_dtype(
            "NoisyCumulativeSum",
            &[*input_dtypes.get("A")?, *input_dtypes.get("std")?],
        )
    }

    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng) -> Result<Tensor> {
        let a = inputs.get("A")?.to_dtype(ctx.dtype)?;
        let noise = gaussian_noise(rng, ctx.output_shape, inputs.get("std")?, ctx.dtype, ctx.device)?;
        Ok((a.cumsum(0)? + noise)?)
    }

    fn logp(&self, ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        let cumsum_mat = cumsum_operator(ctx)?;
        let expected_x = cumsum_mat.matmul(inputs.get("A")?)?;
        let var = inputs.get("std")?.sqr()?;
        Ok(gaussian_log_density(result, &expected_x, &var)?.sum_all()?)
    }

    /// E_q[log N(X; L A, std²)] with L the cumulative-sum operator.
    ///
    /// Row i of X accumulates the posterior variance of rows 0..=i of A,
    /// so each vA[j] is weighted by Σ_{i>=j} 1/var[i], a reverse
    /// cumulative sum of precisions.
    fn expected_logp(
        &self,
        ctx: &NodeContext,
        q_result: &dyn QDistribution,
        q_inputs: &Params<SharedQ>,
    ) -> Result<Tensor> {
        let q_a = q_inputs.get("A")?;
        let std = q_inputs.get("std")?.sample()?;
        let var = q_result.variance()?.broadcast_add(&std.sqr()?)?;
        let x = q_result.mean()?;

        let cumsum_mat = cumsum_operator(ctx)?;
        let expected_x = cumsum_mat.matmul(&q_a.mean()?)?;
        let gaussian_lp = gaussian_log_density(&x, &expected_x, &var)?.sum_all()?;

        let reverse_precision = cumsum_mat.t()?.contiguous()?.matmul(&var.recip()?)?;
        let corrections = (reverse_precision.mul(&q_a.variance()?)? * (-0.5))?;

        Ok((gaussian_lp + corrections.sum_all()?)?)
    }

    fn default_q(&self, ctx: &NodeContext) -> Result<SharedQ> {
        gaussian_default_q(ctx)
    }
}
