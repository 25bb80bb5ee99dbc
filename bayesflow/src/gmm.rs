use anyhow::{bail, Result};
use candle_core::{DType, Shape, Tensor};
use candle_util::candle_dists::{gaussian_log_density_std, log_factorial, log_sum_exp};
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand_distr::Distribution;

use crate::node::*;

/// Gaussian mixture with shared isotropic noise
///
/// ```text
/// z_i ~ Categorical(weights)
/// x_i ~ N(centers[z_i], std²)
/// ```
///
/// * `weights` - K cluster probabilities
/// * `centers` - K x D cluster means
/// * `std` - noise standard deviation
///
/// The number of draws N cannot be derived from the parameters; the
/// output shape (N, D) must be given explicitly.
#[derive(Debug, Clone)]
pub struct GMMClustering {
    /// Add ln(K!) to E[log p] for the K! equivalent cluster labelings
    pub symmetry_correction: bool,
}

impl Default for GMMClustering {
    fn default() -> Self {
        Self {
            symmetry_correction: true,
        }
    }
}

impl GMMClustering {
    pub fn build<W, C, S>(self, weights: W, centers: C, std: S) -> NodeBuilder
    where
        W: Into<Input>,
        C: Into<Input>,
        S: Into<Input>,
    {
        NodeBuilder::new(self)
            .input("weights", weights)
            .input("centers", centers)
            .input("std", std)
    }
}

const INPUTS: &[InputSlot] = &[
    InputSlot::required("weights"),
    InputSlot::required("centers"),
    InputSlot::required("std"),
];

impl ConditionalDistribution for GMMClustering {
    fn type_name(&self) -> &'static str {
        "GMMClustering"
    }

    fn inputs(&self) -> &'static [InputSlot] {
        INPUTS
    }

    fn compute_shape(&self, _input_shapes: &Params<Shape>) -> Result<Shape> {
        bail!("cannot infer shape for GMMClustering, must specify number of cluster draws")
    }

    fn compute_dtype(&self, input_dtypes: &Params<DType>) -> Result<DType> {
        same_dtype(
            "GMMClustering",
            &[*input_dtypes.get("centers")?, *input_dtypes.get("std")?],
        )
    }

    fn sample(&self, ctx: &NodeContext, inputs: &Params<Tensor>, rng: &mut StdRng) -> Result<Tensor> {
        let n = match ctx.output_shape.dims() {
            &[n, _] => n,
            other => bail!("{}: expected an N x D output, got shape {:?}", ctx.name, other),
        };
        let weights: Vec<f64> = inputs
            .get("weights")?
            .flatten_all()?
            .to_dtype(DType::F64)?
            .to_vec1()?;
        let centers = inputs.get("centers")?.to_dtype(ctx.dtype)?;

        let noise = gaussian_noise(rng, ctx.output_shape, inputs.get("std")?, ctx.dtype, ctx.device)?;

        let pick = WeightedIndex::new(&weights)?;
        let choices: Vec<u32> = (0..n).map(|_| pick.sample(rng) as u32).collect();
        let choices = Tensor::from_vec(choices, n, ctx.device)?;

        Ok((centers.index_select(&choices, 0)? + noise)?)
    }

    /// Σ_i log Σ_k w_k N(x_i; c_k, std²), stable for well-separated clusters
    fn logp(&self, _ctx: &NodeContext, result: &Tensor, inputs: &Params<Tensor>) -> Result<Tensor> {
        let weights = inputs.get("weights")?.flatten_all()?.to_dtype(result.dtype())?;
        let centers = inputs.get("centers")?;
        let std = inputs.get("std")?;

        let n_clusters = centers.dim(0)?;
        let log_weights = weights.log()?;
        let mut cluster_logps = Vec::with_capacity(n_clusters);
        for k in 0..n_clusters {
            // log-likelihood of every point under this cluster alone
            let cluster_ll = gaussian_log_density_std(result, &centers.get(k)?, std)?.sum(1)?;
            cluster_logps.push(cluster_ll.broadcast_add(&log_weights.get(k)?)?);
        }

        let cluster_logps = Tensor::stack(&cluster_logps, 1)?;
        Ok(log_sum_exp(&cluster_logps, 1)?.sum_all()?)
    }

    fn symmetry_correction(&self, ctx: &NodeContext) -> Result<f64> {
        if !self.symmetry_correction {
            return Ok(0.0);
        }
        Ok(log_factorial(ctx.input_dim("centers", 0)?))
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

    fn two_clusters(dev: &Device) -> Result<(Tensor, Tensor)> {
        let weights = Tensor::from_vec(vec![0.5f64, 0.5], 2, dev)?;
        let centers = Tensor::from_vec(vec![0f64, 0., 10., 10.], (2, 2), dev)?;
        Ok((weights, centers))
    }

    #[test]
    fn test_shape_must_be_given() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
        let (weights, centers) = two_clusters(&dev)?;
        let missing = GMMClustering::default().build(&weights, &centers, 0.1);
        assert!(net.add(missing).is_err());
        assert!(net.is_empty());

        let x = net.add(
            GMMClustering::default()
                .build(&weights, &centers, 0.1)
                .shape((20, 2)),
        )?;
        assert_eq!(net.sample(x, 5)?.dims(), &[20, 2]);
        Ok(())
    }

    #[test]
    fn test_samples_near_a_center() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
        let (weights, centers) = two_clusters(&dev)?;
        let x = net.add(
            GMMClustering::default()
                .build(&weights, &centers, 0.01)
                .shape((50, 2)),
        )?;
        for row in net.sample(x, 1)?.to_vec2::<f64>()? {
            let near_origin = row.iter().all(|v| v.abs() < 0.1);
            let near_far = row.iter().all(|v| (v - 10.0).abs() < 0.1);
            assert!(near_origin || near_far, "{:?}", row);
        }
        Ok(())
    }

    #[test]
    fn test_logp_dominated_by_near_cluster() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
        let (weights, centers) = two_clusters(&dev)?;
        let std = Tensor::new(0.1f64, &dev)?;
        let x = net.add(
            GMMClustering::default()
                .build(&weights, &centers, &std)
                .shape((1, 2)),
        )?;

        let mut inputs = Params::new();
        inputs.insert("weights", weights);
        inputs.insert("centers", centers);
        inputs.insert("std", std);

        let point = Tensor::zeros((1, 2), DType::F64, &dev)?;
        let lp = net.logp(x, &point, &inputs)?.to_scalar::<f64>()?;
        let near = 0.5f64.ln() + 2.0 * (-0.5 * LN_2PI - 0.1f64.ln());
        assert_abs_diff_eq!(lp, near, epsilon = 1e-9);

        // far from both clusters: no underflow to -inf
        let far = Tensor::from_vec(vec![1000f64, -1000.], (1, 2), &dev)?;
        assert!(net.logp(x, &far, &inputs)?.to_scalar::<f64>()?.is_finite());
        Ok(())
    }

    #[test]
    fn test_permutation_correction() -> Result<()> {
        let dev = Device::Cpu;
        let mut net = BayesNet::new(dev.clone()).with_default_dtype(DType::F64);
        let weights = Tensor::from_vec(vec![0.2f64, 0.3, 0.5], 3, &dev)?;
        let centers = Tensor::zeros((3, 2), DType::F64, &dev)?;
        let x = net.add(GMMClustering::default().build(&weights, &centers, 1.0).shape((4, 2)))?;
        let y = net.add(
            GMMClustering {
                symmetry_correction: false,
            }
            .build(&weights, &centers, 1.0)
            .shape((4, 2)),
        )?;
        let value = Tensor::zeros((4, 2), DType::F64, &dev)?;
        net.observe(x, value.clone())?;
        net.observe(y, value)?;

        // observed inputs and result: the Monte Carlo term is deterministic
        let (with, _) = net.elbo_term(x)?;
        let (without, _) = net.elbo_term(y)?;
        assert_abs_diff_eq!(
            with.to_scalar::<f64>()? - without.to_scalar::<f64>()?,
            6f64.ln(),
            epsilon = 1e-9
        );
        Ok(())
    }
}
