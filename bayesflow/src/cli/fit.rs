use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use clap::{Args, ValueEnum};
use log::info;

use crate::cumulative_sum::NoisyCumulativeSum;
use crate::elementary::{BernoulliMatrix, Gaussian};
use crate::gmm::GMMClustering;
use crate::graph::BayesNet;
use crate::inference::{fit, FitOptions};
use crate::latent_features::NoisyLatentFeatures;
use crate::matrix_product::NoisyGaussianMatrixProduct;
use crate::node::NodeId;

#[derive(Clone, Debug, ValueEnum)]
pub enum ModelType {
    /// X = A Bᵗ / K + noise
    MatrixProduct,
    /// X = cumsum(A) + noise
    Cumsum,
    /// X = B G + noise with binary B
    LatentFeatures,
    /// rows drawn from a K-component Gaussian mixture
    Gmm,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(short, long, default_value = "matrix-product")]
    pub model: ModelType,

    #[arg(long, default_value = "100", help = "Number of rows of the data matrix")]
    pub rows: usize,

    #[arg(long, default_value = "20", help = "Number of columns of the data matrix")]
    pub cols: usize,

    #[arg(short = 'k', long, default_value = "3", help = "Latent rank / number of features or clusters")]
    pub rank: usize,

    #[arg(long, default_value = "0.1", help = "Noise standard deviation")]
    pub std: f64,

    #[arg(long, default_value = "1000")]
    pub steps: usize,

    #[arg(long, default_value = "0.01")]
    pub lr: f64,

    #[arg(long, default_value = "1", help = "Monte Carlo draws per ELBO estimate")]
    pub samples: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, help = "Start the posteriors at the simulated values")]
    pub init_true: bool,

    #[arg(long, default_value = "100")]
    pub print_interval: usize,

    #[arg(long)]
    pub gpu: bool,
}

/// Wire up the generative model and return its data node
fn build_model(net: &mut BayesNet, args: &FitArgs) -> Result<NodeId> {
    let (n, m, k) = (args.rows, args.cols, args.rank);
    let x = match args.model {
        ModelType::MatrixProduct => {
            let a = net.add(Gaussian.build(0.0, 1.0).shape((n, k)).name("A"))?;
            let b = net.add(Gaussian.build(0.0, 1.0).shape((m, k)).name("B"))?;
            net.add(
                NoisyGaussianMatrixProduct::default()
                    .build(a, b, args.std)
                    .name("X"),
            )?
        }
        ModelType::Cumsum => {
            let a = net.add(Gaussian.build(0.0, 1.0).shape((n, m)).name("A"))?;
            net.add(NoisyCumulativeSum.build(a, args.std).name("X"))?
        }
        ModelType::LatentFeatures => {
            let p = Tensor::full(0.5f32, (n, k), net.device())?;
            let b = net.add(BernoulliMatrix.build(p).name("B"))?;
            let g = net.add(Gaussian.build(0.0, 1.0).shape((k, m)).name("G"))?;
            net.add(
                NoisyLatentFeatures::default()
                    .build(b, g, args.std)
                    .name("X"),
            )?
        }
        ModelType::Gmm => {
            let weights = Tensor::full(1.0 / k as f32, k, net.device())?;
            let centers = net.add(Gaussian.build(0.0, 5.0).shape((k, m)).name("centers"))?;
            net.add(
                GMMClustering::default()
                    .build(weights, centers, args.std)
                    .shape((n, m))
                    .name("X"),
            )?
        }
    };
    Ok(x)
}

pub fn run(args: &FitArgs) -> Result<()> {
    let device = if args.gpu {
        #[cfg(target_os = "macos")]
        {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        }
        #[cfg(target_os = "linux")]
        {
            Device::new_cuda(0).unwrap_or(Device::Cpu)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Device::Cpu
        }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);

    let mut net = BayesNet::new(device).with_default_dtype(DType::F32);
    let x = build_model(&mut net, args)?;
    info!("Model {:?}: {} nodes, X {:?}", args.model, net.len(), net.output_shape(x)?);

    let data = net.sample(x, args.seed)?;
    net.observe(x, data)?;

    if args.init_true {
        net.init_q_true(x)?;
    }

    let options = FitOptions {
        learning_rate: args.lr,
        num_steps: args.steps,
        num_samples: args.samples,
        print_interval: args.print_interval,
    };
    let summary = fit(&mut net, x, &options)?;

    println!(
        "ELBO after {} steps: {:.4} (E[log p] = {:.4}, H[q] = {:.4})",
        summary.steps, summary.elbo, summary.expected_logp, summary.entropy
    );
    Ok(())
}
