//! Composable Bayesian network nodes with mean-field variational inference.
//!
//! Build a model by adding [`node::ConditionalDistribution`] nodes to a
//! [`graph::BayesNet`], draw from it with [`graph::BayesNet::sample`],
//! condition on data with [`graph::BayesNet::observe`], and fit the
//! remaining posteriors with [`inference::fit`].

pub mod cli;
pub mod cumulative_sum;
pub mod elementary;
pub mod flat;
pub mod gmm;
pub mod graph;
pub mod inference;
pub mod latent_features;
pub mod matrix_product;
pub mod multiplicative_noise;
pub mod node;

pub use cumulative_sum::NoisyCumulativeSum;
pub use elementary::{BernoulliMatrix, Gaussian};
pub use flat::FlatDistribution;
pub use gmm::GMMClustering;
pub use graph::{BayesNet, Elbo};
pub use inference::{averaged_elbo, fit, FitOptions, FitSummary};
pub use latent_features::NoisyLatentFeatures;
pub use matrix_product::NoisyGaussianMatrixProduct;
pub use multiplicative_noise::MultiplicativeGaussianNoise;
pub use node::{ConditionalDistribution, Input, InputSlot, NodeBuilder, NodeContext, NodeId, Params, SharedQ};
