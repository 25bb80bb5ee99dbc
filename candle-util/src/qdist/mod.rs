//! Approximate posterior (Q) distributions for mean-field variational inference.
//!
//! Every random variable in a model carries at most one posterior. The
//! posterior exposes the first two moments, a (reparameterized when
//! possible) sample, and its entropy; the node-level expected log-likelihood
//! terms combine these into the ELBO.
//!
//! # Families
//!
//! - [`ObservedQ`]: a point mass at an observed value (variance 0, entropy 0)
//! - [`GaussianQ`]: diagonal Gaussian `N(μ, σ²)` with trainable `μ`, `ln σ`
//! - [`BernoulliQ`]: independent Bernoulli with trainable logits
//! - [`PointQ`]: trainable point mass (point estimate, entropy 0)
//!
//! # Example
//!
//! ```ignore
//! use candle_util::qdist::{GaussianQ, QDistribution};
//!
//! let q = GaussianQ::new((5, 3), DType::F32, &Device::Cpu)?;
//! let elbo_entropy = q.entropy()?;
//! let mut optimizer = candle_nn::AdamW::new_lr(q.vars(), 0.01)?;
//! ```

mod bernoulli;
mod gaussian;
mod observed;
mod point;
mod traits;

pub use bernoulli::BernoulliQ;
pub use gaussian::GaussianQ;
pub use observed::ObservedQ;
pub use point::PointQ;
pub use traits::QDistribution;
