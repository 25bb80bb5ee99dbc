use candle_core::{DType, Result, Shape, Tensor, Var};

/// Approximate posterior q(x) attached to a single random variable.
pub trait QDistribution: Send + Sync + std::fmt::Debug {
    /// Shape of the variable this posterior describes
    fn output_shape(&self) -> Shape;

    /// Element type of the variable
    fn dtype(&self) -> DType;

    /// Posterior mean E_q[x], shape `output_shape`
    fn mean(&self) -> Result<Tensor>;

    /// Posterior variance Var_q[x], shape `output_shape`
    fn variance(&self) -> Result<Tensor>;

    /// One draw x ~ q(x).
    ///
    /// Continuous families return a reparameterized draw, so gradients
    /// flow back to the variational parameters.
    fn sample(&self) -> Result<Tensor>;

    /// Entropy H[q], a scalar
    fn entropy(&self) -> Result<Tensor>;

    /// Per-element success probabilities of a binary variable
    fn probs(&self) -> Result<Tensor> {
        candle_core::bail!("{:?} does not expose Bernoulli probabilities", self)
    }

    /// Point-initialize the variational parameters at `value`.
    ///
    /// Families without this capability return an error; callers treat
    /// it as recoverable.
    fn initialize_to_value(&self, _value: &Tensor) -> Result<()> {
        candle_core::bail!("{:?} does not support point initialization", self)
    }

    /// True for point masses pinned to data
    fn is_observed(&self) -> bool {
        false
    }

    /// Trainable parameters, handed to the optimizer
    fn vars(&self) -> Vec<Var> {
        vec![]
    }
}
