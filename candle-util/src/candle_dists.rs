use candle_core::{Result, Tensor};

/// ln(2π)
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Elementwise Gaussian log-density with broadcasting
///
/// log N(x; μ, v) = -0.5 * [ln(2π) + ln(v) + (x - μ)² / v]
///
/// * `x` - points
/// * `mean` - location (broadcast against `x`)
/// * `variance` - variance (broadcast against `x`)
///
pub fn gaussian_log_density(x: &Tensor, mean: &Tensor, variance: &Tensor) -> Result<Tensor> {
    let diff_sq = x.broadcast_sub(mean)?.sqr()?;
    let scaled = diff_sq.broadcast_div(variance)?;
    let log_var = variance.log()?;
    (scaled.broadcast_add(&log_var)? + LN_2PI)? * (-0.5)
}

/// Same as [`gaussian_log_density`] but parameterized by the standard deviation
pub fn gaussian_log_density_std(x: &Tensor, mean: &Tensor, std: &Tensor) -> Result<Tensor> {
    gaussian_log_density(x, mean, &std.sqr()?)
}

/// Entropy of a fully factorized Gaussian
///
/// H = Σ ln σ + 0.5 * n * (1 + ln 2π)
///
/// * `ln_std` - log standard deviations, any shape
///
pub fn gaussian_entropy(ln_std: &Tensor) -> Result<Tensor> {
    let n = ln_std.elem_count() as f64;
    ln_std.sum_all()? + 0.5 * n * (1.0 + LN_2PI)
}

/// Entropy of independent Bernoulli variables, summed
///
/// H = -Σ [p ln p + (1 - p) ln (1 - p)]
///
pub fn bernoulli_entropy(probs: &Tensor) -> Result<Tensor> {
    let eps = 1e-6;
    let p = probs.clamp(eps, 1.0 - eps)?;
    let q = (1.0 - &p)?;
    let plogp = (&p * p.log()?)?;
    let qlogq = (&q * q.log()?)?;
    (plogp + qlogq)?.sum_all()?.neg()
}

/// Numerically stable log Σ exp(x) along `dim`; the dimension is removed
pub fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    let shifted = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    (shifted + max)?.squeeze(dim)
}

/// ln(k!)
pub fn log_factorial(k: usize) -> f64 {
    (1..=k).map(|i| (i as f64).ln()).sum()
}
