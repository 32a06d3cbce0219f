//! Pointwise activation functions for classifier layers.
//!
//! | Activation | Formula | Notes |
//! |------------|---------|-------|
//! | ReLU       | max(0, x) | Positively homogeneous; admits rescaling invariances. |
//! | Swish      | x · σ(x) | Smooth ReLU replacement. |
//! | Mish       | x · tanh(softplus(x)) | Smooth, non-monotone. |
//! | QuadU      | max(0, x)² | Amplifies strong positive activations. |
//! | Square     | x² | Polynomial network. |

use candle_core::{Result, Tensor};

use entropic_common::Activation;

/// ReLU²: `max(0, x)²`.
#[inline]
pub fn relu_squared(x: &Tensor) -> Result<Tensor> {
    x.relu()?.sqr()
}

/// Numerically stable `ln(1 + eˣ) = max(0, x) + ln(1 + e^{-|x|})`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// Mish: `x · tanh(softplus(x))`.
pub fn mish(x: &Tensor) -> Result<Tensor> {
    x * softplus(x)?.tanh()?
}

/// Apply the configured activation.
pub fn apply(activation: Activation, x: &Tensor) -> Result<Tensor> {
    match activation {
        Activation::Relu => x.relu(),
        Activation::Swish => candle_nn::ops::silu(x),
        Activation::Mish => mish(x),
        Activation::QuadU => relu_squared(x),
        Activation::Square => x.sqr(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
