//! Classification losses on logits.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{encoding::one_hot, loss, ops};

use entropic_common::LossKind;

/// Per-example loss, shape `[batch]`.
///
/// `Mse` is the mean squared error between logits and one-hot targets,
/// averaged over classes.
pub fn per_sample(kind: LossKind, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    match kind {
        LossKind::Nll => {
            let log_probs = ops::log_softmax(logits, D::Minus1)?;
            log_probs
                .gather(&targets.unsqueeze(1)?, 1)?
                .squeeze(1)?
                .neg()
        }
        LossKind::Mse => {
            let classes = logits.dim(D::Minus1)?;
            let onehot = one_hot(targets.clone(), classes, 1f32, 0f32)?.to_dtype(logits.dtype())?;
            (logits - onehot)?.sqr()?.mean(D::Minus1)
        }
    }
}

/// Batch-mean loss, differentiable.
pub fn mean(kind: LossKind, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    match kind {
        LossKind::Nll => loss::cross_entropy(logits, targets),
        LossKind::Mse => per_sample(kind, logits, targets)?.mean_all(),
    }
}

/// Summed loss as a host scalar (evaluation).
pub fn sum(kind: LossKind, logits: &Tensor, targets: &Tensor) -> Result<f64> {
    let total = per_sample(kind, logits, targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(total as f64)
}

/// Flooding: `|loss − b| + b`, so gradient ascent kicks in below level `b`.
pub fn flooded(loss: &Tensor, flood: f64) -> Result<Tensor> {
    if flood <= 0.0 {
        return Ok(loss.clone());
    }
    loss.affine(1.0, -flood)?.abs()?.affine(1.0, flood)
}

// ── Tests ───────────────────────────────────────────────────────────────────
