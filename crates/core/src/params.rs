//! Parameter bookkeeping over [`VarMap`]s.
//!
//! `VarMap::all_vars` has hash-map order, so every cross-network operation
//! goes through [`named_vars`], which sorts by parameter name.

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// All variables of `varmap`, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("var map lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// The tensors behind `vars` (shared storage, not copies).
pub fn tensors(vars: &[Var]) -> Vec<Tensor> {
    vars.iter().map(|v| v.as_tensor().clone()).collect()
}

/// Σ ‖t‖² over a parameter list.
pub fn sq_norm(tensors: &[Tensor]) -> Result<f64> {
    let mut total = 0f64;
    for t in tensors {
        total += t.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    Ok(total)
}

/// Σ ‖a − b‖², computed on `device`.
pub fn sq_distance(a: &[Tensor], b: &[Tensor], device: &Device) -> Result<f64> {
    if a.len() != b.len() {
        candle_core::bail!("parameter lists differ in length: {} vs {}", a.len(), b.len());
    }
    let mut total = 0f64;
    for (x, y) in a.iter().zip(b) {
        let x = x.to_device(device)?;
        let y = y.to_device(device)?;
        total += (x - y)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    Ok(total)
}

/// Deep copies: later `Var::set` calls on the originals do not affect them.
pub fn snapshot(vars: &[Var]) -> Result<Vec<Tensor>> {
    vars.iter().map(|v| v.as_tensor().copy()).collect()
}

/// Overwrite `vars` with `values`, moving each value to its variable's device.
pub fn assign(vars: &[Var], values: &[Tensor]) -> Result<()> {
    if vars.len() != values.len() {
        candle_core::bail!("assign: {} vars but {} values", vars.len(), values.len());
    }
    for (var, value) in vars.iter().zip(values) {
        var.set(&value.to_device(var.device())?)?;
    }
    Ok(())
}

/// Standard normal noise with the shape and device of `like`, drawn from `rng`.
///
/// Used instead of `randn_like` where reproducibility matters: CPU devices
/// cannot be seeded.
pub fn gaussian_like(like: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let n = like.elem_count();
    let values: Vec<f32> = (0..n)
        .map(|_| Distribution::<f32>::sample(&StandardNormal, &mut *rng))
        .collect();
    Tensor::from_vec(values, like.shape(), like.device())?.to_dtype(like.dtype())
}
