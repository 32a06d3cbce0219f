//! Function-preserving weight normalization for ReLU networks.
//!
//! ReLU is positively homogeneous, so scaling a hidden unit's incoming weights
//! and bias by `1/p` and its outgoing weights by `p` leaves the network
//! function unchanged. Max-pooling commutes with the same per-channel scaling,
//! so convolution channels are handled like hidden units. Normalizing every
//! unit to unit incoming norm picks a canonical point on that orbit, which
//! makes norms and distances of different networks comparable.

use std::collections::HashMap;

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;

use entropic_common::{Architecture, ModelConfig};

use crate::model::mlp_layer_prefix;
use crate::params::named_vars;
use crate::robust::RobustNet;

const MIN_NORM: f64 = 1e-12;

fn param<'a>(vars: &'a HashMap<String, Var>, prefix: &str, suffix: &str) -> Result<&'a Var> {
    let name = format!("{prefix}.{suffix}");
    vars.get(&name)
        .ok_or_else(|| candle_core::Error::Msg(format!("missing parameter {name}")))
}

/// `[n]` reshaped to broadcast along `dim` of a rank-`rank` tensor.
fn along(t: &Tensor, dim: usize, rank: usize) -> Result<Tensor> {
    let mut shape = vec![1; rank];
    shape[dim] = t.dim(0)?;
    t.reshape(shape)
}

/// Normalize the output units of layer `layer` and push the factors into the
/// input units of `next`.
///
/// A unit is a row of a linear weight or an output channel of a conv weight.
/// When `next` is a linear layer fed by a flattened conv output, each factor
/// covers a contiguous block of its input columns.
fn normalize_layer(vars: &HashMap<String, Var>, layer: &str, next: &str) -> Result<Vec<f32>> {
    let w = param(vars, layer, "weight")?;
    let b = param(vars, layer, "bias")?;
    let w_next = param(vars, next, "weight")?;

    let units = w.dim(0)?;
    let next_inputs = w_next.dim(1)?;
    if next_inputs % units != 0 {
        candle_core::bail!("{next} has {next_inputs} inputs, not a multiple of {units} units of {layer}");
    }
    let spread = next_inputs / units;

    // [units] joint norm of incoming weights and bias
    let p = (w.as_tensor().flatten_from(1)?.sqr()?.sum(1)? + b.as_tensor().sqr()?)?
        .sqrt()?
        .clamp(MIN_NORM, f64::INFINITY)?;

    let w_scaled = w.as_tensor().broadcast_div(&along(&p, 0, w.rank())?)?;
    let b_scaled = (b.as_tensor() / &p)?;
    let columns = p
        .unsqueeze(1)?
        .broadcast_as((units, spread))?
        .flatten_all()?;
    let next_scaled = w_next
        .as_tensor()
        .broadcast_mul(&along(&columns, 1, w_next.rank())?)?;
    w.set(&w_scaled)?;
    b.set(&b_scaled)?;
    w_next.set(&next_scaled)?;

    p.to_vec1::<f32>()
}

fn check_activation(config: &ModelConfig) -> Result<()> {
    if !config.activation.is_positively_homogeneous() {
        candle_core::bail!(
            "weight normalization is only function-preserving for relu, got {:?}",
            config.activation
        );
    }
    Ok(())
}

/// Normalize every hidden unit of the MLP stored in `varmap`.
///
/// Returns, for each hidden layer, the factors `p_j = ‖(W_j, b_j)‖` that were
/// divided out of the unit's incoming weights and multiplied into the next
/// layer.
pub fn normalize_mlp(config: &ModelConfig, varmap: &VarMap) -> Result<Vec<Vec<f32>>> {
    let hidden = match &config.arch {
        Architecture::Mlp { hidden } => hidden.len(),
        other => candle_core::bail!("expected an mlp, got {other}"),
    };
    check_activation(config)?;

    let vars: HashMap<String, Var> = named_vars(varmap)?.into_iter().collect();
    (0..hidden)
        .map(|i| normalize_layer(&vars, &mlp_layer_prefix(i), &mlp_layer_prefix(i + 1)))
        .collect()
}

/// Normalize the conv channels and the hidden fully connected units of a
/// LeNet. Factors are returned for `conv1`, `conv2` and `fc1` in that order.
pub fn normalize_lenet(config: &ModelConfig, varmap: &VarMap) -> Result<Vec<Vec<f32>>> {
    if !matches!(config.arch, Architecture::LeNet) {
        candle_core::bail!("expected lenet, got {}", config.arch);
    }
    check_activation(config)?;

    let vars: HashMap<String, Var> = named_vars(varmap)?.into_iter().collect();
    [("conv1", "conv2"), ("conv2", "fc1"), ("fc1", "fc2")]
        .iter()
        .map(|(layer, next)| normalize_layer(&vars, layer, next))
        .collect()
}

/// Normalize whichever architecture `config` describes.
pub fn normalize_network(config: &ModelConfig, varmap: &VarMap) -> Result<Vec<Vec<f32>>> {
    match config.arch {
        Architecture::Mlp { .. } => normalize_mlp(config, varmap),
        Architecture::LeNet => normalize_lenet(config, varmap),
    }
}

/// Normalize every replica of `net` and rebuild the center.
pub fn normalize_robust(net: &RobustNet) -> Result<Vec<Vec<Vec<f32>>>> {
    let factors = net
        .replicas()
        .iter()
        .map(|r| normalize_network(net.config(), r.varmap()))
        .collect::<Result<Vec<_>>>()?;
    net.update_center()?;
    tracing::debug!(replicas = factors.len(), "replicas normalized");
    Ok(factors)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classifier;
    use candle_core::{DType, Device};
    use candle_nn::{Module, VarBuilder};
    use entropic_common::Activation;

    fn mean_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn mlp_config(activation: Activation) -> ModelConfig {
        ModelConfig {
            arch: "mlp_8_5".parse().unwrap(),
            input_shape: vec![6],
            num_classes: 4,
            activation,
            ..Default::default()
        }
    }

    fn lenet_config() -> ModelConfig {
        ModelConfig {
            arch: Architecture::LeNet,
            input_shape: vec![1, 16, 16],
            num_classes: 3,
            activation: Activation::Relu,
            ..Default::default()
        }
    }

    #[test]
    fn outputs_are_invariant() {
        let config = mlp_config(Activation::Relu);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Classifier::new(&config, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (10, 6), &Device::Cpu).unwrap();

        let before = model.forward(&x).unwrap();
        let factors = normalize_mlp(&config, &varmap).unwrap();
        let after = model.forward(&x).unwrap();

        assert_eq!(factors.len(), 2);
        assert_eq!(factors[0].len(), 8);
        assert_eq!(factors[1].len(), 5);
        assert!(mean_abs_diff(&before, &after) < 1e-5);
    }

    #[test]
    fn hidden_units_have_unit_norm() {
        let config = mlp_config(Activation::Relu);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = Classifier::new(&config, vb).unwrap();
        normalize_mlp(&config, &varmap).unwrap();

        // A second pass finds nothing left to divide out.
        let again = normalize_mlp(&config, &varmap).unwrap();
        for p in again.iter().flatten() {
            assert!((p - 1.0).abs() < 1e-4, "{p}");
        }
    }

    #[test]
    fn lenet_outputs_are_invariant() {
        let config = lenet_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Classifier::new(&config, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (4, 1, 16, 16), &Device::Cpu).unwrap();

        let before = model.forward(&x).unwrap();
        let factors = normalize_network(&config, &varmap).unwrap();
        let after = model.forward(&x).unwrap();

        let sizes: Vec<usize> = factors.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 50, 500]);
        assert!(mean_abs_diff(&before, &after) < 1e-5);

        let again = normalize_lenet(&config, &varmap).unwrap();
        for p in again.iter().flatten() {
            assert!((p - 1.0).abs() < 1e-4, "{p}");
        }
    }

    #[test]
    fn rejects_non_homogeneous_activation_and_wrong_arch() {
        let varmap = VarMap::new();
        assert!(normalize_mlp(&mlp_config(Activation::Swish), &varmap).is_err());
        assert!(normalize_mlp(&lenet_config(), &varmap).is_err());
        assert!(normalize_lenet(&mlp_config(Activation::Relu), &varmap).is_err());

        let swish_lenet = ModelConfig {
            activation: Activation::Swish,
            ..lenet_config()
        };
        assert!(normalize_network(&swish_lenet, &varmap).is_err());
    }

    #[test]
    fn robust_normalization_keeps_center_consistent() {
        let config = mlp_config(Activation::Relu);
        let net = RobustNet::new(&config, 2, &[]).unwrap();
        let x = Tensor::randn(0f32, 1.0, (4, 6), &Device::Cpu).unwrap();
        let before = net.forward_all(&x, false).unwrap();
        normalize_robust(&net).unwrap();
        let after = net.forward_all(&x, false).unwrap();
        for (b, a) in before.iter().zip(&after) {
            assert!(mean_abs_diff(b, a) < 1e-5);
        }
    }
}
