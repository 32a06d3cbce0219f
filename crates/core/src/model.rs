//! Classifier architectures: fully connected MLP and LeNet-5 style CNN.
//!
//! Parameter names are stable across instances (`fc.{i}.weight`,
//! `conv1.weight`, ...), which is what lets replicas be compared and averaged
//! parameter by parameter.

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, Module, VarBuilder};

use entropic_common::{Activation, Architecture, ModelConfig};

use crate::activation;

/// VarBuilder prefix of the `i`-th fully connected layer of an MLP.
pub fn mlp_layer_prefix(i: usize) -> String {
    format!("fc.{i}")
}

// ── MLP ─────────────────────────────────────────────────────────────────────

/// `input → (Linear → act → dropout)* → Linear → logits`.
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        num_classes: usize,
        activation: Activation,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(input_dim);
        dims.extend_from_slice(hidden);
        dims.push(num_classes);

        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, w)| linear(w[0], w[1], vb.pp(mlp_layer_prefix(i))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.flatten_from(1)?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i < last {
                h = activation::apply(self.activation, &h)?;
                h = self.dropout.forward(&h, train)?;
            }
        }
        Ok(h)
    }
}

// ── LeNet ───────────────────────────────────────────────────────────────────

/// Two 5×5 conv + max-pool stages followed by two fully connected layers.
pub struct LeNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
    dropout: Dropout,
}

impl LeNet {
    const C1: usize = 20;
    const C2: usize = 50;
    const HIDDEN: usize = 500;
    const KERNEL: usize = 5;

    pub fn new(
        input_shape: &[usize],
        num_classes: usize,
        activation: Activation,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (channels, height, width) = match input_shape {
            [c, h, w] => (*c, *h, *w),
            other => candle_core::bail!("lenet expects [c, h, w] inputs, got {other:?}"),
        };
        let spatial = |s: usize| -> Result<usize> {
            let after_first = s
                .checked_sub(Self::KERNEL - 1)
                .map(|v| v / 2)
                .unwrap_or(0);
            let after_second = after_first
                .checked_sub(Self::KERNEL - 1)
                .map(|v| v / 2)
                .unwrap_or(0);
            if after_second == 0 {
                candle_core::bail!("input {s} too small for lenet");
            }
            Ok(after_second)
        };
        let flat = Self::C2 * spatial(height)? * spatial(width)?;

        let cfg = Conv2dConfig::default();
        Ok(Self {
            conv1: conv2d(channels, Self::C1, Self::KERNEL, cfg, vb.pp("conv1"))?,
            conv2: conv2d(Self::C1, Self::C2, Self::KERNEL, cfg, vb.pp("conv2"))?,
            fc1: linear(flat, Self::HIDDEN, vb.pp("fc1"))?,
            fc2: linear(Self::HIDDEN, num_classes, vb.pp("fc2"))?,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let act = |t: &Tensor| activation::apply(self.activation, t);
        let h = act(&self.conv1.forward(x)?)?.max_pool2d(2)?;
        let h = act(&self.conv2.forward(&h)?)?.max_pool2d(2)?;
        let h = h.flatten_from(1)?;
        let h = act(&self.fc1.forward(&h)?)?;
        let h = self.dropout.forward(&h, train)?;
        self.fc2.forward(&h)
    }
}

// ── Classifier ──────────────────────────────────────────────────────────────

/// Any supported architecture, built from a [`ModelConfig`].
pub enum Classifier {
    Mlp(Mlp),
    LeNet(LeNet),
}

impl Classifier {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        match &config.arch {
            Architecture::Mlp { hidden } => Ok(Self::Mlp(Mlp::new(
                config.input_dim(),
                hidden,
                config.num_classes,
                config.activation,
                config.dropout,
                vb,
            )?)),
            Architecture::LeNet => Ok(Self::LeNet(LeNet::new(
                &config.input_shape,
                config.num_classes,
                config.activation,
                config.dropout,
                vb,
            )?)),
        }
    }

    /// Logits `[batch, num_classes]`. `train` enables dropout.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Mlp(m) => m.forward_t(x, train),
            Self::LeNet(m) => m.forward_t(x, train),
        }
    }
}

impl Module for Classifier {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: &ModelConfig) -> (VarMap, Classifier) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Classifier::new(config, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn mlp_output_shape_and_param_names() {
        let config = ModelConfig {
            arch: "mlp_16_8".parse().unwrap(),
            input_shape: vec![1, 4, 4],
            num_classes: 3,
            ..Default::default()
        };
        let (varmap, model) = build(&config);
        let x = Tensor::zeros((5, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let y = model.forward(&x).unwrap();
        assert_eq!(y.dims(), &[5, 3]);

        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "fc.0.bias", "fc.0.weight", "fc.1.bias", "fc.1.weight", "fc.2.bias",
                "fc.2.weight"
            ]
        );
    }

    #[test]
    fn lenet_handles_mnist_and_cifar_shapes() {
        for (shape, flat) in [([1, 28, 28], 800), ([3, 32, 32], 1250)] {
            let config = ModelConfig {
                arch: Architecture::LeNet,
                input_shape: shape.to_vec(),
                num_classes: 10,
                ..Default::default()
            };
            let (varmap, model) = build(&config);
            let x = Tensor::zeros((2, shape[0], shape[1], shape[2]), DType::F32, &Device::Cpu)
                .unwrap();
            assert_eq!(model.forward(&x).unwrap().dims(), &[2, 10]);
            let fc1 = varmap.data().lock().unwrap()["fc1.weight"].as_tensor().clone();
            assert_eq!(fc1.dims(), &[500, flat]);
        }
    }

    #[test]
    fn dropout_only_applies_in_training() {
        let config = ModelConfig {
            arch: "mlp_64".parse().unwrap(),
            input_shape: vec![8],
            num_classes: 2,
            dropout: 0.5,
            ..Default::default()
        };
        let (_varmap, model) = build(&config);
        let x = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();

        let eval_a = model.forward_t(&x, false).unwrap();
        let eval_b = model.forward_t(&x, false).unwrap();
        let diff = |a: &Tensor, b: &Tensor| -> f32 {
            (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap()
        };
        assert_eq!(diff(&eval_a, &eval_b), 0.0);

        let train = model.forward_t(&x, true).unwrap();
        assert_eq!(train.dims(), &[4, 2]);
        assert!(diff(&eval_a, &train) > 0.0);
    }

    #[test]
    fn lenet_rejects_tiny_inputs() {
        let config = ModelConfig {
            arch: Architecture::LeNet,
            input_shape: vec![1, 8, 8],
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Classifier::new(&config, vb).is_err());
    }
}
