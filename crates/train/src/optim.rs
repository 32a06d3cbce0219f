//! Per-replica optimisers and gradient utilities.
//!
//! [`MomentumSgd`] implements [`candle_nn::Optimizer`] like candle's own
//! `AdamW`, and additionally accepts explicitly assembled gradients through
//! [`MomentumSgd::step_with`] (the Entropy-SGD outer update has no `GradStore`).

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use entropic_common::{OptimConfig, OptimizerKind};

// ── MomentumSgd ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

/// SGD with heavy-ball or Nesterov momentum and coupled L2 weight decay.
///
/// `d = ∇ + wd·w`, `v ← m·v + d` (`v = d` on the first step), then
/// `w ← w − lr·(d + m·v)` for Nesterov or `w ← w − lr·v` otherwise.
pub struct MomentumSgd {
    vars: Vec<Var>,
    velocity: Vec<Option<Tensor>>,
    params: ParamsSgd,
}

impl MomentumSgd {
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Apply one update with gradients aligned to [`Self::vars`].
    pub fn step_with(&mut self, grads: &[Tensor]) -> Result<()> {
        if grads.len() != self.vars.len() {
            candle_core::bail!(
                "step_with: {} gradients for {} parameters",
                grads.len(),
                self.vars.len()
            );
        }
        for i in 0..self.vars.len() {
            self.update(i, &grads[i])?;
        }
        Ok(())
    }

    fn update(&mut self, i: usize, grad: &Tensor) -> Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
            nesterov,
        } = self.params;
        let var = &self.vars[i];
        let w = var.as_tensor();
        let grad = grad.to_device(w.device())?;

        let mut d = if weight_decay != 0.0 {
            (grad + w.affine(weight_decay, 0.0)?)?
        } else {
            grad
        };
        if momentum != 0.0 {
            let v = match self.velocity[i].take() {
                Some(v) => (v.affine(momentum, 0.0)? + &d)?,
                None => d.clone(),
            };
            d = if nesterov {
                (d + v.affine(momentum, 0.0)?)?
            } else {
                v.clone()
            };
            self.velocity[i] = Some(v);
        }
        var.set(&(w - d.affine(lr, 0.0)?)?)
    }
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let velocity = vec![None; vars.len()];
        Ok(Self {
            vars,
            velocity,
            params,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for i in 0..self.vars.len() {
            let grad = grads.get(self.vars[i].as_tensor()).cloned();
            if let Some(grad) = grad {
                self.update(i, &grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

// ── ReplicaOptimizer ────────────────────────────────────────────────────────

/// The optimiser driving one replica.
pub enum ReplicaOptimizer {
    Sgd(MomentumSgd),
    Adam(AdamW),
}

impl ReplicaOptimizer {
    /// Build from the run's optimiser settings. Entropy-SGD uses momentum SGD
    /// for its outer update.
    pub fn new(vars: Vec<Var>, config: &OptimConfig) -> Result<Self> {
        match config.kind {
            OptimizerKind::Adam => Ok(Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: config.lr,
                    weight_decay: config.weight_decay,
                    ..Default::default()
                },
            )?)),
            kind => Ok(Self::Sgd(MomentumSgd::new(
                vars,
                ParamsSgd {
                    lr: config.lr,
                    momentum: config.momentum,
                    weight_decay: config.weight_decay,
                    nesterov: kind == OptimizerKind::Nesterov,
                },
            )?)),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Sgd(o) => o.step(grads),
            Self::Adam(o) => o.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd(o) => o.learning_rate(),
            Self::Adam(o) => o.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Sgd(o) => o.set_learning_rate(lr),
            Self::Adam(o) => o.set_learning_rate(lr),
        }
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Fold `coupling[i]` into the gradient of `vars[i]`.
///
/// Parameters without a loss gradient receive the coupling term alone.
pub fn add_coupling(grads: &mut GradStore, vars: &[Var], coupling: &[Tensor]) -> Result<()> {
    if vars.len() != coupling.len() {
        candle_core::bail!(
            "add_coupling: {} coupling terms for {} parameters",
            coupling.len(),
            vars.len()
        );
    }
    for (var, c) in vars.iter().zip(coupling) {
        let total = match grads.remove(var.as_tensor()) {
            Some(g) => (g + c)?,
            None => c.clone(),
        };
        grads.insert(var.as_tensor(), total);
    }
    Ok(())
}

/// Total L2 norm of the gradients of `vars`.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::new(values, &Device::Cpu).unwrap()
    }

    fn values(v: &Var) -> Vec<f32> {
        v.as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn plain_sgd_step() {
        let w = var(&[1.0, -2.0]);
        let mut opt = MomentumSgd::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 0.5,
                momentum: 0.0,
                weight_decay: 0.0,
                nesterov: false,
            },
        )
        .unwrap();
        let g = Tensor::new(&[2.0f32, 2.0], &Device::Cpu).unwrap();
        opt.step_with(&[g]).unwrap();
        assert_eq!(values(&w), vec![0.0, -3.0]);
    }

    #[test]
    fn heavy_ball_accumulates_velocity() {
        let w = var(&[0.0]);
        let mut opt = MomentumSgd::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 1.0,
                momentum: 0.5,
                weight_decay: 0.0,
                nesterov: false,
            },
        )
        .unwrap();
        let g = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        opt.step_with(std::slice::from_ref(&g)).unwrap(); // v = 1
        opt.step_with(std::slice::from_ref(&g)).unwrap(); // v = 1.5
        assert!((values(&w)[0] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn nesterov_and_weight_decay() {
        let w = var(&[1.0]);
        let mut opt = MomentumSgd::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 0.1,
                momentum: 0.9,
                weight_decay: 1.0,
                nesterov: true,
            },
        )
        .unwrap();
        let g = Tensor::new(&[0.0f32], &Device::Cpu).unwrap();
        // d = 0 + 1·1 = 1, v = 1, step = d + 0.9·v = 1.9
        opt.step_with(&[g]).unwrap();
        assert!((values(&w)[0] - 0.81).abs() < 1e-6);
    }

    #[test]
    fn grad_store_step_and_coupling() {
        let w = var(&[1.0, 2.0]);
        let loss = (w.as_tensor().sqr().unwrap().sum_all().unwrap() * 0.5).unwrap();
        let mut grads = loss.backward().unwrap();
        // ∇ = w = [1, 2]; coupling adds [1, 1]
        let c = Tensor::new(&[1.0f32, 1.0], &Device::Cpu).unwrap();
        add_coupling(&mut grads, std::slice::from_ref(&w), &[c]).unwrap();
        let norm = grad_norm(&grads, std::slice::from_ref(&w)).unwrap();
        assert!((norm - 13f64.sqrt()).abs() < 1e-5);

        let config = OptimConfig {
            kind: OptimizerKind::Sgd,
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = ReplicaOptimizer::new(vec![w.clone()], &config).unwrap();
        opt.step(&grads).unwrap();
        let got = values(&w);
        assert!((got[0] - 0.8).abs() < 1e-6);
        assert!((got[1] - 1.7).abs() < 1e-6);
    }

    #[test]
    fn adam_learning_rate_is_settable() {
        let config = OptimConfig {
            kind: OptimizerKind::Adam,
            lr: 1e-3,
            ..Default::default()
        };
        let mut opt = ReplicaOptimizer::new(vec![var(&[0.0])], &config).unwrap();
        assert!(matches!(opt, ReplicaOptimizer::Adam(_)));
        opt.set_learning_rate(5e-4);
        assert!((opt.learning_rate() - 5e-4).abs() < 1e-12);
    }
}
