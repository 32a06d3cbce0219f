//! Entropy-SGD on a replica ensemble.
//!
//! One outer step picks a replica uniformly at random and estimates the
//! gradient of its local entropy with `L` inner SGLD steps:
//!
//! ```text
//! x  = w_a,  x' = w_a,  μ = w_a
//! repeat L times:
//!     d  = ∇f(x') + γ (x' − x)          (fresh mini-batch every time)
//!     v  = m v + d;  d = v              (if m > 0)
//!     x' = x' − η' d + √η' ε N(0, 1)
//!     μ  = (1 − α) μ + α x'
//! w_a = x
//! e   = γ (x − μ)                       (or x − μ without gscale)
//! ```
//!
//! `e + g (w_a − c)` is then applied by the replica's outer momentum SGD
//! optimiser, the center is recomputed and `γ` is scoped up by
//! `γ ← γ (1 + scoping)`.

use candle_core::Tensor;
use candle_nn::Optimizer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use entropic_common::{Batch, EsgdConfig, LossKind, OptimConfig};
use entropic_core::params;
use entropic_core::RobustNet;

use crate::eval::topk_correct;
use crate::loss;
use crate::optim::{MomentumSgd, ParamsSgd};

/// Outcome of one outer step.
#[derive(Debug, Clone, Copy, Default)]
pub struct EsgdStepStats {
    /// Replica that was updated.
    pub replica: usize,
    /// Loss on the first inner mini-batch.
    pub loss: f64,
    pub correct: usize,
    pub count: usize,
    /// `sqrt(‖w_a − c‖² / num_params)` after the update.
    pub dist: f64,
    /// Norm of the total outer gradient.
    pub grad_norm: f64,
    pub lr: f64,
    /// `γ` used in this step.
    pub gamma: f64,
}

pub struct EntropySgd {
    config: EsgdConfig,
    gamma: f64,
    outer: Vec<MomentumSgd>,
    loss: LossKind,
    flood: f64,
    replica_rng: StdRng,
    noise_rng: StdRng,
}

impl EntropySgd {
    pub fn new(
        net: &RobustNet,
        config: &EsgdConfig,
        optim: &OptimConfig,
        seed: u64,
    ) -> candle_core::Result<Self> {
        if config.inner_steps == 0 {
            candle_core::bail!("entropy-sgd needs at least one inner step");
        }
        let outer = net
            .replicas()
            .iter()
            .map(|r| {
                MomentumSgd::new(
                    r.vars().to_vec(),
                    ParamsSgd {
                        lr: optim.lr,
                        momentum: optim.momentum,
                        weight_decay: optim.weight_decay,
                        nesterov: false,
                    },
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            config: config.clone(),
            gamma: config.gamma,
            outer,
            loss: optim.loss,
            flood: optim.flood,
            replica_rng: StdRng::seed_from_u64(seed),
            noise_rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
        })
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn set_gamma(&mut self, gamma: f64) {
        self.gamma = gamma;
    }

    /// Restore `γ` after resuming at `steps` outer steps into training.
    pub fn fast_forward(&mut self, steps: usize) {
        self.gamma *= (1.0 + self.config.scoping).powi(steps as i32);
    }

    pub fn learning_rate(&self) -> f64 {
        self.outer.first().map_or(0.0, |o| o.learning_rate())
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        for o in &mut self.outer {
            o.set_learning_rate(lr);
        }
    }

    /// One outer step with coupling `g`. `feval` draws a fresh mini-batch.
    pub fn step<F>(&mut self, net: &RobustNet, g: f64, mut feval: F) -> anyhow::Result<EsgdStepStats>
    where
        F: FnMut() -> Batch,
    {
        let a = self.replica_rng.gen_range(0..net.y());
        let replica = net.replica(a);
        let vars = replica.vars();
        let shape = net.config().input_shape.clone();
        let gamma = self.gamma;
        let EsgdConfig {
            inner_steps,
            sgld_noise,
            sgld_lr,
            alpha,
            gscale,
            mom_sgld,
            ..
        } = self.config;

        let x = params::snapshot(vars)?;
        let mut mu = x.clone();
        let mut velocity: Vec<Option<Tensor>> = vec![None; vars.len()];
        let mut stats = EsgdStepStats {
            replica: a,
            gamma,
            ..Default::default()
        };

        for l in 0..inner_steps {
            let batch = feval();
            let (xb, yb) = batch.to_tensors(&shape, replica.device())?;
            let logits = replica.forward_t(&xb, true)?;
            let raw = loss::mean(self.loss, &logits, &yb)?;
            if l == 0 {
                stats.loss = raw.to_scalar::<f32>()? as f64;
                stats.correct = topk_correct(&logits, &yb, 1)?;
                stats.count = batch.len;
            }
            let grads = loss::flooded(&raw, self.flood)?.backward()?;

            for (i, var) in vars.iter().enumerate() {
                let w = var.as_tensor();
                let pull = (w - &x[i])?.affine(gamma, 0.0)?;
                let mut d = match grads.get(w) {
                    Some(grad) => (grad + pull)?,
                    None => pull,
                };
                if mom_sgld > 0.0 {
                    let v = match velocity[i].take() {
                        Some(v) => (v.affine(mom_sgld, 0.0)? + &d)?,
                        None => d,
                    };
                    d = v.clone();
                    velocity[i] = Some(v);
                }
                let noise = params::gaussian_like(w, &mut self.noise_rng)?
                    .affine(sgld_lr.sqrt() * sgld_noise, 0.0)?;
                let next = ((w - d.affine(sgld_lr, 0.0)?)? + noise)?;
                mu[i] = (mu[i].affine(1.0 - alpha, 0.0)? + next.affine(alpha, 0.0)?)?;
                var.set(&next)?;
            }
        }

        params::assign(vars, &x)?;

        let scale = if gscale { gamma } else { 1.0 };
        let coupling = if g != 0.0 {
            Some(net.coupling_gradients(a, g)?)
        } else {
            None
        };
        let mut total = Vec::with_capacity(vars.len());
        for i in 0..vars.len() {
            let e = (&x[i] - &mu[i])?.affine(scale, 0.0)?;
            total.push(match &coupling {
                Some(c) => (e + &c[i])?,
                None => e,
            });
        }
        stats.grad_norm = params::sq_norm(&total)?.sqrt();

        self.outer[a].step_with(&total)?;
        net.update_center()?;

        stats.dist = (net.sqdistance(a)? / net.num_params().max(1) as f64).sqrt();
        stats.lr = self.outer[a].learning_rate();
        self.gamma *= 1.0 + self.config.scoping;

        tracing::trace!(
            replica = a,
            loss = stats.loss,
            grad_norm = stats.grad_norm,
            gamma,
            "esgd step"
        );
        Ok(stats)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use entropic_common::{ClassificationDataset, ModelConfig, RobustDataLoader};

    fn setup(y: usize) -> (RobustNet, RobustDataLoader) {
        let data = ClassificationDataset::synthetic_blobs(64, &[4], 3, 4.0, 3).unwrap();
        let loader = RobustDataLoader::new(Arc::new(data), y, 16, 5).unwrap();
        let config = ModelConfig {
            arch: "mlp_8".parse().unwrap(),
            input_shape: vec![4],
            num_classes: 3,
            ..Default::default()
        };
        (RobustNet::new(&config, y, &[]).unwrap(), loader)
    }

    fn esgd_config() -> EsgdConfig {
        EsgdConfig {
            inner_steps: 3,
            sgld_noise: 1e-4,
            sgld_lr: 0.1,
            alpha: 0.75,
            scoping: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn step_updates_one_replica_and_scopes_gamma() {
        let (net, mut loader) = setup(2);
        let before: Vec<Vec<Tensor>> = net
            .replicas()
            .iter()
            .map(|r| params::snapshot(r.vars()).unwrap())
            .collect();

        let mut esgd = EntropySgd::new(&net, &esgd_config(), &OptimConfig::default(), 0).unwrap();
        let g0 = esgd.gamma();
        let stats = esgd.step(&net, 0.1, || loader.sample_single()).unwrap();

        assert_eq!(stats.count, 16);
        assert!(stats.loss.is_finite() && stats.loss > 0.0);
        assert!(stats.grad_norm > 0.0);
        assert!((esgd.gamma() - g0 * 1.5).abs() < 1e-12);

        let moved: Vec<f64> = (0..2)
            .map(|a| {
                params::sq_distance(&before[a], &net.replica(a).tensors(), &candle_core::Device::Cpu)
                    .unwrap()
            })
            .collect();
        assert!(moved[stats.replica] > 0.0);
        assert_eq!(moved[1 - stats.replica], 0.0);
    }

    #[test]
    fn center_tracks_updated_replica() {
        let (net, mut loader) = setup(1);
        let mut esgd = EntropySgd::new(&net, &esgd_config(), &OptimConfig::default(), 1).unwrap();
        for _ in 0..3 {
            let stats = esgd.step(&net, 0.0, || loader.sample_single()).unwrap();
            assert!(stats.dist < 1e-6);
        }
    }

    fn full_batch_loss(net: &RobustNet, loader: &RobustDataLoader) -> f64 {
        let batch = loader.single_batches().next().unwrap();
        let (x, y) = batch.to_tensors(&[4], &candle_core::Device::Cpu).unwrap();
        let logits = net.replica(0).forward_t(&x, false).unwrap();
        loss::mean(LossKind::Nll, &logits, &y)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as f64
    }

    #[test]
    fn outer_steps_descend_the_training_loss() {
        let data = ClassificationDataset::synthetic_blobs(64, &[4], 3, 4.0, 3).unwrap();
        let mut loader = RobustDataLoader::new(Arc::new(data), 1, 64, 5).unwrap();
        let config = ModelConfig {
            arch: "mlp_8".parse().unwrap(),
            input_shape: vec![4],
            num_classes: 3,
            ..Default::default()
        };
        let net = RobustNet::new(&config, 1, &[]).unwrap();
        let esgd_config = EsgdConfig {
            inner_steps: 5,
            sgld_noise: 0.0,
            sgld_lr: 0.1,
            alpha: 0.75,
            gscale: false,
            mom_sgld: 0.0,
            scoping: 0.0,
            ..Default::default()
        };
        // With unit outer lr and no momentum the step moves w onto μ.
        let optim = OptimConfig {
            lr: 1.0,
            momentum: 0.0,
            weight_decay: 0.0,
            loss: LossKind::Nll,
            ..Default::default()
        };
        let mut esgd = EntropySgd::new(&net, &esgd_config, &optim, 0).unwrap();

        let before = full_batch_loss(&net, &loader);
        for _ in 0..20 {
            esgd.step(&net, 0.0, || loader.sample_single()).unwrap();
        }
        let after = full_batch_loss(&net, &loader);
        assert!(after < 0.8 * before, "{after} !< 0.8 * {before}");
    }

    #[test]
    fn learning_rate_is_shared() {
        let (net, _) = setup(3);
        let mut esgd = EntropySgd::new(&net, &esgd_config(), &OptimConfig::default(), 0).unwrap();
        esgd.set_learning_rate(0.01);
        assert!((esgd.learning_rate() - 0.01).abs() < 1e-12);
        esgd.fast_forward(2);
        assert!((esgd.gamma() - 0.03 * 2.25).abs() < 1e-12);
    }
}
