//! Replica ensemble ("robust ensemble") with a consensus center.
//!
//! `y` independent copies of a classifier are trained jointly; each may live
//! on its own device. A center network on the master device holds the
//! coordinate-wise average of the replicas and is refreshed with
//! [`RobustNet::update_center`] after every optimisation step.
//!
//! The coupling loss is `g · ½ Σ_a ‖w_a − c‖²` with the center treated as a
//! constant, so its gradient with respect to replica `a` is `g (w_a − c)`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use entropic_common::ModelConfig;

use crate::model::Classifier;
use crate::params::{self, named_vars};

// ── Replica ─────────────────────────────────────────────────────────────────

/// One network with its own parameters and device.
pub struct Replica {
    varmap: VarMap,
    model: Classifier,
    device: Device,
    names: Vec<String>,
    vars: Vec<Var>,
}

impl Replica {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Classifier::new(config, vb)?;
        let (names, vars) = named_vars(&varmap)?.into_iter().unzip();
        Ok(Self {
            varmap,
            model,
            device: device.clone(),
            names,
            vars,
        })
    }

    pub fn model(&self) -> &Classifier {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Parameters in name order.
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn tensors(&self) -> Vec<Tensor> {
        params::tensors(&self.vars)
    }

    pub fn num_params(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }

    pub fn sqnorm(&self) -> Result<f64> {
        params::sq_norm(&self.tensors())
    }

    /// Logits for `x` (moved to this replica's device).
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.model.forward_t(&x.to_device(&self.device)?, train)
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("save {}", path.display()))
    }

    fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("load {}", path.display()))
    }
}

// ── RobustNet ───────────────────────────────────────────────────────────────

/// `y` coupled replicas plus their consensus center.
pub struct RobustNet {
    replicas: Vec<Replica>,
    center: Replica,
    config: ModelConfig,
}

impl RobustNet {
    /// Build `y` replicas. Network `r ∈ 0..=y` is placed on
    /// `devices[r % devices.len()]`; index `y` is the center (master device).
    /// An empty device list means everything on the CPU.
    pub fn new(config: &ModelConfig, y: usize, devices: &[Device]) -> Result<Self> {
        if y == 0 {
            candle_core::bail!("a robust ensemble needs at least one replica");
        }
        let cpu = [Device::Cpu];
        let devices = if devices.is_empty() { &cpu[..] } else { devices };
        let device_for = |r: usize| &devices[r % devices.len()];

        let replicas = (0..y)
            .map(|a| Replica::new(config, device_for(a)))
            .collect::<Result<Vec<_>>>()?;
        let center = Replica::new(config, device_for(y))?;

        for (r, replica) in replicas.iter().enumerate() {
            tracing::debug!(replica = r, device = ?replica.device.location(), "replica placed");
        }
        tracing::debug!(device = ?center.device.location(), "center placed");

        let net = Self {
            replicas,
            center,
            config: config.clone(),
        };
        net.update_center()?;
        Ok(net)
    }

    /// Number of replicas `y`.
    pub fn y(&self) -> usize {
        self.replicas.len()
    }

    pub fn replica(&self, a: usize) -> &Replica {
        &self.replicas[a]
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn center(&self) -> &Replica {
        &self.center
    }

    pub fn master_device(&self) -> &Device {
        &self.center.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Parameters per network.
    pub fn num_params(&self) -> usize {
        self.center.num_params()
    }

    // ── Forward ─────────────────────────────────────────────────────────────

    /// Split a replica-major concatenated batch into `y` chunks and run each
    /// replica on its own chunk. Outputs are returned on the master device.
    pub fn forward_split(&self, x: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let chunks = x.chunk(self.y(), 0)?;
        if chunks.len() != self.y() {
            candle_core::bail!(
                "batch of {} cannot be split across {} replicas",
                x.dim(0)?,
                self.y()
            );
        }
        self.replicas
            .iter()
            .zip(chunks)
            .map(|(r, chunk)| r.forward_t(&chunk, train)?.to_device(self.master_device()))
            .collect()
    }

    /// Run every replica on the same input. Outputs on the master device.
    pub fn forward_all(&self, x: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        self.replicas
            .iter()
            .map(|r| r.forward_t(x, train)?.to_device(self.master_device()))
            .collect()
    }

    /// Stack per-replica outputs along the batch axis.
    pub fn concat_outputs(outputs: &[Tensor]) -> Result<Tensor> {
        Tensor::cat(outputs, 0)
    }

    // ── Center & coupling ───────────────────────────────────────────────────

    /// Recompute the center as the coordinate-wise replica average.
    pub fn update_center(&self) -> Result<()> {
        let master = self.master_device();
        let scale = 1.0 / self.y() as f64;
        for (i, cvar) in self.center.vars.iter().enumerate() {
            let mut acc = self.replicas[0].vars[i].as_tensor().to_device(master)?;
            for replica in &self.replicas[1..] {
                acc = (acc + replica.vars[i].as_tensor().to_device(master)?)?;
            }
            cvar.set(&acc.affine(scale, 0.0)?)?;
        }
        Ok(())
    }

    /// ‖w_a − c‖².
    pub fn sqdistance(&self, a: usize) -> Result<f64> {
        params::sq_distance(
            &self.replicas[a].tensors(),
            &self.center.tensors(),
            self.master_device(),
        )
    }

    /// ‖w_a − c‖² for every replica.
    pub fn sqdistances(&self) -> Result<Vec<f64>> {
        (0..self.y()).map(|a| self.sqdistance(a)).collect()
    }

    /// ‖w_a‖² for every replica.
    pub fn sqnorms(&self) -> Result<Vec<f64>> {
        self.replicas.iter().map(|r| r.sqnorm()).collect()
    }

    pub fn center_sqnorm(&self) -> Result<f64> {
        self.center.sqnorm()
    }

    /// `½ Σ_a ‖w_a − c‖²`; the reported coupling loss is `g` times this.
    pub fn distance_loss(&self) -> Result<f64> {
        Ok(0.5 * self.sqdistances()?.iter().sum::<f64>())
    }

    /// `g (w_a − c)` per parameter, on replica `a`'s device.
    pub fn coupling_gradients(&self, a: usize, g: f64) -> Result<Vec<Tensor>> {
        let replica = &self.replicas[a];
        replica
            .vars
            .iter()
            .zip(&self.center.vars)
            .map(|(w, c)| {
                let c = c.as_tensor().to_device(&replica.device)?;
                (w.as_tensor() - c)?.affine(g, 0.0)
            })
            .collect()
    }

    // ── Initialisation tweaks ───────────────────────────────────────────────

    /// Multiply every replica parameter by `gain`.
    pub fn rescale_parameters(&self, gain: f64) -> Result<()> {
        for replica in &self.replicas {
            for var in &replica.vars {
                var.set(&var.as_tensor().affine(gain, 0.0)?)?;
            }
        }
        self.update_center()
    }

    /// Multiplicative Gaussian perturbation `w ← w + ampl · w ⊙ ξ`.
    pub fn perturb_parameters(&self, ampl: f64, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        for replica in &self.replicas {
            for var in &replica.vars {
                let w = var.as_tensor();
                let xi = params::gaussian_like(w, &mut rng)?;
                let dw = (w * xi)?.affine(ampl, 0.0)?;
                var.set(&(w + dw)?)?;
            }
        }
        self.update_center()
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    fn replica_path(dir: &Path, a: usize) -> PathBuf {
        dir.join(format!("replica-{a}.safetensors"))
    }

    pub fn center_path(dir: &Path) -> PathBuf {
        dir.join("center.safetensors")
    }

    /// Save every replica and the center into `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        for (a, replica) in self.replicas.iter().enumerate() {
            replica.save(&Self::replica_path(dir, a))?;
        }
        self.center.save(&Self::center_path(dir))
    }

    /// Load replicas from `dir` and rebuild the center.
    pub fn load(&mut self, dir: &Path) -> anyhow::Result<()> {
        for (a, replica) in self.replicas.iter_mut().enumerate() {
            replica.load(&Self::replica_path(dir, a))?;
        }
        self.update_center()?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ModelConfig {
        ModelConfig {
            arch: "mlp_6".parse().unwrap(),
            input_shape: vec![4],
            num_classes: 3,
            ..Default::default()
        }
    }

    #[test]
    fn single_replica_has_zero_distance() {
        let net = RobustNet::new(&small_config(), 1, &[]).unwrap();
        assert!(net.sqdistance(0).unwrap() < 1e-10);
        assert!(net.distance_loss().unwrap() < 1e-10);
        assert!((net.center_sqnorm().unwrap() - net.sqnorms().unwrap()[0]).abs() < 1e-4);
    }

    #[test]
    fn center_is_replica_mean() {
        let net = RobustNet::new(&small_config(), 3, &[]).unwrap();
        let n = net.replica(0).vars().len();
        for i in 0..n {
            let mean = {
                let mut acc = net.replica(0).vars()[i].as_tensor().clone();
                for a in 1..3 {
                    acc = (acc + net.replica(a).vars()[i].as_tensor()).unwrap();
                }
                acc.affine(1.0 / 3.0, 0.0).unwrap()
            };
            let diff = (mean - net.center().vars()[i].as_tensor())
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-6);
        }
        // Independent initialisations.
        assert!(net.sqdistance(0).unwrap() > 0.0);
    }

    #[test]
    fn coupling_gradient_is_scaled_offset_from_center() {
        let net = RobustNet::new(&small_config(), 2, &[]).unwrap();
        let g = 0.5;
        let grads = net.coupling_gradients(1, g).unwrap();
        let sq: f64 = params::sq_norm(&grads).unwrap();
        // ‖g (w − c)‖² = g² ‖w − c‖²
        let expected = g * g * net.sqdistance(1).unwrap();
        assert!((sq - expected).abs() < 1e-4 * expected.max(1.0));

        // Same direction as w − c, so a descent step moves w toward c.
        let w = net.replica(1).tensors();
        let c = net.center().tensors();
        let mut dot = 0f64;
        let mut stepped = Vec::new();
        for ((gr, w), c) in grads.iter().zip(&w).zip(&c) {
            let diff = (w - c).unwrap();
            dot += (gr * &diff).unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() as f64;
            stepped.push((w - gr).unwrap());
        }
        assert!(dot > 0.0);
        let after = params::sq_distance(&stepped, &c, &Device::Cpu).unwrap();
        let before = net.sqdistance(1).unwrap();
        assert!((after - (1.0 - g).powi(2) * before).abs() < 1e-4 * before.max(1.0));
    }

    #[test]
    fn forward_split_and_all() {
        let net = RobustNet::new(&small_config(), 2, &[]).unwrap();
        let x = Tensor::ones((6, 4), DType::F32, &Device::Cpu).unwrap();
        let split = net.forward_split(&x, false).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].dims(), &[3, 3]);
        let all = net.forward_all(&x, false).unwrap();
        assert_eq!(all[1].dims(), &[6, 3]);
        assert_eq!(RobustNet::concat_outputs(&split).unwrap().dims(), &[6, 3]);
    }

    #[test]
    fn rescale_scales_norms() {
        let net = RobustNet::new(&small_config(), 2, &[]).unwrap();
        let before = net.sqnorms().unwrap();
        net.rescale_parameters(2.0).unwrap();
        let after = net.sqnorms().unwrap();
        for (b, a) in before.iter().zip(after) {
            assert!((a - 4.0 * b).abs() < 1e-3 * a);
        }
    }

    #[test]
    fn perturbation_is_seeded() {
        let a = RobustNet::new(&small_config(), 2, &[]).unwrap();
        let b = RobustNet::new(&small_config(), 2, &[]).unwrap();
        for r in 0..2 {
            params::assign(b.replica(r).vars(), &a.replica(r).tensors()).unwrap();
        }
        a.perturb_parameters(0.1, 3).unwrap();
        b.perturb_parameters(0.1, 3).unwrap();
        let d = params::sq_distance(&a.center().tensors(), &b.center().tensors(), &Device::Cpu)
            .unwrap();
        assert!(d < 1e-12);
    }

    #[test]
    fn save_and_load_restore_parameters() {
        let dir = std::env::temp_dir().join(format!("entropic-robust-{}", std::process::id()));
        let net = RobustNet::new(&small_config(), 2, &[]).unwrap();
        net.save(&dir).unwrap();

        let mut other = RobustNet::new(&small_config(), 2, &[]).unwrap();
        other.load(&dir).unwrap();
        for a in 0..2 {
            let d = params::sq_distance(
                &net.replica(a).tensors(),
                &other.replica(a).tensors(),
                &Device::Cpu,
            )
            .unwrap();
            assert!(d < 1e-12);
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
