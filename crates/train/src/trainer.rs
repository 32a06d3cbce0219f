//! Trainer: encapsulates the full robust-ensemble training loop.
//!
//! Decouples the compute graph (forward + loss per replica) from the
//! optimisation step (coupling gradient, per-replica optimiser, center
//! update, schedule advance).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use entropic_common::{OptimizerKind, RobustDataLoader, RunConfig};
use entropic_core::RobustNet;

use crate::esgd::EntropySgd;
use crate::eval::{evaluate, topk_correct, EpochExtras, Report};
use crate::loss;
use crate::optim::{add_coupling, grad_norm, ReplicaOptimizer};
use crate::scheduler::{CouplingSchedule, LrScheduler};

const METRICS_FILE: &str = "metrics.jsonl";
const ESGD_TRACE_FILE: &str = "esgd_dists.jsonl";
const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";

/// Metrics accumulated over one training epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean training loss over the examples seen.
    pub loss: f64,
    /// Training error (%) over the examples seen.
    pub error: f64,
    /// Mean `sqrt(‖w_a − c‖² / num_params)`, sampled every few steps for
    /// replica optimisers and after every step for Entropy-SGD.
    pub mean_dist: f64,
    pub mean_grad_norm: f64,
    pub lr: f64,
    /// Entropy-SGD `γ` at the end of the epoch (0 for the other optimisers).
    pub gamma_esgd: f64,
}

impl EpochMetrics {
    pub fn extras(&self) -> EpochExtras {
        EpochExtras {
            lr: self.lr,
            esgd_dist: self.mean_dist,
            esgd_grad: self.mean_grad_norm,
            g_esgd: self.gamma_esgd,
        }
    }
}

/// Every this many batches the replica distances are sampled for
/// [`EpochMetrics::mean_dist`]. The last batch of an epoch is always sampled.
const DIST_SAMPLE_EVERY: usize = 10;

/// One Entropy-SGD outer step, as written to `esgd_dists.jsonl`.
#[derive(Debug, Clone, Serialize)]
struct EsgdTraceLine {
    epoch: usize,
    step: usize,
    replica: usize,
    dist: f64,
    grad_norm: f64,
    gamma: f64,
}

/// Schedule state stored next to checkpointed weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainerState {
    epoch: usize,
    g0: f64,
    gamma_esgd: Option<f64>,
}

enum Stepper {
    Replicas(Vec<ReplicaOptimizer>),
    Esgd(EntropySgd),
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the ensemble, the optimisers and all schedules.
pub struct RobustTrainer {
    net: RobustNet,
    stepper: Stepper,
    lr_scheduler: LrScheduler,
    coupling: CouplingSchedule,
    pub config: RunConfig,
    output_dir: PathBuf,
    epoch: usize,
    progress: bool,
}

impl RobustTrainer {
    /// Build replicas, optimisers and schedules from `config`.
    pub fn new(config: RunConfig, devices: &[Device], output_dir: PathBuf) -> anyhow::Result<Self> {
        config.validate()?;
        let net = RobustNet::new(&config.model, config.robust.replicas, devices)?;

        tracing::info!(
            arch = %config.model.arch,
            replicas = net.y(),
            params_per_replica = net.num_params(),
            optimizer = ?config.optim.kind,
            "Robust ensemble built"
        );

        let stepper = match config.optim.kind {
            OptimizerKind::EntropySgd => Stepper::Esgd(EntropySgd::new(
                &net,
                &config.esgd,
                &config.optim,
                config.seed,
            )?),
            _ => Stepper::Replicas(
                net.replicas()
                    .iter()
                    .map(|r| ReplicaOptimizer::new(r.vars().to_vec(), &config.optim))
                    .collect::<candle_core::Result<Vec<_>>>()?,
            ),
        };

        let lr_scheduler = LrScheduler::new(
            config.optim.lr,
            config.optim.warmup_epochs,
            config.epochs,
            config.optim.schedule.clone(),
        );
        let coupling = CouplingSchedule::new(&config.robust, config.epochs);

        Ok(Self {
            net,
            stepper,
            lr_scheduler,
            coupling,
            config,
            output_dir,
            epoch: 0,
            progress: true,
        })
    }

    pub fn net(&self) -> &RobustNet {
        &self.net
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Coupling `g` the next training epoch will use.
    pub fn coupling(&self) -> f64 {
        self.coupling.training_value()
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr_scheduler.current_lr()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Show or hide the per-epoch progress bar.
    pub fn set_progress(&mut self, progress: bool) {
        self.progress = progress;
    }

    fn progress_bar(&self, len: usize) -> anyhow::Result<ProgressBar> {
        if !self.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} batches {msg}")?
                .progress_chars("=>-"),
        );
        Ok(pb)
    }

    /// Run one epoch over `loader`.
    pub fn train_epoch(&mut self, loader: &mut RobustDataLoader) -> anyhow::Result<EpochMetrics> {
        if loader.replicas() != self.net.y() {
            anyhow::bail!(
                "loader feeds {} replicas but the ensemble has {}",
                loader.replicas(),
                self.net.y()
            );
        }
        let g = self.coupling.training_value();
        let lr = self.lr_scheduler.current_lr();
        let kind = self.config.optim.loss;
        let flood = self.config.optim.flood;
        let shape = self.config.model.input_shape.clone();
        let n_params = self.net.num_params().max(1) as f64;
        let num_batches = loader.num_batches();
        let epoch = self.epoch + 1;
        let pb = self.progress_bar(num_batches)?;

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut count = 0usize;
        let mut dist_sum = 0.0f64;
        let mut dist_samples = 0usize;
        let mut grad_sum = 0.0f64;
        let mut steps = 0usize;
        let mut trace = Vec::new();
        let net = &self.net;

        let gamma_esgd = match &mut self.stepper {
            Stepper::Replicas(optimizers) => {
                for opt in optimizers.iter_mut() {
                    opt.set_learning_rate(lr);
                }
                for batch in loader.epoch() {
                    let mut batch_grad = 0.0;
                    for (a, (b, opt)) in batch.per_replica.iter().zip(optimizers.iter_mut()).enumerate() {
                        let replica = net.replica(a);
                        let (x, y) = b.to_tensors(&shape, replica.device())?;
                        let logits = replica.forward_t(&x, true)?;
                        let raw = loss::mean(kind, &logits, &y)?;
                        loss_sum += raw.to_scalar::<f32>()? as f64 * b.len as f64;
                        correct += topk_correct(&logits, &y, 1)?;
                        count += b.len;

                        let mut grads = loss::flooded(&raw, flood)?.backward()?;
                        if g != 0.0 {
                            add_coupling(&mut grads, replica.vars(), &net.coupling_gradients(a, g)?)?;
                        }
                        batch_grad += grad_norm(&grads, replica.vars())?;
                        opt.step(&grads)?;
                    }
                    net.update_center()?;

                    if steps % DIST_SAMPLE_EVERY == 0 || steps + 1 == num_batches {
                        let d: f64 = net.sqdistances()?.iter().map(|d| (d / n_params).sqrt()).sum();
                        dist_sum += d / net.y() as f64;
                        dist_samples += 1;
                    }
                    grad_sum += batch_grad / net.y() as f64;
                    steps += 1;
                    pb.inc(1);
                    pb.set_message(format!("loss {:.4}", loss_sum / count.max(1) as f64));
                }
                0.0
            }
            Stepper::Esgd(esgd) => {
                esgd.set_learning_rate(lr);
                for step in 0..num_batches {
                    let s = esgd.step(net, g, || loader.sample_single())?;
                    trace.push(EsgdTraceLine {
                        epoch,
                        step,
                        replica: s.replica,
                        dist: s.dist,
                        grad_norm: s.grad_norm,
                        gamma: s.gamma,
                    });
                    loss_sum += s.loss * s.count as f64;
                    correct += s.correct;
                    count += s.count;
                    dist_sum += s.dist;
                    dist_samples += 1;
                    grad_sum += s.grad_norm;
                    steps += 1;
                    pb.inc(1);
                    pb.set_message(format!("loss {:.4} γ {:.3e}", s.loss, esgd.gamma()));
                }
                esgd.gamma()
            }
        };
        pb.finish_and_clear();
        if !trace.is_empty() {
            self.append_esgd_trace(&trace)?;
        }

        let metrics = EpochMetrics {
            epoch,
            loss: loss_sum / count.max(1) as f64,
            error: 100.0 * (1.0 - correct as f64 / count.max(1) as f64),
            mean_dist: dist_sum / dist_samples.max(1) as f64,
            mean_grad_norm: grad_sum / steps.max(1) as f64,
            lr,
            gamma_esgd,
        };
        tracing::debug!(
            epoch = metrics.epoch,
            loss = format!("{:.4}", metrics.loss),
            error = format!("{:.2}", metrics.error),
            dist = format!("{:.4e}", metrics.mean_dist),
            grad = format!("{:.4e}", metrics.mean_grad_norm),
            g,
            "epoch trained"
        );
        Ok(metrics)
    }

    fn append_esgd_trace(&self, lines: &[EsgdTraceLine]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(ESGD_TRACE_FILE);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        for line in lines {
            writeln!(file, "{}", serde_json::to_string(line)?)?;
        }
        Ok(())
    }

    /// Advance the LR and coupling schedules past the epoch just trained.
    pub fn end_epoch(&mut self) {
        self.epoch += 1;
        self.lr_scheduler.advance();
        self.coupling.advance();
    }

    /// Set `g0` from the epoch-0 report when no initial coupling was given.
    /// Returns the coupling now in effect.
    pub fn balance_coupling(&mut self, report: &Report) -> f64 {
        if self.coupling.needs_balancing() {
            let g0 = CouplingSchedule::balanced_g0(report.mean_train_loss(), report.dist_loss);
            self.coupling.rebase(g0);
            tracing::info!(g0 = self.coupling.g0(), "Coupling balanced against training loss");
        }
        self.coupling.current()
    }

    /// Resume schedules as if `last_epoch` epochs had been trained.
    pub fn fast_forward(&mut self, last_epoch: usize, steps_per_epoch: usize) {
        let skip = last_epoch.saturating_sub(self.epoch);
        self.epoch += skip;
        self.lr_scheduler.set_epoch(self.epoch);
        self.coupling.fast_forward(skip);
        if let Stepper::Esgd(esgd) = &mut self.stepper {
            esgd.fast_forward(skip * steps_per_epoch);
        }
    }

    /// Evaluate on both loaders and build the report for the current epoch.
    pub fn report(
        &self,
        train: &RobustDataLoader,
        test: &RobustDataLoader,
        extras: EpochExtras,
    ) -> anyhow::Result<Report> {
        let kind = self.config.optim.loss;
        let train_eval = evaluate(&self.net, train, kind, false)?;
        let test_eval = evaluate(&self.net, test, kind, true)?;
        Report::new(
            self.epoch,
            &self.net,
            &train_eval,
            &test_eval,
            self.coupling.current(),
            extras,
        )
    }

    /// Full loop: epoch-0 report (and coupling balancing), `epochs` training
    /// epochs with periodic reports and checkpoints, then the final save.
    pub fn fit(
        &mut self,
        train: &mut RobustDataLoader,
        test: &RobustDataLoader,
    ) -> anyhow::Result<Report> {
        std::fs::create_dir_all(&self.output_dir)?;
        let metrics_path = self.output_dir.join(METRICS_FILE);

        let mut last = self.report(train, test, EpochExtras {
            lr: self.learning_rate(),
            ..Default::default()
        })?;
        if self.epoch == 0 {
            self.balance_coupling(&last);
            last.gamma = self.coupling.current();
            last.coupl_loss = last.gamma * last.dist_loss;
        }
        last.log();
        last.append_jsonl(&metrics_path)?;

        while self.epoch < self.config.epochs {
            let metrics = self.train_epoch(train)?;
            self.end_epoch();

            let log_every = self.config.log_every.max(1);
            if self.epoch % log_every == 0 || self.epoch == self.config.epochs {
                last = self.report(train, test, metrics.extras())?;
                last.log();
                last.append_jsonl(&metrics_path)?;
            }
            if self.config.save_every > 0 && self.epoch % self.config.save_every == 0 {
                let path = self.save_checkpoint(&self.epoch.to_string())?;
                tracing::info!(path = %path.display(), "Saved checkpoint");
            }
        }

        let path = self.save_final()?;
        tracing::info!(path = %path.display(), "Training done");
        Ok(last)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    fn state(&self) -> TrainerState {
        TrainerState {
            epoch: self.epoch,
            g0: self.coupling.g0(),
            gamma_esgd: match &self.stepper {
                Stepper::Esgd(esgd) => Some(esgd.gamma()),
                Stepper::Replicas(_) => None,
            },
        }
    }

    fn save_to(&self, dir: &Path) -> anyhow::Result<()> {
        self.net.save(dir)?;
        self.config.save(&dir.join(CONFIG_FILE))?;
        let state = serde_json::to_string_pretty(&self.state())?;
        std::fs::write(dir.join(STATE_FILE), state)?;
        Ok(())
    }

    /// Save replicas, center, config and schedule state under
    /// `output_dir/checkpoint-{tag}`.
    pub fn save_checkpoint(&self, tag: &str) -> anyhow::Result<PathBuf> {
        let dir = self.output_dir.join(format!("checkpoint-{tag}"));
        self.save_to(&dir)?;
        Ok(dir)
    }

    /// Save the final ensemble directly into `output_dir`.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        self.save_to(&self.output_dir)?;
        Ok(self.output_dir.clone())
    }

    /// Load weights and schedule state saved by [`Self::save_checkpoint`].
    /// Optimiser momentum is not restored.
    pub fn load_checkpoint(&mut self, dir: &Path, steps_per_epoch: usize) -> anyhow::Result<()> {
        self.net.load(dir)?;
        let state_path = dir.join(STATE_FILE);
        let json = std::fs::read_to_string(&state_path)
            .with_context(|| format!("read {}", state_path.display()))?;
        let state: TrainerState = serde_json::from_str(&json)?;

        self.coupling.restore_g0(state.g0);
        self.fast_forward(state.epoch, steps_per_epoch);
        if let (Stepper::Esgd(esgd), Some(gamma)) = (&mut self.stepper, state.gamma_esgd) {
            esgd.set_gamma(gamma);
        }
        tracing::info!(epoch = state.epoch, dir = %dir.display(), "Resumed from checkpoint");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
