//! Evaluation of replicas and center, and the per-epoch report.

use std::io::Write;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;
use serde::Serialize;

use entropic_common::{Batch, LossKind, RobustDataLoader};
use entropic_core::{Classifier, RobustNet};

use crate::loss;

// ── Counting ────────────────────────────────────────────────────────────────

/// Number of rows whose target is among the `k` highest logits.
pub fn topk_correct(logits: &Tensor, targets: &Tensor, k: usize) -> candle_core::Result<usize> {
    let k = k.min(logits.dim(1)?);
    let top = if k == 1 {
        logits.argmax_keepdim(1)?
    } else {
        logits.arg_sort_last_dim(false)?.narrow(1, 0, k)?
    };
    let hits = top
        .broadcast_eq(&targets.to_dtype(DType::U32)?.unsqueeze(1)?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits as usize)
}

/// Running totals over a dataset for one network.
#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    pub loss_sum: f64,
    pub correct: usize,
    pub correct5: usize,
    pub count: usize,
}

impl Totals {
    pub fn mean_loss(&self) -> f64 {
        self.loss_sum / self.count.max(1) as f64
    }

    /// Top-1 error in percent.
    pub fn error(&self) -> f64 {
        100.0 * (1.0 - self.correct as f64 / self.count.max(1) as f64)
    }

    pub fn top5_error(&self) -> f64 {
        100.0 * (1.0 - self.correct5 as f64 / self.count.max(1) as f64)
    }
}

/// Evaluate `model` on host batches.
pub(crate) fn evaluate_model(
    model: &Classifier,
    batches: &[Batch],
    sample_shape: &[usize],
    device: &Device,
    kind: LossKind,
    top5: bool,
) -> candle_core::Result<Totals> {
    let mut totals = Totals::default();
    for batch in batches {
        let (x, y) = batch.to_tensors(sample_shape, device)?;
        let logits = model.forward_t(&x, false)?;
        totals.loss_sum += loss::sum(kind, &logits, &y)?;
        totals.correct += topk_correct(&logits, &y, 1)?;
        if top5 {
            totals.correct5 += topk_correct(&logits, &y, 5)?;
        }
        totals.count += batch.len;
    }
    Ok(totals)
}

// ── Evaluation ──────────────────────────────────────────────────────────────

/// Loss and error of every replica and of the center on one dataset.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub loss: Vec<f64>,
    pub error: Vec<f64>,
    pub center_loss: f64,
    pub center_error: f64,
    pub center_top5_error: Option<f64>,
    /// `sqrt(‖c‖² / num_params)`.
    pub norm_center: f64,
}

/// Evaluate all replicas and the center on `loader`'s in-order batches.
/// Networks are evaluated in parallel.
pub fn evaluate(
    net: &RobustNet,
    loader: &RobustDataLoader,
    kind: LossKind,
    top5: bool,
) -> anyhow::Result<Evaluation> {
    let batches: Vec<Batch> = loader.single_batches().collect();
    let shape = loader.dataset().sample_shape();

    let networks: Vec<_> = net
        .replicas()
        .iter()
        .chain(std::iter::once(net.center()))
        .collect();
    let totals = networks
        .par_iter()
        .enumerate()
        .map(|(i, r)| {
            let is_center = i == networks.len() - 1;
            evaluate_model(r.model(), &batches, shape, r.device(), kind, top5 && is_center)
        })
        .collect::<candle_core::Result<Vec<_>>>()?;

    let (center, replicas) = totals.split_last().ok_or_else(|| anyhow::anyhow!("no networks"))?;
    let norm_center = (net.center_sqnorm()? / net.num_params().max(1) as f64).sqrt();

    Ok(Evaluation {
        loss: replicas.iter().map(Totals::mean_loss).collect(),
        error: replicas.iter().map(Totals::error).collect(),
        center_loss: center.mean_loss(),
        center_error: center.error(),
        center_top5_error: top5.then(|| center.top5_error()),
        norm_center,
    })
}

// ── Report ──────────────────────────────────────────────────────────────────

/// Statistics produced by the training epoch that precedes a report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EpochExtras {
    pub lr: f64,
    pub esgd_dist: f64,
    pub esgd_grad: f64,
    pub g_esgd: f64,
}

/// One line of `metrics.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub epoch: usize,
    pub train_loss: Vec<f64>,
    pub train_error: Vec<f64>,
    pub test_loss: Vec<f64>,
    pub test_error: Vec<f64>,
    pub train_center_loss: f64,
    pub train_center_error: f64,
    pub test_center_loss: f64,
    pub test_center_error: f64,
    pub test_center_top5_error: Option<f64>,
    pub norm_center: f64,
    pub dist_loss: f64,
    pub coupl_loss: f64,
    /// `sqrt(‖w_a − c‖² / num_params)` per replica.
    pub distances: Vec<f64>,
    /// `sqrt(‖w_a‖² / num_params)` per replica.
    pub norms: Vec<f64>,
    pub gamma: f64,
    pub lr: f64,
    pub esgd_dist: f64,
    pub esgd_grad: f64,
    pub g_esgd: f64,
    /// Center test loss minus center train loss.
    pub gen_gap: f64,
}

impl Report {
    pub fn new(
        epoch: usize,
        net: &RobustNet,
        train: &Evaluation,
        test: &Evaluation,
        g: f64,
        extras: EpochExtras,
    ) -> anyhow::Result<Self> {
        let n = net.num_params().max(1) as f64;
        let dist_loss = net.distance_loss()?;
        let per_param = |v: Vec<f64>| v.into_iter().map(|d| (d / n).sqrt()).collect();
        Ok(Self {
            epoch,
            train_loss: train.loss.clone(),
            train_error: train.error.clone(),
            test_loss: test.loss.clone(),
            test_error: test.error.clone(),
            train_center_loss: train.center_loss,
            train_center_error: train.center_error,
            test_center_loss: test.center_loss,
            test_center_error: test.center_error,
            test_center_top5_error: test.center_top5_error,
            norm_center: train.norm_center,
            dist_loss,
            coupl_loss: g * dist_loss,
            distances: per_param(net.sqdistances()?),
            norms: per_param(net.sqnorms()?),
            gamma: g,
            lr: extras.lr,
            esgd_dist: extras.esgd_dist,
            esgd_grad: extras.esgd_grad,
            g_esgd: extras.g_esgd,
            gen_gap: test.center_loss - train.center_loss,
        })
    }

    /// Mean replica training loss.
    pub fn mean_train_loss(&self) -> f64 {
        self.train_loss.iter().sum::<f64>() / self.train_loss.len().max(1) as f64
    }

    pub fn log(&self) {
        tracing::info!(
            epoch = self.epoch,
            train_loss = format!("{:.4}", self.mean_train_loss()),
            train_center_error = format!("{:.2}", self.train_center_error),
            test_center_loss = format!("{:.4}", self.test_center_loss),
            test_center_error = format!("{:.2}", self.test_center_error),
            dist_loss = format!("{:.4e}", self.dist_loss),
            g = format!("{:.3e}", self.gamma),
            lr = format!("{:.3e}", self.lr),
            "Report"
        );
    }

    /// Append this report as one JSON line.
    pub fn append_jsonl(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", serde_json::to_string(self)?)?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
