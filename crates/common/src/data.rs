//! Data pipeline: in-memory classification datasets and replicated batching.
//!
//! Datasets are stored host-side as flat `f32` inputs plus `u32` labels and
//! moved to a device one batch at a time. Files use the safetensors format
//! with two tensors, `images` (`[N, ...]`) and `labels` (`[N]`).
//!
//! * **[`ClassificationDataset`]**: load, subset, standardise, synthesise.
//! * **[`RobustDataLoader`]**: per-epoch replicated batches (one independent
//!   shuffle per replica), in-order evaluation batches, and freshly sampled
//!   single mini-batches.
//! * **[`Batch::to_tensors`]**: raw batch → Candle tensors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

const IMAGES_KEY: &str = "images";
const LABELS_KEY: &str = "labels";

// ── ClassificationDataset ───────────────────────────────────────────────────

/// Labelled samples held in host memory.
#[derive(Debug, Clone)]
pub struct ClassificationDataset {
    inputs: Vec<f32>,
    labels: Vec<u32>,
    sample_shape: Vec<usize>,
    num_classes: usize,
}

/// Per-feature mean and standard deviation used for preprocessing.
#[derive(Debug, Clone)]
pub struct Standardization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl ClassificationDataset {
    pub fn new(inputs: Vec<f32>, labels: Vec<u32>, sample_shape: Vec<usize>) -> AnyhowResult<Self> {
        let dim: usize = sample_shape.iter().product();
        if dim == 0 {
            anyhow::bail!("sample shape {sample_shape:?} has no elements");
        }
        if inputs.len() != labels.len() * dim {
            anyhow::bail!(
                "inputs hold {} values but {} labels × {dim} features were expected",
                inputs.len(),
                labels.len()
            );
        }
        let num_classes = labels.iter().copied().max().map_or(0, |m| m as usize + 1);
        Ok(Self {
            inputs,
            labels,
            sample_shape,
            num_classes,
        })
    }

    /// Load `images` / `labels` tensors from a safetensors file.
    pub fn load_safetensors(path: &Path) -> AnyhowResult<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("load dataset {}", path.display()))?;
        let images = tensors
            .get(IMAGES_KEY)
            .with_context(|| format!("{} has no {IMAGES_KEY:?} tensor", path.display()))?;
        let labels = tensors
            .get(LABELS_KEY)
            .with_context(|| format!("{} has no {LABELS_KEY:?} tensor", path.display()))?;

        let dims = images.dims();
        if dims.len() < 2 {
            anyhow::bail!("images must be [N, ...], got {dims:?}");
        }
        let sample_shape = dims[1..].to_vec();
        let mut images = images.to_dtype(DType::F32)?;
        if tensors[IMAGES_KEY].dtype() == DType::U8 {
            images = images.affine(1.0 / 255.0, 0.0)?;
        }
        let inputs = images.flatten_all()?.to_vec1::<f32>()?;
        let labels = labels.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        Self::new(inputs, labels, sample_shape)
    }

    /// Write the dataset as `images` (F32) / `labels` (U32) safetensors.
    pub fn save_safetensors(&self, path: &Path) -> AnyhowResult<()> {
        let mut shape = vec![self.len()];
        shape.extend_from_slice(&self.sample_shape);
        let images = Tensor::from_slice(&self.inputs, shape.as_slice(), &Device::Cpu)?;
        let labels = Tensor::from_slice(&self.labels, self.len(), &Device::Cpu)?;
        let tensors: HashMap<String, Tensor> = [
            (IMAGES_KEY.to_string(), images),
            (LABELS_KEY.to_string(), labels),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("save dataset {}", path.display()))?;
        Ok(())
    }

    /// Gaussian-mixture data: one isotropic blob per class with centres drawn
    /// from `N(0, separation²)`.
    pub fn synthetic_blobs(
        n: usize,
        sample_shape: &[usize],
        num_classes: usize,
        separation: f32,
        seed: u64,
    ) -> AnyhowResult<Self> {
        if num_classes == 0 {
            anyhow::bail!("synthetic data needs at least one class");
        }
        let dim: usize = sample_shape.iter().product();
        let mut rng = StdRng::seed_from_u64(seed);
        let centre_dist = Normal::new(0.0f32, separation.max(f32::EPSILON))?;
        let noise = Normal::new(0.0f32, 1.0)?;

        let centres: Vec<Vec<f32>> = (0..num_classes)
            .map(|_| (0..dim).map(|_| centre_dist.sample(&mut rng)).collect())
            .collect();

        let mut inputs = Vec::with_capacity(n * dim);
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let c = rng.gen_range(0..num_classes);
            labels.push(c as u32);
            inputs.extend(centres[c].iter().map(|&m| m + noise.sample(&mut rng)));
        }
        let mut ds = Self::new(inputs, labels, sample_shape.to_vec())?;
        ds.num_classes = num_classes;
        Ok(ds)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    pub fn sample_dim(&self) -> usize {
        self.sample_shape.iter().product()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Keep only the first `m` examples.
    pub fn take_first(mut self, m: usize) -> Self {
        let m = m.min(self.len());
        self.inputs.truncate(m * self.sample_dim());
        self.labels.truncate(m);
        self
    }

    /// Split into the first `at` examples and the rest (e.g. train / test from
    /// one synthetic draw). Both halves keep the full class count.
    pub fn split_at(mut self, at: usize) -> (Self, Self) {
        let at = at.min(self.len());
        let dim = self.sample_dim();
        let rest = Self {
            inputs: self.inputs.split_off(at * dim),
            labels: self.labels.split_off(at),
            sample_shape: self.sample_shape.clone(),
            num_classes: self.num_classes,
        };
        (self, rest)
    }

    /// Keep the first `k` examples of every class, in dataset order.
    pub fn take_per_class(&self, k: usize) -> Self {
        let mut seen = vec![0usize; self.num_classes];
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| {
                let c = self.labels[i] as usize;
                if seen[c] < k {
                    seen[c] += 1;
                    true
                } else {
                    false
                }
            })
            .collect();
        let batch = self.gather(&keep);
        Self {
            inputs: batch.inputs,
            labels: batch.labels,
            sample_shape: self.sample_shape.clone(),
            num_classes: self.num_classes,
        }
    }

    /// Per-feature statistics of this dataset.
    pub fn standardization(&self) -> Standardization {
        let dim = self.sample_dim();
        let n = self.len().max(1) as f64;
        let mut mean = vec![0f64; dim];
        let mut sq = vec![0f64; dim];
        for row in self.inputs.chunks_exact(dim) {
            for (j, &x) in row.iter().enumerate() {
                mean[j] += x as f64;
                sq[j] += (x as f64) * (x as f64);
            }
        }
        let mut out_mean = Vec::with_capacity(dim);
        let mut out_std = Vec::with_capacity(dim);
        for j in 0..dim {
            let m = mean[j] / n;
            let var = (sq[j] / n - m * m).max(0.0);
            let s = var.sqrt();
            out_mean.push(m as f32);
            out_std.push(if s < 1e-8 { 1.0 } else { s as f32 });
        }
        Standardization {
            mean: out_mean,
            std: out_std,
        }
    }

    /// Apply `(x - mean) / std` feature-wise.
    pub fn apply_standardization(&mut self, stats: &Standardization) -> AnyhowResult<()> {
        let dim = self.sample_dim();
        if stats.mean.len() != dim || stats.std.len() != dim {
            anyhow::bail!(
                "standardization has {} features, dataset has {dim}",
                stats.mean.len()
            );
        }
        for row in self.inputs.chunks_exact_mut(dim) {
            for (j, x) in row.iter_mut().enumerate() {
                *x = (*x - stats.mean[j]) / stats.std[j];
            }
        }
        Ok(())
    }

    /// Copy the given examples into a [`Batch`].
    pub fn gather(&self, indices: &[usize]) -> Batch {
        let dim = self.sample_dim();
        let mut inputs = Vec::with_capacity(indices.len() * dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            inputs.extend_from_slice(&self.inputs[i * dim..(i + 1) * dim]);
            labels.push(self.labels[i]);
        }
        Batch {
            len: labels.len(),
            inputs,
            labels,
        }
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// A host-side mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub labels: Vec<u32>,
    pub len: usize,
}

impl Batch {
    /// Convert to `(inputs [len, ...shape], labels [len])` Candle tensors.
    pub fn to_tensors(&self, sample_shape: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let mut shape = Vec::with_capacity(sample_shape.len() + 1);
        shape.push(self.len);
        shape.extend_from_slice(sample_shape);
        let inputs = Tensor::from_slice(&self.inputs, shape.as_slice(), device)?;
        let labels = Tensor::from_slice(&self.labels, self.len, device)?;
        Ok((inputs, labels))
    }
}

/// One mini-batch per replica, drawn from independent shuffles.
#[derive(Debug, Clone)]
pub struct ReplicatedBatch {
    pub per_replica: Vec<Batch>,
}

impl ReplicatedBatch {
    /// Examples seen by each replica.
    pub fn len(&self) -> usize {
        self.per_replica.first().map_or(0, |b| b.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── RobustDataLoader ────────────────────────────────────────────────────────

/// Loader feeding `y` replicas.
///
/// Every epoch draws one random permutation per replica, so each replica sees
/// the whole dataset once per epoch in its own order.
pub struct RobustDataLoader {
    dataset: Arc<ClassificationDataset>,
    replicas: usize,
    batch_size: usize,
    rng: StdRng,
}

impl RobustDataLoader {
    pub fn new(
        dataset: Arc<ClassificationDataset>,
        replicas: usize,
        batch_size: usize,
        seed: u64,
    ) -> AnyhowResult<Self> {
        if replicas == 0 || batch_size == 0 {
            anyhow::bail!("replicas ({replicas}) and batch_size ({batch_size}) must be positive");
        }
        if dataset.is_empty() {
            anyhow::bail!("dataset is empty");
        }
        Ok(Self {
            dataset,
            replicas,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn dataset(&self) -> &ClassificationDataset {
        &self.dataset
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch (the last one may be partial).
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Shuffle and return this epoch's replicated batches.
    pub fn epoch(&mut self) -> ReplicatedEpoch {
        let n = self.dataset.len();
        let permutations = (0..self.replicas)
            .map(|_| {
                let mut p: Vec<usize> = (0..n).collect();
                p.shuffle(&mut self.rng);
                p
            })
            .collect();
        ReplicatedEpoch {
            dataset: Arc::clone(&self.dataset),
            permutations,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }

    /// In-order, non-replicated batches covering the dataset exactly once.
    pub fn single_batches(&self) -> impl Iterator<Item = Batch> + '_ {
        let n = self.dataset.len();
        let bs = self.batch_size;
        (0..n).step_by(bs).map(move |start| {
            let idx: Vec<usize> = (start..(start + bs).min(n)).collect();
            self.dataset.gather(&idx)
        })
    }

    /// A fresh uniformly sampled mini-batch (without replacement within it).
    pub fn sample_single(&mut self) -> Batch {
        let n = self.dataset.len();
        let k = self.batch_size.min(n);
        let idx = rand::seq::index::sample(&mut self.rng, n, k).into_vec();
        self.dataset.gather(&idx)
    }
}

/// Iterator over one epoch of replicated batches.
pub struct ReplicatedEpoch {
    dataset: Arc<ClassificationDataset>,
    permutations: Vec<Vec<usize>>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for ReplicatedEpoch {
    type Item = ReplicatedBatch;

    fn next(&mut self) -> Option<ReplicatedBatch> {
        let n = self.dataset.len();
        if self.cursor >= n {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(n);
        let per_replica = self
            .permutations
            .iter()
            .map(|p| self.dataset.gather(&p[self.cursor..end]))
            .collect();
        self.cursor = end;
        Some(ReplicatedBatch { per_replica })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
