//! Local energy: how fast the training loss grows under random
//! multiplicative perturbations of the weights.
//!
//! For amplitude `σ`, each sample evaluates a copy with `w + σ · w ⊙ ξ`,
//! `ξ ~ N(0, 1)` drawn independently per weight. Copies are independent
//! `Classifier`s built from tensors, so samples run in parallel.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use entropic_common::{Batch, LossKind, ModelConfig, RobustDataLoader};
use entropic_core::{params, Classifier, Replica};

use crate::eval::{evaluate_model, Totals};

#[derive(Debug, Clone, Serialize)]
pub struct FlatnessPoint {
    pub sigma: f64,
    pub loss_mean: f64,
    pub loss_std: f64,
    pub error_mean: f64,
    pub error_std: f64,
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn perturbed_totals(
    network: &Replica,
    config: &ModelConfig,
    batches: &[Batch],
    kind: LossKind,
    sigma: f64,
    seed: u64,
) -> candle_core::Result<Totals> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors: HashMap<String, Tensor> = HashMap::with_capacity(network.vars().len());
    for (name, var) in network.names().iter().zip(network.vars()) {
        let w = var.as_tensor();
        let w = if sigma == 0.0 {
            w.copy()?
        } else {
            let xi = params::gaussian_like(w, &mut rng)?;
            (w + (w * xi)?.affine(sigma, 0.0)?)?
        };
        tensors.insert(name.clone(), w);
    }
    let vb = VarBuilder::from_tensors(tensors, DType::F32, network.device());
    let model = Classifier::new(config, vb)?;
    evaluate_model(&model, batches, &config.input_shape, network.device(), kind, false)
}

/// Local energy of `network` on `loader`'s data for each `sigma`,
/// averaged over `samples` perturbations.
pub fn local_energy(
    network: &Replica,
    config: &ModelConfig,
    loader: &RobustDataLoader,
    kind: LossKind,
    sigmas: &[f64],
    samples: usize,
    seed: u64,
) -> anyhow::Result<Vec<FlatnessPoint>> {
    if samples == 0 {
        anyhow::bail!("flatness needs at least one sample per amplitude");
    }
    let batches: Vec<Batch> = loader.single_batches().collect();
    let mut seeder = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(sigmas.len());

    for &sigma in sigmas {
        let seeds: Vec<u64> = (0..samples).map(|_| seeder.gen()).collect();
        let totals = seeds
            .par_iter()
            .map(|&s| perturbed_totals(network, config, &batches, kind, sigma, s))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let losses: Vec<f64> = totals.iter().map(Totals::mean_loss).collect();
        let errors: Vec<f64> = totals.iter().map(Totals::error).collect();
        let (loss_mean, loss_std) = mean_std(&losses);
        let (error_mean, error_std) = mean_std(&errors);
        tracing::info!(
            sigma,
            loss = format!("{loss_mean:.4} ± {loss_std:.4}"),
            error = format!("{error_mean:.2} ± {error_std:.2}"),
            "local energy"
        );
        points.push(FlatnessPoint {
            sigma,
            loss_mean,
            loss_std,
            error_mean,
            error_std,
        });
    }
    Ok(points)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use entropic_common::ClassificationDataset;
    use entropic_core::RobustNet;

    use crate::eval::evaluate;

    fn setup() -> (RobustNet, RobustDataLoader, ModelConfig) {
        let data = ClassificationDataset::synthetic_blobs(48, &[5], 3, 3.0, 11).unwrap();
        let loader = RobustDataLoader::new(Arc::new(data), 1, 16, 0).unwrap();
        let config = ModelConfig {
            arch: "mlp_10".parse().unwrap(),
            input_shape: vec![5],
            num_classes: 3,
            ..Default::default()
        };
        let net = RobustNet::new(&config, 1, &[]).unwrap();
        (net, loader, config)
    }

    #[test]
    fn zero_amplitude_is_unperturbed_loss() {
        let (net, loader, config) = setup();
        let points =
            local_energy(net.center(), &config, &loader, LossKind::Nll, &[0.0], 3, 0).unwrap();
        let eval = evaluate(&net, &loader, LossKind::Nll, false).unwrap();
        assert!((points[0].loss_mean - eval.center_loss).abs() < 1e-6);
        assert!(points[0].loss_std < 1e-9);
    }

    #[test]
    fn perturbations_are_seeded() {
        let (net, loader, config) = setup();
        let run = |seed| {
            local_energy(net.center(), &config, &loader, LossKind::Nll, &[0.5], 4, seed).unwrap()
        };
        let a = run(7);
        let b = run(7);
        assert_eq!(a[0].loss_mean, b[0].loss_mean);
        assert!(a[0].loss_std > 0.0);
    }

    #[test]
    fn zero_samples_is_an_error() {
        let (net, loader, config) = setup();
        assert!(local_energy(net.center(), &config, &loader, LossKind::Nll, &[0.1], 0, 0).is_err());
    }
}
