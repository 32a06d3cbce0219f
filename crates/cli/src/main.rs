use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use entropic_common::{ClassificationDataset, LrSchedule, OptimizerKind, RobustDataLoader, RunConfig};
use entropic_core::{normalize_robust, RobustNet};
use entropic_train::{local_energy, RobustTrainer};

#[derive(Parser, Debug)]
#[command(name = "entropic", about = "Robust-ensemble and Entropy-SGD training experiments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a coupled replica ensemble.
    Train(TrainArgs),
    /// Measure local energy (flatness) of a trained network.
    Flatness(FlatnessArgs),
    /// Apply function-preserving weight normalization to a trained ReLU MLP.
    Normalize(NormalizeArgs),
    /// Write a synthetic Gaussian-blob dataset in safetensors format.
    Synth(SynthArgs),
}

// ── Shared ─────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct DeviceArgs {
    /// Run everything on the CPU.
    #[arg(long)]
    cpu: bool,
    /// CUDA ordinals; replicas are spread round-robin, the last one hosts the center.
    #[arg(long, value_delimiter = ',')]
    gpu: Vec<usize>,
}

#[derive(Parser, Debug)]
struct DataArgs {
    /// Training set (`images` / `labels` safetensors).
    #[arg(long)]
    train_data: Option<PathBuf>,
    /// Test set (`images` / `labels` safetensors).
    #[arg(long)]
    test_data: Option<PathBuf>,
    /// Use `N` synthetic training examples (plus N/4 test examples) instead of files.
    #[arg(long)]
    synthetic: Option<usize>,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[command(flatten)]
    data: DataArgs,
    #[command(flatten)]
    devices: DeviceArgs,
    #[arg(long, default_value = "runs")]
    output_dir: PathBuf,
    /// Number of replicas `y`.
    #[arg(long)]
    replicas: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    /// Initial coupling. Pass a negative value to balance it at epoch 0.
    #[arg(long)]
    g: Option<f64>,
    /// sgd, nesterov, adam or entropy-sgd.
    #[arg(long)]
    opt: Option<OptimizerKind>,
    #[arg(long)]
    seed: Option<u64>,
    /// LR drop encoding: 0, cosine, a factor < 1 (every 2 epochs) or ≥ 1 (at milestones).
    #[arg(long)]
    droplr: Option<String>,
    /// Milestones for `--droplr`, e.g. `drop_150_225`.
    #[arg(long)]
    drop_milestones: Option<String>,
    /// Multiply all initial weights by this gain.
    #[arg(long)]
    init_rescale: Option<f64>,
    /// Multiplicative Gaussian perturbation of the initial weights.
    #[arg(long)]
    init_perturb: Option<f64>,
    /// Resume from a checkpoint directory.
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

// ── Flatness / Normalize / Synth ───────────────────────────────────────────────

#[derive(Parser, Debug)]
struct FlatnessArgs {
    /// Directory written by `train` (config.json + replica weights).
    #[arg(long)]
    model_dir: PathBuf,
    #[command(flatten)]
    data: DataArgs,
    #[command(flatten)]
    devices: DeviceArgs,
    /// Perturbation amplitudes.
    #[arg(long, value_delimiter = ',', default_value = "0,0.1,0.2,0.5")]
    sigmas: Vec<f64>,
    #[arg(long, default_value_t = 10)]
    samples: usize,
    /// Probe this replica instead of the center.
    #[arg(long)]
    replica: Option<usize>,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Write the results as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct NormalizeArgs {
    #[arg(long)]
    model_dir: PathBuf,
    /// Where to write the normalized ensemble (defaults to `model_dir`).
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct SynthArgs {
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = 1000)]
    n: usize,
    /// Per-sample shape, e.g. `1,28,28`.
    #[arg(long, value_delimiter = ',', default_value = "784")]
    shape: Vec<usize>,
    #[arg(long, default_value_t = 10)]
    classes: usize,
    #[arg(long, default_value_t = 1.0)]
    separation: f32,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Flatness(args) => cmd_flatness(args),
        Command::Normalize(args) => cmd_normalize(args),
        Command::Synth(args) => cmd_synth(args),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

/// Device list: CPU, the requested CUDA ordinals, or CUDA 0 when available.
fn devices(args: &DeviceArgs) -> Result<Vec<Device>> {
    if args.cpu {
        return Ok(vec![Device::Cpu]);
    }
    if args.gpu.is_empty() {
        return Ok(vec![Device::cuda_if_available(0)?]);
    }
    args.gpu
        .iter()
        .map(|&i| Device::new_cuda(i).with_context(|| format!("open cuda:{i}")))
        .collect()
}

fn seed_devices(devices: &[Device], seed: u64) {
    for device in devices {
        if let Err(e) = device.set_seed(seed) {
            tracing::debug!(device = ?device.location(), error = %e, "device seeding unsupported");
        }
    }
}

/// Train and test sets with the run's subsets and preprocessing applied.
fn load_data(args: &DataArgs, config: &RunConfig) -> Result<(ClassificationDataset, ClassificationDataset)> {
    let (mut train, mut test) = match (args.synthetic, &args.train_data, &args.test_data) {
        (Some(n), _, _) => {
            let all = ClassificationDataset::synthetic_blobs(
                n + n / 4,
                &config.model.input_shape,
                config.model.num_classes,
                1.0,
                config.seed,
            )?;
            all.split_at(n)
        }
        (None, Some(train), Some(test)) => (
            ClassificationDataset::load_safetensors(train)?,
            ClassificationDataset::load_safetensors(test)?,
        ),
        _ => anyhow::bail!("pass --synthetic N or both --train-data and --test-data"),
    };

    if train.sample_shape() != config.model.input_shape.as_slice() {
        anyhow::bail!(
            "data samples have shape {:?} but the model expects {:?}",
            train.sample_shape(),
            config.model.input_shape
        );
    }
    if let Some(m) = config.train_subset {
        train = train.take_first(m);
    }
    if let Some(m) = config.test_subset {
        test = test.take_first(m);
    }
    if config.preprocess {
        let stats = train.standardization();
        train.apply_standardization(&stats)?;
        test.apply_standardization(&stats)?;
    }
    tracing::info!(train = train.len(), test = test.len(), classes = train.num_classes(), "Data loaded");
    Ok((train, test))
}

fn load_or_create_config(path: &Path) -> Result<RunConfig> {
    if path.exists() {
        return RunConfig::load(path);
    }
    let config = RunConfig::default();
    config.save(path)?;
    tracing::info!(path = %path.display(), "Created default config");
    eprintln!("Created default config at {}", path.display());
    Ok(config)
}

/// Rebuild an ensemble saved by `train`.
fn load_ensemble(dir: &Path, devices: &[Device]) -> Result<(RunConfig, RobustNet)> {
    let config = RunConfig::load(&dir.join("config.json"))
        .with_context(|| format!("no run config in {}", dir.display()))?;
    let mut net = RobustNet::new(&config.model, config.robust.replicas, devices)?;
    net.load(dir)?;
    Ok((config, net))
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut config = load_or_create_config(&args.config)?;

    // CLI overrides
    if let Some(y) = args.replicas {
        config.robust.replicas = y;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(lr) = args.lr {
        config.optim.lr = lr;
    }
    if let Some(g) = args.g {
        config.robust.g = (g >= 0.0).then_some(g);
    }
    if let Some(kind) = args.opt {
        config.optim.kind = kind;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(droplr) = &args.droplr {
        config.optim.schedule =
            LrSchedule::from_droplr(droplr, args.drop_milestones.as_deref(), config.epochs)?;
    }
    config.validate()?;

    let devices = devices(&args.devices)?;
    seed_devices(&devices, config.seed);

    let (train, test) = load_data(&args.data, &config)?;
    let mut train_loader =
        RobustDataLoader::new(Arc::new(train), config.robust.replicas, config.batch_size, config.seed)?;
    let test_loader = RobustDataLoader::new(Arc::new(test), 1, config.batch_size, config.seed)?;

    let mut trainer = RobustTrainer::new(config.clone(), &devices, args.output_dir.clone())?;
    trainer.set_progress(!args.no_progress);

    if let Some(dir) = &args.resume {
        trainer.load_checkpoint(dir, train_loader.num_batches())?;
    } else {
        if let Some(gain) = args.init_rescale {
            trainer.net().rescale_parameters(gain)?;
        }
        if let Some(ampl) = args.init_perturb {
            trainer.net().perturb_parameters(ampl, config.seed)?;
        }
    }

    let report = trainer.fit(&mut train_loader, &test_loader)?;
    eprintln!(
        "Training done. Center test error {:.2}% (loss {:.4}), saved to {}",
        report.test_center_error,
        report.test_center_loss,
        trainer.output_dir().display()
    );
    Ok(())
}

fn cmd_flatness(args: FlatnessArgs) -> Result<()> {
    let devices = devices(&args.devices)?;
    let (config, net) = load_ensemble(&args.model_dir, &devices)?;
    let (train, _) = load_data(&args.data, &config)?;
    let loader = RobustDataLoader::new(Arc::new(train), 1, config.batch_size, args.seed)?;

    let network = match args.replica {
        Some(a) if a < net.y() => net.replica(a),
        Some(a) => anyhow::bail!("replica {a} out of range (y = {})", net.y()),
        None => net.center(),
    };
    let points = local_energy(
        network,
        &config.model,
        &loader,
        config.optim.loss,
        &args.sigmas,
        args.samples,
        args.seed,
    )?;

    for p in &points {
        println!(
            "sigma {:.4}  loss {:.4} ± {:.4}  error {:.2} ± {:.2}",
            p.sigma, p.loss_mean, p.loss_std, p.error_mean, p.error_std
        );
    }
    if let Some(path) = &args.output {
        std::fs::write(path, serde_json::to_string_pretty(&points)?)?;
        eprintln!("Wrote {}", path.display());
    }
    Ok(())
}

fn cmd_normalize(args: NormalizeArgs) -> Result<()> {
    let (config, net) = load_ensemble(&args.model_dir, &[Device::Cpu])?;
    let before = net.sqnorms()?;
    let factors = normalize_robust(&net)?;
    let after = net.sqnorms()?;

    for (a, (b, f)) in before.iter().zip(&after).enumerate() {
        tracing::info!(replica = a, sqnorm_before = b, sqnorm_after = f, "Normalized");
    }
    let layers = factors.first().map_or(0, Vec::len);
    eprintln!("Normalized {} replicas ({layers} layers each)", factors.len());

    let out = args.output_dir.unwrap_or(args.model_dir);
    net.save(&out)?;
    config.save(&out.join("config.json"))?;
    eprintln!("Saved to {}", out.display());
    Ok(())
}

fn cmd_synth(args: SynthArgs) -> Result<()> {
    let ds = ClassificationDataset::synthetic_blobs(
        args.n,
        &args.shape,
        args.classes,
        args.separation,
        args.seed,
    )?;
    ds.save_safetensors(&args.output)?;
    eprintln!(
        "Wrote {} examples of shape {:?} ({} classes) to {}",
        ds.len(),
        ds.sample_shape(),
        ds.num_classes(),
        args.output.display()
    );
    Ok(())
}
