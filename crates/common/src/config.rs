//! Run configuration for robust-ensemble experiments.
//!
//! Serialised as JSON next to checkpoints. Every field has a sensible default
//! so a minimal `{}` JSON produces a working (small) experiment: an MLP on
//! 28×28 single-channel inputs, one replica, plain momentum SGD.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Model ───────────────────────────────────────────────────────────────────

/// Classifier architecture.
///
/// Stored in JSON as the compact string form used on the command line:
/// `"lenet"` or `"mlp_200_100"` (one hidden width per `_`-separated field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Architecture {
    Mlp { hidden: Vec<usize> },
    LeNet,
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s == "lenet" {
            return Ok(Self::LeNet);
        }
        if let Some(rest) = s.strip_prefix("mlp") {
            let hidden = rest
                .split('_')
                .filter(|w| !w.is_empty())
                .map(|w| {
                    w.parse::<usize>()
                        .map_err(|e| anyhow::anyhow!("bad hidden width {w:?} in {s:?}: {e}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            if hidden.iter().any(|&h| h == 0) {
                anyhow::bail!("hidden widths must be positive in {s:?}");
            }
            return Ok(Self::Mlp { hidden });
        }
        anyhow::bail!("unknown architecture {s:?} (expected lenet or mlp_<w1>_<w2>...)")
    }
}

impl TryFrom<String> for Architecture {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl From<Architecture> for String {
    fn from(a: Architecture) -> Self {
        a.to_string()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeNet => write!(f, "lenet"),
            Self::Mlp { hidden } => {
                write!(f, "mlp")?;
                for h in hidden {
                    write!(f, "_{h}")?;
                }
                Ok(())
            }
        }
    }
}

/// Pointwise nonlinearity used between layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Swish,
    Mish,
    QuadU,
    Square,
}

impl Activation {
    /// `f(λx) = λ f(x)` for `λ > 0`; required by function-preserving rescaling.
    pub fn is_positively_homogeneous(self) -> bool {
        matches!(self, Self::Relu)
    }
}

impl FromStr for Activation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relu" => Ok(Self::Relu),
            "swish" | "silu" => Ok(Self::Swish),
            "mish" => Ok(Self::Mish),
            "quadu" => Ok(Self::QuadU),
            "square" | "squareu" => Ok(Self::Square),
            other => anyhow::bail!("unknown activation {other:?}"),
        }
    }
}

/// Architecture hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_arch")]
    pub arch: Architecture,
    /// Per-sample input shape, e.g. `[1, 28, 28]` or `[784]`.
    #[serde(default = "default_input_shape")]
    pub input_shape: Vec<usize>,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_activation")]
    pub activation: Activation,
    /// Dropout probability on hidden activations (training only).
    #[serde(default)]
    pub dropout: f32,
}

impl ModelConfig {
    /// Number of scalar inputs per sample.
    pub fn input_dim(&self) -> usize {
        self.input_shape.iter().product()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: default_arch(),
            input_shape: default_input_shape(),
            num_classes: default_num_classes(),
            activation: default_activation(),
            dropout: 0.0,
        }
    }
}

// ── Robust ensemble ─────────────────────────────────────────────────────────

/// Growth law of the coupling strength `g` over epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CouplingKind {
    Exp,
    Lin,
    Cosine,
}

impl FromStr for CouplingKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "exp" => Ok(Self::Exp),
            "lin" | "linear" => Ok(Self::Lin),
            "cosine" => Ok(Self::Cosine),
            other => anyhow::bail!("unknown coupling schedule {other:?}"),
        }
    }
}

/// Replica ensemble and coupling schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobustConfig {
    /// Number of replicas `y`.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Initial coupling. `None` balances training and coupling loss at epoch 0.
    #[serde(default = "default_g")]
    pub g: Option<f64>,
    /// Per-epoch coupling increase rate.
    #[serde(default)]
    pub grate: f64,
    /// Total coupling multiplicative factor (cap relative to the initial `g`).
    #[serde(default = "default_gmax")]
    pub gmax: f64,
    #[serde(default = "default_gsched")]
    pub gsched: CouplingKind,
    /// Multiplier applied to the initial coupling after the epoch-0 report.
    #[serde(default = "default_gtime")]
    pub gtime: f64,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            g: default_g(),
            grate: 0.0,
            gmax: default_gmax(),
            gsched: default_gsched(),
            gtime: default_gtime(),
        }
    }
}

// ── Entropy-SGD ─────────────────────────────────────────────────────────────

/// Inner Langevin loop of the Entropy-SGD step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsgdConfig {
    /// Number of inner SGLD steps `L`.
    #[serde(default = "default_inner_steps")]
    pub inner_steps: usize,
    #[serde(default = "default_sgld_noise")]
    pub sgld_noise: f64,
    #[serde(default = "default_sgld_lr")]
    pub sgld_lr: f64,
    /// Exponential averaging weight of the SGLD iterate.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Multiply the entropic gradient by the local-entropy coupling `γ`.
    #[serde(default = "default_true")]
    pub gscale: bool,
    #[serde(default = "default_mom_sgld")]
    pub mom_sgld: f64,
    /// Initial local-entropy coupling `γ`.
    #[serde(default = "default_esgd_gamma")]
    pub gamma: f64,
    /// Per-step scoping rate: `γ ← γ (1 + scoping)`.
    #[serde(default = "default_scoping")]
    pub scoping: f64,
}

impl Default for EsgdConfig {
    fn default() -> Self {
        Self {
            inner_steps: default_inner_steps(),
            sgld_noise: default_sgld_noise(),
            sgld_lr: default_sgld_lr(),
            alpha: default_alpha(),
            gscale: true,
            mom_sgld: default_mom_sgld(),
            gamma: default_esgd_gamma(),
            scoping: default_scoping(),
        }
    }
}

// ── Optimisation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "sgd")]
    Sgd,
    #[serde(rename = "nesterov")]
    Nesterov,
    #[serde(rename = "adam")]
    Adam,
    #[serde(rename = "entropy-sgd")]
    EntropySgd,
}

impl FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "nesterov" => Ok(Self::Nesterov),
            "adam" => Ok(Self::Adam),
            "entropy-sgd" | "esgd" => Ok(Self::EntropySgd),
            other => anyhow::bail!("unknown optimizer {other:?}"),
        }
    }
}

/// Classification loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Cross-entropy on logits.
    Nll,
    /// Squared error against one-hot targets.
    Mse,
}

impl FromStr for LossKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "nll" | "ce" => Ok(Self::Nll),
            "mse" => Ok(Self::Mse),
            other => anyhow::bail!("unknown loss {other:?}"),
        }
    }
}

/// Epoch-level learning-rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    Constant,
    MultiStep { milestones: Vec<usize>, gamma: f64 },
    Step { step_size: usize, gamma: f64 },
    Cosine { eta_min: f64 },
}

impl LrSchedule {
    /// Parse the `droplr` / `drop_<m1>_<m2>` encoding used by experiment configs.
    ///
    /// * `"0"` → constant
    /// * `"cosine"` → cosine annealing to 0
    /// * `d < 1` → multiply by `d` every 2 epochs
    /// * `d ≥ 1` → divide by `d` at each milestone (`[E/2, 3E/4, 15E/16]` if none given)
    pub fn from_droplr(droplr: &str, milestones: Option<&str>, epochs: usize) -> anyhow::Result<Self> {
        let droplr = droplr.trim();
        if droplr == "cosine" {
            return Ok(Self::Cosine { eta_min: 0.0 });
        }
        let d: f64 = droplr
            .parse()
            .map_err(|e| anyhow::anyhow!("bad droplr {droplr:?}: {e}"))?;
        if d == 0.0 {
            return Ok(Self::Constant);
        }
        if d < 1.0 {
            return Ok(Self::Step {
                step_size: 2,
                gamma: d,
            });
        }
        let milestones = match milestones {
            Some(m) => m
                .split('_')
                .skip(1)
                .map(|h| {
                    h.parse::<usize>()
                        .map_err(|e| anyhow::anyhow!("bad milestone {h:?}: {e}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => vec![epochs / 2, epochs * 3 / 4, epochs * 15 / 16],
        };
        Ok(Self::MultiStep {
            milestones,
            gamma: 1.0 / d,
        })
    }
}

/// Per-replica optimiser hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimConfig {
    #[serde(default = "default_optimizer")]
    pub kind: OptimizerKind,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_schedule")]
    pub schedule: LrSchedule,
    /// Linear warmup epochs before the schedule takes over (0 = none).
    #[serde(default)]
    pub warmup_epochs: usize,
    #[serde(default = "default_loss")]
    pub loss: LossKind,
    /// Flooding level: the training loss is reflected around this value.
    #[serde(default)]
    pub flood: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            kind: default_optimizer(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            schedule: default_schedule(),
            warmup_epochs: 0,
            loss: default_loss(),
            flood: 0.0,
        }
    }
}

// ── Run ─────────────────────────────────────────────────────────────────────

/// Complete experiment description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub robust: RobustConfig,
    #[serde(default)]
    pub esgd: EsgdConfig,
    #[serde(default)]
    pub optim: OptimConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub seed: u64,
    /// Report every `log_every` epochs.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// Checkpoint every `save_every` epochs (0 = final only).
    #[serde(default)]
    pub save_every: usize,
    /// Keep only the first `M` training examples (`None` = all).
    #[serde(default)]
    pub train_subset: Option<usize>,
    #[serde(default)]
    pub test_subset: Option<usize>,
    /// Standardise inputs with training-set statistics.
    #[serde(default)]
    pub preprocess: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            robust: RobustConfig::default(),
            esgd: EsgdConfig::default(),
            optim: OptimConfig::default(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            seed: 0,
            log_every: default_log_every(),
            save_every: 0,
            train_subset: None,
            test_subset: None,
            preprocess: false,
        }
    }
}

impl RunConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.robust.replicas == 0 {
            anyhow::bail!("robust.replicas must be at least 1");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.epochs == 0 {
            anyhow::bail!("epochs must be positive");
        }
        if !(self.optim.lr > 0.0) {
            anyhow::bail!("optim.lr must be positive, got {}", self.optim.lr);
        }
        if self.model.input_shape.is_empty() || self.model.input_dim() == 0 {
            anyhow::bail!("model.input_shape must be non-empty and non-zero");
        }
        if self.model.num_classes < 2 {
            anyhow::bail!("model.num_classes must be at least 2");
        }
        if self.model.arch == Architecture::LeNet && self.model.input_shape.len() != 3 {
            anyhow::bail!(
                "lenet needs a [channels, height, width] input shape, got {:?}",
                self.model.input_shape
            );
        }
        if self.robust.gmax < 1.0 {
            anyhow::bail!("robust.gmax is a multiplicative factor and must be >= 1");
        }
        Ok(())
    }
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_arch() -> Architecture {
    Architecture::Mlp {
        hidden: vec![200, 100],
    }
}
fn default_input_shape() -> Vec<usize> {
    vec![1, 28, 28]
}
fn default_num_classes() -> usize {
    10
}
fn default_activation() -> Activation {
    Activation::Relu
}
fn default_replicas() -> usize {
    1
}
fn default_g() -> Option<f64> {
    Some(0.0)
}
fn default_gmax() -> f64 {
    1e4
}
fn default_gsched() -> CouplingKind {
    CouplingKind::Exp
}
fn default_gtime() -> f64 {
    1.0
}
fn default_inner_steps() -> usize {
    1
}
fn default_sgld_noise() -> f64 {
    1e-4
}
fn default_sgld_lr() -> f64 {
    0.1
}
fn default_alpha() -> f64 {
    0.75
}
fn default_true() -> bool {
    true
}
fn default_mom_sgld() -> f64 {
    0.9
}
fn default_esgd_gamma() -> f64 {
    0.03
}
fn default_scoping() -> f64 {
    1e-3
}
fn default_optimizer() -> OptimizerKind {
    OptimizerKind::Sgd
}
fn default_lr() -> f64 {
    0.1
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_schedule() -> LrSchedule {
    LrSchedule::Constant
}
fn default_loss() -> LossKind {
    LossKind::Nll
}
fn default_batch_size() -> usize {
    128
}
fn default_epochs() -> usize {
    100
}
fn default_log_every() -> usize {
    2
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.robust.replicas, 1);
        assert_eq!(config.robust.gsched, CouplingKind::Exp);
        assert_eq!(config.optim.kind, OptimizerKind::Sgd);
        assert_eq!(config.esgd.alpha, 0.75);
        assert_eq!(config.model.arch.to_string(), "mlp_200_100");
        config.validate().unwrap();
    }

    #[test]
    fn architecture_parses_and_serialises_as_string() {
        let a: Architecture = "mlp_500_300_100".parse().unwrap();
        assert_eq!(
            a,
            Architecture::Mlp {
                hidden: vec![500, 300, 100]
            }
        );
        assert_eq!("LeNet".parse::<Architecture>().unwrap(), Architecture::LeNet);
        assert!("resnet18".parse::<Architecture>().is_err());
        assert!("mlp_0".parse::<Architecture>().is_err());

        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"mlp_500_300_100\"");
    }

    #[test]
    fn optimizer_kind_uses_hyphenated_name() {
        let json = r#"{"optim": {"kind": "entropy-sgd", "lr": 0.05}}"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.optim.kind, OptimizerKind::EntropySgd);
        assert_eq!(config.optim.momentum, 0.9);
    }

    #[test]
    fn null_g_requests_balancing() {
        let json = r#"{"robust": {"replicas": 3, "g": null, "grate": 0.2}}"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.robust.replicas, 3);
        assert!(config.robust.g.is_none());
    }

    #[test]
    fn droplr_encodings() {
        assert_eq!(
            LrSchedule::from_droplr("0", None, 100).unwrap(),
            LrSchedule::Constant
        );
        assert_eq!(
            LrSchedule::from_droplr("cosine", None, 100).unwrap(),
            LrSchedule::Cosine { eta_min: 0.0 }
        );
        assert_eq!(
            LrSchedule::from_droplr("0.5", None, 100).unwrap(),
            LrSchedule::Step {
                step_size: 2,
                gamma: 0.5
            }
        );
        assert_eq!(
            LrSchedule::from_droplr("5", Some("drop_150_225"), 300).unwrap(),
            LrSchedule::MultiStep {
                milestones: vec![150, 225],
                gamma: 0.2
            }
        );
        assert_eq!(
            LrSchedule::from_droplr("10", None, 160).unwrap(),
            LrSchedule::MultiStep {
                milestones: vec![80, 120, 150],
                gamma: 0.1
            }
        );
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let mut c = RunConfig::default();
        c.robust.replicas = 0;
        assert!(c.validate().is_err());

        let mut c = RunConfig::default();
        c.model.arch = Architecture::LeNet;
        c.model.input_shape = vec![784];
        assert!(c.validate().is_err());

        let mut c = RunConfig::default();
        c.robust.gmax = 0.5;
        assert!(c.validate().is_err());
    }
}
