//! # entropic-train: The Training Engine
//!
//! Training loops, optimisers and schedules for coupled replica ensembles:
//!
//! * **[`RobustTrainer`]**: owns the ensemble, one optimiser per replica (or
//!   an [`EntropySgd`] stepper) and the LR / coupling schedules.
//!   [`RobustTrainer::fit`] runs the whole experiment and writes
//!   `metrics.jsonl`.
//! * **[`EntropySgd`]**: local-entropy gradient from inner SGLD steps.
//! * **[`MomentumSgd`]**: heavy-ball / Nesterov SGD as a candle `Optimizer`.
//! * **[`LrScheduler`]** / **[`CouplingSchedule`]**: per-epoch schedules.
//! * **[`evaluate`]** / **[`Report`]**: replica and center metrics.
//! * **[`local_energy`]**: flatness under multiplicative weight noise.

pub mod esgd;
pub mod eval;
pub mod flatness;
pub mod loss;
pub mod optim;
pub mod scheduler;
pub mod trainer;

pub use esgd::{EntropySgd, EsgdStepStats};
pub use eval::{evaluate, topk_correct, EpochExtras, Evaluation, Report};
pub use flatness::{local_energy, FlatnessPoint};
pub use optim::{add_coupling, MomentumSgd, ParamsSgd, ReplicaOptimizer};
pub use scheduler::{CouplingSchedule, LrScheduler};
pub use trainer::{EpochMetrics, RobustTrainer};
