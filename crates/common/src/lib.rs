//! # entropic-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`RunConfig`]**: experiment hyper-parameters (serialised as JSON).
//! * **[`ClassificationDataset`]** / **[`RobustDataLoader`]**: data loading
//!   and replicated batching.
//! * **[`Batch::to_tensors`]**: raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::{
    Activation, Architecture, CouplingKind, EsgdConfig, LossKind, LrSchedule, ModelConfig,
    OptimConfig, OptimizerKind, RobustConfig, RunConfig,
};
pub use data::{
    Batch, ClassificationDataset, ReplicatedBatch, ReplicatedEpoch, RobustDataLoader,
    Standardization,
};
