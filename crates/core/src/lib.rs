//! # entropic-core: Networks and Replica Ensembles
//!
//! Everything that owns parameters lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`activation`] | ReLU, Swish, Mish, QuadU, Square |
//! | [`model`] | `Mlp`, `LeNet` and the `Classifier` wrapper |
//! | [`params`] | Name-ordered parameter lists, norms, distances, snapshots |
//! | [`robust`] | `RobustNet`: `y` coupled replicas plus their center |
//! | [`normalize`] | Function-preserving weight normalization for ReLU networks |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`,
//!    so replicas can be spread across CPU and CUDA devices.
//! 2. **Stable parameter order.** Cross-network arithmetic always walks
//!    parameters sorted by name, never `VarMap` hash order.
//! 3. **In-place updates.** Parameters are `Var`s mutated with `Var::set`;
//!    anything that must survive an update is deep-copied first.

pub mod activation;
pub mod model;
pub mod normalize;
pub mod params;
pub mod robust;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use model::{Classifier, LeNet, Mlp};
pub use normalize::{normalize_lenet, normalize_mlp, normalize_network, normalize_robust};
pub use robust::{Replica, RobustNet};
