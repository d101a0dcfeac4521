//! Core contracts for the kumitate installer engine.
//!
//! This crate holds the types every provisioning step and stage agrees on,
//! without any process or file-system plumbing. Step authors depend on this
//! crate; the engine and concrete steps live in `kumitate`.
//!
//! # Core Types
//!
//! - [`Step`] - Four-phase provisioning unit (configure, pre, run, post)
//! - [`Stage`] - Ordered group of steps driven through prepare, run and finalize passes
//! - [`RuntimeState`] / [`CanonicalState`] - Values produced during a run and their single-writer merge ledger
//! - [`InstallerError`] / [`StageError`] - Structured errors and their per-step aggregate
//! - [`Config`] / [`Action`] - Immutable operator input and the lifecycle selector
//! - [`LabelSelector`] - Chooses which labelled steps execute
//! - [`CancellationToken`] - Cooperative cancellation for long-running actions

mod cancel;
mod config;
mod error;
mod selector;
mod stage;
mod state;
mod step;

pub use cancel::CancellationToken;
pub use config::{
    Action, AwsConfig, Config, ConfigError, FeatureFlags, GlobalConfig, ProxyConfig,
    DEFAULT_NETWORK_CIDR,
};
pub use error::{ErrorCode, InstallerError, StageError};
pub use selector::LabelSelector;
pub use stage::{Pass, Stage};
pub use state::{AwsRuntimeState, CanonicalState, FieldPath, RuntimeState};
pub use step::{Phase, PhaseResult, RunContext, Step, StepName};
