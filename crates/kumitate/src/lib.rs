//! Stage/step execution engine for edge platform installers.
//!
//! A run is a list of stages. Each stage drives its steps through three
//! passes (prepare, run, finalize) and reports failures per step instead of
//! stopping at the first one. The [`Pipeline`] chains stages and decides,
//! through its [`ContinuationPolicy`], whether to go on after a failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use kumitate::prelude::*;
//! use kumitate::targets;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), InstallerError> {
//!     let config = Config::from_path("installer.json")?;
//!     let ctx = RunContext::new(Arc::new(config));
//!
//!     let mut pipeline = Pipeline::builder()
//!         .add_stages(targets::on_prem::create_stages()?)
//!         .build()?;
//!
//!     let mut state = CanonicalState::new(RuntimeState::default());
//!     let report = pipeline.execute(&ctx, &mut state).await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

mod pipeline;
mod stage;
pub mod steps;
pub mod targets;

// Re-export core types
pub use kumitate_core::*;

pub use pipeline::{
    Continuation, ContinuationPolicy, Pipeline, PipelineBuilder, PipelineReport, StageOrder,
    StageReport, StepFailure,
};
pub use stage::{StepStage, StepStageBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        Action, CancellationToken, CanonicalState, Config, Continuation, ContinuationPolicy,
        ErrorCode, InstallerError, LabelSelector, Phase, PhaseResult, Pipeline, PipelineReport,
        RunContext, RuntimeState, Stage, StageError, Step, StepName, StepStage,
    };
}
