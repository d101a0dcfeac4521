//! Stage trait.

use crate::error::StageError;
use crate::state::CanonicalState;
use crate::step::{RunContext, StepName};
use async_trait::async_trait;
use std::fmt::{self, Debug};

/// One full iteration over a stage's steps for one lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Configure then Pre for every step.
    Prepare,
    /// Run for every step.
    Run,
    /// Post for every step.
    Finalize,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Prepare => write!(f, "prepare"),
            Pass::Run => write!(f, "run"),
            Pass::Finalize => write!(f, "finalize"),
        }
    }
}

/// An ordered group of steps executed as one pipeline unit.
///
/// Each pass visits every step, records failures positionally and returns
/// `None` when nothing failed. A stage never decides whether the next pass
/// should run; that is the pipeline driver's call.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Names of the contained steps, in slot order.
    fn step_names(&self) -> Vec<StepName>;

    /// Configures and pre-checks every step.
    async fn prepare(&mut self, ctx: &RunContext, state: &mut CanonicalState)
        -> Option<StageError>;

    /// Runs every step.
    async fn run(&mut self, ctx: &RunContext, state: &mut CanonicalState) -> Option<StageError>;

    /// Finalizes every step. `trigger` is the aggregate of the pass being
    /// finalized; each step receives its own slot of it.
    async fn finalize(
        &mut self,
        ctx: &RunContext,
        state: &mut CanonicalState,
        trigger: Option<&StageError>,
    ) -> Option<StageError>;
}
