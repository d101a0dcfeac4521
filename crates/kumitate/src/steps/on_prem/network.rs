//! On-premises network step.

use async_trait::async_trait;
use kumitate_core::{PhaseResult, RunContext, RuntimeState, Step, StepName};
use tracing::debug;

/// Placeholder for on-premises network preparation. Every phase passes the
/// runtime state through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnPremNetworkStep;

#[async_trait]
impl Step for OnPremNetworkStep {
    fn name(&self) -> StepName {
        StepName::new("OnPremNetworkStep")
    }

    fn labels(&self) -> &[&str] {
        &["on-prem", "vm"]
    }

    async fn configure(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        Ok(state)
    }

    async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        Ok(state)
    }

    async fn run(&mut self, ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        debug!(action = %ctx.config().global.action, "Nothing to provision for the on-prem network");
        Ok(state)
    }
}
