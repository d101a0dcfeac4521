//! Stage driver that runs an ordered list of steps through the three passes.

use async_trait::async_trait;
use kumitate_core::{
    CanonicalState, InstallerError, Phase, PhaseResult, RunContext, Stage, StageError, Step,
    StepName,
};
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A [`Stage`] backed by an ordered list of [`Step`]s.
///
/// Every pass visits every step in list order. A failure is recorded in
/// the failing step's slot and the loop moves on; nothing short-circuits.
pub struct StepStage {
    name: String,
    steps: Vec<Box<dyn Step>>,
}

impl fmt::Debug for StepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepStage")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl StepStage {
    /// Creates a new stage builder.
    pub fn builder(name: impl Into<String>) -> StepStageBuilder {
        StepStageBuilder::new(name)
    }

    /// Returns the number of steps in the stage.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Merges a successful phase's candidate and turns the outcome into a slot
/// value, logging either way.
fn settle(
    stage: &str,
    step: &StepName,
    phase: Phase,
    result: PhaseResult,
    state: &mut CanonicalState,
    started: Instant,
) -> Option<InstallerError> {
    let outcome = result.and_then(|candidate| state.merge(step, candidate));
    match outcome {
        Ok(changed) => {
            info!(
                stage,
                step = %step,
                phase = %phase,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Step '{}' {} completed",
                step,
                phase
            );
            if !changed.is_empty() {
                debug!(step = %step, fields = ?changed, "runtime state updated");
            }
            None
        }
        Err(e) => {
            warn!(
                stage,
                step = %step,
                phase = %phase,
                code = %e.code(),
                "Step '{}' {} failed: {}",
                step,
                phase,
                e.message()
            );
            Some(e)
        }
    }
}

#[async_trait]
impl Stage for StepStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn step_names(&self) -> Vec<StepName> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    async fn prepare(
        &mut self,
        ctx: &RunContext,
        state: &mut CanonicalState,
    ) -> Option<StageError> {
        let mut slots: Vec<Option<InstallerError>> = vec![None; self.steps.len()];

        for (i, step) in self.steps.iter_mut().enumerate() {
            if !ctx.selector().selects(step.labels()) {
                debug!(stage = %self.name, step = %step.name(), "Step not selected, skipping");
                continue;
            }
            let name = step.name();
            let started = Instant::now();
            let result = step.configure(ctx, state.snapshot()).await;
            if let Some(e) = settle(&self.name, &name, Phase::Configure, result, state, started) {
                slots[i] = Some(e);
            }
        }

        for (i, step) in self.steps.iter_mut().enumerate() {
            if !ctx.selector().selects(step.labels()) {
                continue;
            }
            let name = step.name();
            let started = Instant::now();
            let result = step.pre(ctx, state.snapshot()).await;
            if let Some(e) = settle(&self.name, &name, Phase::Pre, result, state, started) {
                slots[i] = Some(e);
            }
        }

        StageError::from_slots(slots)
    }

    async fn run(&mut self, ctx: &RunContext, state: &mut CanonicalState) -> Option<StageError> {
        let mut slots: Vec<Option<InstallerError>> = vec![None; self.steps.len()];

        for (i, step) in self.steps.iter_mut().enumerate() {
            if !ctx.selector().selects(step.labels()) {
                continue;
            }
            let name = step.name();
            let started = Instant::now();
            let result = step.run(ctx, state.snapshot()).await;
            slots[i] = settle(&self.name, &name, Phase::Run, result, state, started);
        }

        StageError::from_slots(slots)
    }

    async fn finalize(
        &mut self,
        ctx: &RunContext,
        state: &mut CanonicalState,
        trigger: Option<&StageError>,
    ) -> Option<StageError> {
        let mut slots: Vec<Option<InstallerError>> = vec![None; self.steps.len()];

        for (i, step) in self.steps.iter_mut().enumerate() {
            if !ctx.selector().selects(step.labels()) {
                continue;
            }
            let name = step.name();
            let previous = trigger.and_then(|t| t.slot(i));
            let started = Instant::now();
            let result = step.post(ctx, state.snapshot(), previous).await;

            let outcome = settle(&self.name, &name, Phase::Post, result, state, started);
            slots[i] = match (outcome, previous) {
                (Some(post_err), Some(prev)) if &post_err != prev => {
                    error!(
                        stage = %self.name,
                        step = %name,
                        "Step '{}' post failed ({}) after an earlier failure ({})",
                        name,
                        post_err,
                        prev
                    );
                    Some(post_err.superseding(prev.clone()))
                }
                (slot, _) => slot,
            };
        }

        StageError::from_slots(slots)
    }
}

/// Builder for constructing [`StepStage`] instances.
pub struct StepStageBuilder {
    name: String,
    steps: Vec<Box<dyn Step>>,
}

impl StepStageBuilder {
    /// Creates a new empty stage builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step; steps run in the order they are added.
    pub fn add_step<S: Step + 'static>(mut self, step: S) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Appends an already boxed step.
    pub fn add_boxed(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Builds the stage.
    ///
    /// Step names identify writers in the runtime state ledger, so they
    /// must be unique within a stage.
    pub fn build(self) -> Result<StepStage, InstallerError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            let name = step.name();
            if !seen.insert(name.clone()) {
                return Err(InstallerError::invalid_argument(format!(
                    "duplicate step {name} in stage {}",
                    self.name
                )));
            }
        }

        Ok(StepStage {
            name: self.name,
            steps: self.steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kumitate_core::{Config, ErrorCode, RuntimeState};
    use std::sync::Arc;

    #[derive(Debug)]
    struct PidStep;

    #[async_trait]
    impl Step for PidStep {
        fn name(&self) -> StepName {
            StepName::new("PidStep")
        }

        fn labels(&self) -> &[&str] {
            &["common"]
        }

        async fn configure(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
            Ok(state)
        }

        async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
            Ok(state)
        }

        async fn run(&mut self, _ctx: &RunContext, mut state: RuntimeState) -> PhaseResult {
            state.sshuttle_pid = "1234".to_string();
            Ok(state)
        }
    }

    #[derive(Debug)]
    struct FailingStep;

    #[async_trait]
    impl Step for FailingStep {
        fn name(&self) -> StepName {
            StepName::new("FailingStep")
        }

        fn labels(&self) -> &[&str] {
            &["common"]
        }

        async fn configure(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
            Ok(state)
        }

        async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
            Ok(state)
        }

        async fn run(&mut self, _ctx: &RunContext, _state: RuntimeState) -> PhaseResult {
            Err(InstallerError::internal("Intentional failure"))
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_stage_run_success() {
        let mut stage = StepStage::builder("Test")
            .add_step(PidStep)
            .build()
            .expect("valid stage");

        let mut state = CanonicalState::default();
        assert!(stage.prepare(&ctx(), &mut state).await.is_none());
        assert!(stage.run(&ctx(), &mut state).await.is_none());
        assert_eq!(state.state().sshuttle_pid, "1234");
    }

    #[tokio::test]
    async fn test_stage_run_failure_is_positional() {
        let mut stage = StepStage::builder("Test")
            .add_step(FailingStep)
            .add_step(PidStep)
            .build()
            .expect("valid stage");

        let mut state = CanonicalState::default();
        let agg = stage.run(&ctx(), &mut state).await.expect("aggregate");
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.slot(0).map(InstallerError::code), Some(ErrorCode::Internal));
        assert!(agg.slot(1).is_none());
        assert_eq!(state.state().sshuttle_pid, "1234");
    }

    #[test]
    fn test_stage_builder_rejects_duplicates() {
        let result = StepStage::builder("Dup")
            .add_step(PidStep)
            .add_step(PidStep)
            .build();
        assert_eq!(
            result.map(|_| ()).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_stage_step_names() {
        let stage = StepStage::builder("Names")
            .add_step(FailingStep)
            .add_step(PidStep)
            .build()
            .expect("valid stage");
        assert_eq!(stage.name(), "Names");
        assert_eq!(stage.step_count(), 2);
        assert_eq!(
            stage.step_names(),
            vec![StepName::new("FailingStep"), StepName::new("PidStep")]
        );
    }
}
