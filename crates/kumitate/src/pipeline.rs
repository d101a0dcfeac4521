//! Pipeline driver that chains stages and decides whether to continue after
//! a failure.

use kumitate_core::{
    Action, CanonicalState, InstallerError, Pass, RunContext, Stage, StageError, StepName,
};
use std::fmt;
use std::time::Instant;
use tracing::{error, info, warn};

/// What the driver does once a pass has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Keep going: run the next pass and the next stages.
    Proceed,
    /// Skip the remaining passes of the stage (except finalize) and every
    /// later stage.
    Halt,
}

/// Order in which a pipeline visits its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOrder {
    Forward,
    Reverse,
}

/// Continuation rules for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationPolicy {
    pub on_prepare_failure: Continuation,
    /// Also applies to failures reported by finalize.
    pub on_run_failure: Continuation,
    pub stage_order: StageOrder,
}

impl ContinuationPolicy {
    /// Stop at the first failing pass, visiting stages in declaration order.
    pub fn halt_on_failure() -> Self {
        Self {
            on_prepare_failure: Continuation::Halt,
            on_run_failure: Continuation::Halt,
            stage_order: StageOrder::Forward,
        }
    }

    /// Attempt every stage regardless of failures, last stage first.
    pub fn best_effort_teardown() -> Self {
        Self {
            on_prepare_failure: Continuation::Proceed,
            on_run_failure: Continuation::Proceed,
            stage_order: StageOrder::Reverse,
        }
    }

    /// The default policy for an action.
    ///
    /// Installs and upgrades stop early so nothing builds on a broken
    /// stage. Uninstall tears down everything it can, in reverse.
    pub fn for_action(action: Action) -> Self {
        match action {
            Action::Install | Action::Upgrade => Self::halt_on_failure(),
            Action::Uninstall => Self::best_effort_teardown(),
        }
    }

    fn halts(&self, report: &StageReport) -> bool {
        (report.prepare.is_some() && self.on_prepare_failure == Continuation::Halt)
            || ((report.run.is_some() || report.finalize.is_some())
                && self.on_run_failure == Continuation::Halt)
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub step_names: Vec<StepName>,
    pub prepare: Option<StageError>,
    pub run: Option<StageError>,
    pub finalize: Option<StageError>,
    /// `true` when the run pass was skipped because prepare failed.
    pub run_skipped: bool,
}

impl StageReport {
    pub fn is_success(&self) -> bool {
        self.prepare.is_none() && self.run.is_none() && self.finalize.is_none()
    }

    /// Aggregate for `pass`, if it failed.
    pub fn pass(&self, pass: Pass) -> Option<&StageError> {
        match pass {
            Pass::Prepare => self.prepare.as_ref(),
            Pass::Run => self.run.as_ref(),
            Pass::Finalize => self.finalize.as_ref(),
        }
    }
}

/// One failed step phase, as reported by [`PipelineReport::failures`].
#[derive(Debug, Clone, Copy)]
pub struct StepFailure<'a> {
    pub stage: &'a str,
    pub pass: Pass,
    pub index: usize,
    pub step: Option<&'a StepName>,
    pub error: &'a InstallerError,
}

impl fmt::Display for StepFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(
                f,
                "{}/{} step {} ({}): {}",
                self.stage,
                self.pass,
                self.index,
                step,
                self.error.chain()
            ),
            None => write!(
                f,
                "{}/{} step {}: {}",
                self.stage,
                self.pass,
                self.index,
                self.error.chain()
            ),
        }
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub policy: ContinuationPolicy,
    /// Stages that ran, in the order they ran.
    pub stages: Vec<StageReport>,
    /// Stages never started because an earlier stage halted the run.
    pub skipped_stages: Vec<String>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(StageReport::is_success)
    }

    /// Every failed step phase, grouped by stage and ordered by step
    /// position, then pass.
    pub fn failures(&self) -> impl Iterator<Item = StepFailure<'_>> {
        self.stages.iter().flat_map(|stage| {
            let slots = [
                stage.step_names.len(),
                stage.prepare.as_ref().map_or(0, StageError::len),
                stage.run.as_ref().map_or(0, StageError::len),
                stage.finalize.as_ref().map_or(0, StageError::len),
            ];
            let count = slots.into_iter().max().unwrap_or(0);
            (0..count).flat_map(move |index| {
                [Pass::Prepare, Pass::Run, Pass::Finalize]
                    .into_iter()
                    .filter_map(move |pass| {
                        stage
                            .pass(pass)
                            .and_then(|agg| agg.slot(index))
                            .map(|error| StepFailure {
                                stage: &stage.name,
                                pass,
                                index,
                                step: stage.step_names.get(index),
                                error,
                            })
                    })
            })
        })
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "{} stage(s) completed", self.stages.len());
        }
        writeln!(f, "pipeline failed:")?;
        for failure in self.failures() {
            writeln!(f, "  {failure}")?;
        }
        if !self.skipped_stages.is_empty() {
            write!(f, "  skipped: {}", self.skipped_stages.join(", "))?;
        }
        Ok(())
    }
}

/// Chains stages through the prepare, run and finalize passes.
///
/// The pipeline owns the continuation policy. When none is set, the policy
/// is derived from the configured action.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    policy: Option<ContinuationPolicy>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("policy", &self.policy)
            .finish()
    }
}

impl Pipeline {
    /// Creates a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Returns the number of stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Resolves the policy for a run.
    ///
    /// Without an explicit policy the action must parse, otherwise the run
    /// fails with `InvalidArgument` before any stage starts.
    pub fn policy(&self, ctx: &RunContext) -> Result<ContinuationPolicy, InstallerError> {
        match self.policy {
            Some(policy) => Ok(policy),
            None => Ok(ContinuationPolicy::for_action(ctx.config().action()?)),
        }
    }

    /// Executes every stage according to the policy.
    ///
    /// Step failures never surface as `Err`; they are collected in the
    /// returned report. `Err` is reserved for failures to start the run.
    pub async fn execute(
        &mut self,
        ctx: &RunContext,
        state: &mut CanonicalState,
    ) -> Result<PipelineReport, InstallerError> {
        let policy = self.policy(ctx)?;
        let order: Vec<usize> = match policy.stage_order {
            StageOrder::Forward => (0..self.stages.len()).collect(),
            StageOrder::Reverse => (0..self.stages.len()).rev().collect(),
        };

        let mut report = PipelineReport {
            policy,
            stages: Vec::with_capacity(self.stages.len()),
            skipped_stages: Vec::new(),
        };
        let mut halted = false;

        for index in order {
            let stage = &mut self.stages[index];
            if halted {
                warn!(stage = stage.name(), "Stage skipped after earlier failure");
                report.skipped_stages.push(stage.name().to_string());
                continue;
            }

            let stage_report = run_stage(stage.as_mut(), ctx, state, &policy).await;
            if policy.halts(&stage_report) {
                error!(
                    stage = %stage_report.name,
                    "Stage '{}' failed, halting pipeline",
                    stage_report.name
                );
                halted = true;
            }
            report.stages.push(stage_report);
        }

        Ok(report)
    }
}

async fn run_stage(
    stage: &mut dyn Stage,
    ctx: &RunContext,
    state: &mut CanonicalState,
    policy: &ContinuationPolicy,
) -> StageReport {
    let name = stage.name().to_string();
    let started = Instant::now();
    info!(stage = %name, "Stage '{}' starting", name);

    let prepare = stage.prepare(ctx, state).await;
    let run_skipped = prepare.is_some() && policy.on_prepare_failure == Continuation::Halt;

    let (run, finalize) = if run_skipped {
        warn!(stage = %name, "Prepare failed, skipping run");
        let finalize = stage.finalize(ctx, state, prepare.as_ref()).await;
        (None, finalize)
    } else {
        let run = stage.run(ctx, state).await;
        let trigger = latest_failures(prepare.as_ref(), run.as_ref());
        let finalize = stage.finalize(ctx, state, trigger.as_ref()).await;
        (run, finalize)
    };

    let report = StageReport {
        name,
        step_names: stage.step_names(),
        prepare,
        run,
        finalize,
        run_skipped,
    };

    if report.is_success() {
        info!(
            stage = %report.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stage '{}' completed",
            report.name
        );
    } else {
        for (pass, agg) in [
            (Pass::Prepare, &report.prepare),
            (Pass::Run, &report.run),
            (Pass::Finalize, &report.finalize),
        ] {
            if let Some(agg) = agg {
                warn!(stage = %report.name, pass = %pass, "{}", agg);
            }
        }
    }

    report
}

/// Per step, the run failure if there is one, otherwise the prepare failure.
fn latest_failures(prepare: Option<&StageError>, run: Option<&StageError>) -> Option<StageError> {
    let len = prepare
        .map_or(0, StageError::len)
        .max(run.map_or(0, StageError::len));
    StageError::from_slots(
        (0..len)
            .map(|i| {
                run.and_then(|agg| agg.slot(i))
                    .or_else(|| prepare.and_then(|agg| agg.slot(i)))
                    .cloned()
            })
            .collect(),
    )
}

/// Builder for constructing [`Pipeline`] instances.
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    policy: Option<ContinuationPolicy>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// Creates a new empty pipeline builder.
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            policy: None,
        }
    }

    /// Appends a stage; stages are declared in forward order.
    pub fn add_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Appends several already boxed stages.
    pub fn add_stages(mut self, stages: impl IntoIterator<Item = Box<dyn Stage>>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Overrides the action-derived continuation policy.
    pub fn policy(mut self, policy: ContinuationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Builds the pipeline, validating that it has stages with unique
    /// names.
    pub fn build(self) -> Result<Pipeline, InstallerError> {
        if self.stages.is_empty() {
            return Err(InstallerError::invalid_argument(
                "pipeline must contain at least one stage",
            ));
        }
        let mut names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(InstallerError::invalid_argument(format!(
                "duplicate stage {}",
                pair[0]
            )));
        }

        Ok(Pipeline {
            stages: self.stages,
            policy: self.policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kumitate_core::{Config, ErrorCode};
    use std::sync::Arc;

    #[test]
    fn test_policy_for_action() {
        let install = ContinuationPolicy::for_action(Action::Install);
        assert_eq!(install.on_prepare_failure, Continuation::Halt);
        assert_eq!(install.on_run_failure, Continuation::Halt);
        assert_eq!(install.stage_order, StageOrder::Forward);
        assert_eq!(ContinuationPolicy::for_action(Action::Upgrade), install);

        let uninstall = ContinuationPolicy::for_action(Action::Uninstall);
        assert_eq!(uninstall.on_run_failure, Continuation::Proceed);
        assert_eq!(uninstall.stage_order, StageOrder::Reverse);
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = Pipeline::builder().build().map(|_| ()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_policy_requires_valid_action() {
        let pipeline = Pipeline {
            stages: Vec::new(),
            policy: None,
        };

        let mut config = Config::default();
        config.global.action = "reinstall".to_string();
        let ctx = RunContext::new(Arc::new(config));
        assert_eq!(
            pipeline.policy(&ctx).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );

        let mut config = Config::default();
        config.global.action = "uninstall".to_string();
        let ctx = RunContext::new(Arc::new(config));
        assert_eq!(
            pipeline.policy(&ctx).unwrap(),
            ContinuationPolicy::best_effort_teardown()
        );
    }

    #[test]
    fn test_latest_failures_prefers_run() {
        let prepare = StageError::from_slots(vec![
            Some(InstallerError::invalid_argument("bad cidr")),
            Some(InstallerError::internal("no sudo")),
            None,
        ]);
        let run = StageError::from_slots(vec![
            None,
            Some(InstallerError::terraform("apply failed")),
            None,
        ]);

        let merged = latest_failures(prepare.as_ref(), run.as_ref()).unwrap();
        assert_eq!(merged.slot(0).unwrap().code(), ErrorCode::InvalidArgument);
        assert_eq!(merged.slot(1).unwrap().code(), ErrorCode::Terraform);
        assert!(merged.slot(2).is_none());
        assert!(latest_failures(None, None).is_none());
    }

    #[test]
    fn test_report_failures_order() {
        let report = PipelineReport {
            policy: ContinuationPolicy::halt_on_failure(),
            stages: vec![StageReport {
                name: "Infra".to_string(),
                step_names: vec![StepName::new("A"), StepName::new("B")],
                prepare: StageError::from_slots(vec![
                    None,
                    Some(InstallerError::invalid_argument("bad cidr")),
                ]),
                run: None,
                finalize: StageError::from_slots(vec![
                    Some(InstallerError::internal("cleanup")),
                    Some(InstallerError::internal("cleanup")),
                ]),
                run_skipped: true,
            }],
            skipped_stages: vec!["Later".to_string()],
        };

        assert!(!report.is_success());
        let failures: Vec<_> = report
            .failures()
            .map(|f| (f.index, f.pass, f.step.map(StepName::as_str)))
            .collect();
        assert_eq!(
            failures,
            vec![
                (0, Pass::Finalize, Some("A")),
                (1, Pass::Prepare, Some("B")),
                (1, Pass::Finalize, Some("B")),
            ]
        );

        let rendered = report.to_string();
        assert!(rendered.contains("Infra/prepare step 1 (B)"));
        assert!(rendered.contains("skipped: Later"));
    }
}
