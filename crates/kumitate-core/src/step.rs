//! Step trait and related types.

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::InstallerError;
use crate::selector::LabelSelector;
use crate::state::RuntimeState;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// One of the four lifecycle operations of a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Configure,
    Pre,
    Run,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Configure => write!(f, "configure"),
            Phase::Pre => write!(f, "pre"),
            Phase::Run => write!(f, "run"),
            Phase::Post => write!(f, "post"),
        }
    }
}

/// What every phase hands back: a candidate runtime state, or the failure.
///
/// A failed phase's candidate is discarded by the stage.
pub type PhaseResult = Result<RuntimeState, InstallerError>;

/// Read-only inputs shared by every phase of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    config: Arc<Config>,
    cancel: CancellationToken,
    selector: LabelSelector,
}

impl RunContext {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            selector: LabelSelector::All,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn selector(&self) -> &LabelSelector {
        &self.selector
    }

    /// Fails with `Cancelled` if the caller has cancelled the run.
    ///
    /// Steps call this before starting a long-running delegated action.
    pub fn ensure_not_cancelled(&self, what: &str) -> Result<(), InstallerError> {
        if self.cancel.is_cancelled() {
            Err(InstallerError::cancelled(format!(
                "run cancelled before {what}"
            )))
        } else {
            Ok(())
        }
    }
}

/// The atomic unit of provisioning work.
///
/// A stage drives each step through four phases. Every phase receives the
/// current runtime state by value and returns a candidate; the stage merges
/// the candidate into the canonical copy.
///
/// # Examples
///
/// ```
/// use kumitate_core::{PhaseResult, RunContext, RuntimeState, Step, StepName};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct LogDirStep;
///
/// #[async_trait]
/// impl Step for LogDirStep {
///     fn name(&self) -> StepName {
///         StepName::new("LogDirStep")
///     }
///
///     fn labels(&self) -> &[&str] {
///         &["common"]
///     }
///
///     async fn configure(&mut self, _ctx: &RunContext, mut state: RuntimeState) -> PhaseResult {
///         state.log_dir = "/var/log/installer".to_string();
///         Ok(state)
///     }
///
///     async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
///         Ok(state)
///     }
///
///     async fn run(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
///         Ok(state)
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// The name of the step.
    fn name(&self) -> StepName;

    /// Labels used to select a subset of steps for a run.
    fn labels(&self) -> &[&str];

    /// Derives and stores the step's private parameters.
    ///
    /// Pure computation only; never touches external systems.
    async fn configure(&mut self, ctx: &RunContext, state: RuntimeState) -> PhaseResult;

    /// Pre-flight checks and idempotent preparation. Must be safe to re-run.
    async fn pre(&mut self, ctx: &RunContext, state: RuntimeState) -> PhaseResult;

    /// The provisioning action itself; the only phase expected to have
    /// durable external side effects.
    async fn run(&mut self, ctx: &RunContext, state: RuntimeState) -> PhaseResult;

    /// Cleanup and finalization.
    ///
    /// Always invoked, even when an earlier phase of this step failed, in
    /// which case `previous` carries that failure.
    ///
    /// The default passes the state through and succeeds, so the failure
    /// shows up only in the aggregate of the pass that triggered finalize.
    /// Return `previous` to keep it in the finalize aggregate as well.
    async fn post(
        &mut self,
        _ctx: &RunContext,
        state: RuntimeState,
        _previous: Option<&InstallerError>,
    ) -> PhaseResult {
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[derive(Debug)]
    struct PassthroughStep;

    #[async_trait]
    impl Step for PassthroughStep {
        fn name(&self) -> StepName {
            StepName::new("PassthroughStep")
        }

        fn labels(&self) -> &[&str] {
            &["test"]
        }

        async fn configure(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
            Ok(state)
        }

        async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
            Ok(state)
        }

        async fn run(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
            Ok(state)
        }
    }

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");

        let name: StepName = "test".into();
        assert_eq!(name, "test");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Configure.to_string(), "configure");
        assert_eq!(Phase::Post.to_string(), "post");
    }

    #[tokio::test]
    async fn test_default_post_keeps_state() {
        let ctx = RunContext::new(Arc::new(Config::default()));
        let mut state = RuntimeState::default();
        state.log_dir = "/tmp".to_string();

        let mut step = PassthroughStep;
        let previous = InstallerError::internal("earlier failure");
        let out = step.post(&ctx, state.clone(), Some(&previous)).await.unwrap();
        assert_eq!(out, state);
    }

    #[test]
    fn test_ensure_not_cancelled() {
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(Arc::new(Config::default())).with_cancellation(cancel.clone());
        assert!(ctx.ensure_not_cancelled("terraform apply").is_ok());

        cancel.cancel();
        let err = ctx.ensure_not_cancelled("terraform apply").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }
}
