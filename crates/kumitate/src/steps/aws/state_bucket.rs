//! S3 bucket that stores terraform state for the other AWS modules.

use super::require_state_bucket;
use crate::steps::terraform::to_tf_json;
use crate::steps::{log_file, ModuleRunner};
use async_trait::async_trait;
use kumitate_core::{InstallerError, PhaseResult, RunContext, RuntimeState, Step, StepName};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const STATE_BUCKET_MODULE_PATH: &str = "targets/aws/iac/state_bucket";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBucketVariables {
    pub region: String,
    pub orch_name: String,
    pub bucket: String,
    pub customer_tag: String,
}

/// Creates the state bucket. The module keeps its own state locally since
/// the bucket cannot hold the state that creates it.
#[derive(Debug)]
pub struct AwsStateBucketStep {
    runner: ModuleRunner,
    variables: Option<StateBucketVariables>,
}

impl AwsStateBucketStep {
    pub fn new(runner: ModuleRunner) -> Self {
        Self {
            runner,
            variables: None,
        }
    }
}

#[async_trait]
impl Step for AwsStateBucketStep {
    fn name(&self) -> StepName {
        StepName::new("AwsStateBucketStep")
    }

    fn labels(&self) -> &[&str] {
        &["aws", "state-bucket"]
    }

    async fn configure(&mut self, ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        let config = ctx.config();
        let bucket = require_state_bucket(config, &state)?;
        self.variables = Some(StateBucketVariables {
            region: config.aws.region.clone(),
            orch_name: config.global.orch_name.clone(),
            bucket,
            customer_tag: config.aws.customer_tag.clone(),
        });
        Ok(state)
    }

    async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        Ok(state)
    }

    async fn run(&mut self, ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        let action = ctx.config().action()?;
        let variables = self.variables.as_ref().ok_or_else(|| {
            InstallerError::internal("AwsStateBucketStep must be configured before it runs")
        })?;
        ctx.ensure_not_cancelled("applying the state bucket module")?;

        self.runner
            .run(
                action,
                STATE_BUCKET_MODULE_PATH,
                to_tf_json(variables, "state bucket variables")?,
                None,
                log_file(&state, "aws_state_bucket.log"),
                ctx.cancellation(),
            )
            .await?;
        if action.is_teardown() {
            info!(bucket = %variables.bucket, "State bucket removed");
        } else {
            info!(bucket = %variables.bucket, "State bucket ready");
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::FakeTerraform;
    use kumitate_core::{Config, ErrorCode};
    use std::sync::Arc;

    fn ctx(action: &str) -> RunContext {
        let mut config = Config::default();
        config.global.orch_name = "demo".to_string();
        config.global.action = action.to_string();
        config.aws.region = "us-west-2".to_string();
        RunContext::new(Arc::new(config))
    }

    #[tokio::test]
    async fn test_bucket_uses_local_backend() {
        let terraform = Arc::new(FakeTerraform::default());
        let mut step = AwsStateBucketStep::new(ModuleRunner::new("/checkout", false, terraform.clone()));

        let mut state = RuntimeState::default();
        state.deployment_id = "a1b2c3".to_string();
        let state = step.configure(&ctx("install"), state).await.unwrap();
        let after = step.run(&ctx("install"), state.clone()).await.unwrap();
        assert_eq!(after, state);

        let calls = terraform.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].backend_config.is_none());
        assert_eq!(calls[0].variables["bucket"], "demo-a1b2c3");
    }

    #[tokio::test]
    async fn test_configure_requires_deployment_id() {
        let terraform = Arc::new(FakeTerraform::default());
        let mut step = AwsStateBucketStep::new(ModuleRunner::new("/checkout", false, terraform));
        let err = step
            .configure(&ctx("install"), RuntimeState::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_terraform_failure_passes_through() {
        let terraform = Arc::new(FakeTerraform::failing(InstallerError::terraform(
            "failed to apply terraform config",
        )));
        let mut step = AwsStateBucketStep::new(ModuleRunner::new("/checkout", false, terraform));

        let mut state = RuntimeState::default();
        state.deployment_id = "a1b2c3".to_string();
        let state = step.configure(&ctx("upgrade"), state).await.unwrap();
        let err = step.run(&ctx("upgrade"), state).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Terraform);
    }
}
