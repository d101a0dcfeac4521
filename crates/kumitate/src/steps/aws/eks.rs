//! EKS cluster.

use super::require_state_bucket;
use crate::steps::terraform::{to_tf_json, AwsBucketBackendConfig};
use crate::steps::{log_file, ModuleRunner};
use async_trait::async_trait;
use kumitate_core::{InstallerError, PhaseResult, RunContext, RuntimeState, Step, StepName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const EKS_MODULE_PATH: &str = "targets/aws/iac/eks";
pub const EKS_STATE_KEY: &str = "eks.tfstate";
const EKS_VOLUME_TYPE: &str = "gp3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EksAddOn {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub configuration_values: String,
}

impl EksAddOn {
    fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            configuration_values: String::new(),
        }
    }
}

fn default_add_ons() -> Vec<EksAddOn> {
    vec![
        EksAddOn::new("aws-ebs-csi-driver", "v1.39.0-eksbuild.1"),
        EksAddOn {
            configuration_values: r#"{"enableNetworkPolicy": "true", "nodeAgent": {"healthProbeBindAddr": "8163", "metricsBindAddr": "8162"}}"#
                .to_string(),
            ..EksAddOn::new("vpc-cni", "v1.19.2-eksbuild.1")
        },
        EksAddOn::new("aws-efs-csi-driver", "v2.1.4-eksbuild.1"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EksNodeGroup {
    pub desired_size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub instance_type: String,
    pub volume_size: u32,
    pub volume_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Variables of the EKS module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EksVariables {
    pub name: String,
    pub region: String,
    pub vpc_id: String,
    pub customer_tag: String,
    pub subnet_ids: Vec<String>,
    pub eks_version: String,
    pub node_instance_type: String,
    pub desired_size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub max_pods: u32,
    pub volume_size: u32,
    pub volume_type: String,
    pub enable_cache_registry: bool,
    pub cache_registry: String,
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
    pub addons: Vec<EksAddOn>,
    pub additional_node_groups: BTreeMap<String, EksNodeGroup>,
    pub kubectl_socks_proxy: String,
}

/// Creates the EKS cluster inside the VPC recorded in runtime state.
#[derive(Debug)]
pub struct AwsEksStep {
    runner: ModuleRunner,
    additional_node_groups: BTreeMap<String, EksNodeGroup>,
    variables: Option<EksVariables>,
    backend_config: Option<AwsBucketBackendConfig>,
}

impl AwsEksStep {
    pub fn new(runner: ModuleRunner) -> Self {
        Self {
            runner,
            additional_node_groups: BTreeMap::new(),
            variables: None,
            backend_config: None,
        }
    }

    /// Adds a node group next to the default one.
    pub fn with_node_group(mut self, name: impl Into<String>, group: EksNodeGroup) -> Self {
        self.additional_node_groups.insert(name.into(), group);
        self
    }
}

#[async_trait]
impl Step for AwsEksStep {
    fn name(&self) -> StepName {
        StepName::new("AwsEksStep")
    }

    fn labels(&self) -> &[&str] {
        &["aws", "eks"]
    }

    async fn configure(&mut self, ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        let config = ctx.config();
        let bucket = require_state_bucket(config, &state)?;
        let aws = &config.aws;

        self.variables = Some(EksVariables {
            name: config.global.orch_name.clone(),
            region: aws.region.clone(),
            vpc_id: String::new(),
            customer_tag: aws.customer_tag.clone(),
            subnet_ids: Vec::new(),
            eks_version: aws.eks_version.clone(),
            node_instance_type: aws.eks_node_instance_type.clone(),
            desired_size: aws.eks_desired_size,
            min_size: aws.eks_min_size,
            max_size: aws.eks_max_size,
            max_pods: aws.eks_max_pods,
            volume_size: aws.eks_volume_size,
            volume_type: EKS_VOLUME_TYPE.to_string(),
            enable_cache_registry: config.features.enable_cache_registry,
            cache_registry: String::new(),
            http_proxy: config.proxy.http_proxy.clone(),
            https_proxy: config.proxy.https_proxy.clone(),
            no_proxy: config.proxy.no_proxy.clone(),
            addons: default_add_ons(),
            additional_node_groups: self.additional_node_groups.clone(),
            kubectl_socks_proxy: config.proxy.socks_proxy.clone(),
        });
        self.backend_config = Some(AwsBucketBackendConfig {
            region: aws.region.clone(),
            bucket,
            key: EKS_STATE_KEY.to_string(),
        });
        Ok(state)
    }

    async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        Ok(state)
    }

    async fn run(&mut self, ctx: &RunContext, mut state: RuntimeState) -> PhaseResult {
        let action = ctx.config().action()?;
        let (variables, backend) = match (&self.variables, &self.backend_config) {
            (Some(v), Some(b)) => (v, b),
            _ => {
                return Err(InstallerError::internal(
                    "AwsEksStep must be configured before it runs",
                ))
            }
        };
        let vpc_known = !state.aws.vpc_id.is_empty() && !state.aws.private_subnet_ids.is_empty();
        if !vpc_known {
            if !action.is_teardown() {
                let missing = if state.aws.vpc_id.is_empty() {
                    "vpc_id is not set in the runtime state"
                } else {
                    "private subnet ids are not set in the runtime state"
                };
                return Err(InstallerError::invalid_argument(missing));
            }
            // Destroy works from the module's own state.
            warn!("VPC is no longer recorded, destroying the EKS cluster from its state only");
        }
        ctx.ensure_not_cancelled("applying the EKS module")?;

        let variables = EksVariables {
            vpc_id: state.aws.vpc_id.clone(),
            subnet_ids: state.aws.private_subnet_ids.clone(),
            ..variables.clone()
        };
        let output = self
            .runner
            .run(
                action,
                EKS_MODULE_PATH,
                to_tf_json(&variables, "EKS variables")?,
                Some(to_tf_json(backend, "EKS backend config")?),
                log_file(&state, "aws_eks.log"),
                ctx.cancellation(),
            )
            .await?;

        if action.is_teardown() {
            state.aws.eks_oidc_issuer.clear();
            return Ok(state);
        }
        state.aws.eks_oidc_issuer = output.string_output("eks_oidc_issuer")?;
        info!(cluster = %variables.name, "EKS cluster is ready");
        Ok(state)
    }
}
