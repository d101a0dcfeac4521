//! Steps that provision the AWS target.

mod eks;
mod state_bucket;
mod vpc;

pub use eks::{AwsEksStep, EksAddOn, EksNodeGroup, EksVariables, EKS_MODULE_PATH, EKS_STATE_KEY};
pub use state_bucket::{AwsStateBucketStep, StateBucketVariables, STATE_BUCKET_MODULE_PATH};
pub use vpc::{
    generate_ssh_key_pair, plan_subnets, AwsVpcJumphostSubnet, AwsVpcStep, AwsVpcSubnet,
    AwsVpcVariables, Ipv4Cidr, SubnetPlan, JUMP_HOST_AMI_ID, MINIMUM_VPC_CIDR_MASK_SIZE,
    PRIVATE_SUBNET_MASK_SIZE, PUBLIC_SUBNET_MASK_SIZE, REQUIRED_AVAILABILITY_ZONES,
    VPC_MODULE_PATH, VPC_STATE_KEY,
};

use kumitate_core::{Config, InstallerError, RuntimeState};

/// Name of the S3 bucket holding terraform state for a deployment.
pub fn state_bucket_name(orch_name: &str, deployment_id: &str) -> String {
    format!("{orch_name}-{deployment_id}")
}

/// Bucket name for the current run, failing when either half is missing.
fn require_state_bucket(config: &Config, state: &RuntimeState) -> Result<String, InstallerError> {
    if config.global.orch_name.is_empty() {
        return Err(InstallerError::invalid_argument("orch_name is not set"));
    }
    if state.deployment_id.is_empty() {
        return Err(InstallerError::invalid_argument(
            "deployment_id is not set in the runtime state",
        ));
    }
    Ok(state_bucket_name(&config.global.orch_name, &state.deployment_id))
}
