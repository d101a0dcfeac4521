//! VPC, subnets and jump host.

use super::require_state_bucket;
use crate::steps::terraform::{to_tf_json, AwsBucketBackendConfig, TerraformOutput};
use crate::steps::{log_file, ModuleRunner};
use async_trait::async_trait;
use kumitate_core::{InstallerError, PhaseResult, RunContext, RuntimeState, Step, StepName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::info;

pub const VPC_MODULE_PATH: &str = "targets/aws/iac/vpc";
pub const VPC_STATE_KEY: &str = "vpc.tfstate";
pub const JUMP_HOST_AMI_ID: &str = "ami-0026a04369a3093cc";
const JUMP_HOST_INSTANCE_TYPE: &str = "t3.medium";

/// The VPC block must be at least this large (a smaller mask is a larger
/// block).
pub const MINIMUM_VPC_CIDR_MASK_SIZE: u8 = 18;
pub const REQUIRED_AVAILABILITY_ZONES: usize = 3;
pub const PRIVATE_SUBNET_MASK_SIZE: u8 = 20;
pub const PUBLIC_SUBNET_MASK_SIZE: u8 = 24;

/// An IPv4 network in CIDR notation, normalized to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, InstallerError> {
        if prefix > 32 {
            return Err(InstallerError::invalid_argument(format!(
                "invalid prefix length /{prefix}"
            )));
        }
        let mask = u32::MAX.checked_shl(u32::from(32 - prefix)).unwrap_or(0);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = InstallerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            || InstallerError::invalid_argument(format!("failed to parse VPC CIDR block: {s:?}"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsVpcSubnet {
    pub az: String,
    pub cidr_block: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsVpcJumphostSubnet {
    pub name: String,
    pub az: String,
    pub cidr_block: String,
}

/// Subnet layout for a VPC, keyed by subnet name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetPlan {
    pub private: BTreeMap<String, AwsVpcSubnet>,
    pub public: BTreeMap<String, AwsVpcSubnet>,
    pub jumphost: AwsVpcJumphostSubnet,
}

/// Lays out one private and one public subnet per zone.
///
/// Private `/20` blocks are allocated consecutively from the VPC base
/// address, then public `/24` blocks consecutively after the private ones.
/// Only the first [`REQUIRED_AVAILABILITY_ZONES`] zones are used; the jump
/// host lives in the first zone's public subnet.
pub fn plan_subnets(
    orch_name: &str,
    vpc: &Ipv4Cidr,
    zones: &[String],
) -> Result<SubnetPlan, InstallerError> {
    if vpc.prefix() > MINIMUM_VPC_CIDR_MASK_SIZE {
        return Err(InstallerError::invalid_argument(format!(
            "VPC CIDR block is too small: {vpc}, minimum is /{MINIMUM_VPC_CIDR_MASK_SIZE}"
        )));
    }
    if zones.len() < REQUIRED_AVAILABILITY_ZONES {
        return Err(InstallerError::invalid_argument(format!(
            "{REQUIRED_AVAILABILITY_ZONES} availability zones are required, got {}",
            zones.len()
        )));
    }
    let zones = &zones[..REQUIRED_AVAILABILITY_ZONES];

    // A /18 or larger block always fits 3 x /20 plus 3 x /24.
    let base = u32::from(vpc.network());
    let private_size = 1u32 << (32 - PRIVATE_SUBNET_MASK_SIZE);
    let public_size = 1u32 << (32 - PUBLIC_SUBNET_MASK_SIZE);

    let mut private = BTreeMap::new();
    for (i, az) in zones.iter().enumerate() {
        let addr = Ipv4Addr::from(base + i as u32 * private_size);
        private.insert(
            format!("subnet-{az}"),
            AwsVpcSubnet {
                az: az.clone(),
                cidr_block: format!("{addr}/{PRIVATE_SUBNET_MASK_SIZE}"),
            },
        );
    }

    let public_base = base + zones.len() as u32 * private_size;
    let mut public = BTreeMap::new();
    for (i, az) in zones.iter().enumerate() {
        let addr = Ipv4Addr::from(public_base + i as u32 * public_size);
        public.insert(
            format!("subnet-{az}-pub"),
            AwsVpcSubnet {
                az: az.clone(),
                cidr_block: format!("{addr}/{PUBLIC_SUBNET_MASK_SIZE}"),
            },
        );
    }

    let first = &zones[0];
    let jumphost = AwsVpcJumphostSubnet {
        name: format!("{orch_name}-subnet-{first}-pub"),
        az: first.clone(),
        cidr_block: format!("{}/{PUBLIC_SUBNET_MASK_SIZE}", Ipv4Addr::from(public_base)),
    };

    Ok(SubnetPlan {
        private,
        public,
        jumphost,
    })
}

/// Generates an Ed25519 key pair for the jump host.
///
/// Returns the private key in OpenSSH PEM form and the public key in
/// `authorized_keys` form.
pub fn generate_ssh_key_pair() -> Result<(String, String), InstallerError> {
    let private_key =
        ssh_key::PrivateKey::random(&mut ssh_key::rand_core::OsRng, ssh_key::Algorithm::Ed25519)
            .map_err(|e| {
                InstallerError::internal(format!("failed to generate SSH key pair: {e}"))
            })?;
    let private_pem = private_key
        .to_openssh(ssh_key::LineEnding::LF)
        .map_err(|e| InstallerError::internal(format!("failed to serialize private key: {e}")))?
        .to_string();
    let public_openssh = private_key
        .public_key()
        .to_openssh()
        .map_err(|e| InstallerError::internal(format!("failed to serialize public key: {e}")))?;
    Ok((private_pem, public_openssh))
}

/// Variables of the VPC module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsVpcVariables {
    pub region: String,
    pub vpc_name: String,
    pub vpc_cidr_block: String,
    pub vpc_additional_cidr_blocks: Vec<String>,
    pub vpc_enable_dns_hostnames: bool,
    pub vpc_enable_dns_support: bool,
    pub private_subnets: BTreeMap<String, AwsVpcSubnet>,
    pub public_subnets: BTreeMap<String, AwsVpcSubnet>,
    pub endpoint_sg_name: String,
    pub jumphost_ip_allow_list: Vec<String>,
    pub jumphost_ami_id: String,
    pub jumphost_instance_type: String,
    pub jumphost_instance_ssh_key_pub: String,
    pub jumphost_subnet: AwsVpcJumphostSubnet,
    pub production: bool,
    pub customer_tag: String,
}

/// Creates the VPC, its subnets and the jump host.
#[derive(Debug)]
pub struct AwsVpcStep {
    runner: ModuleRunner,
    variables: Option<AwsVpcVariables>,
    backend_config: Option<AwsBucketBackendConfig>,
}

impl AwsVpcStep {
    pub fn new(runner: ModuleRunner) -> Self {
        Self {
            runner,
            variables: None,
            backend_config: None,
        }
    }

    /// Variables computed by the last successful configure.
    pub fn variables(&self) -> Option<&AwsVpcVariables> {
        self.variables.as_ref()
    }
}

/// Collects the `id` of every planned subnet from a map output, in subnet
/// name order.
fn subnet_ids<'a>(
    output: &TerraformOutput,
    name: &str,
    subnets: impl Iterator<Item = &'a String>,
) -> Result<Vec<String>, InstallerError> {
    let value = output.output_json(name)?;
    subnets
        .map(|subnet| {
            value
                .get(subnet)
                .and_then(|s| s.get("id"))
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    InstallerError::terraform(format!(
                        "subnet id for {subnet} does not exist in terraform output"
                    ))
                })
        })
        .collect()
}

#[async_trait]
impl Step for AwsVpcStep {
    fn name(&self) -> StepName {
        StepName::new("AwsVpcStep")
    }

    fn labels(&self) -> &[&str] {
        &["aws", "vpc"]
    }

    async fn configure(&mut self, ctx: &RunContext, mut state: RuntimeState) -> PhaseResult {
        let config = ctx.config();
        let cidr: Ipv4Cidr = config.aws.vpc_cidr_block.parse()?;
        let plan = plan_subnets(&config.global.orch_name, &cidr, &config.availability_zones())?;
        let bucket = require_state_bucket(config, &state)?;

        let public_key = if state.aws.jump_host_ssh_private_key.is_empty()
            || state.aws.jump_host_ssh_public_key.is_empty()
        {
            let (private_key, public_key) = generate_ssh_key_pair()?;
            info!("Generated jump host SSH key pair");
            state.aws.jump_host_ssh_private_key = private_key;
            state.aws.jump_host_ssh_public_key = public_key.clone();
            public_key
        } else {
            state.aws.jump_host_ssh_public_key.clone()
        };

        self.variables = Some(AwsVpcVariables {
            region: config.aws.region.clone(),
            vpc_name: config.global.orch_name.clone(),
            vpc_cidr_block: cidr.to_string(),
            vpc_additional_cidr_blocks: Vec::new(),
            vpc_enable_dns_hostnames: true,
            vpc_enable_dns_support: true,
            private_subnets: plan.private,
            public_subnets: plan.public,
            endpoint_sg_name: format!("{}-vpc-ep", config.global.orch_name),
            jumphost_ip_allow_list: config.aws.jump_host_whitelist.clone(),
            jumphost_ami_id: JUMP_HOST_AMI_ID.to_string(),
            jumphost_instance_type: JUMP_HOST_INSTANCE_TYPE.to_string(),
            jumphost_instance_ssh_key_pub: public_key,
            jumphost_subnet: plan.jumphost,
            production: config.features.production,
            customer_tag: config.aws.customer_tag.clone(),
        });
        self.backend_config = Some(AwsBucketBackendConfig {
            region: config.aws.region.clone(),
            bucket,
            key: VPC_STATE_KEY.to_string(),
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
                    "AwsVpcStep must be configured before it runs",
                ))
            }
        };
        ctx.ensure_not_cancelled("applying the VPC module")?;

        let output = self
            .runner
            .run(
                action,
                VPC_MODULE_PATH,
                to_tf_json(variables, "VPC variables")?,
                Some(to_tf_json(backend, "VPC backend config")?),
                log_file(&state, "aws_vpc.log"),
                ctx.cancellation(),
            )
            .await?;

        if action.is_teardown() {
            state.aws.vpc_id.clear();
            state.aws.jump_host_ip.clear();
            state.aws.public_subnet_ids.clear();
            state.aws.private_subnet_ids.clear();
            return Ok(state);
        }

        state.aws.vpc_id = output.string_output("vpc_id")?;
        state.aws.jump_host_ip = output.string_output("jumphost_ip")?;
        state.aws.public_subnet_ids =
            subnet_ids(&output, "public_subnets", variables.public_subnets.keys())?;
        state.aws.private_subnet_ids =
            subnet_ids(&output, "private_subnets", variables.private_subnets.keys())?;
        info!(vpc_id = %state.aws.vpc_id, "VPC is ready");
        Ok(state)
    }

    /// Reports the triggering failure again so the VPC stays failed in the
    /// finalize aggregate.
    async fn post(
        &mut self,
        _ctx: &RunContext,
        state: RuntimeState,
        previous: Option<&InstallerError>,
    ) -> PhaseResult {
        match previous {
            Some(err) => Err(err.clone()),
            None => Ok(state),
        }
    }
}
