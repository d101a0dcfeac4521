//! AWS target.

use crate::stage::StepStage;
use crate::steps::aws::{AwsEksStep, AwsStateBucketStep, AwsVpcStep};
use crate::steps::common::SshuttleStep;
use crate::steps::shell::ShellUtility;
use crate::steps::terraform::TerraformUtility;
use crate::steps::ModuleRunner;
use kumitate_core::{Config, InstallerError, Stage, Step};
use std::sync::Arc;

/// Builds the AWS stages in declaration order.
///
/// `PreInfra` creates the state bucket the later modules keep their state
/// in. `Infra` creates the VPC, opens the tunnel through the jump host and
/// creates the EKS cluster. For a teardown action `Infra` lists its steps
/// in reverse, so the cluster is destroyed while its VPC still exists.
///
/// Modules are resolved under `config.global.root_path`.
pub fn create_stages(
    config: &Config,
    shell: Arc<dyn ShellUtility>,
    terraform: Arc<dyn TerraformUtility>,
) -> Result<Vec<Box<dyn Stage>>, InstallerError> {
    assemble(config, SshuttleStep::new(&config.global.root_path, shell), terraform)
}

fn assemble(
    config: &Config,
    sshuttle: SshuttleStep,
    terraform: Arc<dyn TerraformUtility>,
) -> Result<Vec<Box<dyn Stage>>, InstallerError> {
    let action = config.action()?;
    let global = &config.global;
    let runner = ModuleRunner::new(&global.root_path, global.keep_generated_files, terraform);

    let pre_infra = StepStage::builder("PreInfra")
        .add_step(AwsStateBucketStep::new(runner.clone()))
        .build()?;

    let mut infra_steps: Vec<Box<dyn Step>> = vec![
        Box::new(AwsVpcStep::new(runner.clone())),
        Box::new(sshuttle),
        Box::new(AwsEksStep::new(runner)),
    ];
    if action.is_teardown() {
        infra_steps.reverse();
    }
    let infra = infra_steps
        .into_iter()
        .fold(StepStage::builder("Infra"), |builder, step| builder.add_boxed(step))
        .build()?;

    Ok(vec![Box::new(pre_infra), Box::new(infra)])
}
