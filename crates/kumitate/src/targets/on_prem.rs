//! On-premises target.

use crate::stage::StepStage;
use crate::steps::on_prem::OnPremNetworkStep;
use kumitate_core::{InstallerError, Stage};

pub fn create_stages() -> Result<Vec<Box<dyn Stage>>, InstallerError> {
    let network = StepStage::builder("Network")
        .add_step(OnPremNetworkStep)
        .build()?;
    Ok(vec![Box::new(network)])
}
