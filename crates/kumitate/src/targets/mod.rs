//! Deployment targets: each assembles its steps into ordered stages.

pub mod aws;
pub mod on_prem;
