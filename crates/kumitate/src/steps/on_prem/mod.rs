//! Steps for on-premises targets.

mod network;

pub use network::OnPremNetworkStep;
