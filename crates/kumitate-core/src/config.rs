//! Operator configuration and the top-level lifecycle action.

use crate::error::InstallerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default VPC network block.
pub const DEFAULT_NETWORK_CIDR: &str = "10.250.0.0/16";

/// Top-level lifecycle selector.
///
/// `install` and `upgrade` take the apply path of a delegated action,
/// `uninstall` takes the destroy path.
///
/// ```
/// use kumitate_core::{Action, ErrorCode};
///
/// assert_eq!("install".parse::<Action>(), Ok(Action::Install));
/// assert!(Action::Uninstall.is_teardown());
///
/// let err = "reinstall".parse::<Action>().unwrap_err();
/// assert_eq!(err.code(), ErrorCode::InvalidArgument);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Upgrade,
    Uninstall,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Uninstall => "uninstall",
        }
    }

    /// `true` when the action tears infrastructure down.
    pub fn is_teardown(&self) -> bool {
        matches!(self, Action::Uninstall)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = InstallerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Action::Install),
            "upgrade" => Ok(Action::Upgrade),
            "uninstall" => Ok(Action::Uninstall),
            other => Err(InstallerError::invalid_argument(format!(
                "unsupported action: {other:?}"
            ))),
        }
    }
}

/// Errors raised while loading a [`Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<ConfigError> for InstallerError {
    fn from(err: ConfigError) -> Self {
        InstallerError::invalid_argument(err.to_string())
    }
}

/// Settings shared by every target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Name of the orchestrator deployment; prefixes every cloud resource.
    pub orch_name: String,
    /// Raw action as supplied by the operator. Parse with [`Config::action`].
    pub action: String,
    /// Checkout that contains the infrastructure-as-code modules.
    pub root_path: PathBuf,
    /// Keep generated variable and backend files after a successful run.
    pub keep_generated_files: bool,
}

/// AWS target settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    pub customer_tag: String,
    pub jump_host_whitelist: Vec<String>,
    /// Overrides zone selection. When empty, zones `a`, `b` and `c` of
    /// `region` are used.
    pub availability_zones: Vec<String>,
    pub vpc_cidr_block: String,
    pub eks_version: String,
    pub eks_node_instance_type: String,
    pub eks_desired_size: u32,
    pub eks_min_size: u32,
    pub eks_max_size: u32,
    pub eks_max_pods: u32,
    pub eks_volume_size: u32,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            customer_tag: String::new(),
            jump_host_whitelist: Vec::new(),
            availability_zones: Vec::new(),
            vpc_cidr_block: DEFAULT_NETWORK_CIDR.to_string(),
            eks_version: "1.32".to_string(),
            eks_node_instance_type: "t3.2xlarge".to_string(),
            eks_desired_size: 3,
            eks_min_size: 3,
            eks_max_size: 3,
            eks_max_pods: 58,
            eks_volume_size: 128,
        }
    }
}

/// Proxy settings forwarded to provisioning tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
    pub socks_proxy: String,
}

/// Feature switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub production: bool,
    pub enable_cache_registry: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            production: true,
            enable_cache_registry: false,
        }
    }
}

/// Fully resolved operator input.
///
/// Built once before the pipeline starts and shared read-only by every
/// stage and step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub aws: AwsConfig,
    pub proxy: ProxyConfig,
    pub features: FeatureFlags,
}

impl Config {
    /// Parses a JSON document. Missing sections take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads and parses a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Parses the operator-supplied action.
    ///
    /// Fails with `InvalidArgument` for anything other than
    /// `install`, `upgrade` or `uninstall`.
    pub fn action(&self) -> Result<Action, InstallerError> {
        self.global.action.parse()
    }

    /// Zones to spread subnets over, in allocation order.
    pub fn availability_zones(&self) -> Vec<String> {
        if !self.aws.availability_zones.is_empty() {
            return self.aws.availability_zones.clone();
        }
        ["a", "b", "c"]
            .iter()
            .map(|suffix| format!("{}{}", self.aws.region, suffix))
            .collect()
    }
}
