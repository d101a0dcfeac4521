//! Concrete provisioning steps and the utilities they delegate to.

pub mod aws;
pub mod common;
pub mod on_prem;
pub mod shell;
pub mod terraform;

use kumitate_core::{Action, CancellationToken, InstallerError, RuntimeState};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use terraform::{TerraformInput, TerraformOutput, TerraformUtility};

/// Where a step's delegated tool writes its log.
///
/// Falls back to the system temp directory when no log directory has been
/// recorded.
pub(crate) fn log_file(state: &RuntimeState, name: &str) -> PathBuf {
    if state.log_dir.is_empty() {
        std::env::temp_dir().join(name)
    } else {
        Path::new(&state.log_dir).join(name)
    }
}

/// Shared settings for steps that apply a terraform module from the
/// checkout.
#[derive(Debug, Clone)]
pub struct ModuleRunner {
    root_path: PathBuf,
    exec_path: PathBuf,
    keep_generated_files: bool,
    terraform: Arc<dyn TerraformUtility>,
}

impl ModuleRunner {
    /// Modules are resolved relative to `root_path`. The binary defaults to
    /// `terraform` on `PATH`.
    pub fn new(
        root_path: impl Into<PathBuf>,
        keep_generated_files: bool,
        terraform: Arc<dyn TerraformUtility>,
    ) -> Self {
        Self {
            root_path: root_path.into(),
            exec_path: PathBuf::from("terraform"),
            keep_generated_files,
            terraform,
        }
    }

    pub fn with_exec_path(mut self, exec_path: impl Into<PathBuf>) -> Self {
        self.exec_path = exec_path.into();
        self
    }

    pub fn module_path(&self, module: &str) -> PathBuf {
        self.root_path.join(module)
    }

    /// Applies or destroys `module` depending on `action`.
    pub async fn run(
        &self,
        action: Action,
        module: &str,
        variables: Value,
        backend_config: Option<Value>,
        log_file: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<TerraformOutput, InstallerError> {
        let input = TerraformInput {
            action,
            exec_path: self.exec_path.clone(),
            module_path: self.module_path(module),
            variables,
            backend_config,
            log_file,
            keep_generated_files: self.keep_generated_files,
        };
        self.terraform.run(input, cancel).await
    }
}
