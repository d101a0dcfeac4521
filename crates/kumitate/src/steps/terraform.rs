//! Terraform invocation used by infrastructure steps.

use async_trait::async_trait;
use kumitate_core::{Action, CancellationToken, InstallerError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Upper bound for a single terraform sub-command.
pub const DEFAULT_TERRAFORM_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const ENVIRONMENTS_DIR: &str = "environments";
const VARIABLES_FILE: &str = "variables.tfvars.json";
const BACKEND_FILE: &str = "backend.tfvars.json";

/// The terraform sub-command an [`Action`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerraformCommand {
    Apply,
    Destroy,
}

impl TerraformCommand {
    pub fn for_action(action: Action) -> Self {
        match action {
            Action::Install | Action::Upgrade => TerraformCommand::Apply,
            Action::Uninstall => TerraformCommand::Destroy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerraformCommand::Apply => "apply",
            TerraformCommand::Destroy => "destroy",
        }
    }
}

/// S3 backend settings written to `backend.tfvars.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsBucketBackendConfig {
    pub region: String,
    pub bucket: String,
    pub key: String,
}

/// Everything needed to apply or destroy one module.
#[derive(Debug, Clone, PartialEq)]
pub struct TerraformInput {
    pub action: Action,
    /// Path to the terraform binary.
    pub exec_path: PathBuf,
    pub module_path: PathBuf,
    pub variables: Value,
    /// `None` keeps the module's own backend (local state).
    pub backend_config: Option<Value>,
    pub log_file: PathBuf,
    pub keep_generated_files: bool,
}

/// One entry of `terraform output -json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMeta {
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub r#type: Value,
    pub value: Value,
}

/// Outputs of a module after apply or destroy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerraformOutput {
    pub outputs: BTreeMap<String, OutputMeta>,
}

impl TerraformOutput {
    /// The raw value of output `name`.
    pub fn output_json(&self, name: &str) -> Result<&Value, InstallerError> {
        self.outputs
            .get(name)
            .map(|meta| &meta.value)
            .ok_or_else(|| {
                InstallerError::terraform(format!("{name} does not exist in terraform output"))
            })
    }

    /// Output `name` as a string.
    pub fn string_output(&self, name: &str) -> Result<String, InstallerError> {
        match self.output_json(name)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(InstallerError::terraform(format!(
                "terraform output {name} is not a string: {other}"
            ))),
        }
    }
}

/// Serializes module variables or backend settings.
pub fn to_tf_json<T: Serialize>(value: &T, what: &str) -> Result<Value, InstallerError> {
    serde_json::to_value(value)
        .map_err(|e| InstallerError::internal(format!("failed to marshal {what}: {e}")))
}

/// Applies or destroys a terraform module.
#[async_trait]
pub trait TerraformUtility: Send + Sync + Debug {
    async fn run(
        &self,
        input: TerraformInput,
        cancel: &CancellationToken,
    ) -> Result<TerraformOutput, InstallerError>;
}

/// Variable and backend files written next to a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFiles {
    pub variables: PathBuf,
    pub backend: Option<PathBuf>,
}

impl GeneratedFiles {
    /// Writes `<module>/environments/{variables,backend}.tfvars.json`.
    pub async fn write(
        module_path: &Path,
        variables: &Value,
        backend: Option<&Value>,
    ) -> Result<Self, InstallerError> {
        let dir = module_path.join(ENVIRONMENTS_DIR);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            InstallerError::internal(format!(
                "failed to create environments directory {}: {e}",
                dir.display()
            ))
        })?;

        let variables_path = dir.join(VARIABLES_FILE);
        write_json(&variables_path, variables, "variables file").await?;

        let backend_path = match backend {
            Some(backend) => {
                let path = dir.join(BACKEND_FILE);
                write_json(&path, backend, "backend config file").await?;
                Some(path)
            }
            None => None,
        };

        debug!(module = %module_path.display(), "Backend and variables files created");
        Ok(Self {
            variables: variables_path,
            backend: backend_path,
        })
    }

    /// Deletes the files. Failures are logged, not returned.
    pub async fn remove(&self) {
        for path in std::iter::once(&self.variables).chain(self.backend.iter()) {
            debug!(path = %path.display(), "Deleting generated file");
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("failed to delete generated file {}: {}", path.display(), e);
            }
        }
    }
}

async fn write_json(path: &Path, value: &Value, what: &str) -> Result<(), InstallerError> {
    let raw = serde_json::to_vec_pretty(value)
        .map_err(|e| InstallerError::internal(format!("failed to marshal {what}: {e}")))?;
    tokio::fs::write(path, raw)
        .await
        .map_err(|e| InstallerError::internal(format!("failed to write {what}: {e}")))
}

/// [`TerraformUtility`] that drives the `terraform` binary.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    timeout: Duration,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new()
    }
}

impl TerraformCli {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TERRAFORM_TIMEOUT,
        }
    }

    /// Sets the timeout applied to each sub-command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exec(
        &self,
        input: &TerraformInput,
        args: &[String],
        log: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<String, InstallerError> {
        let label = format!("terraform {}", args.first().map_or("", String::as_str));
        if cancel.is_cancelled() {
            return Err(InstallerError::cancelled(format!("cancelled before {label}")));
        }

        let mut command = Command::new(&input.exec_path);
        command
            .args(args)
            .current_dir(&input.module_path)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match log {
            Some(path) => {
                let file = open_log(path).await?;
                let err_file = file.try_clone().map_err(|e| {
                    InstallerError::internal(format!("failed to open log file: {e}"))
                })?;
                command.stdout(Stdio::from(file)).stderr(Stdio::from(err_file));
            }
            None => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        debug!(module = %input.module_path.display(), "Running {}", label);
        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, command.output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(InstallerError::terraform(format!("failed to run {label}: {e}")))
                }
                Err(_) => {
                    return Err(InstallerError::terraform(format!(
                        "{label} timed out after {:?}",
                        self.timeout
                    )))
                }
            },
            _ = cancel.cancelled() => {
                return Err(InstallerError::cancelled(format!("{label} was cancelled")));
            }
        };

        if !output.status.success() {
            let detail = match log {
                Some(path) => format!("see {}", path.display()),
                None => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            return Err(InstallerError::terraform(format!(
                "{label} exited with {}: {detail}",
                output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn open_log(path: &Path) -> Result<std::fs::File, InstallerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            InstallerError::internal(format!(
                "failed to create log directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| {
            InstallerError::internal(format!(
                "failed to open log file {}: {e}",
                path.display()
            ))
        })?;
    Ok(file.into_std().await)
}

#[async_trait]
impl TerraformUtility for TerraformCli {
    async fn run(
        &self,
        input: TerraformInput,
        cancel: &CancellationToken,
    ) -> Result<TerraformOutput, InstallerError> {
        let files = GeneratedFiles::write(
            &input.module_path,
            &input.variables,
            input.backend_config.as_ref(),
        )
        .await?;

        let mut init = vec![
            "init".to_string(),
            "-upgrade".to_string(),
            "-input=false".to_string(),
        ];
        if let Some(backend) = &files.backend {
            init.push(format!("-backend-config={}", backend.display()));
        }
        self.exec(&input, &init, Some(&input.log_file), cancel)
            .await
            .map_err(|e| {
                InstallerError::new(e.code(), format!("failed to initialize terraform: {}", e.message()))
            })?;

        let command = TerraformCommand::for_action(input.action);
        let mut args = vec![
            command.as_str().to_string(),
            "-auto-approve".to_string(),
            "-json".to_string(),
            "-input=false".to_string(),
            format!("-var-file={}", files.variables.display()),
        ];
        if command == TerraformCommand::Destroy {
            args.push("-refresh=false".to_string());
        }
        self.exec(&input, &args, Some(&input.log_file), cancel)
            .await
            .map_err(|e| {
                InstallerError::new(
                    e.code(),
                    format!("failed to {} terraform config: {}", command.as_str(), e.message()),
                )
            })?;

        let raw = self
            .exec(
                &input,
                &["output".to_string(), "-json".to_string()],
                None,
                cancel,
            )
            .await
            .map_err(|e| {
                InstallerError::new(
                    e.code(),
                    format!("failed to retrieve terraform output: {}", e.message()),
                )
            })?;
        let outputs: BTreeMap<String, OutputMeta> = serde_json::from_str(&raw).map_err(|e| {
            InstallerError::terraform(format!("failed to parse terraform output: {e}"))
        })?;

        if !input.keep_generated_files {
            files.remove().await;
        }

        Ok(TerraformOutput { outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kumitate_core::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_command_for_action() {
        assert_eq!(
            TerraformCommand::for_action(Action::Install),
            TerraformCommand::Apply
        );
        assert_eq!(
            TerraformCommand::for_action(Action::Upgrade),
            TerraformCommand::Apply
        );
        assert_eq!(
            TerraformCommand::for_action(Action::Uninstall),
            TerraformCommand::Destroy
        );
    }

    #[test]
    fn test_parse_output() {
        let raw = r#"{
            "vpc_id": {"sensitive": false, "type": "string", "value": "vpc-0abc"},
            "private_subnets": {
                "sensitive": false,
                "type": ["object", {"subnet-a": ["object", {"id": "string"}]}],
                "value": {"subnet-a": {"id": "subnet-111"}}
            }
        }"#;
        let outputs: BTreeMap<String, OutputMeta> = serde_json::from_str(raw).unwrap();
        let output = TerraformOutput { outputs };

        assert_eq!(output.string_output("vpc_id").unwrap(), "vpc-0abc");
        assert_eq!(
            output.output_json("private_subnets").unwrap()["subnet-a"]["id"],
            "subnet-111"
        );

        let missing = output.string_output("eks_oidc_issuer").unwrap_err();
        assert_eq!(missing.code(), ErrorCode::Terraform);
        let not_string = output.string_output("private_subnets").unwrap_err();
        assert_eq!(not_string.code(), ErrorCode::Terraform);
    }

    #[tokio::test]
    async fn test_generated_files_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let backend = to_tf_json(
            &AwsBucketBackendConfig {
                region: "us-west-2".to_string(),
                bucket: "demo-abc".to_string(),
                key: "vpc.tfstate".to_string(),
            },
            "backend config",
        )
        .unwrap();

        let files = GeneratedFiles::write(dir.path(), &json!({"region": "us-west-2"}), Some(&backend))
            .await
            .unwrap();

        let written: Value =
            serde_json::from_slice(&std::fs::read(&files.variables).unwrap()).unwrap();
        assert_eq!(written["region"], "us-west-2");
        let backend_path = files.backend.clone().unwrap();
        assert!(backend_path.ends_with("environments/backend.tfvars.json"));

        files.remove().await;
        assert!(!files.variables.exists());
        assert!(!backend_path.exists());
    }

    #[tokio::test]
    async fn test_generated_files_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let files = GeneratedFiles::write(dir.path(), &json!({}), None)
            .await
            .unwrap();
        assert!(files.backend.is_none());
        assert!(!dir.path().join("environments").join(BACKEND_FILE).exists());
    }
}
