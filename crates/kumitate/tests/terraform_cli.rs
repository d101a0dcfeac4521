//! Drives `TerraformCli` against a stand-in `terraform` script.
#![cfg(unix)]

use kumitate::steps::terraform::{TerraformCli, TerraformInput, TerraformUtility};
use kumitate::{Action, CancellationToken, ErrorCode};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const FAKE_TERRAFORM: &str = r#"#!/bin/sh
echo "$@" >> "$PWD/invocations.log"
case "$1" in
  output)
    printf '%s' '{"vpc_id":{"sensitive":false,"type":"string","value":"vpc-0abc"}}'
    ;;
  apply|destroy)
    echo "{\"@message\":\"$1 complete\"}"
    [ -f "$PWD/fail" ] && exit 1
    ;;
esac
exit 0
"#;

fn install_fake_terraform(dir: &Path) -> PathBuf {
    let path = dir.join("terraform");
    std::fs::write(&path, FAKE_TERRAFORM).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn input(bin: &Path, module: &Path, logs: &Path, action: Action, keep: bool) -> TerraformInput {
    TerraformInput {
        action,
        exec_path: bin.to_path_buf(),
        module_path: module.to_path_buf(),
        variables: json!({"region": "us-west-2"}),
        backend_config: Some(json!({"region": "us-west-2", "bucket": "demo-a1b2c3", "key": "vpc.tfstate"})),
        log_file: logs.join("aws_vpc.log"),
        keep_generated_files: keep,
    }
}

fn invocations(module: &Path) -> Vec<String> {
    std::fs::read_to_string(module.join("invocations.log"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_terraform_cli_lifecycle() {
    let bin_dir = tempfile::tempdir().unwrap();
    let module = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let bin = install_fake_terraform(bin_dir.path());
    let cancel = CancellationToken::new();
    let cli = TerraformCli::new();

    // Apply, then generated files are cleaned up.
    let output = cli
        .run(
            input(&bin, module.path(), logs.path(), Action::Install, false),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(output.string_output("vpc_id").unwrap(), "vpc-0abc");

    let calls = invocations(module.path());
    assert_eq!(calls.len(), 3);
    assert!(calls[0].starts_with("init -upgrade -input=false -backend-config="));
    assert!(calls[1].starts_with("apply -auto-approve -json -input=false -var-file="));
    assert_eq!(calls[2], "output -json");

    let environments = module.path().join("environments");
    assert!(!environments.join("variables.tfvars.json").exists());
    assert!(!environments.join("backend.tfvars.json").exists());
    let log = std::fs::read_to_string(logs.path().join("aws_vpc.log")).unwrap();
    assert!(log.contains("apply complete"));

    // Destroy skips the refresh and keeps files when asked to.
    std::fs::remove_file(module.path().join("invocations.log")).unwrap();
    cli.run(
        input(&bin, module.path(), logs.path(), Action::Uninstall, true),
        &cancel,
    )
    .await
    .unwrap();
    let calls = invocations(module.path());
    assert!(calls[1].starts_with("destroy -auto-approve"));
    assert!(calls[1].ends_with("-refresh=false"));
    assert!(environments.join("variables.tfvars.json").exists());

    // A failing apply surfaces as a terraform error.
    std::fs::write(module.path().join("fail"), "").unwrap();
    let err = cli
        .run(
            input(&bin, module.path(), logs.path(), Action::Upgrade, false),
            &cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Terraform);
    assert!(err.message().contains("failed to apply terraform config"));
}
