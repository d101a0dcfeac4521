//! Runtime state threaded through every step, and the ledger that merges
//! step candidates into one canonical copy.

use crate::error::InstallerError;
use crate::step::StepName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// AWS resources discovered or generated during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsRuntimeState {
    /// OpenSSH private key for the jump host, written by the VPC step.
    pub jump_host_ssh_private_key: String,
    /// Public half of the jump host key.
    pub jump_host_ssh_public_key: String,
    /// Public IP of the jump host the tunnel connects through.
    pub jump_host_ip: String,
    /// ID of the VPC, empty until the VPC is applied.
    pub vpc_id: String,
    /// Public subnet IDs, ordered by subnet name.
    pub public_subnet_ids: Vec<String>,
    /// Private subnet IDs, ordered by subnet name.
    pub private_subnet_ids: Vec<String>,
    /// OIDC issuer URL of the EKS cluster.
    pub eks_oidc_issuer: String,
}

/// Values produced while the pipeline executes.
///
/// Each field is either supplied once by the operator (or restored from a
/// previous run) or written by exactly one step. Steps receive a snapshot
/// and hand back a candidate; [`CanonicalState::merge`] commits it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    /// Operator-supplied suffix that makes cloud resource names unique.
    pub deployment_id: String,
    /// Directory for tool logs. Empty means the system temp directory.
    pub log_dir: String,
    /// AWS resources of the deployment.
    pub aws: AwsRuntimeState,
    /// Pid of the background sshuttle tunnel, empty when none is running.
    pub sshuttle_pid: String,
}

impl RuntimeState {
    /// Restores a state persisted by [`RuntimeState::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InstallerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InstallerError::internal(format!(
                "failed to read runtime state {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            InstallerError::internal(format!("failed to parse runtime state: {e}"))
        })
    }

    /// Persists the state as pretty JSON so a later run can resume from it.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), InstallerError> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self).map_err(|e| {
            InstallerError::internal(format!("failed to serialize runtime state: {e}"))
        })?;
        std::fs::write(path, raw).map_err(|e| {
            InstallerError::internal(format!(
                "failed to write runtime state {}: {e}",
                path.display()
            ))
        })
    }
}

/// Dotted path of a leaf field inside [`RuntimeState`], e.g. `aws.vpc_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::borrow::Borrow<str> for FieldPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The single canonical copy of [`RuntimeState`] plus the record of which
/// step owns each field.
///
/// This is the only mutation point for runtime state during a run.
///
/// # Examples
///
/// ```
/// use kumitate_core::{CanonicalState, ErrorCode, RuntimeState, StepName};
///
/// let mut canonical = CanonicalState::new(RuntimeState::default());
///
/// let mut candidate = canonical.snapshot();
/// candidate.aws.vpc_id = "vpc-123".to_string();
/// canonical.merge(&StepName::new("AwsVpcStep"), candidate).unwrap();
///
/// // A different step may not overwrite a field it does not own.
/// let mut rogue = canonical.snapshot();
/// rogue.aws.vpc_id = "vpc-999".to_string();
/// let err = canonical.merge(&StepName::new("OtherStep"), rogue).unwrap_err();
/// assert_eq!(err.code(), ErrorCode::StateConflict);
/// assert_eq!(canonical.state().aws.vpc_id, "vpc-123");
/// ```
#[derive(Debug, Clone, Default)]
pub struct CanonicalState {
    state: RuntimeState,
    owners: BTreeMap<FieldPath, StepName>,
}

impl CanonicalState {
    /// Seeds the canonical copy. Seeded fields start without an owner; the
    /// first step that changes one claims it.
    pub fn new(initial: RuntimeState) -> Self {
        Self {
            state: initial,
            owners: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    /// A copy of the current state to hand to a step phase.
    pub fn snapshot(&self) -> RuntimeState {
        self.state.clone()
    }

    /// The step that last wrote `path`, if any step has.
    pub fn owner_of(&self, path: &str) -> Option<&StepName> {
        self.owners.get(path)
    }

    pub fn into_state(self) -> RuntimeState {
        self.state
    }

    /// Commits `candidate`, produced by `writer`, into the canonical copy.
    ///
    /// Every changed leaf field must be unowned or already owned by
    /// `writer`. On any conflict or serialization failure nothing is
    /// committed. Returns the paths that changed.
    pub fn merge(
        &mut self,
        writer: &StepName,
        candidate: RuntimeState,
    ) -> Result<Vec<FieldPath>, InstallerError> {
        let current = flatten_state(&self.state)?;
        let proposed = flatten_state(&candidate)?;

        let changed: Vec<FieldPath> = proposed
            .iter()
            .filter(|(path, value)| current.get(*path) != Some(*value))
            .map(|(path, _)| path.clone())
            .chain(
                current
                    .keys()
                    .filter(|path| !proposed.contains_key(*path))
                    .cloned(),
            )
            .collect();

        let conflicts: Vec<String> = changed
            .iter()
            .filter_map(|path| match self.owners.get(path) {
                Some(owner) if owner != writer => Some(format!("{path} (owned by {owner})")),
                _ => None,
            })
            .collect();
        if !conflicts.is_empty() {
            return Err(InstallerError::conflict(format!(
                "step {writer} attempted to overwrite runtime state fields written by other steps: {}",
                conflicts.join(", ")
            )));
        }

        for path in &changed {
            self.owners.insert(path.clone(), writer.clone());
        }
        self.state = candidate;
        Ok(changed)
    }
}

fn flatten_state(state: &RuntimeState) -> Result<BTreeMap<FieldPath, Value>, InstallerError> {
    let value = serde_json::to_value(state).map_err(|e| {
        InstallerError::internal(format!("failed to serialize runtime state: {e}"))
    })?;
    let mut leaves = BTreeMap::new();
    flatten_into(String::new(), value, &mut leaves);
    Ok(leaves)
}

fn flatten_into(prefix: String, value: Value, out: &mut BTreeMap<FieldPath, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(path, child, out);
            }
        }
        leaf => {
            out.insert(FieldPath(prefix), leaf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn step(name: &str) -> StepName {
        StepName::new(name)
    }

    #[test]
    fn test_disjoint_merges_compose() {
        let mut canonical = CanonicalState::default();

        let mut a = canonical.snapshot();
        a.aws.vpc_id = "vpc-1".to_string();
        let changed = canonical.merge(&step("A"), a).unwrap();
        assert_eq!(changed, vec![FieldPath::from("aws.vpc_id")]);

        let mut b = canonical.snapshot();
        b.sshuttle_pid = "4242".to_string();
        canonical.merge(&step("B"), b).unwrap();

        assert_eq!(canonical.state().aws.vpc_id, "vpc-1");
        assert_eq!(canonical.state().sshuttle_pid, "4242");
        assert_eq!(canonical.owner_of("aws.vpc_id"), Some(&step("A")));
        assert_eq!(canonical.owner_of("sshuttle_pid"), Some(&step("B")));
    }

    #[test]
    fn test_owner_may_rewrite_its_field() {
        let mut canonical = CanonicalState::default();

        let mut first = canonical.snapshot();
        first.aws.private_subnet_ids = vec!["subnet-a".to_string()];
        canonical.merge(&step("Vpc"), first).unwrap();

        let mut second = canonical.snapshot();
        second.aws.private_subnet_ids.clear();
        canonical.merge(&step("Vpc"), second).unwrap();

        assert!(canonical.state().aws.private_subnet_ids.is_empty());
    }

    #[test]
    fn test_conflicting_write_is_rejected_atomically() {
        let mut canonical = CanonicalState::default();

        let mut a = canonical.snapshot();
        a.aws.vpc_id = "vpc-1".to_string();
        canonical.merge(&step("A"), a).unwrap();

        let mut b = canonical.snapshot();
        b.aws.vpc_id = "vpc-2".to_string();
        b.log_dir = "/tmp/logs".to_string();
        let err = canonical.merge(&step("B"), b).unwrap_err();

        assert_eq!(err.code(), ErrorCode::StateConflict);
        assert!(err.message().contains("aws.vpc_id"));
        assert_eq!(canonical.state().aws.vpc_id, "vpc-1");
        assert_eq!(canonical.state().log_dir, "");
        assert!(canonical.owner_of("log_dir").is_none());
    }

    #[test]
    fn test_unchanged_candidate_claims_nothing() {
        let mut seed = RuntimeState::default();
        seed.deployment_id = "abc123".to_string();
        let mut canonical = CanonicalState::new(seed);

        let changed = canonical.merge(&step("A"), canonical.snapshot()).unwrap();
        assert!(changed.is_empty());
        assert!(canonical.owner_of("deployment_id").is_none());
    }

    #[test]
    fn test_seeded_fields_are_claimable_once() {
        let mut seed = RuntimeState::default();
        seed.aws.vpc_id = "vpc-restored".to_string();
        let mut canonical = CanonicalState::new(seed);

        let mut a = canonical.snapshot();
        a.aws.vpc_id = "vpc-new".to_string();
        canonical.merge(&step("A"), a).unwrap();

        let mut b = canonical.snapshot();
        b.aws.vpc_id = "vpc-other".to_string();
        assert!(canonical.merge(&step("B"), b).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = RuntimeState::default();
        state.aws.public_subnet_ids = vec!["subnet-1".to_string(), "subnet-2".to_string()];
        state.save(&path).unwrap();

        assert_eq!(RuntimeState::load(&path).unwrap(), state);
        assert_eq!(
            RuntimeState::load(dir.path().join("nope.json"))
                .unwrap_err()
                .code(),
            ErrorCode::Internal
        );
    }
}
