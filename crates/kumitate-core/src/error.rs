//! Structured errors and the per-stage error aggregate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The kind of failure reported by a step phase.
///
/// Codes describe *what kind* of thing went wrong, not which Rust type
/// produced it. Tool-specific codes are added per integrated external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorCode {
    /// Malformed input, such as an undersized network block or an unsupported action.
    InvalidArgument,
    /// Local failure: file I/O, serialization, key generation, missing local tool.
    Internal,
    /// A delegated infrastructure-as-code action failed.
    Terraform,
    /// Two steps tried to write the same runtime state field.
    StateConflict,
    /// The caller cancelled the run before the action completed.
    Cancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidArgument => write!(f, "invalid_argument"),
            ErrorCode::Internal => write!(f, "internal"),
            ErrorCode::Terraform => write!(f, "terraform"),
            ErrorCode::StateConflict => write!(f, "state_conflict"),
            ErrorCode::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A typed failure unit returned by any phase of any step.
///
/// Once built an error is never mutated. [`InstallerError::superseding`]
/// produces a *new* error that keeps an earlier one reachable through
/// [`std::error::Error::source`].
///
/// # Examples
///
/// ```
/// use kumitate_core::{ErrorCode, InstallerError};
///
/// let err = InstallerError::invalid_argument("VPC CIDR block is too small");
/// assert_eq!(err.code(), ErrorCode::InvalidArgument);
/// assert_eq!(err.to_string(), "invalid_argument: VPC CIDR block is too small");
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct InstallerError {
    code: ErrorCode,
    message: String,
    #[source]
    previous: Option<Box<InstallerError>>,
}

impl InstallerError {
    /// Creates an error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            previous: None,
        }
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// Creates an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Creates a `Terraform` error.
    pub fn terraform(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Terraform, message)
    }

    /// Creates a `StateConflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    /// Creates a `Cancelled` error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    /// Returns a copy of `self` that records `previous` as its cause.
    ///
    /// Used when a step's Post phase fails after an earlier phase already
    /// failed: Post's error decides the step's final status, the earlier
    /// error stays in the chain.
    pub fn superseding(self, previous: InstallerError) -> Self {
        Self {
            previous: Some(Box::new(previous)),
            ..self
        }
    }

    /// Returns the error kind.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the human-readable message, without the code prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error this one superseded, if any.
    pub fn previous(&self) -> Option<&InstallerError> {
        self.previous.as_deref()
    }

    /// Renders the error and every superseded cause, outermost first.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut cursor = self.previous();
        while let Some(prev) = cursor {
            out.push_str(" (after: ");
            out.push_str(&prev.to_string());
            out.push(')');
            cursor = prev.previous();
        }
        out
    }
}

/// Positional collection of per-step errors produced by one stage pass.
///
/// Slot `i` belongs to step `i` of the stage. An empty slot means that step
/// succeeded (or was not selected) in the pass. An aggregate is only ever
/// built with at least one populated slot; a clean pass yields `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageError {
    step_errors: Vec<Option<InstallerError>>,
}

impl StageError {
    /// Builds an aggregate from the slots of a finished pass.
    ///
    /// Returns `None` when every slot is empty.
    ///
    /// ```
    /// use kumitate_core::{InstallerError, StageError};
    ///
    /// assert!(StageError::from_slots(vec![None, None]).is_none());
    ///
    /// let agg = StageError::from_slots(vec![None, Some(InstallerError::internal("boom")), None])
    ///     .expect("one slot failed");
    /// assert_eq!(agg.failed_count(), 1);
    /// assert!(agg.slot(1).is_some());
    /// ```
    pub fn from_slots(step_errors: Vec<Option<InstallerError>>) -> Option<Self> {
        if step_errors.iter().all(Option::is_none) {
            None
        } else {
            Some(Self { step_errors })
        }
    }

    /// The error recorded for the step at `index`, if any.
    pub fn slot(&self, index: usize) -> Option<&InstallerError> {
        self.step_errors.get(index).and_then(Option::as_ref)
    }

    /// Populated slots in step-list order.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &InstallerError)> {
        self.step_errors
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (i, e)))
    }

    /// All slots, one per step.
    pub fn slots(&self) -> &[Option<InstallerError>] {
        &self.step_errors
    }

    /// Number of slots, which equals the number of steps in the stage.
    pub fn len(&self) -> usize {
        self.step_errors.len()
    }

    /// Returns `true` for a stage without steps.
    pub fn is_empty(&self) -> bool {
        self.step_errors.is_empty()
    }

    /// Number of populated slots.
    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} steps failed", self.failed_count(), self.len())?;
        for (i, err) in self.failures() {
            write!(f, "; step {}: {}", i, err.chain())?;
        }
        Ok(())
    }
}

impl std::error::Error for StageError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let error = InstallerError::terraform("failed to apply terraform config");
        assert_eq!(
            error.to_string(),
            "terraform: failed to apply terraform config"
        );
        assert_eq!(error.code(), ErrorCode::Terraform);
        assert_eq!(error.message(), "failed to apply terraform config");
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::InvalidArgument.to_string(), "invalid_argument");
        assert_eq!(ErrorCode::StateConflict.to_string(), "state_conflict");
    }

    #[test]
    fn test_constructors_set_code() {
        let cases = [
            (InstallerError::invalid_argument("m"), ErrorCode::InvalidArgument),
            (InstallerError::internal("m"), ErrorCode::Internal),
            (InstallerError::terraform("m"), ErrorCode::Terraform),
            (InstallerError::conflict("m"), ErrorCode::StateConflict),
            (InstallerError::cancelled("m"), ErrorCode::Cancelled),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), code);
            assert_eq!(error.message(), "m");
            assert!(error.previous().is_none());
        }
    }

    #[test]
    fn test_superseding_keeps_previous_as_source() {
        let original = InstallerError::internal("run failed");
        let post = InstallerError::internal("cleanup failed").superseding(original.clone());

        assert_eq!(post.message(), "cleanup failed");
        assert_eq!(post.previous(), Some(&original));
        let source = post.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("internal: run failed"));
        assert_eq!(
            post.chain(),
            "internal: cleanup failed (after: internal: run failed)"
        );
    }

    #[test]
    fn test_stage_error_empty_slots_is_none() {
        assert!(StageError::from_slots(vec![]).is_none());
        assert!(StageError::from_slots(vec![None, None, None]).is_none());
    }

    #[test]
    fn test_stage_error_positional() {
        let agg = StageError::from_slots(vec![
            None,
            Some(InstallerError::internal("msg")),
            None,
        ])
        .unwrap();

        assert_eq!(agg.len(), 3);
        assert!(agg.slot(0).is_none());
        assert_eq!(agg.slot(1).map(InstallerError::code), Some(ErrorCode::Internal));
        assert!(agg.slot(2).is_none());
        assert!(agg.slot(7).is_none());
        assert_eq!(
            agg.failures().map(|(i, _)| i).collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(agg.to_string(), "1 of 3 steps failed; step 1: internal: msg");
    }
}
