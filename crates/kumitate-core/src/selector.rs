//! Label-based step selection.

use std::collections::BTreeSet;

/// Decides which labelled steps of a stage execute in a run.
///
/// Owned by the pipeline driver. Steps that are not selected are treated as
/// passthroughs: they are not invoked, leave runtime state unchanged and
/// contribute no error.
///
/// # Examples
///
/// ```
/// use kumitate_core::LabelSelector;
///
/// let selector = LabelSelector::any(["on-prem"]);
/// assert!(selector.selects(&["on-prem", "vm"]));
/// assert!(!selector.selects(&["aws", "vpc"]));
/// assert!(LabelSelector::All.selects(&["aws"]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LabelSelector {
    /// Every step runs.
    #[default]
    All,
    /// Only steps carrying at least one of these labels run.
    Any(BTreeSet<String>),
}

impl LabelSelector {
    /// Selects steps that share at least one label with `labels`.
    ///
    /// An empty label list selects everything.
    pub fn any<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            LabelSelector::All
        } else {
            LabelSelector::Any(labels)
        }
    }

    pub fn selects(&self, step_labels: &[&str]) -> bool {
        match self {
            LabelSelector::All => true,
            LabelSelector::Any(wanted) => step_labels.iter().any(|l| wanted.contains(*l)),
        }
    }
}
