//! Human decision records used to resume suspended instances.

use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::instance::SuspensionKind;
use super::result::{PhaseResult, PhaseStatus};

/// External decision carried by a resumption call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum HumanDecision {
    /// Accept the pending result, optionally overriding status or artifacts
    Approve {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<PhaseStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifacts: Option<Vec<Artifact>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Send the phase back for another iteration with feedback
    Reject { reason: String },
    /// Replace the strategy's result entirely
    Collaborate { result: PhaseResult },
    /// Re-run the current phase of a blocked instance
    Retry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl HumanDecision {
    pub fn approve() -> Self {
        HumanDecision::Approve {
            status: None,
            artifacts: None,
            note: None,
        }
    }

    pub fn approve_as(status: PhaseStatus) -> Self {
        HumanDecision::Approve {
            status: Some(status),
            artifacts: None,
            note: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        HumanDecision::Reject { reason: reason.into() }
    }

    pub fn collaborate(result: PhaseResult) -> Self {
        HumanDecision::Collaborate { result }
    }

    pub fn retry() -> Self {
        HumanDecision::Retry { note: None }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HumanDecision::Approve { .. } => "approve",
            HumanDecision::Reject { .. } => "reject",
            HumanDecision::Collaborate { .. } => "collaborate",
            HumanDecision::Retry { .. } => "retry",
        }
    }

    /// Whether this decision may resume a suspension of the given kind.
    ///
    /// Collaboration only accepts a full replacement result; approvals of a
    /// blocked instance need a pending result to approve.
    pub fn accepted_by(&self, kind: SuspensionKind, has_pending: bool) -> bool {
        match (kind, self) {
            (SuspensionKind::Collaboration, HumanDecision::Collaborate { .. }) => true,
            (SuspensionKind::Collaboration, _) => false,
            (_, HumanDecision::Approve { .. }) => has_pending,
            (_, _) => true,
        }
    }

    /// Apply approval overrides to the pending result
    pub fn apply_approval(
        pending: PhaseResult,
        status: Option<PhaseStatus>,
        artifacts: Option<Vec<Artifact>>,
        note: Option<String>,
    ) -> PhaseResult {
        let mut result = pending;
        if let Some(status) = status {
            result.status = status;
        }
        if let Some(artifacts) = artifacts {
            result.artifacts = artifacts;
        }
        if note.is_some() {
            result.detail = note;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaboration_requires_full_result() {
        assert!(HumanDecision::collaborate(PhaseResult::done()).accepted_by(SuspensionKind::Collaboration, true));
        assert!(!HumanDecision::approve().accepted_by(SuspensionKind::Collaboration, true));
        assert!(!HumanDecision::retry().accepted_by(SuspensionKind::Collaboration, true));
    }

    #[test]
    fn test_approval_needs_pending_result() {
        assert!(HumanDecision::approve().accepted_by(SuspensionKind::Approval, true));
        assert!(!HumanDecision::approve().accepted_by(SuspensionKind::Blocked, false));
        assert!(HumanDecision::retry().accepted_by(SuspensionKind::Blocked, false));
        assert!(HumanDecision::reject("no").accepted_by(SuspensionKind::Approval, true));
    }

    #[test]
    fn test_apply_approval_overrides() {
        let pending = PhaseResult::failed("flaky test").with_artifact(Artifact::new("log", "l1", "..."));
        let result = HumanDecision::apply_approval(pending.clone(), Some(PhaseStatus::Done), None, Some("ok".into()));
        assert_eq!(result.status, PhaseStatus::Done);
        assert_eq!(result.artifacts, pending.artifacts);
        assert_eq!(result.detail.as_deref(), Some("ok"));

        let replaced = HumanDecision::apply_approval(pending, None, Some(vec![]), None);
        assert_eq!(replaced.status, PhaseStatus::Failed);
        assert!(replaced.artifacts.is_empty());
    }

    #[test]
    fn test_decision_yaml() {
        let d: HumanDecision = serde_yaml::from_str("decision: approve\nstatus: done\n").unwrap();
        assert_eq!(d, HumanDecision::approve_as(PhaseStatus::Done));
        let d: HumanDecision = serde_yaml::from_str("decision: reject\nreason: too vague\n").unwrap();
        assert_eq!(d.name(), "reject");
    }
}
