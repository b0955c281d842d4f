//! Phase results returned by strategies.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::artifact::Artifact;

/// What a strategy reports about the phase it just ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase finished, move on
    Done,
    /// Re-enter the same phase
    NeedsMore,
    /// Cannot proceed without outside help
    Blocked,
    /// Phase failed
    Failed,
    /// Spawn one child loop at the next-deeper level
    Descend,
    /// Fork one child loop per produced artifact
    Parallel,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Done => "done",
            PhaseStatus::NeedsMore => "needs_more",
            PhaseStatus::Blocked => "blocked",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Descend => "descend",
            PhaseStatus::Parallel => "parallel",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(PhaseStatus::Done),
            "needs_more" => Ok(PhaseStatus::NeedsMore),
            "blocked" => Ok(PhaseStatus::Blocked),
            "failed" => Ok(PhaseStatus::Failed),
            "descend" => Ok(PhaseStatus::Descend),
            "parallel" => Ok(PhaseStatus::Parallel),
            other => Err(format!("unknown phase status '{}'", other)),
        }
    }
}

/// Normalized outcome of one phase execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub status: PhaseStatus,
    /// Produced artifacts; for `parallel` each one is a work item
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// Advisory only, never authoritative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    /// Failure or normalization detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PhaseResult {
    pub fn new(status: PhaseStatus) -> Self {
        Self {
            status,
            artifacts: Vec::new(),
            next_action: None,
            detail: None,
        }
    }

    pub fn done() -> Self {
        Self::new(PhaseStatus::Done)
    }

    pub fn needs_more() -> Self {
        Self::new(PhaseStatus::NeedsMore)
    }

    pub fn blocked(detail: impl Into<String>) -> Self {
        Self::new(PhaseStatus::Blocked).with_detail(detail)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(PhaseStatus::Failed).with_detail(detail)
    }

    pub fn descend(artifacts: Vec<Artifact>) -> Self {
        Self {
            artifacts,
            ..Self::new(PhaseStatus::Descend)
        }
    }

    pub fn parallel(work_items: Vec<Artifact>) -> Self {
        Self {
            artifacts: work_items,
            ..Self::new(PhaseStatus::Parallel)
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_next_action(mut self, action: impl Into<String>) -> Self {
        self.next_action = Some(action.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Does the result carry an artifact of the given type (any type when `None`)?
    pub fn has_artifact(&self, artifact_type: Option<&str>) -> bool {
        match artifact_type {
            Some(t) => self.artifacts.iter().any(|a| a.artifact_type == t),
            None => !self.artifacts.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&PhaseStatus::NeedsMore).unwrap(), "\"needs_more\"");
        assert_eq!(serde_json::to_string(&PhaseStatus::Parallel).unwrap(), "\"parallel\"");
        let s: PhaseStatus = serde_json::from_str("\"descend\"").unwrap();
        assert_eq!(s, PhaseStatus::Descend);
    }

    #[test]
    fn test_status_from_str_matches_display() {
        for status in [
            PhaseStatus::Done,
            PhaseStatus::NeedsMore,
            PhaseStatus::Blocked,
            PhaseStatus::Failed,
            PhaseStatus::Descend,
            PhaseStatus::Parallel,
        ] {
            assert_eq!(status.to_string().parse::<PhaseStatus>().unwrap(), status);
        }
        assert!("finished".parse::<PhaseStatus>().is_err());
    }

    #[test]
    fn test_constructors() {
        assert_eq!(PhaseResult::done().status, PhaseStatus::Done);
        let failed = PhaseResult::failed("compile error");
        assert_eq!(failed.status, PhaseStatus::Failed);
        assert_eq!(failed.detail.as_deref(), Some("compile error"));

        let items = vec![Artifact::new("story", "a", ""), Artifact::new("story", "b", "")];
        let parallel = PhaseResult::parallel(items);
        assert_eq!(parallel.artifacts.len(), 2);
    }

    #[test]
    fn test_has_artifact() {
        let result = PhaseResult::done().with_artifact(Artifact::new("design", "d1", "..."));
        assert!(result.has_artifact(None));
        assert!(result.has_artifact(Some("design")));
        assert!(!result.has_artifact(Some("story")));
        assert!(!PhaseResult::done().has_artifact(None));
    }

    #[test]
    fn test_parse_from_yaml() {
        let yaml = r#"
status: done
next_action: review
artifacts:
  - artifact_type: design
    id: d1
    content: "overview"
"#;
        let result: PhaseResult = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(result.status, PhaseStatus::Done);
        assert_eq!(result.next_action.as_deref(), Some("review"));
        assert_eq!(result.artifacts[0].id, "d1");
    }
}
