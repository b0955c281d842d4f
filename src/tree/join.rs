//! Join aggregation for forked children.

use crate::domain::{ArtifactRef, InstanceStatus, JoinTolerance, LoopInstance, PhaseResult};

/// Synthesized result of a join plus the union of the children's artifacts
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub result: PhaseResult,
    pub refs: Vec<ArtifactRef>,
}

/// Combine terminal children into one result.
///
/// Worst case wins: any failed or aborted child fails the join, unless the
/// tolerance captured at fork time accepts the number of completed children.
pub fn aggregate(children: &[&LoopInstance], tolerance: JoinTolerance) -> JoinOutcome {
    let mut refs: Vec<ArtifactRef> = Vec::new();
    for child in children {
        for r in &child.artifacts {
            if !refs.iter().any(|existing| existing.same_artifact(r)) {
                refs.push(r.clone());
            }
        }
    }

    let total = children.len();
    let completed = children
        .iter()
        .filter(|c| c.status == InstanceStatus::Completed)
        .count();
    let unsuccessful: Vec<String> = children
        .iter()
        .filter(|c| c.status != InstanceStatus::Completed)
        .map(|c| match &c.failure {
            Some(reason) => format!("#{} {} ({})", c.id, c.status, reason),
            None => format!("#{} {}", c.id, c.status),
        })
        .collect();

    let result = if unsuccessful.is_empty() {
        PhaseResult::done()
    } else if tolerance.accepts(completed, total) {
        PhaseResult::done().with_detail(format!(
            "{} of {} children completed; tolerated: {}",
            completed,
            total,
            unsuccessful.join(", ")
        ))
    } else {
        PhaseResult::failed(format!(
            "{} of {} children completed: {}",
            completed,
            total,
            unsuccessful.join(", ")
        ))
    };

    JoinOutcome { result, refs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoopDefinition, PhaseStatus};
    use crate::id::InstanceId;

    fn child(id: u64, status: InstanceStatus, artifact: &str) -> LoopInstance {
        let def = LoopDefinition::new("execution", &["work"]);
        let mut inst = LoopInstance::new(
            InstanceId(id),
            &def,
            Some(InstanceId(1)),
            vec![ArtifactRef::new("m", "story", artifact)],
        )
        .unwrap();
        inst.status = status;
        if status == InstanceStatus::Failed {
            inst.failure = Some("tests red".into());
        }
        inst
    }

    #[test]
    fn test_all_completed_is_done() {
        let a = child(2, InstanceStatus::Completed, "a");
        let b = child(3, InstanceStatus::Completed, "b");
        let outcome = aggregate(&[&a, &b], JoinTolerance::Strict);
        assert_eq!(outcome.result.status, PhaseStatus::Done);
        assert!(outcome.result.detail.is_none());
        assert_eq!(outcome.refs.len(), 2);
    }

    #[test]
    fn test_one_failure_fails_strict_join() {
        let a = child(2, InstanceStatus::Completed, "a");
        let b = child(3, InstanceStatus::Failed, "b");
        let c = child(4, InstanceStatus::Completed, "c");
        let outcome = aggregate(&[&a, &b, &c], JoinTolerance::Strict);
        assert_eq!(outcome.result.status, PhaseStatus::Failed);
        let detail = outcome.result.detail.unwrap();
        assert!(detail.contains("2 of 3"));
        assert!(detail.contains("#3 failed (tests red)"));
    }

    #[test]
    fn test_aborted_child_counts_as_failure() {
        let a = child(2, InstanceStatus::Aborted, "a");
        let outcome = aggregate(&[&a], JoinTolerance::Strict);
        assert_eq!(outcome.result.status, PhaseStatus::Failed);
    }

    #[test]
    fn test_tolerated_failure() {
        let a = child(2, InstanceStatus::Completed, "a");
        let b = child(3, InstanceStatus::Failed, "b");
        let c = child(4, InstanceStatus::Completed, "c");
        let outcome = aggregate(&[&a, &b, &c], JoinTolerance::MinCompleted(2));
        assert_eq!(outcome.result.status, PhaseStatus::Done);
        assert!(outcome.result.detail.unwrap().contains("tolerated"));

        let outcome = aggregate(&[&a, &b, &c], JoinTolerance::MinCompleted(3));
        assert_eq!(outcome.result.status, PhaseStatus::Failed);
    }

    #[test]
    fn test_refs_are_deduplicated() {
        let a = child(2, InstanceStatus::Completed, "same");
        let b = child(3, InstanceStatus::Completed, "same");
        let outcome = aggregate(&[&a, &b], JoinTolerance::Strict);
        assert_eq!(outcome.refs.len(), 1);
    }
}
