//! Structural invariants of the loop tree.

use std::collections::HashSet;

use super::LoopTree;
use crate::domain::{InstanceStatus, WaitState};
use crate::error::{EngineError, Result};
use crate::id::InstanceId;

impl LoopTree {
    /// Verify the tree's structural invariants.
    ///
    /// Checked: a single root, one existing parent per non-root instance,
    /// parent/child symmetry, acyclicity, consistent wait and suspension
    /// state, and no live instance below a terminal one.
    pub fn check_invariants(&self) -> Result<()> {
        let roots: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| i.parent.is_none())
            .map(|i| i.id)
            .collect();
        match (self.root, roots.as_slice()) {
            (None, []) => {}
            (Some(root), [only]) if root == *only => {}
            _ => return Err(violation(format!("expected one root {:?}, found {:?}", self.root, roots))),
        }

        for inst in self.instances.values() {
            if inst.id.0 >= self.next_id {
                return Err(violation(format!("#{} is not below next id {}", inst.id, self.next_id)));
            }

            if let Some(parent_id) = inst.parent {
                let parent = self
                    .instances
                    .get(&parent_id)
                    .ok_or_else(|| violation(format!("#{} has missing parent #{}", inst.id, parent_id)))?;
                if !parent.children.contains(&inst.id) {
                    return Err(violation(format!("#{} is not listed by its parent #{}", inst.id, parent_id)));
                }
                if parent.status.is_terminal() && !inst.status.is_terminal() {
                    return Err(violation(format!("#{} is live below terminal #{}", inst.id, parent_id)));
                }
            }

            let mut unique = HashSet::new();
            for child_id in &inst.children {
                let child = self
                    .instances
                    .get(child_id)
                    .ok_or_else(|| violation(format!("#{} lists missing child #{}", inst.id, child_id)))?;
                if child.parent != Some(inst.id) {
                    return Err(violation(format!("#{} lists #{} which has another parent", inst.id, child_id)));
                }
                if !unique.insert(child_id) {
                    return Err(violation(format!("#{} lists child #{} twice", inst.id, child_id)));
                }
            }

            // Acyclic: the parent chain must reach the root within len steps
            let mut current = inst.parent;
            let mut steps = 0;
            while let Some(ancestor) = current {
                steps += 1;
                if ancestor == inst.id || steps > self.instances.len() {
                    return Err(violation(format!("#{} is part of a parent cycle", inst.id)));
                }
                current = self.instances.get(&ancestor).and_then(|a| a.parent);
            }

            if let Some(wait) = &inst.wait {
                if inst.status != InstanceStatus::Running || inst.suspension.is_some() {
                    return Err(violation(format!("#{} waits on children while {}", inst.id, inst.status)));
                }
                for child_id in wait.children() {
                    if !inst.children.contains(&child_id) {
                        return Err(violation(format!("#{} waits on foreign #{}", inst.id, child_id)));
                    }
                }
                if let WaitState::Join { children, .. } = wait {
                    if children.is_empty() {
                        return Err(violation(format!("#{} joins zero children", inst.id)));
                    }
                }
                let all_done = wait
                    .children()
                    .iter()
                    .all(|c| self.instances.get(c).is_some_and(|c| c.status.is_terminal()));
                if all_done {
                    return Err(violation(format!("#{} still waits on finished children", inst.id)));
                }
            }

            if inst.status.is_suspended() != inst.suspension.is_some() {
                return Err(violation(format!(
                    "#{} has status {} but suspension {:?}",
                    inst.id,
                    inst.status,
                    inst.suspension.as_ref().map(|s| s.kind)
                )));
            }

            if inst.retired && !inst.status.is_terminal() {
                return Err(violation(format!("#{} is retired but {}", inst.id, inst.status)));
            }
        }
        Ok(())
    }
}

fn violation(msg: String) -> EngineError {
    EngineError::InvalidState(format!("tree invariant violated: {}", msg))
}
