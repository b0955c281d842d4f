//! Loop tree manager
//!
//! Owns every `LoopInstance` of a run in an arena keyed by `InstanceId`.
//! Instances refer to each other by id only; the parent/child links are
//! kept symmetric here. Structural operations (advance, descend, fork,
//! join, escalate, abort) are applied synchronously and reported as
//! `TreeEvent`s, which the engine turns into log lines and notifications.

mod invariants;
mod join;

pub use join::{JoinOutcome, aggregate};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Configuration;
use crate::domain::{
    ArtifactRef, InstanceStatus, JoinTolerance, LoopInstance, PhaseResult, PhaseStatus, Suspension, SuspensionKind,
    WaitState,
};
use crate::error::{EngineError, Result};
use crate::id::InstanceId;

/// Failure reason recorded when a phase runs out of iterations
pub const ITERATION_CAP_EXCEEDED: &str = "iteration_cap_exceeded";

/// Failure reason recorded on aborted instances
pub const ABORTED: &str = "aborted";

/// Structural change applied to the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Spawned {
        id: InstanceId,
        parent: Option<InstanceId>,
        level: String,
    },
    Advanced {
        id: InstanceId,
        phase: String,
    },
    Continued {
        id: InstanceId,
        phase: String,
        iteration: u32,
    },
    Completed {
        id: InstanceId,
    },
    Failed {
        id: InstanceId,
        reason: String,
        result: Option<PhaseResult>,
    },
    Suspended {
        id: InstanceId,
        kind: SuspensionKind,
        reason: String,
        result: Option<PhaseResult>,
    },
    TimedOut {
        id: InstanceId,
        reason: String,
        result: Option<PhaseResult>,
    },
    Resumed {
        id: InstanceId,
    },
    Aborted {
        id: InstanceId,
    },
    /// Children were folded back into their parent
    Joined {
        id: InstanceId,
        result: PhaseResult,
    },
    Retired {
        id: InstanceId,
    },
}

impl TreeEvent {
    pub fn id(&self) -> InstanceId {
        match self {
            TreeEvent::Spawned { id, .. }
            | TreeEvent::Advanced { id, .. }
            | TreeEvent::Continued { id, .. }
            | TreeEvent::Completed { id }
            | TreeEvent::Failed { id, .. }
            | TreeEvent::Suspended { id, .. }
            | TreeEvent::TimedOut { id, .. }
            | TreeEvent::Resumed { id }
            | TreeEvent::Aborted { id }
            | TreeEvent::Joined { id, .. }
            | TreeEvent::Retired { id } => *id,
        }
    }
}

/// Arena of loop instances for one run
#[derive(Debug, Clone)]
pub struct LoopTree {
    config: Arc<Configuration>,
    instances: BTreeMap<InstanceId, LoopInstance>,
    root: Option<InstanceId>,
    next_id: u64,
    events: Vec<TreeEvent>,
}

impl LoopTree {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            instances: BTreeMap::new(),
            root: None,
            next_id: 1,
            events: Vec::new(),
        }
    }

    /// Rebuild a tree from snapshot parts; the result must satisfy every
    /// structural invariant and match the configuration.
    pub fn from_parts(
        config: Arc<Configuration>,
        root: Option<InstanceId>,
        next_id: u64,
        instances: Vec<LoopInstance>,
    ) -> Result<Self> {
        let mut tree = Self::new(config);
        tree.root = root;
        tree.next_id = next_id;
        for instance in instances {
            let id = instance.id;
            if tree.instances.insert(id, instance).is_some() {
                return Err(EngineError::invalid(format!("instance #{} appears twice", id)));
            }
        }
        tree.check_invariants()?;
        tree.check_compatible(&tree.config)?;
        Ok(tree)
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Swap in a reloaded configuration
    pub fn set_config(&mut self, config: Arc<Configuration>) -> Result<()> {
        self.check_compatible(&config)?;
        self.config = config;
        Ok(())
    }

    /// Every live instance must still find its level and its phase at the
    /// same index in `config`.
    pub fn check_compatible(&self, config: &Configuration) -> Result<()> {
        for inst in self.instances.values().filter(|i| !i.status.is_terminal()) {
            let definition = config.definition(&inst.level).map_err(|_| {
                EngineError::config(format!(
                    "live instance #{} runs level '{}' which is no longer defined",
                    inst.id, inst.level
                ))
            })?;
            if definition.phases.get(inst.phase_index) != Some(&inst.phase) {
                return Err(EngineError::config(format!(
                    "live instance #{} sits at {}.{} which moved or was removed",
                    inst.id, inst.level, inst.phase
                )));
            }
        }
        Ok(())
    }

    //=== Queries ===

    pub fn root(&self) -> Option<InstanceId> {
        self.root
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, id: InstanceId) -> Result<&LoopInstance> {
        self.instances
            .get(&id)
            .ok_or_else(|| EngineError::InstanceNotFound(format!("#{}", id)))
    }

    fn get_mut(&mut self, id: InstanceId) -> Result<&mut LoopInstance> {
        self.instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::InstanceNotFound(format!("#{}", id)))
    }

    /// All instances in id order
    pub fn instances(&self) -> impl Iterator<Item = &LoopInstance> {
        self.instances.values()
    }

    /// The run is over once the root is terminal
    pub fn is_finished(&self) -> bool {
        self.root
            .and_then(|root| self.instances.get(&root))
            .is_some_and(|root| root.status.is_terminal())
    }

    /// Instances that can be dispatched, in id order
    pub fn runnable(&self) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| i.is_runnable())
            .map(|i| i.id)
            .collect()
    }

    /// Instances waiting on a human
    pub fn suspended(&self) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| i.status.is_suspended())
            .map(|i| i.id)
            .collect()
    }

    /// Earliest approval/collaboration deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.instances
            .values()
            .filter_map(|i| i.suspension.as_ref())
            .filter(|s| s.kind != SuspensionKind::Blocked)
            .filter_map(|s| s.deadline_ms)
            .min()
    }

    /// Suspensions whose deadline has passed at `now`
    pub fn expired(&self, now: u64) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| {
                i.suspension
                    .as_ref()
                    .is_some_and(|s| s.kind != SuspensionKind::Blocked && s.is_expired(now))
            })
            .map(|i| i.id)
            .collect()
    }

    /// Every descendant of `id`; ancestors come before their descendants
    pub fn descendants(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut found = Vec::new();
        let mut to_check = vec![id];
        while let Some(current) = to_check.pop() {
            if let Some(inst) = self.instances.get(&current) {
                for child in &inst.children {
                    found.push(*child);
                    to_check.push(*child);
                }
            }
        }
        found
    }

    pub fn drain_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.events)
    }

    //=== Creation ===

    pub fn create_root(&mut self, seed: Vec<ArtifactRef>) -> Result<InstanceId> {
        if let Some(root) = self.root {
            return Err(EngineError::invalid(format!("run already has root #{}", root)));
        }
        let level = self.config.root_level().to_string();
        let id = self.spawn(None, &level, seed)?;
        self.root = Some(id);
        Ok(id)
    }

    fn spawn(&mut self, parent: Option<InstanceId>, level: &str, seed: Vec<ArtifactRef>) -> Result<InstanceId> {
        let id = InstanceId(self.next_id);
        let instance = LoopInstance::new(id, self.config.definition(level)?, parent, seed)?;
        if let Some(parent_id) = parent {
            let parent = self.get_mut(parent_id)?;
            parent.children.push(id);
            parent.touch();
        }
        self.next_id += 1;
        log::info!(
            "Spawned #{} at {}.{}{}",
            id,
            instance.level,
            instance.phase,
            parent.map(|p| format!(" under #{}", p)).unwrap_or_default()
        );
        self.instances.insert(id, instance);
        self.events.push(TreeEvent::Spawned {
            id,
            parent,
            level: level.to_string(),
        });
        Ok(id)
    }

    //=== Phase bookkeeping ===

    // Running, not waiting on children, not suspended
    fn active_mut(&mut self, id: InstanceId) -> Result<&mut LoopInstance> {
        let inst = self.get_mut(id)?;
        if !inst.is_runnable() {
            return Err(EngineError::invalid(format!(
                "#{} is {}{} and cannot move",
                id,
                inst.status,
                if inst.wait.is_some() { " (waiting on children)" } else { "" }
            )));
        }
        Ok(inst)
    }

    /// Append a history entry for a dispatched phase and merge what it produced
    pub fn record_step(&mut self, id: InstanceId, result: &PhaseResult, produced: &[ArtifactRef]) -> Result<()> {
        let inst = self.get_mut(id)?;
        if inst.status.is_terminal() {
            return Err(EngineError::invalid(format!("#{} is already {}", id, inst.status)));
        }
        inst.merge_artifacts(produced);
        inst.record(result.status, result.detail.clone(), produced.to_vec());
        Ok(())
    }

    /// Attach human feedback to the current phase's latest history entry
    pub fn annotate(&mut self, id: InstanceId, note: &str) -> Result<()> {
        let inst = self.get_mut(id)?;
        let current = inst
            .history
            .last()
            .is_some_and(|e| e.phase == inst.phase && e.iteration == inst.iteration);
        if current {
            if let Some(entry) = inst.history.last_mut() {
                entry.note = Some(match entry.note.take() {
                    Some(existing) => format!("{}\n{}", existing, note),
                    None => note.to_string(),
                });
            }
            inst.touch();
        } else {
            inst.record(PhaseStatus::NeedsMore, Some(note.to_string()), Vec::new());
        }
        Ok(())
    }

    //=== Structural operations ===

    /// Move to the next phase; on the last phase this escalates
    pub fn advance(&mut self, id: InstanceId, result: PhaseResult) -> Result<()> {
        let config = Arc::clone(&self.config);
        let inst = self.active_mut(id)?;
        let definition = config.definition(&inst.level)?;
        if definition.is_last(inst.phase_index) {
            return self.escalate(id, result);
        }
        let next = inst.phase_index + 1;
        inst.phase = definition.phase(next)?.to_string();
        inst.phase_index = next;
        inst.iteration = 1;
        inst.touch();
        log::info!("#{} advanced to {}.{}", id, inst.level, inst.phase);
        let phase = inst.phase.clone();
        self.events.push(TreeEvent::Advanced { id, phase });
        Ok(())
    }

    /// Complete the instance and hand `result` to the parent
    pub fn escalate(&mut self, id: InstanceId, result: PhaseResult) -> Result<()> {
        let inst = self.active_mut(id)?;
        inst.status = InstanceStatus::Completed;
        inst.outcome = Some(result);
        inst.touch();
        log::info!("#{} completed level {}", id, inst.level);
        self.events.push(TreeEvent::Completed { id });
        self.settle(id)
    }

    /// Re-enter the current phase with the next iteration.
    ///
    /// Past the policy's iteration cap the instance escalates if the
    /// escalation condition holds for `result`, otherwise it fails.
    pub fn continue_phase(&mut self, id: InstanceId, result: PhaseResult) -> Result<()> {
        let config = Arc::clone(&self.config);
        let inst = self.active_mut(id)?;
        let policy = config.policy_at(&inst.level, inst.phase_index)?;
        let next = inst.iteration + 1;

        if policy.max_iterations.is_some_and(|max| next > max) {
            let at = format!("{}.{} after {} iterations", inst.level, inst.phase, inst.iteration);
            if policy.escalates(&result) {
                log::info!("#{} reached the iteration cap at {}; escalating", id, at);
                return self.escalate(id, result);
            }
            let detail = EngineError::IterationCapExceeded(at).to_string();
            return self.fail(id, ITERATION_CAP_EXCEEDED, Some(result.with_detail(detail)));
        }

        inst.iteration = next;
        inst.touch();
        log::debug!("#{} re-entering {}.{} (iteration {})", id, inst.level, inst.phase, next);
        let phase = inst.phase.clone();
        self.events.push(TreeEvent::Continued {
            id,
            phase,
            iteration: next,
        });
        Ok(())
    }

    /// Spawn one child at the descend-target level and wait for it
    pub fn descend(&mut self, id: InstanceId, seed: Vec<ArtifactRef>) -> Result<InstanceId> {
        let config = Arc::clone(&self.config);
        let level = self.active_mut(id)?.level.clone();
        let target = config.descend_target(&level)?;
        let child = self.spawn(Some(id), &target.level, seed)?;
        let inst = self.get_mut(id)?;
        inst.wait = Some(WaitState::Descend { child });
        inst.touch();
        Ok(child)
    }

    /// Spawn one child per work item and wait for all of them
    pub fn fork(&mut self, id: InstanceId, items: Vec<ArtifactRef>, tolerance: JoinTolerance) -> Result<Vec<InstanceId>> {
        if items.is_empty() {
            return Err(EngineError::invalid(format!("#{} cannot fork without work items", id)));
        }
        let config = Arc::clone(&self.config);
        let level = self.active_mut(id)?.level.clone();
        let target = config.descend_target(&level)?;

        let mut children = Vec::with_capacity(items.len());
        for item in items {
            children.push(self.spawn(Some(id), &target.level, vec![item])?);
        }
        log::info!("#{} forked {} children at level {}", id, children.len(), target.level);

        let inst = self.get_mut(id)?;
        inst.wait = Some(WaitState::Join {
            children: children.clone(),
            tolerance,
        });
        inst.touch();
        Ok(children)
    }

    // Called whenever an instance turns terminal; resumes a waiting parent
    fn settle(&mut self, id: InstanceId) -> Result<()> {
        let Some(parent_id) = self.get(id)?.parent else {
            return Ok(());
        };
        match self.get(parent_id)?.wait.clone() {
            Some(WaitState::Descend { child }) if child == id => self.gather(parent_id, vec![child], JoinTolerance::Strict),
            Some(WaitState::Join { children, tolerance }) if children.contains(&id) => {
                let all_terminal = children
                    .iter()
                    .all(|c| self.instances.get(c).is_some_and(|c| c.status.is_terminal()));
                if all_terminal {
                    self.gather(parent_id, children, tolerance)
                } else {
                    Ok(())
                }
            }
            // Parent no longer waits on this child (aborted)
            _ => Ok(()),
        }
    }

    // Fold terminal children into their parent exactly once.
    // A done result advances the parent, anything else blocks it.
    fn gather(&mut self, parent_id: InstanceId, children: Vec<InstanceId>, tolerance: JoinTolerance) -> Result<()> {
        let outcome = {
            let finished = children.iter().map(|c| self.get(*c)).collect::<Result<Vec<_>>>()?;
            aggregate(&finished, tolerance)
        };
        for child in &children {
            self.retire(*child);
        }

        let parent = self.get_mut(parent_id)?;
        parent.wait = None;
        parent.merge_artifacts(&outcome.refs);
        parent.record(outcome.result.status, outcome.result.detail.clone(), outcome.refs.clone());
        log::info!(
            "#{} joined {} children: {}",
            parent_id,
            children.len(),
            outcome.result.status
        );
        self.events.push(TreeEvent::Joined {
            id: parent_id,
            result: outcome.result.clone(),
        });

        let JoinOutcome { result, .. } = outcome;
        // The parent's flow mode already gated its descend/parallel result;
        // a done join moves on without a second gate.
        if result.status == PhaseStatus::Done {
            self.advance(parent_id, result)
        } else {
            let reason = result.detail.clone().unwrap_or_else(|| "children did not complete".to_string());
            self.pause(parent_id, Suspension::blocked(reason, Some(result)))
        }
    }

    fn retire(&mut self, id: InstanceId) {
        if let Some(inst) = self.instances.get_mut(&id) {
            if !inst.retired {
                inst.retired = true;
                inst.touch();
                self.events.push(TreeEvent::Retired { id });
            }
        }
    }

    //=== Suspension ===

    /// Suspend an instance until a human acts
    pub fn pause(&mut self, id: InstanceId, suspension: Suspension) -> Result<()> {
        let inst = self.get_mut(id)?;
        if inst.status.is_terminal() || inst.wait.is_some() {
            return Err(EngineError::invalid(format!("#{} is {} and cannot be paused", id, inst.status)));
        }
        inst.status = suspension.status();
        inst.touch();
        log::info!("#{} {}: {}", id, inst.status, suspension.reason);
        let event = TreeEvent::Suspended {
            id,
            kind: suspension.kind,
            reason: suspension.reason.clone(),
            result: suspension.pending.clone(),
        };
        inst.suspension = Some(suspension);
        self.events.push(event);
        Ok(())
    }

    /// Clear a suspension and return the instance to `running`
    pub fn resume(&mut self, id: InstanceId) -> Result<Suspension> {
        let inst = self.get_mut(id)?;
        let suspension = inst
            .suspension
            .take()
            .ok_or_else(|| EngineError::invalid(format!("#{} is {}, not suspended", id, inst.status)))?;
        inst.status = InstanceStatus::Running;
        inst.touch();
        log::info!("#{} resumed from {:?}", id, suspension.kind);
        self.events.push(TreeEvent::Resumed { id });
        Ok(suspension)
    }

    /// Turn an overdue approval/collaboration into `blocked`, keeping the
    /// pending result; nothing is ever auto-approved.
    pub fn expire(&mut self, id: InstanceId) -> Result<()> {
        let inst = self.get_mut(id)?;
        let Some(current) = inst.suspension.take() else {
            return Err(EngineError::invalid(format!("#{} is not suspended", id)));
        };
        if current.kind == SuspensionKind::Blocked {
            inst.suspension = Some(current);
            return Err(EngineError::invalid(format!("#{} is blocked and has no deadline", id)));
        }
        let reason = match current.kind {
            SuspensionKind::Collaboration => "collaboration timed out",
            _ => "approval timed out",
        };
        let blocked = Suspension::blocked(reason, current.pending);
        inst.status = blocked.status();
        inst.touch();
        log::warn!("#{} {}", id, reason);
        let event = TreeEvent::TimedOut {
            id,
            reason: reason.to_string(),
            result: blocked.pending.clone(),
        };
        inst.suspension = Some(blocked);
        self.events.push(event);
        Ok(())
    }

    //=== Termination ===

    /// Terminal failure; live descendants are aborted first
    pub fn fail(&mut self, id: InstanceId, reason: &str, result: Option<PhaseResult>) -> Result<()> {
        if self.get(id)?.status.is_terminal() {
            return Err(EngineError::invalid(format!("#{} is already terminal", id)));
        }
        self.abort_descendants(id);

        let inst = self.get_mut(id)?;
        let outcome = result.unwrap_or_else(|| PhaseResult::failed(reason));
        inst.status = InstanceStatus::Failed;
        inst.failure = Some(reason.to_string());
        inst.outcome = Some(outcome.clone());
        inst.wait = None;
        inst.suspension = None;
        inst.touch();
        log::warn!("#{} failed at {}.{}: {}", id, inst.level, inst.phase, reason);
        self.events.push(TreeEvent::Failed {
            id,
            reason: reason.to_string(),
            result: Some(outcome),
        });
        self.settle(id)
    }

    /// Abort an instance and its whole subtree.
    ///
    /// Returns the instances that changed state. Aborting a terminal
    /// instance changes nothing.
    pub fn abort(&mut self, id: InstanceId) -> Result<Vec<InstanceId>> {
        if self.get(id)?.status.is_terminal() {
            return Ok(Vec::new());
        }
        let mut aborted = self.abort_descendants(id);
        if self.mark_aborted(id) {
            aborted.push(id);
        }
        self.settle(id)?;
        Ok(aborted)
    }

    // Descendants before ancestors, then retire the whole subtree
    fn abort_descendants(&mut self, id: InstanceId) -> Vec<InstanceId> {
        let descendants = self.descendants(id);
        let mut aborted = Vec::new();
        for d in descendants.iter().rev() {
            if self.mark_aborted(*d) {
                aborted.push(*d);
            }
        }
        for d in &descendants {
            self.retire(*d);
        }
        aborted
    }

    fn mark_aborted(&mut self, id: InstanceId) -> bool {
        let Some(inst) = self.instances.get_mut(&id) else {
            return false;
        };
        if inst.status.is_terminal() {
            return false;
        }
        inst.status = InstanceStatus::Aborted;
        inst.failure = Some(ABORTED.to_string());
        inst.outcome = Some(PhaseResult::failed(ABORTED));
        inst.wait = None;
        inst.suspension = None;
        inst.touch();
        log::info!("#{} aborted", id);
        self.events.push(TreeEvent::Aborted { id });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use crate::domain::{EscalationCondition, FlowMode, LoopDefinition, TransitionKey, TransitionPolicy};

    fn config(max_iterations: Option<u32>) -> Arc<Configuration> {
        let mut design = TransitionPolicy::autonomous(TransitionKey::within("execution", "design", "implement"));
        if let Some(max) = max_iterations {
            design = design.with_max_iterations(max);
        }
        let file = ConfigFile::new("release")
            .with_level(
                LoopDefinition::new("release", &["plan", "ship"])
                    .with_strategy_for_all("noop")
                    .with_descend("execution"),
            )
            .with_level(LoopDefinition::new("execution", &["design", "implement"]).with_strategy_for_all("noop"))
            .with_policy(TransitionPolicy::new("*.* -> *.*".parse().unwrap(), FlowMode::Autonomous))
            .with_policy(design);
        Arc::new(file.build().unwrap())
    }

    fn item(id: &str) -> ArtifactRef {
        ArtifactRef::new("m", "story", id)
    }

    fn tree() -> (LoopTree, InstanceId) {
        let mut tree = LoopTree::new(config(Some(2)));
        let root = tree.create_root(vec![item("seed")]).unwrap();
        (tree, root)
    }

    fn finish_child(tree: &mut LoopTree, id: InstanceId) {
        tree.advance(id, PhaseResult::done()).unwrap();
        tree.advance(id, PhaseResult::done()).unwrap();
    }

    #[test]
    fn test_create_root() {
        let (mut tree, root) = tree();
        assert_eq!(root, InstanceId(1));
        let inst = tree.get(root).unwrap();
        assert_eq!(inst.level, "release");
        assert_eq!(inst.phase, "plan");
        assert_eq!(tree.runnable(), vec![root]);
        assert!(tree.create_root(vec![]).is_err());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_get_unknown_instance() {
        let (tree, _) = tree();
        assert!(matches!(tree.get(InstanceId(99)), Err(EngineError::InstanceNotFound(_))));
    }

    #[test]
    fn test_advance_and_escalate_root() {
        let (mut tree, root) = tree();
        tree.advance(root, PhaseResult::done()).unwrap();
        assert_eq!(tree.get(root).unwrap().phase, "ship");
        assert!(!tree.is_finished());

        tree.advance(root, PhaseResult::done().with_detail("shipped")).unwrap();
        let inst = tree.get(root).unwrap();
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert_eq!(inst.outcome.as_ref().unwrap().detail.as_deref(), Some("shipped"));
        assert!(tree.is_finished());
        assert!(tree.runnable().is_empty());
    }

    #[test]
    fn test_continue_increments_iteration() {
        let (mut tree, root) = tree();
        let child = tree.descend(root, vec![]).unwrap();
        tree.continue_phase(child, PhaseResult::needs_more()).unwrap();
        let inst = tree.get(child).unwrap();
        assert_eq!(inst.phase, "design");
        assert_eq!(inst.iteration, 2);
        assert!(
            tree.drain_events()
                .contains(&TreeEvent::Continued { id: child, phase: "design".into(), iteration: 2 })
        );
    }

    #[test]
    fn test_iteration_cap_fails_without_escalation_condition() {
        let (mut tree, root) = tree();
        let child = tree.descend(root, vec![]).unwrap();
        tree.continue_phase(child, PhaseResult::needs_more()).unwrap();
        tree.continue_phase(child, PhaseResult::needs_more()).unwrap();

        let inst = tree.get(child).unwrap();
        assert_eq!(inst.status, InstanceStatus::Failed);
        assert_eq!(inst.failure.as_deref(), Some(ITERATION_CAP_EXCEEDED));
        assert!(inst.outcome.as_ref().unwrap().detail.as_ref().unwrap().contains("Iteration cap exceeded"));

        // Descend failure blocks the parent
        let parent = tree.get(root).unwrap();
        assert_eq!(parent.status, InstanceStatus::Blocked);
        assert!(parent.wait.is_none());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_iteration_cap_escalates_when_condition_holds() {
        let design = TransitionPolicy::autonomous(TransitionKey::within("execution", "design", "implement"))
            .with_max_iterations(1)
            .with_escalation(EscalationCondition::Always);
        let file = ConfigFile::new("execution")
            .with_level(LoopDefinition::new("execution", &["design", "implement"]).with_strategy_for_all("noop"))
            .with_policy(TransitionPolicy::new("*.* -> *.*".parse().unwrap(), FlowMode::Autonomous))
            .with_policy(design);
        let mut tree = LoopTree::new(Arc::new(file.build().unwrap()));
        let root = tree.create_root(vec![]).unwrap();
        tree.continue_phase(root, PhaseResult::needs_more()).unwrap();
        assert_eq!(tree.get(root).unwrap().status, InstanceStatus::Completed);
    }

    #[test]
    fn test_descend_waits_and_resumes_parent() {
        let (mut tree, root) = tree();
        let child = tree.descend(root, vec![item("a")]).unwrap();
        assert_eq!(tree.get(child).unwrap().level, "execution");
        assert_eq!(tree.get(child).unwrap().artifacts, vec![item("a")]);
        assert_eq!(tree.runnable(), vec![child]);
        assert!(tree.advance(root, PhaseResult::done()).is_err());
        tree.check_invariants().unwrap();

        finish_child(&mut tree, child);
        let parent = tree.get(root).unwrap();
        assert_eq!(parent.phase, "ship");
        assert!(parent.wait.is_none());
        assert!(tree.get(child).unwrap().retired);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_fork_join_resumes_exactly_once() {
        let (mut tree, root) = tree();
        let children = tree
            .fork(root, vec![item("a"), item("b"), item("c")], JoinTolerance::Strict)
            .unwrap();
        assert_eq!(children.len(), 3);
        tree.drain_events();

        for child in &children {
            finish_child(&mut tree, *child);
        }
        let joins = tree
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, TreeEvent::Joined { .. }))
            .count();
        assert_eq!(joins, 1);
        assert_eq!(tree.get(root).unwrap().phase, "ship");
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_fork_with_one_failure_blocks_parent() {
        let (mut tree, root) = tree();
        let children = tree
            .fork(root, vec![item("a"), item("b"), item("c")], JoinTolerance::Strict)
            .unwrap();
        finish_child(&mut tree, children[0]);
        tree.fail(children[1], "tests red", None).unwrap();
        assert_eq!(tree.get(root).unwrap().status, InstanceStatus::Running);
        finish_child(&mut tree, children[2]);

        let parent = tree.get(root).unwrap();
        assert_eq!(parent.status, InstanceStatus::Blocked);
        let suspension = parent.suspension.as_ref().unwrap();
        assert_eq!(suspension.pending.as_ref().unwrap().status, PhaseStatus::Failed);
        assert!(suspension.reason.contains("#3 failed"));
        assert!(tree.drain_events().iter().any(|e| matches!(e, TreeEvent::Suspended { id, .. } if *id == root)));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_fork_tolerance() {
        let (mut tree, root) = tree();
        let children = tree
            .fork(root, vec![item("a"), item("b")], JoinTolerance::MinCompleted(1))
            .unwrap();
        tree.fail(children[0], "flaky", None).unwrap();
        finish_child(&mut tree, children[1]);
        assert_eq!(tree.get(root).unwrap().phase, "ship");
    }

    #[test]
    fn test_fork_requires_items() {
        let (mut tree, root) = tree();
        assert!(tree.fork(root, vec![], JoinTolerance::Strict).is_err());
    }

    #[test]
    fn test_descend_without_target_is_config_error() {
        let (mut tree, root) = tree();
        let child = tree.descend(root, vec![]).unwrap();
        assert!(matches!(tree.descend(child, vec![]), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_abort_leaves_no_live_descendants() {
        let (mut tree, root) = tree();
        let children = tree.fork(root, vec![item("a"), item("b")], JoinTolerance::Strict).unwrap();
        tree.pause(children[0], Suspension::approval(PhaseResult::done(), None)).unwrap();

        let aborted = tree.abort(root).unwrap();
        assert_eq!(aborted.len(), 3);
        assert_eq!(*aborted.last().unwrap(), root);
        for inst in tree.instances() {
            assert_eq!(inst.status, InstanceStatus::Aborted);
            assert!(inst.suspension.is_none());
        }
        assert!(tree.is_finished());
        assert!(tree.abort(root).unwrap().is_empty());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_abort_child_counts_as_failed_join() {
        let (mut tree, root) = tree();
        let child = tree.descend(root, vec![]).unwrap();
        tree.abort(child).unwrap();
        assert_eq!(tree.get(root).unwrap().status, InstanceStatus::Blocked);
    }

    #[test]
    fn test_pause_resume() {
        let (mut tree, root) = tree();
        tree.pause(root, Suspension::approval(PhaseResult::done(), Some(10))).unwrap();
        assert_eq!(tree.get(root).unwrap().status, InstanceStatus::PausedForHuman);
        assert!(tree.runnable().is_empty());
        assert_eq!(tree.suspended(), vec![root]);
        assert_eq!(tree.next_deadline(), Some(10));
        tree.check_invariants().unwrap();

        let suspension = tree.resume(root).unwrap();
        assert_eq!(suspension.kind, SuspensionKind::Approval);
        assert_eq!(tree.get(root).unwrap().status, InstanceStatus::Running);
        assert!(tree.resume(root).is_err());
    }

    #[test]
    fn test_expire_blocks_and_keeps_pending() {
        let (mut tree, root) = tree();
        tree.pause(root, Suspension::approval(PhaseResult::done(), Some(10))).unwrap();
        assert!(tree.expired(9).is_empty());
        assert_eq!(tree.expired(10), vec![root]);

        tree.expire(root).unwrap();
        let inst = tree.get(root).unwrap();
        assert_eq!(inst.status, InstanceStatus::Blocked);
        let suspension = inst.suspension.as_ref().unwrap();
        assert_eq!(suspension.reason, "approval timed out");
        assert_eq!(suspension.pending, Some(PhaseResult::done()));
        assert!(tree.next_deadline().is_none());
        assert!(tree.expire(root).is_err());
    }

    #[test]
    fn test_annotate() {
        let (mut tree, root) = tree();
        tree.annotate(root, "needs a rollback plan").unwrap();
        tree.record_step(root, &PhaseResult::needs_more(), &[]).unwrap();
        tree.annotate(root, "also a changelog").unwrap();

        let history = &tree.get(root).unwrap().history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].note.as_deref(), Some("also a changelog"));
        tree.annotate(root, "and tests").unwrap();
        assert_eq!(
            tree.get(root).unwrap().history[1].note.as_deref(),
            Some("also a changelog\nand tests")
        );
    }

    #[test]
    fn test_record_step_merges_produced() {
        let (mut tree, root) = tree();
        let produced = vec![ArtifactRef::new("docs", "plan", "p1")];
        tree.record_step(root, &PhaseResult::done(), &produced).unwrap();
        let inst = tree.get(root).unwrap();
        assert_eq!(inst.artifacts.len(), 2);
        assert_eq!(inst.history[0].artifacts, produced);
    }

    #[test]
    fn test_from_parts_round_trip() {
        let (mut tree, root) = tree();
        tree.descend(root, vec![item("a")]).unwrap();
        let instances: Vec<LoopInstance> = tree.instances().cloned().collect();
        let rebuilt = LoopTree::from_parts(tree.config().clone(), tree.root(), tree.next_id(), instances).unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.runnable(), tree.runnable());
    }

    #[test]
    fn test_from_parts_rejects_broken_tree() {
        let (mut tree, root) = tree();
        let child = tree.descend(root, vec![]).unwrap();
        let mut instances: Vec<LoopInstance> = tree.instances().cloned().collect();
        instances.retain(|i| i.id != child);
        assert!(LoopTree::from_parts(tree.config().clone(), Some(root), tree.next_id(), instances).is_err());
    }

    #[test]
    fn test_incompatible_config() {
        let (tree, _) = tree();
        let other = ConfigFile::new("release")
            .with_level(LoopDefinition::new("release", &["ship"]).with_strategy_for_all("noop"))
            .with_policy(TransitionPolicy::new("*.* -> *.*".parse().unwrap(), FlowMode::Autonomous))
            .build()
            .unwrap();
        assert!(tree.check_compatible(&other).is_err());
    }
}
