//! Loop instance record and related types
//!
//! A `LoopInstance` is the mutable unit of execution. Instances live in the
//! loop tree's arena and refer to each other only by `InstanceId`.

use serde::{Deserialize, Serialize};

use super::artifact::ArtifactRef;
use super::definition::LoopDefinition;
use super::policy::JoinTolerance;
use super::result::{PhaseResult, PhaseStatus};
use crate::error::Result;
use crate::id::{InstanceId, now_ms};

/// Status of a loop instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Dispatchable, or waiting on children
    Running,
    /// Suspended until a human decision arrives
    PausedForHuman,
    /// Suspended after a failure that needs outside help
    Blocked,
    /// Escalated to the parent (or finished the run)
    Completed,
    /// Terminal failure
    Failed,
    /// Cancelled, together with its whole subtree
    Aborted,
}

impl InstanceStatus {
    /// Returns true if the instance is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Aborted
        )
    }

    /// Returns true if the instance waits on a human
    pub fn is_suspended(&self) -> bool {
        matches!(self, InstanceStatus::PausedForHuman | InstanceStatus::Blocked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::PausedForHuman => "paused_for_human",
            InstanceStatus::Blocked => "blocked",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-state of a running instance that waits on its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    /// Waiting for the single child created by `descend`
    Descend { child: InstanceId },
    /// Waiting for every child created by `fork`
    Join {
        children: Vec<InstanceId>,
        tolerance: JoinTolerance,
    },
}

impl WaitState {
    pub fn children(&self) -> Vec<InstanceId> {
        match self {
            WaitState::Descend { child } => vec![*child],
            WaitState::Join { children, .. } => children.clone(),
        }
    }
}

/// Why an instance is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    Approval,
    Collaboration,
    Blocked,
}

/// Durable record of a suspension; survives snapshots and restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub kind: SuspensionKind,
    pub reason: String,
    /// Result waiting for the human decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PhaseResult>,
    /// Unix ms after which an approval/collaboration turns into `blocked`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    pub since_ms: u64,
}

impl Suspension {
    pub fn approval(pending: PhaseResult, deadline_ms: Option<u64>) -> Self {
        Self {
            kind: SuspensionKind::Approval,
            reason: "awaiting approval".to_string(),
            pending: Some(pending),
            deadline_ms,
            since_ms: now_ms(),
        }
    }

    pub fn collaboration(pending: PhaseResult, deadline_ms: Option<u64>) -> Self {
        Self {
            kind: SuspensionKind::Collaboration,
            reason: "awaiting collaboration".to_string(),
            pending: Some(pending),
            deadline_ms,
            since_ms: now_ms(),
        }
    }

    pub fn blocked(reason: impl Into<String>, pending: Option<PhaseResult>) -> Self {
        Self {
            kind: SuspensionKind::Blocked,
            reason: reason.into(),
            pending,
            deadline_ms: None,
            since_ms: now_ms(),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        match self.kind {
            SuspensionKind::Approval | SuspensionKind::Collaboration => InstanceStatus::PausedForHuman,
            SuspensionKind::Blocked => InstanceStatus::Blocked,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline_ms.is_some_and(|deadline| now >= deadline)
    }
}

/// One entry of an instance's accumulated context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub phase: String,
    pub iteration: u32,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    pub at_ms: u64,
}

/// The mutable unit of execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopInstance {
    //=== Identity ===
    pub id: InstanceId,

    /// Level this instance runs
    pub level: String,

    /// Parent instance (None only for the root)
    pub parent: Option<InstanceId>,

    /// Children in creation order
    #[serde(default)]
    pub children: Vec<InstanceId>,

    //=== Position ===
    pub phase_index: usize,
    pub phase: String,

    /// 1-based attempt counter for the current phase
    pub iteration: u32,

    //=== State ===
    pub status: InstanceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,

    /// Current artifact reference set
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,

    /// History of prior results
    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    /// Final result handed to the parent on escalation or failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PhaseResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,

    /// Removed from the active set, kept for history
    #[serde(default)]
    pub retired: bool,

    //=== Timestamps ===
    pub created_at: u64,
    pub updated_at: u64,
}

impl LoopInstance {
    /// Create an instance positioned at the first phase of `definition`
    pub fn new(
        id: InstanceId,
        definition: &LoopDefinition,
        parent: Option<InstanceId>,
        seed: Vec<ArtifactRef>,
    ) -> Result<Self> {
        let now = now_ms();
        Ok(Self {
            id,
            level: definition.level.clone(),
            parent,
            children: Vec::new(),
            phase_index: 0,
            phase: definition.first_phase()?.to_string(),
            iteration: 1,
            status: InstanceStatus::Running,
            wait: None,
            suspension: None,
            artifacts: seed,
            history: Vec::new(),
            outcome: None,
            failure: None,
            retired: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Running, not waiting on children, not suspended, still active
    pub fn is_runnable(&self) -> bool {
        self.status == InstanceStatus::Running && self.wait.is_none() && self.suspension.is_none() && !self.retired
    }

    /// Union the given refs into the current set; same type+id replaces
    pub fn merge_artifacts(&mut self, refs: &[ArtifactRef]) {
        for r in refs {
            match self.artifacts.iter_mut().find(|existing| existing.same_artifact(r)) {
                Some(existing) => *existing = r.clone(),
                None => self.artifacts.push(r.clone()),
            }
        }
    }

    pub fn record(&mut self, status: PhaseStatus, note: Option<String>, artifacts: Vec<ArtifactRef>) {
        self.history.push(HistoryEntry {
            phase: self.phase.clone(),
            iteration: self.iteration,
            status,
            note,
            artifacts,
            at_ms: now_ms(),
        });
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}
