//! Transition evaluator: decides what happens after a phase.
//!
//! Evaluation is pure. The structural action follows from the result status
//! alone (plus the iteration budget for failures); the flow mode of the
//! policy decides whether a human sees or gates the transition first.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{FlowMode, PhaseResult, PhaseStatus, TransitionPolicy};

/// Structural consequence of a phase result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    /// Move to the next phase
    NextPhase,
    /// Leave the level; hand the result to the parent
    Escalate,
    /// Re-enter the same phase (needs_more)
    Continue,
    /// Re-enter the same phase after a failure
    Retry,
    /// Suspend as blocked
    Block,
    /// Terminal failure
    Fail,
    /// Spawn one child at the descend level
    Descend,
    /// Spawn one child per work item
    Fork,
}

impl TransitionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionAction::NextPhase => "next_phase",
            TransitionAction::Escalate => "escalate",
            TransitionAction::Continue => "continue",
            TransitionAction::Retry => "retry",
            TransitionAction::Block => "block",
            TransitionAction::Fail => "fail",
            TransitionAction::Descend => "descend",
            TransitionAction::Fork => "fork",
        }
    }
}

impl std::fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the instance stands when its result is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowContext {
    pub iteration: u32,
    pub is_last_phase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub result: PhaseResult,
    pub action: TransitionAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionDecision {
    /// Apply the action now
    Advance(Payload),
    /// Tell a human, then apply the action
    RequestNotify(Payload),
    /// Suspend until a human approves or rejects
    RequestApproval { payload: Payload, timeout: Option<Duration> },
    /// Suspend until a human supplies a replacement result
    RequestCollaboration { payload: Payload, timeout: Option<Duration> },
}

impl TransitionDecision {
    pub fn payload(&self) -> &Payload {
        match self {
            TransitionDecision::Advance(payload) | TransitionDecision::RequestNotify(payload) => payload,
            TransitionDecision::RequestApproval { payload, .. }
            | TransitionDecision::RequestCollaboration { payload, .. } => payload,
        }
    }
}

pub struct TransitionEvaluator;

impl TransitionEvaluator {
    /// Structural action for a result.
    ///
    /// A failure is retried while `iteration < max_iterations`; a policy
    /// without a cap gives failures no retry budget.
    pub fn action_for(result: &PhaseResult, policy: &TransitionPolicy, flow: FlowContext) -> TransitionAction {
        match result.status {
            PhaseStatus::Done if flow.is_last_phase => TransitionAction::Escalate,
            PhaseStatus::Done => TransitionAction::NextPhase,
            PhaseStatus::NeedsMore => TransitionAction::Continue,
            PhaseStatus::Blocked => TransitionAction::Block,
            PhaseStatus::Failed => match policy.max_iterations {
                Some(max) if flow.iteration < max => TransitionAction::Retry,
                _ => TransitionAction::Fail,
            },
            PhaseStatus::Descend => TransitionAction::Descend,
            PhaseStatus::Parallel => TransitionAction::Fork,
        }
    }

    /// Full decision: action plus the human gate from the flow mode.
    ///
    /// `Block` already hands control to a human, so it is never gated again.
    pub fn evaluate(result: PhaseResult, policy: &TransitionPolicy, flow: FlowContext) -> TransitionDecision {
        let action = Self::action_for(&result, policy, flow);
        let payload = Payload { result, action };
        if action == TransitionAction::Block {
            return TransitionDecision::Advance(payload);
        }
        match policy.mode {
            FlowMode::Autonomous => TransitionDecision::Advance(payload),
            FlowMode::HitlNotify => TransitionDecision::RequestNotify(payload),
            FlowMode::HitlApprove => TransitionDecision::RequestApproval {
                payload,
                timeout: policy.timeout(),
            },
            FlowMode::HitlCollaborate => TransitionDecision::RequestCollaboration {
                payload,
                timeout: policy.timeout(),
            },
        }
    }
}
