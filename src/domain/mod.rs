//! Domain types for loopflow
//!
//! This module contains the core data model:
//! - ArtifactRef / Artifact: backend-agnostic work products
//! - LoopDefinition: immutable per-level phase sequence
//! - LoopInstance: the mutable unit of execution
//! - TransitionPolicy: per-transition autonomy configuration
//! - PhaseResult: normalized strategy output
//! - HumanDecision: what a human sends to resume a suspension

pub mod artifact;
pub mod decision;
pub mod definition;
pub mod instance;
pub mod policy;
pub mod result;

pub use artifact::{is_plain_segment, Artifact, ArtifactLink, ArtifactRef, RefParseError};
pub use decision::HumanDecision;
pub use definition::LoopDefinition;
pub use instance::{HistoryEntry, InstanceStatus, LoopInstance, Suspension, SuspensionKind, WaitState};
pub use policy::{
    EXIT_PHASE, Endpoint, EscalationCondition, FlowMode, JoinTolerance, TransitionKey, TransitionPolicy, WILDCARD,
};
pub use result::{PhaseResult, PhaseStatus};
