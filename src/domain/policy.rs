//! Transition policies: the per-transition autonomy configuration.
//!
//! A transition key has the form `level.phase -> level.phase`. Any of the four
//! components may be `*`. While an instance sits in the last phase of its
//! level, the key points at the reserved `exit` phase.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::result::PhaseResult;
use crate::error::{EngineError, Result};

/// Matches any level or phase
pub const WILDCARD: &str = "*";

/// Reserved target phase for the transition out of a level's last phase
pub const EXIT_PHASE: &str = "exit";

/// One side of a transition key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub level: String,
    pub phase: String,
}

impl Endpoint {
    pub fn new(level: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            phase: phase.into(),
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let (level, phase) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| EngineError::config(format!("transition endpoint '{}' must be level.phase", s.trim())))?;
        if level.is_empty() || phase.is_empty() {
            return Err(EngineError::config(format!("transition endpoint '{}' has an empty part", s.trim())));
        }
        Ok(Self::new(level, phase))
    }

    fn matches(&self, concrete: &Endpoint) -> bool {
        (self.level == WILDCARD || self.level == concrete.level)
            && (self.phase == WILDCARD || self.phase == concrete.phase)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.level, self.phase)
    }
}

/// `level.phase -> level.phase`, possibly with wildcards
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransitionKey {
    pub from: Endpoint,
    pub to: Endpoint,
}

impl TransitionKey {
    pub fn new(from: Endpoint, to: Endpoint) -> Self {
        Self { from, to }
    }

    /// Key for moving between two phases of the same level
    pub fn within(level: &str, from_phase: &str, to_phase: &str) -> Self {
        Self::new(Endpoint::new(level, from_phase), Endpoint::new(level, to_phase))
    }

    pub fn is_concrete(&self) -> bool {
        [&self.from.level, &self.from.phase, &self.to.level, &self.to.phase]
            .iter()
            .all(|part| part.as_str() != WILDCARD)
    }

    /// Does this (possibly wildcard) key cover the given concrete key?
    pub fn matches(&self, concrete: &TransitionKey) -> bool {
        self.from.matches(&concrete.from) && self.to.matches(&concrete.to)
    }

    /// Rank of a pattern: every concrete component sets one bit, weighted
    /// from-level > from-phase > to-level > to-phase. A fully concrete key
    /// scores 15; two distinct patterns matching the same key never tie.
    pub fn specificity(&self) -> u8 {
        let bit = |part: &str, weight: u8| if part == WILDCARD { 0 } else { weight };
        bit(&self.from.level, 8) + bit(&self.from.phase, 4) + bit(&self.to.level, 2) + bit(&self.to.phase, 1)
    }
}

impl fmt::Display for TransitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

impl FromStr for TransitionKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s
            .split_once("->")
            .ok_or_else(|| EngineError::config(format!("transition key '{}' must contain '->'", s)))?;
        Ok(Self::new(Endpoint::parse(from)?, Endpoint::parse(to)?))
    }
}

impl TryFrom<String> for TransitionKey {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TransitionKey> for String {
    fn from(key: TransitionKey) -> Self {
        key.to_string()
    }
}

/// How much autonomy a transition gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    #[default]
    Autonomous,
    HitlNotify,
    HitlApprove,
    HitlCollaborate,
}

/// Predicate deciding whether a capped phase escalates or fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCondition {
    Always,
    Never,
    /// The last result carries an artifact (of the given type, if any)
    HasArtifact {
        #[serde(default)]
        artifact_type: Option<String>,
    },
    /// The strategy's advisory next action equals `action`
    Suggested { action: String },
    All(Vec<EscalationCondition>),
    Any(Vec<EscalationCondition>),
}

impl EscalationCondition {
    pub fn evaluate(&self, result: &PhaseResult) -> bool {
        match self {
            EscalationCondition::Always => true,
            EscalationCondition::Never => false,
            EscalationCondition::HasArtifact { artifact_type } => result.has_artifact(artifact_type.as_deref()),
            EscalationCondition::Suggested { action } => result.next_action.as_deref() == Some(action.as_str()),
            EscalationCondition::All(conditions) => conditions.iter().all(|c| c.evaluate(result)),
            EscalationCondition::Any(conditions) => conditions.iter().any(|c| c.evaluate(result)),
        }
    }
}

/// Partial-success tolerance applied when joining forked children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinTolerance {
    /// Any failed or aborted child fails the join
    #[default]
    Strict,
    /// The join succeeds once at least this many children completed
    MinCompleted(usize),
}

impl JoinTolerance {
    pub fn accepts(&self, completed: usize, total: usize) -> bool {
        match self {
            JoinTolerance::Strict => completed == total,
            JoinTolerance::MinCompleted(min) => completed >= *min,
        }
    }
}

/// Per-transition policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPolicy {
    pub key: TransitionKey,
    #[serde(default)]
    pub mode: FlowMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_condition: Option<EscalationCondition>,
    /// Deadline for approval/collaboration suspensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub join_tolerance: JoinTolerance,
}

impl TransitionPolicy {
    pub fn new(key: TransitionKey, mode: FlowMode) -> Self {
        Self {
            key,
            mode,
            max_iterations: None,
            escalation_condition: None,
            timeout_ms: None,
            join_tolerance: JoinTolerance::Strict,
        }
    }

    pub fn autonomous(key: TransitionKey) -> Self {
        Self::new(key, FlowMode::Autonomous)
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_escalation(mut self, condition: EscalationCondition) -> Self {
        self.escalation_condition = Some(condition);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_join_tolerance(mut self, tolerance: JoinTolerance) -> Self {
        self.join_tolerance = tolerance;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Escalate-or-fail decision once the iteration cap has been exceeded
    pub fn escalates(&self, result: &PhaseResult) -> bool {
        self.escalation_condition
            .as_ref()
            .map(|c| c.evaluate(result))
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == Some(0) {
            return Err(EngineError::config(format!("{}: max_iterations must be > 0", self.key)));
        }
        if self.timeout_ms == Some(0) {
            return Err(EngineError::config(format!("{}: timeout_ms must be > 0", self.key)));
        }
        if self.join_tolerance == JoinTolerance::MinCompleted(0) {
            return Err(EngineError::config(format!("{}: min_completed must be > 0", self.key)));
        }
        Ok(())
    }
}
