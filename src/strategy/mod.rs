//! Phase strategies: what happens inside a phase.
//!
//! A strategy is an opaque leaf. It receives a read-only context and returns a
//! `PhaseResult`; it never sees the engine or the loop tree.

pub mod command;
pub mod dispatcher;
pub mod scripted;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::adapter::StoredArtifact;
use crate::domain::{HistoryEntry, PhaseResult, TransitionPolicy};
use crate::error::{EngineError, Result};
use crate::id::InstanceId;

pub use command::{CommandConfig, CommandStrategy};
pub use dispatcher::{DispatchOutcome, DispatchPlan, PhaseDispatcher, find_problem, normalize};
pub use scripted::{FnStrategy, ScriptedStrategy};

/// Errors a strategy may report instead of a result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Everything a strategy gets to see
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub instance: InstanceId,
    pub level: String,
    pub phase: String,
    /// 1-based attempt counter for this phase
    pub iteration: u32,
    /// Resolved input artifacts
    pub inputs: Vec<StoredArtifact>,
    /// Policy of the transition out of this phase
    pub policy: TransitionPolicy,
    pub history: Vec<HistoryEntry>,
}

impl StrategyContext {
    /// Note attached to the most recent history entry of this phase
    /// (a rejection reason, for example)
    pub fn last_feedback(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .filter(|h| h.phase == self.phase)
            .find_map(|h| h.note.as_deref())
    }

    pub fn input(&self, artifact_type: &str) -> Option<&StoredArtifact> {
        self.inputs.iter().find(|a| a.reference.artifact_type == artifact_type)
    }
}

#[async_trait]
pub trait PhaseStrategy: Send + Sync {
    async fn execute(&self, ctx: &StrategyContext) -> std::result::Result<PhaseResult, StrategyError>;
}

/// Strategies by id
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn PhaseStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, strategy: Arc<dyn PhaseStrategy>) -> &mut Self {
        self.strategies.insert(id.into(), strategy);
        self
    }

    pub fn with(mut self, id: impl Into<String>, strategy: Arc<dyn PhaseStrategy>) -> Self {
        self.register(id, strategy);
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn PhaseStrategy>> {
        self.strategies
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::config(format!("strategy '{}' is not registered", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.strategies.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry").field("ids", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PhaseStatus, TransitionKey};
    use crate::id::now_ms;

    fn context(history: Vec<HistoryEntry>) -> StrategyContext {
        StrategyContext {
            instance: InstanceId(1),
            level: "execution".into(),
            phase: "design".into(),
            iteration: 2,
            inputs: vec![],
            policy: TransitionPolicy::autonomous(TransitionKey::within("execution", "design", "implement")),
            history,
        }
    }

    fn entry(phase: &str, note: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            phase: phase.into(),
            iteration: 1,
            status: PhaseStatus::NeedsMore,
            note: note.map(String::from),
            artifacts: vec![],
            at_ms: now_ms(),
        }
    }

    #[test]
    fn test_last_feedback_for_current_phase() {
        let ctx = context(vec![
            entry("design", Some("too vague")),
            entry("implement", Some("other phase")),
        ]);
        assert_eq!(ctx.last_feedback(), Some("too vague"));
        assert_eq!(context(vec![]).last_feedback(), None);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StrategyRegistry::new().with("noop", Arc::new(ScriptedStrategy::always(PhaseResult::done())));
        assert!(registry.get("noop").is_ok());
        assert!(matches!(registry.get("missing"), Err(EngineError::Config(_))));
        assert_eq!(registry.ids(), vec!["noop"]);
    }
}
