//! Loop level definitions (immutable after startup).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::policy::{EXIT_PHASE, TransitionKey, TransitionPolicy, WILDCARD};
use crate::error::{EngineError, Result};

/// Definition of one loop level: its phase sequence and defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDefinition {
    /// Level name (e.g., "release", "planning", "execution").
    pub level: String,

    /// Ordered phase sequence.
    pub phases: Vec<String>,

    /// Default strategy id per phase.
    #[serde(default)]
    pub strategies: BTreeMap<String, String>,

    /// Default policies for this level's transitions.
    #[serde(default)]
    pub policies: Vec<TransitionPolicy>,

    /// Level used by `descend` and `fork` children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descend: Option<String>,
}

impl LoopDefinition {
    pub fn new(level: impl Into<String>, phases: &[&str]) -> Self {
        Self {
            level: level.into(),
            phases: phases.iter().map(|p| p.to_string()).collect(),
            strategies: BTreeMap::new(),
            policies: Vec::new(),
            descend: None,
        }
    }

    /// Use one strategy for every phase
    pub fn with_strategy_for_all(mut self, strategy: &str) -> Self {
        for phase in &self.phases {
            self.strategies.insert(phase.clone(), strategy.to_string());
        }
        self
    }

    pub fn with_strategy(mut self, phase: &str, strategy: &str) -> Self {
        self.strategies.insert(phase.to_string(), strategy.to_string());
        self
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_descend(mut self, level: &str) -> Self {
        self.descend = Some(level.to_string());
        self
    }

    pub fn phase_index(&self, phase: &str) -> Option<usize> {
        self.phases.iter().position(|p| p == phase)
    }

    pub fn phase(&self, index: usize) -> Result<&str> {
        self.phases
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| EngineError::config(format!("level '{}' has no phase #{}", self.level, index)))
    }

    pub fn first_phase(&self) -> Result<&str> {
        self.phase(0)
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.phases.len()
    }

    /// Key of the transition out of the phase at `index`
    pub fn transition_key(&self, index: usize) -> Result<TransitionKey> {
        let from = self.phase(index)?;
        let to = self.phases.get(index + 1).map(String::as_str).unwrap_or(EXIT_PHASE);
        Ok(TransitionKey::within(&self.level, from, to))
    }

    /// Every concrete transition key this level can produce
    pub fn transition_keys(&self) -> Vec<TransitionKey> {
        (0..self.phases.len())
            .filter_map(|i| self.transition_key(i).ok())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.level) {
            return Err(EngineError::config(format!("invalid level name '{}'", self.level)));
        }
        if self.phases.is_empty() {
            return Err(EngineError::config(format!("level '{}' has no phases", self.level)));
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !is_valid_name(phase) || phase == EXIT_PHASE {
                return Err(EngineError::config(format!(
                    "level '{}' has invalid phase name '{}'",
                    self.level, phase
                )));
            }
            if !seen.insert(phase.as_str()) {
                return Err(EngineError::config(format!(
                    "level '{}' lists phase '{}' twice",
                    self.level, phase
                )));
            }
        }
        for phase in self.strategies.keys() {
            if !seen.contains(phase.as_str()) {
                return Err(EngineError::config(format!(
                    "level '{}' binds a strategy to unknown phase '{}'",
                    self.level, phase
                )));
            }
        }
        for policy in &self.policies {
            policy.validate()?;
            if policy.key.from.level != self.level && policy.key.from.level != WILDCARD {
                return Err(EngineError::config(format!(
                    "level '{}' declares a default policy for foreign key {}",
                    self.level, policy.key
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != WILDCARD
        && !name.contains(['.', ':', ' '])
        && !name.contains("->")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> LoopDefinition {
        LoopDefinition::new("execution", &["design", "implement", "test"]).with_strategy_for_all("agent")
    }

    #[test]
    fn test_transition_keys() {
        let def = execution();
        assert_eq!(
            def.transition_key(0).unwrap(),
            TransitionKey::within("execution", "design", "implement")
        );
        assert_eq!(
            def.transition_key(2).unwrap(),
            TransitionKey::within("execution", "test", EXIT_PHASE)
        );
        assert!(def.transition_key(3).is_err());
        assert_eq!(def.transition_keys().len(), 3);
    }

    #[test]
    fn test_phase_lookup() {
        let def = execution();
        assert_eq!(def.phase_index("implement"), Some(1));
        assert_eq!(def.phase_index("deploy"), None);
        assert_eq!(def.first_phase().unwrap(), "design");
        assert!(def.is_last(2));
        assert!(!def.is_last(1));
    }

    #[test]
    fn test_validate_ok() {
        assert!(execution().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_phases() {
        let def = LoopDefinition::new("empty", &[]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_reserved_and_duplicate_phases() {
        assert!(LoopDefinition::new("x", &["a", "exit"]).validate().is_err());
        assert!(LoopDefinition::new("x", &["a", "a"]).validate().is_err());
        assert!(LoopDefinition::new("x", &["a.b"]).validate().is_err());
        assert!(LoopDefinition::new("*", &["a"]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_strategy_for_unknown_phase() {
        let def = execution().with_strategy("deploy", "agent");
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_foreign_policy() {
        let def = execution().with_policy(TransitionPolicy::autonomous(TransitionKey::within("planning", "a", "b")));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
level: planning
phases: [breakdown, review]
strategies:
  breakdown: planner
  review: reviewer
descend: execution
"#;
        let def: LoopDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.phases, vec!["breakdown", "review"]);
        assert_eq!(def.descend.as_deref(), Some("execution"));
        assert_eq!(def.strategies.get("review").map(String::as_str), Some("reviewer"));
    }
}
