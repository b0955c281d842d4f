//! Transition policy table with wildcard lookup.
//!
//! Lookup is deterministic: an exact key always wins; otherwise the matching
//! wildcard pattern with the highest specificity is used.

use std::collections::HashMap;

use crate::domain::{TransitionKey, TransitionPolicy};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    exact: HashMap<TransitionKey, TransitionPolicy>,
    /// Sorted by descending specificity
    wildcards: Vec<TransitionPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from level defaults plus explicit entries; explicit entries
    /// replace defaults with the same key, but may not repeat each other.
    pub fn from_parts<'a>(
        defaults: impl IntoIterator<Item = &'a TransitionPolicy>,
        explicit: &[TransitionPolicy],
    ) -> Result<Self> {
        let mut table = Self::new();
        for policy in defaults {
            table.insert(policy.clone());
        }
        let mut seen = std::collections::HashSet::new();
        for policy in explicit {
            if !seen.insert(&policy.key) {
                return Err(EngineError::config(format!("duplicate policy for {}", policy.key)));
            }
            table.insert(policy.clone());
        }
        Ok(table)
    }

    /// Insert or replace the policy for its key
    pub fn insert(&mut self, policy: TransitionPolicy) {
        if policy.key.is_concrete() {
            self.exact.insert(policy.key.clone(), policy);
            return;
        }
        self.wildcards.retain(|p| p.key != policy.key);
        self.wildcards.push(policy);
        self.wildcards
            .sort_by(|a, b| b.key.specificity().cmp(&a.key.specificity()));
    }

    /// Policy for a concrete key
    pub fn lookup(&self, key: &TransitionKey) -> Result<&TransitionPolicy> {
        if let Some(policy) = self.exact.get(key) {
            return Ok(policy);
        }
        self.wildcards
            .iter()
            .find(|p| p.key.matches(key))
            .ok_or_else(|| EngineError::config(format!("no policy matches {}", key)))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All policies, exact first (sorted by key), then wildcards by specificity
    pub fn iter(&self) -> impl Iterator<Item = &TransitionPolicy> {
        let mut exact: Vec<&TransitionPolicy> = self.exact.values().collect();
        exact.sort_by_key(|p| p.key.to_string());
        exact.into_iter().chain(self.wildcards.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FlowMode;

    fn policy(key: &str, mode: FlowMode) -> TransitionPolicy {
        TransitionPolicy::new(key.parse().unwrap(), mode)
    }

    #[test]
    fn test_exact_outranks_wildcard() {
        let mut table = PolicyTable::new();
        table.insert(policy("*.* -> *.*", FlowMode::Autonomous));
        table.insert(policy("execution.* -> execution.*", FlowMode::HitlNotify));
        table.insert(policy("execution.design -> execution.implement", FlowMode::HitlApprove));

        let key = TransitionKey::within("execution", "design", "implement");
        assert_eq!(table.lookup(&key).unwrap().mode, FlowMode::HitlApprove);

        let other = TransitionKey::within("execution", "implement", "test");
        assert_eq!(table.lookup(&other).unwrap().mode, FlowMode::HitlNotify);

        let planning = TransitionKey::within("planning", "a", "b");
        assert_eq!(table.lookup(&planning).unwrap().mode, FlowMode::Autonomous);
    }

    #[test]
    fn test_most_specific_wildcard_wins_regardless_of_insert_order() {
        let key = TransitionKey::within("execution", "design", "implement");
        let patterns = [
            policy("execution.design -> *.*", FlowMode::HitlCollaborate),
            policy("execution.* -> execution.implement", FlowMode::HitlNotify),
            policy("*.* -> *.*", FlowMode::Autonomous),
        ];

        let mut forward = PolicyTable::new();
        for p in patterns.iter().cloned() {
            forward.insert(p);
        }
        let mut backward = PolicyTable::new();
        for p in patterns.iter().rev().cloned() {
            backward.insert(p);
        }

        // from-phase outranks to-level and to-phase combined
        assert_eq!(forward.lookup(&key).unwrap().mode, FlowMode::HitlCollaborate);
        assert_eq!(backward.lookup(&key).unwrap().mode, FlowMode::HitlCollaborate);
    }

    #[test]
    fn test_no_match_is_config_error() {
        let mut table = PolicyTable::new();
        table.insert(policy("planning.* -> planning.*", FlowMode::Autonomous));
        let err = table
            .lookup(&TransitionKey::within("execution", "a", "b"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_explicit_overrides_default() {
        let defaults = vec![policy("execution.a -> execution.b", FlowMode::Autonomous)];
        let explicit = vec![policy("execution.a -> execution.b", FlowMode::HitlApprove)];
        let table = PolicyTable::from_parts(&defaults, &explicit).unwrap();
        assert_eq!(table.len(), 1);
        let key = TransitionKey::within("execution", "a", "b");
        assert_eq!(table.lookup(&key).unwrap().mode, FlowMode::HitlApprove);
    }

    #[test]
    fn test_duplicate_explicit_rejected() {
        let explicit = vec![
            policy("execution.* -> *.*", FlowMode::Autonomous),
            policy("execution.* -> *.*", FlowMode::HitlApprove),
        ];
        let defaults: Vec<TransitionPolicy> = Vec::new();
        assert!(PolicyTable::from_parts(&defaults, &explicit).is_err());
    }

    #[test]
    fn test_replacing_wildcard_keeps_one_entry() {
        let mut table = PolicyTable::new();
        table.insert(policy("*.* -> *.*", FlowMode::Autonomous));
        table.insert(policy("*.* -> *.*", FlowMode::HitlNotify));
        assert_eq!(table.len(), 1);
        assert_eq!(table.iter().next().unwrap().mode, FlowMode::HitlNotify);
    }
}
