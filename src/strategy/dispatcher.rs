//! Phase dispatcher: resolves, invokes and normalizes strategies.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use super::{PhaseStrategy, StrategyContext, StrategyRegistry};
use crate::adapter::AdapterGateway;
use crate::config::Configuration;
use crate::domain::{ArtifactRef, HistoryEntry, LoopInstance, PhaseResult, PhaseStatus, TransitionPolicy};
use crate::error::{EngineError, Result};
use crate::id::InstanceId;

/// Everything needed to run one phase, captured from the instance at
/// scheduling time so the run does not touch the tree.
#[derive(Clone)]
pub struct DispatchPlan {
    pub instance: InstanceId,
    pub level: String,
    pub phase: String,
    pub iteration: u32,
    pub refs: Vec<ArtifactRef>,
    pub history: Vec<HistoryEntry>,
    pub policy: TransitionPolicy,
    pub strategy_id: String,
    strategy: Arc<dyn PhaseStrategy>,
}

impl std::fmt::Debug for DispatchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPlan")
            .field("instance", &self.instance)
            .field("level", &self.level)
            .field("phase", &self.phase)
            .field("iteration", &self.iteration)
            .field("strategy_id", &self.strategy_id)
            .finish()
    }
}

/// What came back from one dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Normalized result; `produced` are the persisted references
    Completed {
        result: PhaseResult,
        produced: Vec<ArtifactRef>,
    },
    /// Inputs could not be read or outputs could not be written
    AdapterFailed { error: String, result: Option<PhaseResult> },
}

#[derive(Clone)]
pub struct PhaseDispatcher {
    config: Arc<Configuration>,
    strategies: StrategyRegistry,
    gateway: AdapterGateway,
}

impl PhaseDispatcher {
    pub fn new(config: Arc<Configuration>, strategies: StrategyRegistry, gateway: AdapterGateway) -> Self {
        Self {
            config,
            strategies,
            gateway,
        }
    }

    /// Same strategies, new configuration and gateway
    pub fn with_config(&self, config: Arc<Configuration>, gateway: AdapterGateway) -> Self {
        Self::new(config, self.strategies.clone(), gateway)
    }

    pub fn gateway(&self) -> &AdapterGateway {
        &self.gateway
    }

    /// Strategy ids referenced by the configuration but not registered
    pub fn missing_strategies(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .config
            .strategy_ids()
            .into_iter()
            .filter(|id| !self.strategies.contains(id))
            .map(String::from)
            .collect();
        missing.sort();
        missing
    }

    /// Resolve strategy and policy for the instance's current phase.
    ///
    /// An unresolvable strategy is a configuration error; the caller fails the
    /// instance instead of scheduling it.
    pub fn prepare(&self, instance: &LoopInstance) -> Result<DispatchPlan> {
        let strategy_id = self.config.strategy_id(&instance.level, &instance.phase)?.to_string();
        let strategy = self.strategies.get(&strategy_id)?;
        let policy = self.config.policy_at(&instance.level, instance.phase_index)?.clone();
        Ok(DispatchPlan {
            instance: instance.id,
            level: instance.level.clone(),
            phase: instance.phase.clone(),
            iteration: instance.iteration,
            refs: instance.artifacts.clone(),
            history: instance.history.clone(),
            policy,
            strategy_id,
            strategy,
        })
    }

    /// Run the plan: resolve inputs, invoke, normalize, persist outputs.
    pub async fn dispatch(&self, plan: DispatchPlan) -> DispatchOutcome {
        let inputs = match self.gateway.resolve(&plan.refs).await {
            Ok(inputs) => inputs,
            Err(e) => {
                log::warn!("Instance #{}: cannot resolve inputs: {}", plan.instance, e);
                return DispatchOutcome::AdapterFailed {
                    error: e.to_string(),
                    result: None,
                };
            }
        };

        let ctx = StrategyContext {
            instance: plan.instance,
            level: plan.level.clone(),
            phase: plan.phase.clone(),
            iteration: plan.iteration,
            inputs,
            policy: plan.policy.clone(),
            history: plan.history.clone(),
        };

        log::debug!(
            "Dispatching {}.{} iteration {} of #{} to '{}'",
            plan.level,
            plan.phase,
            plan.iteration,
            plan.instance,
            plan.strategy_id
        );

        let timeout = self.config.settings().strategy_timeout();
        let result = match invoke(plan.strategy.as_ref(), &ctx, timeout).await {
            Ok(result) => normalize(result),
            Err(detail) => {
                log::warn!("Instance #{}: {}", plan.instance, detail);
                PhaseResult::failed(detail)
            }
        };

        self.accept(result).await
    }

    /// Persist an already normalized result
    pub async fn accept(&self, result: PhaseResult) -> DispatchOutcome {
        match self.gateway.persist(&result.artifacts).await {
            Ok(produced) => DispatchOutcome::Completed { result, produced },
            Err(e) => DispatchOutcome::AdapterFailed {
                error: e.to_string(),
                result: Some(result),
            },
        }
    }
}

// Strategy errors, panics and timeouts all become a failure detail
async fn invoke(
    strategy: &dyn PhaseStrategy,
    ctx: &StrategyContext,
    timeout: Option<Duration>,
) -> std::result::Result<PhaseResult, String> {
    let call = AssertUnwindSafe(strategy.execute(ctx)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(EngineError::StrategyFailure(format!("timed out after {}ms", limit.as_millis())).to_string());
            }
        },
        None => call.await,
    };
    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(EngineError::StrategyFailure(e.to_string()).to_string()),
        Err(panic) => Err(EngineError::StrategyFailure(format!("panicked: {}", panic_message(&*panic))).to_string()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Turn a malformed result into `failed`, dropping its artifacts.
pub fn normalize(result: PhaseResult) -> PhaseResult {
    match find_problem(&result) {
        None => result,
        Some(problem) => {
            log::warn!("Rejecting {} result: {}", result.status, problem);
            PhaseResult {
                status: PhaseStatus::Failed,
                artifacts: Vec::new(),
                next_action: result.next_action,
                detail: Some(problem),
            }
        }
    }
}

/// First reason a result cannot be applied as-is, if any
pub fn find_problem(result: &PhaseResult) -> Option<String> {
    let mut seen = HashSet::new();
    for artifact in &result.artifacts {
        let reference = artifact.unqualified_ref();
        if !reference.is_well_formed() {
            return Some(format!(
                "malformed artifact (type '{}', id '{}')",
                artifact.artifact_type, artifact.id
            ));
        }
        if !seen.insert((artifact.artifact_type.as_str(), artifact.id.as_str())) {
            return Some(format!("duplicate artifact {}:{}", artifact.artifact_type, artifact.id));
        }
        for link in &artifact.links {
            if !link.target.is_well_formed() || link.relation.trim().is_empty() {
                return Some(format!(
                    "malformed link on {}:{} to '{}'",
                    artifact.artifact_type, artifact.id, link.target
                ));
            }
        }
    }
    if result.status == PhaseStatus::Parallel && result.artifacts.is_empty() {
        return Some("parallel result without work items".to_string());
    }
    None
}
