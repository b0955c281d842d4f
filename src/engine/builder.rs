//! Engine construction

use std::sync::Arc;

use super::{Engine, EngineSnapshot};
use crate::adapter::{AdapterGateway, AdapterRegistry, StateAdapter};
use crate::config::Configuration;
use crate::error::Result;
use crate::id::generate_run_id;
use crate::notify::{LogNotifier, Notifier};
use crate::strategy::{PhaseDispatcher, PhaseStrategy, StrategyRegistry};
use crate::tree::LoopTree;

/// Collects strategies, adapters and the notifier for an `Engine`
pub struct EngineBuilder {
    config: Arc<Configuration>,
    strategies: StrategyRegistry,
    adapters: AdapterRegistry,
    notifier: Arc<dyn Notifier>,
    run_id: Option<String>,
}

impl EngineBuilder {
    pub fn new(config: Configuration) -> Self {
        Self {
            config: Arc::new(config),
            strategies: StrategyRegistry::new(),
            adapters: AdapterRegistry::new(),
            notifier: Arc::new(LogNotifier),
            run_id: None,
        }
    }

    pub fn strategy(mut self, id: impl Into<String>, strategy: Arc<dyn PhaseStrategy>) -> Self {
        self.strategies.register(id, strategy);
        self
    }

    /// Replace all registered strategies
    pub fn strategies(mut self, registry: StrategyRegistry) -> Self {
        self.strategies = registry;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn StateAdapter>) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Replace all registered adapters
    pub fn adapters(mut self, registry: AdapterRegistry) -> Self {
        self.adapters = registry;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Engine for a fresh run
    pub fn build(self) -> Result<Engine> {
        let tree = LoopTree::new(Arc::clone(&self.config));
        let run_id = self.run_id.clone().unwrap_or_else(generate_run_id);
        self.assemble(run_id, tree)
    }

    /// Engine continuing a snapshotted run
    pub fn restore(self, snapshot: EngineSnapshot) -> Result<Engine> {
        let run_id = snapshot.run_id.clone();
        let tree = snapshot.into_tree(Arc::clone(&self.config))?;
        log::info!(
            "Restored run {} with {} instances ({} suspended)",
            run_id,
            tree.len(),
            tree.suspended().len()
        );
        self.assemble(run_id, tree)
    }

    fn assemble(self, run_id: String, tree: LoopTree) -> Result<Engine> {
        let gateway = AdapterGateway::new(Arc::clone(&self.config), self.adapters)?;
        let dispatcher = PhaseDispatcher::new(Arc::clone(&self.config), self.strategies, gateway);
        // Unregistered strategies fail only the instances that reach them
        for missing in dispatcher.missing_strategies() {
            log::warn!("Strategy '{}' is configured but not registered", missing);
        }
        Ok(Engine::assemble(run_id, self.config, tree, dispatcher, self.notifier))
    }
}
