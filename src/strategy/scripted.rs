//! Scripted and closure-backed strategies.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{PhaseStrategy, StrategyContext, StrategyError};
use crate::domain::PhaseResult;

/// Plays back a fixed sequence of results; the last one repeats forever.
pub struct ScriptedStrategy {
    script: Vec<PhaseResult>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    seen: Mutex<Vec<(String, u32)>>,
}

impl ScriptedStrategy {
    pub fn new(script: Vec<PhaseResult>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            delay: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always(result: PhaseResult) -> Self {
        Self::new(vec![result])
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (phase, iteration) of every call so far
    pub fn seen(&self) -> Vec<(String, u32)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PhaseStrategy for ScriptedStrategy {
    async fn execute(&self, ctx: &StrategyContext) -> Result<PhaseResult, StrategyError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((ctx.phase.clone(), ctx.iteration));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .get(n)
            .or_else(|| self.script.last())
            .cloned()
            .ok_or_else(|| StrategyError::InvalidInput("empty script".to_string()))
    }
}

type StrategyFn = dyn Fn(&StrategyContext) -> Result<PhaseResult, StrategyError> + Send + Sync;

/// Strategy backed by a plain closure
pub struct FnStrategy {
    f: Box<StrategyFn>,
}

impl FnStrategy {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&StrategyContext) -> Result<PhaseResult, StrategyError> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl PhaseStrategy for FnStrategy {
    async fn execute(&self, ctx: &StrategyContext) -> Result<PhaseResult, StrategyError> {
        (self.f)(ctx)
    }
}
