//! Engine: drives a loop tree to completion.
//!
//! The engine owns the tree and is its only writer. Dispatches run as tokio
//! tasks in a `JoinSet`, bounded by `settings.max_parallel`; their outcomes
//! are applied back on the driver, one at a time. Human decisions arrive
//! either as direct calls or through an `EngineHandle` while `run` owns the
//! engine.

mod builder;
mod handle;
mod snapshot;

pub use builder::EngineBuilder;
pub use handle::EngineHandle;
pub use snapshot::{EngineSnapshot, SnapshotStore};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinSet};

use self::handle::Control;
use crate::config::Configuration;
use crate::domain::{
    Artifact, ArtifactRef, HumanDecision, InstanceStatus, LoopInstance, PhaseResult, PhaseStatus, Suspension,
    SuspensionKind, TransitionPolicy,
};
use crate::error::{EngineError, Result};
use crate::id::{InstanceId, now_ms};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::strategy::{DispatchOutcome, PhaseDispatcher, find_problem};
use crate::transition::{FlowContext, TransitionAction, TransitionDecision, TransitionEvaluator};
use crate::tree::{LoopTree, TreeEvent};

/// Where a run stands when the driver returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// The root instance is terminal
    Finished { root: InstanceId, status: InstanceStatus },
    /// Nothing can move until a human resumes one of these
    AwaitingHuman(Vec<InstanceId>),
    /// No root yet, or nothing left to do
    Idle,
}

const MAX_IDLE_SLEEP: Duration = Duration::from_secs(3600);

enum Resumption {
    Accept { result: PhaseResult, record: bool },
    Reject(String),
    Retry(Option<String>),
}

enum Wake {
    Joined(std::result::Result<(InstanceId, DispatchOutcome), JoinError>),
    Deadline,
    Control(Option<Control>),
    Nothing,
}

pub struct Engine {
    run_id: String,
    config: Arc<Configuration>,
    tree: LoopTree,
    dispatcher: Arc<PhaseDispatcher>,
    notifier: Arc<dyn Notifier>,
    in_flight: HashMap<InstanceId, AbortHandle>,
    tasks: JoinSet<(InstanceId, DispatchOutcome)>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    control_tx: mpsc::WeakUnboundedSender<Control>,
    control_open: bool,
}

impl Engine {
    pub fn builder(config: Configuration) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn assemble(
        run_id: String,
        config: Arc<Configuration>,
        tree: LoopTree,
        dispatcher: PhaseDispatcher,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        // No handle yet: the channel starts closed
        let (tx, control_rx) = mpsc::unbounded_channel();
        let control_tx = tx.downgrade();
        drop(tx);
        Self {
            run_id,
            config,
            tree,
            dispatcher: Arc::new(dispatcher),
            notifier,
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            control_rx,
            control_tx,
            control_open: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn tree(&self) -> &LoopTree {
        &self.tree
    }

    pub fn instance(&self, id: InstanceId) -> Result<&LoopInstance> {
        self.tree.get(id)
    }

    pub fn instances(&self) -> Vec<LoopInstance> {
        self.tree.instances().cloned().collect()
    }

    /// Control handle; reopens the control channel if every earlier
    /// handle has been dropped.
    pub fn handle(&mut self) -> EngineHandle {
        if let Some(tx) = self.control_tx.upgrade() {
            return EngineHandle::new(tx);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.control_rx = rx;
        self.control_tx = tx.downgrade();
        self.control_open = true;
        EngineHandle::new(tx)
    }

    //=== Starting a run ===

    /// Create the root instance seeded with existing artifacts
    pub fn start(&mut self, seed: Vec<ArtifactRef>) -> Result<InstanceId> {
        let gateway = self.dispatcher.gateway();
        let seed = seed.iter().map(|r| gateway.qualify(r)).collect::<Result<Vec<_>>>()?;
        let root = self.tree.create_root(seed)?;
        log::info!("Run {} started with root #{} at level {}", self.run_id, root, self.config.root_level());
        self.flush_events();
        Ok(root)
    }

    /// Persist the seed artifacts, then start the run with them
    pub async fn seed(&mut self, artifacts: Vec<Artifact>) -> Result<InstanceId> {
        let refs = self.dispatcher.gateway().persist(&artifacts).await?;
        self.start(refs)
    }

    //=== Driving ===

    /// Dispatch until nothing is in flight. Deadlines that already passed
    /// are applied; future ones are left for a later call.
    pub async fn run_until_idle(&mut self) -> Result<RunState> {
        self.drive(false).await
    }

    /// Dispatch until the root is terminal, waiting for deadlines and for
    /// handle requests while instances are suspended. Returns early once no
    /// handle is left and nothing else can wake the run.
    pub async fn run(&mut self) -> Result<RunState> {
        self.drive(true).await
    }

    async fn drive(&mut self, wait_for_humans: bool) -> Result<RunState> {
        loop {
            self.drain_controls().await;
            self.expire_overdue()?;

            if self.tree.is_finished() {
                self.cancel_in_flight();
                self.flush_events();
                return Ok(self.state());
            }

            self.schedule();
            self.flush_events();

            let deadline = self.tree.next_deadline();
            let waiting = wait_for_humans && (deadline.is_some() || self.control_open);
            if self.tasks.is_empty() && !waiting {
                return Ok(self.state());
            }

            let sleep_for = deadline
                .map(|d| Duration::from_millis(d.saturating_sub(now_ms())).min(MAX_IDLE_SLEEP))
                .unwrap_or(MAX_IDLE_SLEEP);
            let wake = tokio::select! {
                joined = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Some(joined) => Wake::Joined(joined),
                    None => Wake::Nothing,
                },
                _ = tokio::time::sleep(sleep_for), if wait_for_humans && deadline.is_some() => Wake::Deadline,
                control = self.control_rx.recv(), if self.control_open => Wake::Control(control),
                else => Wake::Nothing,
            };

            match wake {
                Wake::Joined(Ok((id, outcome))) => self.on_joined(id, outcome),
                Wake::Joined(Err(e)) => self.on_join_error(e),
                Wake::Deadline | Wake::Nothing => {}
                Wake::Control(Some(control)) => self.handle_control(control).await,
                Wake::Control(None) => {
                    log::debug!("All engine handles dropped");
                    self.control_open = false;
                }
            }
        }
    }

    /// Summary of where the run stands
    pub fn state(&self) -> RunState {
        if let Some(root) = self.tree.root() {
            if let Ok(inst) = self.tree.get(root) {
                if inst.status.is_terminal() {
                    return RunState::Finished {
                        root,
                        status: inst.status,
                    };
                }
            }
        }
        let waiting = self.tree.suspended();
        if waiting.is_empty() {
            RunState::Idle
        } else {
            RunState::AwaitingHuman(waiting)
        }
    }

    /// Turn overdue approvals and collaborations into `blocked`
    pub fn expire_overdue(&mut self) -> Result<Vec<InstanceId>> {
        let expired = self.tree.expired(now_ms());
        for id in &expired {
            self.tree.expire(*id)?;
        }
        self.flush_events();
        Ok(expired)
    }

    fn schedule(&mut self) {
        let max_parallel = self.config.settings().max_parallel;
        for id in self.tree.runnable() {
            if self.in_flight.len() >= max_parallel {
                break;
            }
            if self.in_flight.contains_key(&id) {
                continue;
            }
            let plan = match self.tree.get(id).and_then(|inst| self.dispatcher.prepare(inst)) {
                Ok(plan) => plan,
                Err(e) => {
                    self.fail_after_error(id, &e);
                    continue;
                }
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            let handle = self.tasks.spawn(async move {
                let outcome = AssertUnwindSafe(dispatcher.dispatch(plan))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| DispatchOutcome::Completed {
                        result: PhaseResult::failed(EngineError::StrategyFailure("dispatch panicked".into()).to_string()),
                        produced: Vec::new(),
                    });
                (id, outcome)
            });
            self.in_flight.insert(id, handle);
        }
    }

    fn cancel_in_flight(&mut self) {
        for (id, handle) in self.in_flight.drain() {
            log::debug!("Cancelling dispatch of #{}", id);
            handle.abort();
        }
    }

    fn on_join_error(&mut self, e: JoinError) {
        let task = e.id();
        let owner = self
            .in_flight
            .iter()
            .find(|(_, handle)| handle.id() == task)
            .map(|(id, _)| *id);
        match owner {
            Some(id) => {
                self.in_flight.remove(&id);
                self.fail_after_error(id, &EngineError::StrategyFailure(e.to_string()));
            }
            None => log::debug!("Dropped cancelled dispatch: {}", e),
        }
    }

    // Outcomes for instances that were aborted or moved on are discarded
    fn on_joined(&mut self, id: InstanceId, outcome: DispatchOutcome) {
        if self.in_flight.remove(&id).is_none() {
            log::debug!("Discarding stale outcome for #{}", id);
            return;
        }
        let runnable = self.tree.get(id).map(|i| i.is_runnable()).unwrap_or(false);
        if !runnable {
            log::debug!("Discarding outcome for #{} which is no longer running", id);
            return;
        }

        let applied = match outcome {
            DispatchOutcome::AdapterFailed { error, result } => self
                .tree
                .pause(id, Suspension::blocked(format!("adapter failure: {}", error), result)),
            DispatchOutcome::Completed { result, produced } => self
                .tree
                .record_step(id, &result, &produced)
                .and_then(|_| self.apply_result(id, result, produced)),
        };
        if let Err(e) = applied {
            self.fail_after_error(id, &e);
        }
    }

    fn flow_for(&self, id: InstanceId) -> Result<(FlowContext, TransitionPolicy)> {
        let inst = self.tree.get(id)?;
        let policy = self.config.policy_at(&inst.level, inst.phase_index)?.clone();
        let is_last_phase = self.config.definition(&inst.level)?.is_last(inst.phase_index);
        Ok((
            FlowContext {
                iteration: inst.iteration,
                is_last_phase,
            },
            policy,
        ))
    }

    // Evaluate a dispatched result and apply the flow mode's gate
    fn apply_result(&mut self, id: InstanceId, result: PhaseResult, produced: Vec<ArtifactRef>) -> Result<()> {
        let (flow, policy) = self.flow_for(id)?;
        let deadline = |timeout: Option<Duration>| {
            timeout.map(|t| now_ms().saturating_add(u64::try_from(t.as_millis()).unwrap_or(u64::MAX)))
        };

        match TransitionEvaluator::evaluate(result, &policy, flow) {
            TransitionDecision::Advance(payload) => self.apply_action(id, payload.action, payload.result, produced),
            TransitionDecision::RequestNotify(payload) => {
                let notification = self
                    .notification(NotificationKind::Notify, id)?
                    .with_reason(format!("{} ({})", payload.action, payload.result.status))
                    .with_result(Some(payload.result.clone()));
                self.notifier.notify(&notification);
                self.apply_action(id, payload.action, payload.result, produced)
            }
            TransitionDecision::RequestApproval { payload, timeout } => self
                .tree
                .pause(id, Suspension::approval(payload.result, deadline(timeout))),
            TransitionDecision::RequestCollaboration { payload, timeout } => self
                .tree
                .pause(id, Suspension::collaboration(payload.result, deadline(timeout))),
        }
    }

    // Structural consequence of an accepted result
    fn apply_action(
        &mut self,
        id: InstanceId,
        action: TransitionAction,
        result: PhaseResult,
        produced: Vec<ArtifactRef>,
    ) -> Result<()> {
        log::debug!("#{}: {} ({})", id, action, result.status);
        match action {
            TransitionAction::NextPhase => self.tree.advance(id, result),
            TransitionAction::Escalate => self.tree.escalate(id, result),
            TransitionAction::Continue | TransitionAction::Retry => self.tree.continue_phase(id, result),
            TransitionAction::Block => {
                let reason = result.detail.clone().unwrap_or_else(|| "blocked by strategy".to_string());
                self.tree.pause(id, Suspension::blocked(reason, Some(result)))
            }
            TransitionAction::Fail => {
                let reason = result.detail.clone().unwrap_or_else(|| "phase failed".to_string());
                self.tree.fail(id, &reason, Some(result))
            }
            TransitionAction::Descend => self.tree.descend(id, produced).map(|_| ()),
            TransitionAction::Fork => {
                let (_, policy) = self.flow_for(id)?;
                self.tree.fork(id, produced, policy.join_tolerance).map(|_| ())
            }
        }
    }

    fn fail_after_error(&mut self, id: InstanceId, error: &EngineError) {
        tracing::warn!(instance = %id, error = %error, "Failing instance after error");
        let live = self.tree.get(id).map(|i| !i.status.is_terminal()).unwrap_or(false);
        if live {
            if let Err(e) = self.tree.fail(id, &error.to_string(), None) {
                log::error!("Could not fail #{}: {}", id, e);
            }
        }
    }

    //=== Human decisions ===

    /// Resume a suspended instance.
    ///
    /// Approve and collaborate apply the (possibly replaced) result directly
    /// without gating it again; reject re-enters the phase with the reason
    /// as feedback; retry re-runs the current iteration. A result that is
    /// malformed, or that descends or forks where the level has nowhere to
    /// go, is refused and the instance stays suspended.
    pub async fn resume(&mut self, id: InstanceId, decision: HumanDecision) -> Result<()> {
        let inst = self.tree.get(id)?;
        let suspension = inst
            .suspension
            .as_ref()
            .ok_or_else(|| EngineError::invalid(format!("#{} is {}, not suspended", id, inst.status)))?;
        if !decision.accepted_by(suspension.kind, suspension.pending.is_some()) {
            return Err(EngineError::invalid(format!(
                "'{}' cannot resume #{} ({:?}: {})",
                decision.name(),
                id,
                suspension.kind,
                suspension.reason
            )));
        }
        let pending = suspension.pending.clone();
        let name = decision.name();

        // Results are checked while the suspension still holds; a rejected
        // override leaves the instance waiting for another decision
        let step = match decision {
            HumanDecision::Approve { status, artifacts, note } => {
                let pending =
                    pending.ok_or_else(|| EngineError::invalid(format!("#{} has no pending result to approve", id)))?;
                let record = status.is_some() || artifacts.is_some();
                let result = HumanDecision::apply_approval(pending, status, artifacts, note);
                self.check_decided(id, &result)?;
                Resumption::Accept { result, record }
            }
            HumanDecision::Collaborate { result } => {
                self.check_decided(id, &result)?;
                Resumption::Accept { result, record: true }
            }
            HumanDecision::Reject { reason } => Resumption::Reject(reason),
            HumanDecision::Retry { note } => Resumption::Retry(note),
        };

        self.tree.resume(id)?;
        log::info!("#{} resumed by '{}'", id, name);
        let outcome = match step {
            Resumption::Accept { result, record } => self.accept_decided(id, result, record).await,
            Resumption::Reject(reason) => self.tree.annotate(id, &reason).and_then(|_| {
                self.tree
                    .continue_phase(id, PhaseResult::needs_more().with_detail(reason.clone()))
            }),
            Resumption::Retry(Some(note)) => self.tree.annotate(id, &note),
            Resumption::Retry(None) => Ok(()),
        };
        if let Err(e) = &outcome {
            self.fail_after_error(id, e);
        }
        self.flush_events();
        outcome
    }

    // A human-supplied result must be well formed and its action possible at the instance's level
    fn check_decided(&self, id: InstanceId, result: &PhaseResult) -> Result<()> {
        if let Some(problem) = find_problem(result) {
            return Err(EngineError::invalid(format!("#{} cannot take this result: {}", id, problem)));
        }
        if matches!(result.status, PhaseStatus::Descend | PhaseStatus::Parallel) {
            let level = &self.tree.get(id)?.level;
            self.config.descend_target(level).map_err(|e| {
                EngineError::invalid(format!("#{} cannot take a {} result: {}", id, result.status, e))
            })?;
        }
        Ok(())
    }

    // Persist a human-supplied result and apply its action without a gate
    async fn accept_decided(&mut self, id: InstanceId, result: PhaseResult, record: bool) -> Result<()> {
        match self.dispatcher.accept(result).await {
            DispatchOutcome::Completed { result, produced } => {
                if record {
                    self.tree.record_step(id, &result, &produced)?;
                }
                let (flow, policy) = self.flow_for(id)?;
                let action = TransitionEvaluator::action_for(&result, &policy, flow);
                self.apply_action(id, action, result, produced)
            }
            DispatchOutcome::AdapterFailed { error, result } => self
                .tree
                .pause(id, Suspension::blocked(format!("adapter failure: {}", error), result)),
        }
    }

    /// Abort an instance and its subtree; in-flight dispatches are cancelled
    pub fn abort(&mut self, id: InstanceId) -> Result<Vec<InstanceId>> {
        self.tree.get(id)?;
        let mut subtree = self.tree.descendants(id);
        subtree.push(id);
        for member in &subtree {
            if let Some(handle) = self.in_flight.remove(member) {
                handle.abort();
            }
        }
        let aborted = self.tree.abort(id)?;
        self.flush_events();
        Ok(aborted)
    }

    //=== Configuration and persistence ===

    /// Swap in a newer configuration. Running dispatches finish with the
    /// old one; everything scheduled afterwards uses the new one.
    pub fn reload(&mut self, config: Configuration) -> Result<()> {
        if config.version() <= self.config.version() {
            return Err(EngineError::config(format!(
                "reload needs a version above {}, got {}",
                self.config.version(),
                config.version()
            )));
        }
        self.tree.check_compatible(&config)?;
        let config = Arc::new(config);
        let gateway = self.dispatcher.gateway().with_config(Arc::clone(&config))?;
        let dispatcher = self.dispatcher.with_config(Arc::clone(&config), gateway);
        for missing in dispatcher.missing_strategies() {
            log::warn!("Strategy '{}' is configured but not registered", missing);
        }
        self.tree.set_config(Arc::clone(&config))?;
        self.dispatcher = Arc::new(dispatcher);
        log::info!("Configuration reloaded: v{}", config.version());
        self.config = config;
        Ok(())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::capture(&self.run_id, &self.tree)
    }

    //=== Control and notifications ===

    async fn drain_controls(&mut self) {
        while let Ok(control) = self.control_rx.try_recv() {
            self.handle_control(control).await;
        }
    }

    async fn handle_control(&mut self, control: Control) {
        log::debug!("Control request: {:?}", control);
        // Replies fail only if the requester went away
        match control {
            Control::Resume { id, decision, reply } => {
                let _ = reply.send(self.resume(id, decision).await);
            }
            Control::Abort { id, reply } => {
                let _ = reply.send(self.abort(id));
            }
            Control::Reload { config, reply } => {
                let _ = reply.send(self.reload(*config));
            }
            Control::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Control::Instances { reply } => {
                let _ = reply.send(self.instances());
            }
        }
    }

    fn notification(&self, kind: NotificationKind, id: InstanceId) -> Result<Notification> {
        let inst = self.tree.get(id)?;
        Ok(Notification::new(kind, id, &inst.level, &inst.phase, inst.iteration))
    }

    fn flush_events(&mut self) {
        for event in self.tree.drain_events() {
            let notification = match &event {
                TreeEvent::Suspended {
                    id,
                    kind,
                    reason,
                    result,
                } => {
                    let kind = match kind {
                        SuspensionKind::Approval => NotificationKind::AwaitingApproval,
                        SuspensionKind::Collaboration => NotificationKind::AwaitingCollaboration,
                        SuspensionKind::Blocked => NotificationKind::Blocked,
                    };
                    self.notification(kind, *id)
                        .map(|n| n.with_reason(reason.clone()).with_result(result.clone()))
                }
                TreeEvent::TimedOut { id, reason, result } => self
                    .notification(NotificationKind::TimedOut, *id)
                    .map(|n| n.with_reason(reason.clone()).with_result(result.clone())),
                TreeEvent::Failed { id, reason, result } => self
                    .notification(NotificationKind::Failed, *id)
                    .map(|n| n.with_reason(reason.clone()).with_result(result.clone())),
                other => {
                    log::trace!("Tree event: {:?}", other);
                    continue;
                }
            };
            match notification {
                Ok(notification) => self.notifier.notify(&notification),
                Err(e) => log::error!("Cannot build notification for #{}: {}", event.id(), e),
            }
        }
    }
}
