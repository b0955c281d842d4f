//! Control handle for a running engine.
//!
//! While `Engine::run` owns the engine, humans and front ends talk to it
//! through an `EngineHandle`. Every request carries a oneshot reply channel.

use tokio::sync::{mpsc, oneshot};

use super::snapshot::EngineSnapshot;
use crate::config::Configuration;
use crate::domain::{HumanDecision, LoopInstance};
use crate::error::{EngineError, Result};
use crate::id::InstanceId;

/// Requests processed by the driver loop
pub(crate) enum Control {
    Resume {
        id: InstanceId,
        decision: HumanDecision,
        reply: oneshot::Sender<Result<()>>,
    },
    Abort {
        id: InstanceId,
        reply: oneshot::Sender<Result<Vec<InstanceId>>>,
    },
    Reload {
        config: Box<Configuration>,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Instances {
        reply: oneshot::Sender<Vec<LoopInstance>>,
    },
}

/// Cloneable sender side of the engine's control channel
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Resume { id, decision, .. } => write!(f, "Resume(#{}, {})", id, decision.name()),
            Control::Abort { id, .. } => write!(f, "Abort(#{})", id),
            Control::Reload { config, .. } => write!(f, "Reload(v{})", config.version()),
            Control::Snapshot { .. } => f.write_str("Snapshot"),
            Control::Instances { .. } => f.write_str("Instances"),
        }
    }
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Control>) -> Self {
        Self { tx }
    }

    /// Resume a suspended instance with a human decision
    pub async fn resume(&self, id: InstanceId, decision: HumanDecision) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Resume { id, decision, reply })?;
        rx.await.map_err(|_| stopped())?
    }

    /// Abort an instance and its subtree
    pub async fn abort(&self, id: InstanceId) -> Result<Vec<InstanceId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Abort { id, reply })?;
        rx.await.map_err(|_| stopped())?
    }

    /// Swap in a configuration with a higher version
    pub async fn reload(&self, config: Configuration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Reload {
            config: Box::new(config),
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Snapshot { reply })?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn instances(&self) -> Result<Vec<LoopInstance>> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Instances { reply })?;
        rx.await.map_err(|_| stopped())
    }

    fn send(&self, control: Control) -> Result<()> {
        self.tx.send(control).map_err(|_| stopped())
    }
}

fn stopped() -> EngineError {
    EngineError::invalid("engine stopped")
}
