//! Notifications to humans.
//!
//! The engine only emits `Notification`s; delivery (chat, mail, a TUI) is up
//! to the `Notifier` implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::PhaseResult;
use crate::id::{InstanceId, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// FYI from a hitl_notify transition
    Notify,
    AwaitingApproval,
    AwaitingCollaboration,
    Blocked,
    Failed,
    /// An approval or collaboration deadline passed
    TimedOut,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Notify => "notify",
            NotificationKind::AwaitingApproval => "awaiting_approval",
            NotificationKind::AwaitingCollaboration => "awaiting_collaboration",
            NotificationKind::Blocked => "blocked",
            NotificationKind::Failed => "failed",
            NotificationKind::TimedOut => "timed_out",
        }
    }

    /// Does the notification ask a human to act?
    pub fn needs_action(&self) -> bool {
        !matches!(self, NotificationKind::Notify | NotificationKind::Failed)
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub instance: InstanceId,
    pub level: String,
    pub phase: String,
    pub iteration: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PhaseResult>,
    pub at_ms: u64,
}

impl Notification {
    pub fn new(kind: NotificationKind, instance: InstanceId, level: &str, phase: &str, iteration: u32) -> Self {
        Self {
            kind,
            instance,
            level: level.to_string(),
            phase: phase.to_string(),
            iteration,
            reason: String::new(),
            result: None,
            at_ms: now_ms(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_result(mut self, result: Option<PhaseResult>) -> Self {
        self.result = result;
        self
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] #{} {}.{} (iteration {})",
            self.kind, self.instance, self.level, self.phase, self.iteration
        )?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Delivery seam; must not block
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        match notification.kind {
            NotificationKind::Notify => log::info!("{}", notification),
            NotificationKind::Failed => log::error!("{}", notification),
            _ => log::warn!("{}", notification),
        }
    }
}

/// Forwards notifications over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: &Notification) {
        if self.tx.send(notification.clone()).is_err() {
            log::debug!("Notification receiver dropped: {}", notification);
        }
    }
}

/// Sends every notification to all inner notifiers
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.targets.push(notifier);
        self
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, notification: &Notification) {
        for target in &self.targets {
            target.notify(notification);
        }
    }
}
