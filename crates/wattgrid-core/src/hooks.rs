//! Transition notifications.
//!
//! Node and request state machines report what happened through a
//! [`Hooks`] sink handed to them at construction. Delivery is
//! fire-and-forget: a failing sink is logged and otherwise ignored.

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::request::RequestId;

/// Something a hook sink may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    PrePowerOn { node: String },
    /// `resolved` is the node the power controller actually acted on.
    PostPowerOn { node: String, success: bool, resolved: String },
    PrePowerOff { node: String },
    PostPowerOff { node: String, success: bool, resolved: String },
    PoweredOn { node: String },
    PoweredOff { node: String },
    UnexpectedPowerOn { node: String },
    UnexpectedPowerOff { node: String },
    /// A power-off did not take; `failures` counts consecutive attempts.
    OnErr { node: String, failures: u32 },
    /// A power-on did not take; `failures` counts consecutive attempts.
    OffErr { node: String, failures: u32 },
    Unknown { node: String },
    Idle { node: String },
    Used { node: String },
    Request {
        id: RequestId,
        slots: Option<f64>,
        memory: Option<f64>,
        task_count: u32,
        max_tasks_per_node: u32,
        constraints: Vec<String>,
    },
}

impl HookEvent {
    /// Short category name, used as the log/target key.
    pub fn kind(&self) -> &'static str {
        match self {
            HookEvent::PrePowerOn { .. } => "pre_poweron",
            HookEvent::PostPowerOn { .. } => "post_poweron",
            HookEvent::PrePowerOff { .. } => "pre_poweroff",
            HookEvent::PostPowerOff { .. } => "post_poweroff",
            HookEvent::PoweredOn { .. } => "poweredon",
            HookEvent::PoweredOff { .. } => "poweredoff",
            HookEvent::UnexpectedPowerOn { .. } => "unexpected_poweron",
            HookEvent::UnexpectedPowerOff { .. } => "unexpected_poweroff",
            HookEvent::OnErr { .. } => "onerr",
            HookEvent::OffErr { .. } => "offerr",
            HookEvent::Unknown { .. } => "unknown",
            HookEvent::Idle { .. } => "idle",
            HookEvent::Used { .. } => "used",
            HookEvent::Request { .. } => "request",
        }
    }
}

/// Receiver of transition notifications.
pub trait Hooks: Send + Sync {
    fn notify(&self, event: &HookEvent) -> anyhow::Result<()>;
}

/// Deliver an event, logging (never propagating) a failure.
pub fn fire(hooks: &dyn Hooks, event: HookEvent) {
    if let Err(e) = hooks.notify(&event) {
        warn!(hook = event.kind(), error = %e, "hook failed");
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl Hooks for NoopHooks {
    fn notify(&self, _event: &HookEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes every event to the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl Hooks for LogHooks {
    fn notify(&self, event: &HookEvent) -> anyhow::Result<()> {
        debug!(hook = event.kind(), ?event, "hook");
        Ok(())
    }
}

/// Keeps every event in memory, for tests and the simulator report.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(HookEvent::kind).collect()
    }
}

impl Hooks for RecordingHooks {
    fn notify(&self, event: &HookEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("hook recorder poisoned"))?
            .push(event.clone());
        Ok(())
    }
}
