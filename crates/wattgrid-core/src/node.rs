//! Managed cluster nodes and their power state machine.
//!
//! A [`Node`] is created the first time the platform reports it and lives
//! for the rest of the run. Observations flow in through
//! [`Node::update_info`]; power commands move it through the pending
//! states `PowOn`/`PowOff`, and timeouts push it into `OffErr`/`OnErr`.
//!
//! ```text
//!            power_on            observed on (after delay_powon)
//!   Off ─────────────────► PowOn ─────────────────────────────► Idle ⇄ Used
//!    ▲                       │ still off past max_wait_poweron    │
//!    │                       ▼                                    │ power_off
//!    │                    OffErr                                  ▼
//!    └───────────────────────────────────────────────────────── PowOff
//!        observed off (after delay_powoff)   still on past max_wait_poweroff → OnErr
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::expr::Value;
use crate::hooks::HookEvent;
use crate::resources::ResourceDescriptor;

/// Power and activity state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// On and free.
    Idle,
    /// On and running work.
    Used,
    /// Confirmed powered off.
    Off,
    /// Power-on issued, awaiting confirmation.
    PowOn,
    /// Power-off issued, awaiting confirmation.
    PowOff,
    /// Power-off attempted but the node is still on.
    OnErr,
    /// Power-on attempted but the node is still off.
    OffErr,
    /// Not currently observed.
    Unknown,
}

impl NodeState {
    pub fn is_on(self) -> bool {
        matches!(self, NodeState::Idle | NodeState::Used)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Idle => "idle",
            NodeState::Used => "used",
            NodeState::Off => "off",
            NodeState::PowOn => "pow_on",
            NodeState::PowOff => "pow_off",
            NodeState::OnErr => "on_err",
            NodeState::OffErr => "off_err",
            NodeState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One node as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    /// Negative means unknown or unlimited.
    pub slots_total: f64,
    pub slots_free: f64,
    /// Negative means unknown or unlimited.
    pub memory_total: f64,
    pub memory_free: f64,
    pub state: NodeState,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl NodeInfo {
    /// An idle node with all of its capacity free.
    pub fn new(name: impl Into<String>, slots: f64, memory: f64) -> Self {
        Self {
            name: name.into(),
            slots_total: slots,
            slots_free: slots,
            memory_total: memory,
            memory_free: memory,
            state: NodeState::Idle,
            attributes: BTreeMap::new(),
        }
    }

    /// A node we know of but have no observation for.
    pub fn unobserved(name: impl Into<String>) -> Self {
        Self {
            state: NodeState::Unknown,
            ..Self::new(name, -1.0, -1.0)
        }
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    pub fn with_free(mut self, slots_free: f64, memory_free: f64) -> Self {
        self.slots_free = slots_free;
        self.memory_free = memory_free;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Values restored when a transition turns out to be a glitch.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Snapshot {
    state: NodeState,
    timestamp_state: u64,
    timestamp_poweredon: u64,
    timestamp_poweredoff: u64,
    power_on_failures: u32,
    power_off_failures: u32,
}

/// A managed cluster member.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub name: String,
    pub slots_total: f64,
    /// Free slots after this pass's speculative allocations.
    pub slots_free: f64,
    /// Free slots as last reported by the platform.
    pub slots_free_observed: f64,
    pub memory_total: f64,
    pub memory_free: f64,
    pub memory_free_observed: f64,
    pub attributes: BTreeMap<String, Value>,
    pub enabled: bool,
    state: NodeState,
    pub timestamp_created: u64,
    pub timestamp_state: u64,
    pub timestamp_info: u64,
    pub timestamp_poweredon: u64,
    pub timestamp_poweredoff: u64,
    pub power_on_failures: u32,
    pub power_off_failures: u32,
    #[serde(skip)]
    prev: Snapshot,
    #[serde(skip)]
    ctx: Context,
}

impl Node {
    /// Create a node from its first observation.
    pub fn from_info(info: &NodeInfo, ctx: Context) -> Self {
        let now = ctx.now();
        let prev = Snapshot {
            state: info.state,
            timestamp_state: now,
            timestamp_poweredon: now,
            timestamp_poweredoff: now,
            power_on_failures: 0,
            power_off_failures: 0,
        };
        Self {
            name: info.name.clone(),
            slots_total: info.slots_total,
            slots_free: info.slots_free,
            slots_free_observed: info.slots_free,
            memory_total: info.memory_total,
            memory_free: info.memory_free,
            memory_free_observed: info.memory_free,
            attributes: info.attributes.clone(),
            enabled: true,
            state: info.state,
            timestamp_created: now,
            timestamp_state: now,
            timestamp_info: now,
            timestamp_poweredon: now,
            timestamp_poweredoff: now,
            power_on_failures: 0,
            power_off_failures: 0,
            prev,
            ctx,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// State before the last accepted transition.
    pub fn previous_state(&self) -> NodeState {
        self.prev.state
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            timestamp_state: self.timestamp_state,
            timestamp_poweredon: self.timestamp_poweredon,
            timestamp_poweredoff: self.timestamp_poweredoff,
            power_on_failures: self.power_on_failures,
            power_off_failures: self.power_off_failures,
        }
    }

    fn mark_powered_on(&mut self, now: u64) {
        debug!(node = %self.name, "node has been powered on");
        self.power_on_failures = 0;
        self.timestamp_poweredon = now;
    }

    fn mark_powered_off(&mut self, now: u64) {
        debug!(node = %self.name, "node has been powered off");
        self.power_off_failures = 0;
        self.timestamp_poweredoff = now;
    }

    /// A monitoring restart can report nodes as off for a moment. If a node
    /// that just went `Off` is seen again in the state it had before, within
    /// the glitch window, the off period is forgotten. Only the transition
    /// into `Off` is treated this way.
    fn restore_if_glitch(&mut self, new_state: NodeState, now: u64) -> bool {
        let window = self.ctx.config.monitoring.time_off_glitch_detection;
        if window == 0
            || self.state != NodeState::Off
            || new_state != self.prev.state
            || now.saturating_sub(self.timestamp_state) > window
        {
            return false;
        }

        info!(node = %self.name, restored = %self.prev.state, "off period was a glitch, restoring previous state");
        self.state = self.prev.state;
        self.timestamp_poweredon = self.prev.timestamp_poweredon;
        self.timestamp_poweredoff = self.prev.timestamp_poweredoff;
        self.power_on_failures = self.prev.power_on_failures;
        self.power_off_failures = self.prev.power_off_failures;
        true
    }

    /// Move to `new_state`, returning whether anything changed.
    ///
    /// Some transitions are held back: a node leaving `PowOn`/`PowOff` must
    /// stay in the new state for `delay_powon`/`delay_powoff` seconds, a node
    /// still observed off past `max_wait_poweron` becomes `OffErr` (and the
    /// symmetric case becomes `OnErr`), and the error states never heal on
    /// their own. `force` applies the change regardless.
    pub fn set_state(&mut self, new_state: NodeState, force: bool) -> bool {
        use NodeState::*;

        if new_state == self.state {
            return false;
        }

        let now = self.ctx.now();
        if self.restore_if_glitch(new_state, now) {
            return true;
        }

        let monitoring = &self.ctx.config.monitoring;
        let elapsed = now.saturating_sub(self.timestamp_state);
        let mut target = new_state;

        let (unexpected, accept) = match (self.state, new_state) {
            (Idle, PowOn | OffErr | Off | OnErr) => (true, true),
            (Used, PowOn | Off | OffErr | OnErr) => (true, true),
            (Off, Idle | Used | PowOff | OffErr | OnErr) => (true, true),
            (OnErr, PowOn | Off | OffErr) => (true, true),
            (OnErr, Idle | Used) => (false, false),
            (OffErr, Idle | Used | PowOff | OnErr) => (true, true),
            (OffErr, Off) => (false, false),
            (PowOn, Off) if elapsed < monitoring.max_wait_poweron => (true, false),
            (PowOn, Off) => {
                warn!(node = %self.name, elapsed, "node was powered on, but it is still off");
                target = OffErr;
                (true, true)
            }
            (PowOn, PowOff | OnErr) => (true, true),
            (PowOn, Idle | Used) => (false, elapsed >= monitoring.delay_powon),
            (PowOff, PowOn | OffErr) => (true, true),
            (PowOff, Idle | Used) if elapsed < monitoring.max_wait_poweroff => (false, false),
            (PowOff, Idle | Used) => {
                warn!(node = %self.name, elapsed, "node was powered off, but it is still on");
                target = OnErr;
                (false, true)
            }
            (PowOff, Off) => (false, elapsed >= monitoring.delay_powoff),
            _ => (false, true),
        };

        if !accept && !force {
            return false;
        }

        if unexpected {
            warn!(node = %self.name, from = %self.state, to = %target, "node changed state unexpectedly");
        }

        let before = self.snapshot();
        let name = self.name.clone();

        if target.is_on() {
            if !self.state.is_on() {
                self.mark_powered_on(now);
                if unexpected {
                    self.ctx.fire(HookEvent::UnexpectedPowerOn { node: name.clone() });
                }
                self.ctx.fire(HookEvent::PoweredOn { node: name.clone() });
            } else if target == Idle {
                self.ctx.fire(HookEvent::Idle { node: name.clone() });
            } else {
                self.ctx.fire(HookEvent::Used { node: name.clone() });
            }
        }

        if target == Off && self.state != Off {
            self.mark_powered_off(now);
            if unexpected {
                self.ctx.fire(HookEvent::UnexpectedPowerOff { node: name.clone() });
            }
            self.ctx.fire(HookEvent::PoweredOff { node: name.clone() });
        }

        match target {
            OffErr => {
                self.power_on_failures += 1;
                debug!(node = %name, failures = self.power_on_failures, "failed to power on node");
                self.ctx.fire(HookEvent::OffErr {
                    node: name.clone(),
                    failures: self.power_on_failures,
                });
            }
            OnErr => {
                self.power_off_failures += 1;
                debug!(node = %name, failures = self.power_off_failures, "failed to power off node");
                self.ctx.fire(HookEvent::OnErr {
                    node: name.clone(),
                    failures: self.power_off_failures,
                });
            }
            Unknown => {
                debug!(node = %name, "node state is now unknown");
                self.ctx.fire(HookEvent::Unknown { node: name.clone() });
            }
            _ => {}
        }

        debug!(node = %name, from = %self.state, to = %target, forced = force && !accept, "node state changed");
        self.prev = before;
        self.state = target;
        self.timestamp_state = self.timestamp_state.max(now);
        true
    }

    /// The node as the platform last reported it.
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            slots_total: self.slots_total,
            slots_free: self.slots_free_observed,
            memory_total: self.memory_total,
            memory_free: self.memory_free_observed,
            state: self.state,
            attributes: self.attributes.clone(),
        }
    }

    /// Fold a fresh observation into the node. Returns
    /// `(info_updated, state_changed)`.
    pub fn update_info(&mut self, info: &NodeInfo) -> (bool, bool) {
        let mut info_updated = self.slots_total != info.slots_total
            || self.slots_free_observed != info.slots_free
            || self.memory_total != info.memory_total
            || self.memory_free_observed != info.memory_free
            || self.attributes != info.attributes;

        let state_changed = self.set_state(info.state, false);
        info_updated |= state_changed;

        self.slots_total = info.slots_total;
        self.slots_free = info.slots_free;
        self.slots_free_observed = info.slots_free;
        self.memory_total = info.memory_total;
        self.memory_free = info.memory_free;
        self.memory_free_observed = info.memory_free;
        self.attributes.clone_from(&info.attributes);

        if info_updated {
            self.timestamp_info = self.ctx.now();
        }
        (info_updated, state_changed)
    }

    /// Take one task's worth of capacity. No clamping: free values may go
    /// negative until the next observation.
    pub fn allocate(&mut self, resources: &ResourceDescriptor) {
        self.slots_free -= resources.slot_amount();
        self.memory_free -= resources.memory_amount();
    }

    pub fn deallocate(&mut self, resources: &ResourceDescriptor) {
        self.slots_free += resources.slot_amount();
        self.memory_free += resources.memory_amount();
    }

    /// Whether one more task described by `resources` fits right now.
    pub fn meets_resources(&self, resources: &ResourceDescriptor) -> bool {
        let infinite = self.ctx.config.monitoring.negative_resources_means_infinite;

        if !(infinite && self.slots_total < 0.0)
            && let Some(slots) = resources.slots
            && slots > self.slots_free
        {
            return false;
        }
        if !(infinite && self.memory_total < 0.0)
            && let Some(memory) = resources.memory
            && memory > self.memory_free
        {
            return false;
        }

        resources.constraints.iter().all(|c| c.matches(&self.attributes))
    }

    /// Bring a node out of an error or unknown state into a state it was
    /// previously observed in.
    pub fn recover(&mut self, previous: Option<NodeState>) -> CoreResult<bool> {
        if !matches!(self.state, NodeState::OffErr | NodeState::OnErr | NodeState::Unknown) {
            return Err(CoreError::NotRecoverable {
                node: self.name.clone(),
                state: self.state,
            });
        }
        let Some(previous) = previous else {
            return Err(CoreError::NoPriorState(self.name.clone()));
        };
        info!(node = %self.name, from = %self.state, to = %previous, "recovering node");
        Ok(self.set_state(previous, true))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (since {}) {}/{} slots {}/{} memory{}",
            self.name,
            self.state,
            self.timestamp_state,
            self.slots_free,
            self.slots_total,
            self.memory_free,
            self.memory_total,
            if self.enabled { "" } else { " disabled" }
        )
    }
}
