//! wattgrid-core — the cluster model shared by the scheduler and the daemon.
//!
//! Holds the node and request state machines, resource descriptors with
//! their constraint expressions, the configuration file format, and the
//! traits the control loop uses to reach the outside world.
//!
//! # Architecture
//!
//! ```text
//! Context (config + clock + hooks, injected once)
//!   ├── NodeList ── Node (power state machine, glitch recovery)
//!   │                 └── ResourceDescriptor ── Constraint (parsed Expr)
//!   ├── RequestQueue ── Request (request lifecycle)
//!   └── JobList ── Request keyed by job id
//!
//! PlatformSource  → node / job inventory (None = unavailable)
//! PowerController → power_on / power_off (may resolve another node)
//! Hooks           → fire-and-forget transition notifications
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod hooks;
pub mod node;
pub mod node_list;
pub mod platform;
pub mod request;
pub mod resources;

pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use config::WattgridConfig;
pub use context::Context;
pub use error::{CoreError, CoreResult};
pub use expr::{Expr, ExprError, Value};
pub use hooks::{HookEvent, Hooks, LogHooks, NoopHooks, RecordingHooks};
pub use node::{Node, NodeInfo, NodeState};
pub use node_list::NodeList;
pub use platform::{PlatformSource, PowerController};
pub use request::{JobInfo, JobList, Request, RequestId, RequestQueue, RequestState, next_request_id};
pub use resources::{Constraint, ResourceDescriptor, ResourceRequirement};
