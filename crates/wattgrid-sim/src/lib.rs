//! wattgrid-sim — a simulated data center to run the control loop against.
//!
//! Models machines that take time to power on and off (and sometimes fail
//! to), a FIFO batch system that only runs jobs on powered-on nodes, and
//! TOML scenarios describing the hardware and the submitted workload.
//!
//! # Architecture
//!
//! ```text
//! Scenario (TOML) ──build_pool──→ NodePool ── SimNode (power transitions)
//!                 ──timeline───→ SimJob submissions
//!
//! DataCenter (pool + FifoLrms behind one lock, shared clock)
//!   ├── impl PlatformSource  → node / job inventories
//!   └── impl PowerController → start power transitions
//! ```

pub mod datacenter;
pub mod error;
pub mod lrms;
pub mod node;
pub mod scenario;

pub use datacenter::DataCenter;
pub use error::{SimError, SimResult};
pub use lrms::{FifoLrms, JobState, SimJob};
pub use node::{NodePool, Power, SimNode};
pub use scenario::{JobSpec, NodeSpec, Scenario};
