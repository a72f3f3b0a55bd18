//! wattd — the wattgrid power-management control loop.
//!
//! Owns the cluster view, runs the scheduler pipeline on it every pass and
//! turns the pipeline's decisions into power commands.
//!
//! # Architecture
//!
//! ```text
//! Simulation::run / run_paced (drive time)
//!   └── Daemon::step ── Tasks (periodic: nodes, jobs, schedule, lifecycle, recovery)
//!         ├── monitor_nodes ── PlatformSource → NodeList (+ HostRegistry flags)
//!         ├── monitor_jobs  ── PlatformSource → JobList
//!         ├── schedule ── Pipeline (wattgrid-scheduler) → Candidates
//!         │                 └── power_off / power_on ── PowerController
//!         └── recover_nodes (OffErr → Off, OnErr → Idle)
//! ```

pub mod daemon;
pub mod error;
pub mod registry;
pub mod simulate;
pub mod tasks;

pub use daemon::{ClusterStatus, Daemon};
pub use error::{DaemonError, DaemonResult};
pub use registry::{HostRegistry, MemoryRegistry};
pub use simulate::{NodeReport, Simulation, SimulationReport};
