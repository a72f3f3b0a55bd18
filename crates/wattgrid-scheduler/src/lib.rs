//! wattgrid-scheduler — decides which nodes to power on and off.
//!
//! Each pass takes the live request queue and a monitoring snapshot and
//! runs an ordered list of policies over them. Every policy adds to one
//! shared [`Candidates`] value:
//!
//! - `requests`: matches queued requests against nodes in widening tiers
//!   and books capacity for the ones in flight
//! - `reconsider_jobs`: re-queues jobs the batch system has kept pending
//!   for too long
//! - `idle_off`: proposes nodes that have been idle for too long
//! - `free_capacity`: keeps a configured number of free slots and nodes
//!
//! # Architecture
//!
//! ```text
//! Pipeline
//!   ├── RequestMatcher ── BookingSystem (reservations across passes)
//!   ├── ReconsiderJobs
//!   ├── IdleOff
//!   └── FreeCapacity
//!        │
//!        ▼
//!   Candidates { on: node → requests, off: nodes }
//! ```

pub mod booking;
pub mod candidates;
pub mod error;
pub mod free_capacity;
pub mod idle;
pub mod matcher;
pub mod monitoring;
pub mod pipeline;
pub mod reconsider;

#[cfg(test)]
mod test_support;

pub use booking::{BookingInfo, BookingSystem};
pub use candidates::Candidates;
pub use error::{SchedulerError, SchedulerResult};
pub use free_capacity::FreeCapacity;
pub use idle::IdleOff;
pub use matcher::RequestMatcher;
pub use monitoring::MonitoringInfo;
pub use pipeline::{Pipeline, SchedulerPolicy, build_policy};
pub use reconsider::ReconsiderJobs;
