//! Requests for capacity, and the jobs they track.
//!
//! A [`Request`] is created either by an administrator or from a job the
//! batch system reports. The [`RequestQueue`] is served strictly in
//! arrival order; the [`JobList`] mirrors the batch system's view and is
//! keyed by job id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::resources::ResourceRequirement;

pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out the next request id. Ids are unique within the process and
/// strictly increasing.
pub fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting for resources.
    Pending,
    /// Resources are being brought up.
    Attended,
    /// Resources are available.
    Served,
    /// Could be served, but held behind an earlier request.
    Blocked,
    /// Nothing can satisfy it and nothing is on the way.
    NotServed,
    /// The tracked job vanished before it was resolved.
    #[serde(rename = "dissapeared", alias = "disappeared")]
    Disappeared,
    /// Abandoned after repeated failures.
    Discarded,
    /// Not initialised yet.
    Unknown,
}

impl RequestState {
    /// States after which a request is only kept around for its cooldown.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Served | RequestState::NotServed | RequestState::Disappeared
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Pending => "pending",
            RequestState::Attended => "attended",
            RequestState::Served => "served",
            RequestState::Blocked => "blocked",
            RequestState::NotServed => "not_served",
            RequestState::Disappeared => "dissapeared",
            RequestState::Discarded => "discarded",
            RequestState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One job as reported by the batch system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub requirement: ResourceRequirement,
    #[serde(default)]
    pub node_ids: Vec<String>,
    pub state: RequestState,
}

impl JobInfo {
    pub fn new(job_id: impl Into<String>, requirement: ResourceRequirement, state: RequestState) -> Self {
        Self {
            job_id: job_id.into(),
            requirement,
            node_ids: Vec::new(),
            state,
        }
    }
}

/// A unit of demand.
#[derive(Clone, Serialize)]
pub struct Request {
    pub id: RequestId,
    pub requirement: ResourceRequirement,
    pub job_id: Option<String>,
    pub job_node_ids: Vec<String>,
    state: RequestState,
    pub timestamp_created: u64,
    pub timestamp_state: u64,
    pub timestamp_attended: u64,
    pub attended_retries: u32,
    #[serde(skip)]
    clock: Arc<dyn Clock>,
}

impl Request {
    pub fn new(requirement: ResourceRequirement, clock: Arc<dyn Clock>) -> Self {
        Self::with_id(next_request_id(), requirement, clock)
    }

    pub fn with_id(id: RequestId, requirement: ResourceRequirement, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            id,
            requirement,
            job_id: None,
            job_node_ids: Vec::new(),
            state: RequestState::Pending,
            timestamp_created: now,
            timestamp_state: now,
            timestamp_attended: 0,
            attended_retries: 0,
            clock,
        }
    }

    /// Link the request to a batch-system job.
    pub fn for_job(mut self, job_id: impl Into<String>, node_ids: Vec<String>) -> Self {
        self.job_id = Some(job_id.into());
        self.job_node_ids = node_ids;
        self
    }

    /// Tracker for an observed job, in the job's reported state.
    pub fn from_job_info(info: &JobInfo, clock: Arc<dyn Clock>) -> Self {
        let mut req = Self::new(info.requirement.clone(), clock)
            .for_job(info.job_id.clone(), info.node_ids.clone());
        req.state = RequestState::Unknown;
        req.set_state(info.state);
        req
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Returns whether the state changed. Entering `Attended` stamps the
    /// attention time and counts the attempt.
    pub fn set_state(&mut self, state: RequestState) -> bool {
        if self.state == state {
            return false;
        }
        let now = self.clock.now();
        debug!(request = self.id, from = %self.state, to = %state, "request state changed");
        self.state = state;
        self.timestamp_state = self.timestamp_state.max(now);
        if state == RequestState::Attended {
            self.timestamp_attended = self.timestamp_state;
            self.attended_retries += 1;
        }
        true
    }

    /// Take over the resources, linkage and state of another request.
    pub fn update(&mut self, other: &Request) {
        self.requirement = other.requirement.clone();
        self.set_state(other.state);
        self.job_id.clone_from(&other.job_id);
        self.job_node_ids.clone_from(&other.job_node_ids);
    }

    /// Take over a fresh observation of the tracked job.
    pub fn update_info(&mut self, info: &JobInfo) {
        self.requirement = info.requirement.clone();
        self.set_state(info.state);
        self.job_id = Some(info.job_id.clone());
        self.job_node_ids.clone_from(&info.node_ids);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("requirement", &self.requirement)
            .field("job_id", &self.job_id)
            .field("state", &self.state)
            .field("timestamp_state", &self.timestamp_state)
            .field("attended_retries", &self.attended_retries)
            .finish()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {} {} @{}: {}", self.id, self.state, self.timestamp_state, self.requirement)?;
        if let Some(job) = &self.job_id {
            write!(f, " (job {job})")?;
        }
        Ok(())
    }
}

// ── Request queue ──────────────────────────────────────────────────

/// Live requests in arrival order.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    order: Vec<RequestId>,
    requests: HashMap<RequestId, Request>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, request: Request) -> CoreResult<()> {
        if self.requests.contains_key(&request.id) {
            return Err(CoreError::DuplicateId(request.id));
        }
        self.order.push(request.id);
        self.requests.insert(request.id, request);
        Ok(())
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        let req = self.requests.remove(&id)?;
        self.order.retain(|&r| r != id);
        Some(req)
    }

    /// Snapshot of the ids in queue order; safe to hold while the queue
    /// is modified.
    pub fn ids(&self) -> Vec<RequestId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.order.iter().filter_map(|id| self.requests.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ── Job list ───────────────────────────────────────────────────────

/// Trackers for the jobs the batch system reports, keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct JobList {
    order: Vec<String>,
    jobs: HashMap<String, Request>,
}

impl JobList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_job_infos(infos: &[JobInfo], clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let mut list = Self::new();
        for info in infos {
            list.append(Request::from_job_info(info, clock.clone()))?;
        }
        Ok(list)
    }

    pub fn append(&mut self, job: Request) -> CoreResult<()> {
        let Some(job_id) = job.job_id.clone() else {
            return Err(CoreError::NotAJob(job.id));
        };
        if self.jobs.contains_key(&job_id) {
            return Err(CoreError::DuplicateJob(job_id));
        }
        self.order.push(job_id.clone());
        self.jobs.insert(job_id, job);
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<&Request> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut Request> {
        self.jobs.get_mut(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn remove(&mut self, job_id: &str) -> Option<Request> {
        let job = self.jobs.remove(job_id)?;
        self.order.retain(|j| j != job_id);
        Some(job)
    }

    /// Job ids in arrival order, optionally only those in `state`.
    pub fn ids(&self, state: Option<RequestState>) -> Vec<String> {
        self.order
            .iter()
            .filter(|j| state.is_none_or(|s| self.jobs.get(*j).is_some_and(|job| job.state == s)))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.order.iter().filter_map(|j| self.jobs.get(j))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resources::ResourceDescriptor;

    fn requirement(slots: f64) -> ResourceRequirement {
        ResourceRequirement::single(ResourceDescriptor::new(Some(slots), None))
    }

    #[test]
    fn ids_are_increasing() {
        let clock = Arc::new(ManualClock::new(0));
        let a = Request::new(requirement(1.0), clock.clone());
        let b = Request::new(requirement(1.0), clock);
        assert!(b.id > a.id);
    }

    #[test]
    fn attended_stamps_and_counts() {
        let clock = Arc::new(ManualClock::new(100));
        let mut req = Request::with_id(1, requirement(1.0), clock.clone());
        assert_eq!(req.state(), RequestState::Pending);
        assert!(!req.set_state(RequestState::Pending));

        clock.set(110);
        assert!(req.set_state(RequestState::Attended));
        assert_eq!(req.timestamp_state, 110);
        assert_eq!(req.timestamp_attended, 110);
        assert_eq!(req.attended_retries, 1);

        clock.set(120);
        req.set_state(RequestState::Pending);
        req.set_state(RequestState::Attended);
        assert_eq!(req.attended_retries, 2);
        assert_eq!(req.timestamp_attended, 120);
    }

    #[test]
    fn queue_rejects_duplicates_and_keeps_order() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let mut queue = RequestQueue::new();
        queue.append(Request::with_id(7, requirement(1.0), clock.clone())).unwrap();
        queue.append(Request::with_id(3, requirement(2.0), clock.clone())).unwrap();
        queue.append(Request::with_id(5, requirement(3.0), clock.clone())).unwrap();

        let err = queue.append(Request::with_id(3, requirement(1.0), clock)).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateId(3)));

        assert_eq!(queue.ids(), vec![7, 3, 5]);
        assert!(queue.remove(3).is_some());
        assert!(queue.remove(3).is_none());
        assert_eq!(queue.ids(), vec![7, 5]);
        assert_eq!(queue.iter().map(|r| r.id).collect::<Vec<_>>(), vec![7, 5]);
    }

    #[test]
    fn job_tracker_follows_observations() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(50));
        let info = JobInfo::new("job.1", requirement(2.0), RequestState::Pending);
        let mut job = Request::from_job_info(&info, clock);
        assert_eq!(job.state(), RequestState::Pending);
        assert_eq!(job.job_id.as_deref(), Some("job.1"));

        let mut running = info.clone();
        running.state = RequestState::Served;
        running.node_ids = vec!["wn0".to_string()];
        job.update_info(&running);
        assert_eq!(job.state(), RequestState::Served);
        assert_eq!(job.job_node_ids, vec!["wn0"]);
    }

    #[test]
    fn update_copies_linkage() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let mut a = Request::with_id(1, requirement(1.0), clock.clone());
        let mut b = Request::with_id(2, requirement(4.0), clock).for_job("j", vec![]);
        b.set_state(RequestState::Blocked);
        a.update(&b);
        assert_eq!(a.id, 1);
        assert_eq!(a.state(), RequestState::Blocked);
        assert_eq!(a.job_id.as_deref(), Some("j"));
        assert_eq!(a.requirement.resources.slots, Some(4.0));
    }

    #[test]
    fn job_list_requires_job_ids() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let mut jobs = JobList::new();
        assert!(matches!(
            jobs.append(Request::with_id(9, requirement(1.0), clock.clone())),
            Err(CoreError::NotAJob(9))
        ));

        let infos = vec![
            JobInfo::new("a", requirement(1.0), RequestState::Pending),
            JobInfo::new("b", requirement(1.0), RequestState::Attended),
        ];
        let mut jobs = JobList::from_job_infos(&infos, clock.clone()).unwrap();
        assert_eq!(jobs.ids(None), vec!["a", "b"]);
        assert_eq!(jobs.ids(Some(RequestState::Attended)), vec!["b"]);
        assert!(matches!(
            jobs.append(Request::from_job_info(&infos[0], clock)),
            Err(CoreError::DuplicateJob(_))
        ));
        jobs.remove("a");
        assert_eq!(jobs.ids(None), vec!["b"]);
    }

    #[test]
    fn state_names_match_wire_format() {
        assert_eq!(
            serde_json::to_string(&RequestState::Disappeared).unwrap(),
            "\"dissapeared\""
        );
        let parsed: RequestState = serde_json::from_str("\"not_served\"").unwrap();
        assert_eq!(parsed, RequestState::NotServed);
    }
}
