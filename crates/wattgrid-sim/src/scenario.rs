//! Simulation scenarios, loaded from TOML.
//!
//! ```toml
//! [[nodes]]
//! name = "wn"
//! count = 4          # wn00 .. wn03
//! cores = 4
//! memory = 8192
//!
//! [[jobs]]
//! at = 10
//! cores = 1
//! memory = 1024
//! seconds = 300
//! ```

use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::lrms::SimJob;
use crate::node::{NodePool, SimNode};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// One node, or `count` identical nodes named `{name}{00..}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default = "one")]
    pub count: u32,
    pub cores: f64,
    pub memory: f64,
    #[serde(default = "default_delay")]
    pub power_on_delay: u64,
    #[serde(default = "default_delay")]
    pub power_off_delay: u64,
    #[serde(default)]
    pub failing_power_ons: u32,
    /// Start powered on instead of off.
    #[serde(default)]
    pub on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    /// Submission time, in seconds from the start of the simulation.
    pub at: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub cores: f64,
    pub memory: f64,
    pub seconds: u64,
    #[serde(default = "one")]
    pub node_count: u32,
    /// Ask for capacity first and submit once the request is handled.
    #[serde(default = "yes")]
    pub request: bool,
}

fn one() -> u32 {
    1
}

fn yes() -> bool {
    true
}

fn default_delay() -> u64 {
    5
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.nodes.is_empty() {
            return Err(SimError::Scenario("no nodes defined".into()));
        }
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(SimError::Scenario("node with an empty name".into()));
            }
            if node.count == 0 {
                return Err(SimError::Scenario(format!("node {} has count 0", node.name)));
            }
        }
        if let Some(job) = self.jobs.iter().find(|j| j.node_count == 0) {
            return Err(SimError::Scenario(format!("job at {} needs 0 nodes", job.at)));
        }
        Ok(())
    }

    pub fn build_pool(&self) -> SimResult<NodePool> {
        let mut pool = NodePool::new();
        for spec in &self.nodes {
            for i in 0..spec.count {
                let name = if spec.count == 1 {
                    spec.name.clone()
                } else {
                    format!("{}{:02}", spec.name, i)
                };
                let mut node = SimNode::new(name, spec.cores, spec.memory)
                    .with_delays(spec.power_on_delay, spec.power_off_delay)
                    .with_failing_power_ons(spec.failing_power_ons);
                if spec.on {
                    node = node.powered_on();
                }
                pool.add(node)?;
            }
        }
        Ok(pool)
    }

    /// Jobs in submission order, named `job0001..` unless named explicitly.
    pub fn timeline(&self) -> Vec<(u64, SimJob, bool)> {
        let mut jobs: Vec<(u64, SimJob, bool)> = self
            .jobs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let name = spec.name.clone().unwrap_or_else(|| format!("job{:04}", i + 1));
                let job = SimJob::new(name, spec.cores, spec.memory, spec.seconds).with_node_count(spec.node_count);
                (spec.at, job, spec.request)
            })
            .collect();
        jobs.sort_by_key(|(at, _, _)| *at);
        jobs
    }

    /// Time of the last submission.
    pub fn last_submission(&self) -> u64 {
        self.jobs.iter().map(|j| j.at).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[[nodes]]
name = "wn"
count = 3
cores = 4
memory = 8192

[[nodes]]
name = "login"
cores = 2
memory = 2048
on = true

[[jobs]]
at = 30
cores = 1
memory = 512
seconds = 60

[[jobs]]
at = 10
name = "mpi"
cores = 2
memory = 1024
seconds = 120
node_count = 2
request = false
"#;

    #[test]
    fn parses_and_expands_nodes() {
        let scenario = Scenario::from_toml_str(SAMPLE).unwrap();
        let pool = scenario.build_pool().unwrap();
        let names: Vec<_> = pool.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["wn00", "wn01", "wn02", "login"]);
        assert_eq!(pool.get("login").unwrap().power, crate::node::Power::On);
        assert_eq!(pool.get("wn01").unwrap().power_on_delay, 5);
    }

    #[test]
    fn timeline_is_sorted_and_named() {
        let scenario = Scenario::from_toml_str(SAMPLE).unwrap();
        let timeline = scenario.timeline();
        assert_eq!(timeline[0].0, 10);
        assert_eq!(timeline[0].1.name, "mpi");
        assert_eq!(timeline[0].1.node_count, 2);
        assert!(!timeline[0].2);
        assert_eq!(timeline[1].1.name, "job0001");
        assert!(timeline[1].2);
        assert_eq!(scenario.last_submission(), 30);
    }

    #[test]
    fn empty_scenario_is_rejected() {
        assert!(Scenario::from_toml_str("").is_err());
        let zero = "[[nodes]]\nname = \"wn\"\ncount = 0\ncores = 1\nmemory = 1\n";
        assert!(Scenario::from_toml_str(zero).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let scenario = Scenario::from_file(file.path()).unwrap();
        assert_eq!(scenario.jobs.len(), 2);
    }
}
