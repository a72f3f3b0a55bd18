//! wattgrid.toml configuration parser.
//!
//! Every key has a default, so an empty file is a valid configuration.
//! All durations are whole seconds.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, CoreResult};

/// Scheduler policies the pipeline knows how to build.
pub const KNOWN_POLICIES: &[&str] = &["requests", "reconsider_jobs", "idle_off", "free_capacity"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WattgridConfig {
    pub general: GeneralConfig,
    pub monitoring: MonitoringConfig,
    pub scheduling: SchedulingConfig,
    pub extra_capacity: ExtraCapacityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Seconds between "still alive" marks in the log.
    pub logger_mark: u64,
    /// Hosts that are never powered on or off automatically.
    pub disabled_hosts: Vec<String>,
    /// "text" or "json".
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            logger_mark: 1800,
            disabled_hosts: Vec::new(),
            log_format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitoringConfig {
    pub max_wait_poweron: u64,
    pub max_wait_poweroff: u64,
    pub period_monitoring_nodes: u64,
    /// 0 disables job monitoring.
    pub period_monitoring_jobs: u64,
    pub period_lifecycle: u64,
    pub nodes_fail_grace: u64,
    pub jobs_fail_grace: u64,
    /// Negative slot or memory totals mean "no limit".
    pub negative_resources_means_infinite: bool,
    pub delay_powon: u64,
    pub delay_powoff: u64,
    pub cooldown_served_jobs: u64,
    pub cooldown_served_requests: u64,
    /// 0 disables glitch detection.
    pub time_off_glitch_detection: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_wait_poweron: 300,
            max_wait_poweroff: 300,
            period_monitoring_nodes: 5,
            period_monitoring_jobs: 0,
            period_lifecycle: 5,
            nodes_fail_grace: 120,
            jobs_fail_grace: 120,
            negative_resources_means_infinite: true,
            delay_powon: 10,
            delay_powoff: 10,
            cooldown_served_jobs: 120,
            cooldown_served_requests: 120,
            time_off_glitch_detection: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    pub period_schedule: u64,
    /// 0 means no limit.
    pub max_booting_nodes: usize,
    pub retries_power_on: u32,
    pub retries_power_off: u32,
    pub period_recovery_nodes: u64,
    pub cooldown_nodes: u64,
    pub idle_time: u64,
    pub reconsider_job_time: u64,
    /// Scheduler policies, run in this order every pass.
    pub policies: Vec<String>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            period_schedule: 5,
            max_booting_nodes: 0,
            retries_power_on: 3,
            retries_power_off: 3,
            period_recovery_nodes: 30,
            cooldown_nodes: 0,
            idle_time: 1800,
            reconsider_job_time: 60,
            policies: KNOWN_POLICIES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtraCapacityConfig {
    pub slots_free: f64,
    pub nodes_free: u32,
    pub period: u64,
}

impl Default for ExtraCapacityConfig {
    fn default() -> Self {
        Self {
            slots_free: 0.0,
            nodes_free: 0,
            period: 30,
        }
    }
}

impl WattgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: WattgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the control loop cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        for policy in &self.scheduling.policies {
            if !KNOWN_POLICIES.contains(&policy.as_str()) {
                return Err(CoreError::Config(format!("unknown scheduler policy {policy:?}")));
            }
        }
        if self.general.disabled_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(CoreError::Config("disabled_hosts contains an empty name".to_string()));
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(CoreError::Config(format!(
                "log_format must be \"text\" or \"json\", got {:?}",
                self.general.log_format
            )));
        }
        Ok(())
    }

    pub fn is_disabled_host(&self, name: &str) -> bool {
        self.general.disabled_hosts.iter().any(|h| h == name)
    }
}
