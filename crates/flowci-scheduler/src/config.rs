//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Queue consumed by the job handler.
    pub job_queue: String,
    /// Queue agents post step results to.
    pub callback_queue: String,
    /// Agent command queues are `{prefix}.{agent_id}`.
    pub agent_queue_prefix: String,
    /// Coordination path holding one liveness node per agent.
    pub agent_root: String,
    /// Delay before a job without a free agent is re-submitted.
    #[serde(with = "seconds")]
    pub retry_delay: Duration,
    /// Upper bound on waiting for an agent lock.
    #[serde(with = "seconds")]
    pub lock_wait: Duration,
    /// Wall-clock limit for a step condition.
    #[serde(with = "seconds")]
    pub condition_timeout: Duration,
    /// Lifetime of a job before it times out if never dispatched.
    #[serde(with = "seconds")]
    pub job_expire: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_queue: "flowci.jobs".to_string(),
            callback_queue: "flowci.callbacks".to_string(),
            agent_queue_prefix: "flowci.agent".to_string(),
            agent_root: "/flowci-agents".to_string(),
            retry_delay: Duration::from_secs(30),
            lock_wait: Duration::from_secs(10),
            condition_timeout: Duration::from_secs(5),
            job_expire: Duration::from_secs(1800),
        }
    }
}

impl SchedulerConfig {
    pub fn with_queues(
        mut self,
        job_queue: impl Into<String>,
        callback_queue: impl Into<String>,
    ) -> Self {
        self.job_queue = job_queue.into();
        self.callback_queue = callback_queue.into();
        self
    }

    pub fn with_agent_root(mut self, root: impl Into<String>) -> Self {
        self.agent_root = root.into();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_condition_timeout(mut self, timeout: Duration) -> Self {
        self.condition_timeout = timeout;
        self
    }

    pub fn with_job_expire(mut self, expire: Duration) -> Self {
        self.job_expire = expire;
        self
    }

    /// Command queue of one agent.
    pub fn agent_queue(&self, agent_id: impl std::fmt::Display) -> String {
        format!("{}.{}", self.agent_queue_prefix, agent_id)
    }
}

/// Durations as (fractional) seconds.
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.retry_delay, Duration::from_secs(30));
        assert_eq!(config.condition_timeout, Duration::from_secs(5));
        assert_eq!(config.agent_queue("agt_1"), "flowci.agent.agt_1");
    }

    #[test]
    fn test_partial_override() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"retry_delay": 2.5, "job_queue": "jobs"}"#).unwrap();
        assert_eq!(config.retry_delay, Duration::from_millis(2500));
        assert_eq!(config.job_queue, "jobs");
        assert_eq!(config.lock_wait, Duration::from_secs(10));
    }
}
