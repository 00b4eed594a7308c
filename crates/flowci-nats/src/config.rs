//! Configuration for the NATS adapters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection and resource settings shared by the event bus, the queue and
/// the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URLs, all members of one cluster.
    pub urls: Vec<String>,
    /// Unlimited when unset.
    pub max_reconnect_attempts: Option<usize>,
    pub connection_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Stream holding domain events.
    pub events_stream: String,
    /// Event retention.
    pub events_max_age_secs: u64,
    /// Work-queue stream backing every named queue.
    pub queue_stream: String,
    /// Redelivery attempts of an unacknowledged queue message.
    pub max_deliver: i64,
    pub ack_wait_secs: u64,
    /// Prefix of the KV buckets used for coordination.
    pub coord_bucket: String,
    /// Lifetime of an ephemeral node that is no longer refreshed.
    pub session_ttl_secs: u64,
    /// Lifetime of a lock whose holder vanished.
    pub lock_ttl_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            max_reconnect_attempts: None,
            connection_timeout_secs: 10,
            request_timeout_secs: 5,
            events_stream: "FLOWCI_EVENTS".to_string(),
            events_max_age_secs: 86400 * 7,
            queue_stream: "FLOWCI_QUEUES".to_string(),
            max_deliver: 5,
            ack_wait_secs: 60,
            coord_bucket: "flowci-coord".to_string(),
            session_ttl_secs: 15,
            lock_ttl_secs: 60,
        }
    }
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    /// Use a distinct set of streams and buckets, e.g. one per test.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        let upper = namespace.to_uppercase().replace('-', "_");
        self.events_stream = format!("{}_EVENTS", upper);
        self.queue_stream = format!("{}_QUEUES", upper);
        self.coord_bucket = format!("{}-coord", namespace.to_lowercase());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl_secs = ttl.as_secs().max(1);
        self
    }

    pub fn with_max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn events_max_age(&self) -> Duration {
        Duration::from_secs(self.events_max_age_secs)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Bucket of persistent nodes.
    pub fn nodes_bucket(&self) -> String {
        self.coord_bucket.clone()
    }

    /// Bucket of ephemeral nodes, expiring after the session ttl.
    pub fn sessions_bucket(&self) -> String {
        format!("{}-sessions", self.coord_bucket)
    }

    pub fn locks_bucket(&self) -> String {
        format!("{}-locks", self.coord_bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_renames_resources() {
        let config = NatsConfig::new("nats://nats:4222").with_namespace("ci-test");

        assert_eq!(config.events_stream, "CI_TEST_EVENTS");
        assert_eq!(config.queue_stream, "CI_TEST_QUEUES");
        assert_eq!(config.nodes_bucket(), "ci-test-coord");
        assert_eq!(config.sessions_bucket(), "ci-test-coord-sessions");
        assert_eq!(config.locks_bucket(), "ci-test-coord-locks");
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"urls": ["nats://a:4222", "nats://b:4222"], "max_deliver": 2}"#)
                .unwrap();

        assert_eq!(config.urls.len(), 2);
        assert_eq!(config.max_deliver, 2);
        assert_eq!(config.queue_stream, "FLOWCI_QUEUES");
        assert_eq!(config.session_ttl(), Duration::from_secs(15));
    }
}
