//! Health of the NATS connection.

use crate::metrics::MetricsSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Connected, but writes have failed.
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub connected: bool,
    pub reconnects: u64,
    pub events_published: u64,
    pub messages_sent: u64,
    pub failures: u64,
}

impl HealthCheck {
    pub fn from_snapshot(snapshot: &MetricsSnapshot, connected: bool) -> Self {
        let failures = snapshot.failures();
        let status = if !connected {
            HealthStatus::Unhealthy {
                reason: "Not connected to NATS".to_string(),
            }
        } else if failures > 0 {
            HealthStatus::Degraded {
                reason: format!("{} failed writes recorded", failures),
            }
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            connected,
            reconnects: snapshot.reconnects,
            events_published: snapshot.events_published,
            messages_sent: snapshot.messages_sent,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_snapshot() {
        let mut snapshot = MetricsSnapshot::default();
        assert!(HealthCheck::from_snapshot(&snapshot, true).status.is_healthy());

        snapshot.send_failures = 2;
        let check = HealthCheck::from_snapshot(&snapshot, true);
        assert!(!check.status.is_healthy());
        assert!(check.status.is_operational());
        assert_eq!(check.failures, 2);

        let check = HealthCheck::from_snapshot(&MetricsSnapshot::default(), false);
        assert!(!check.status.is_operational());
    }
}
