//! Agent types.

use crate::ids::{AgentId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub token: String,
    pub tags: Vec<String>,
    pub status: AgentStatus,
    /// Set only while the agent is busy.
    pub job_id: Option<JobId>,
    pub url: Option<String>,
    pub os: Os,
    pub resource: Option<Resource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            token: uuid::Uuid::new_v4().to_string(),
            tags,
            status: AgentStatus::Offline,
            job_id: None,
            url: None,
            os: Os::Unknown,
            resource: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the agent carries at least one of `tags`, or `tags` is empty.
    pub fn matches(&self, tags: &[String]) -> bool {
        tags.is_empty() || tags.iter().any(|t| self.tags.contains(t))
    }

    pub fn is_busy(&self) -> bool {
        self.status == AgentStatus::Busy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Offline,
    Idle,
    Busy,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Offline => "OFFLINE",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
        }
    }

    /// Decode the payload an agent writes into its coordination node.
    pub fn from_bytes(bytes: &[u8]) -> Option<AgentStatus> {
        std::str::from_utf8(bytes).ok()?.trim().parse().ok()
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFLINE" => Ok(AgentStatus::Offline),
            "IDLE" => Ok(AgentStatus::Idle),
            "BUSY" => Ok(AgentStatus::Busy),
            other => Err(crate::Error::Serialization(format!(
                "unknown agent status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Os {
    Linux,
    Macos,
    Windows,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub cpu: u32,
    pub total_memory_mb: u64,
    pub free_memory_mb: u64,
    pub total_disk_mb: u64,
    pub free_disk_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_matching() {
        let agent = Agent::new("a1", vec!["linux".to_string(), "docker".to_string()]);
        assert!(agent.matches(&[]));
        assert!(agent.matches(&["docker".to_string(), "gpu".to_string()]));
        assert!(!agent.matches(&["windows".to_string()]));
    }

    #[test]
    fn test_status_from_bytes() {
        assert_eq!(AgentStatus::from_bytes(b"IDLE"), Some(AgentStatus::Idle));
        assert_eq!(AgentStatus::from_bytes(b"BUSY\n"), Some(AgentStatus::Busy));
        assert_eq!(AgentStatus::from_bytes(b"???"), None);
    }
}
