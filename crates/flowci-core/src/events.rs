//! Notifications emitted on state transitions.

use crate::agent::AgentStatus;
use crate::ids::*;
use crate::job::{JobStatus, Trigger};
use crate::step::StepStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the flow.ci scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobCreated(JobCreatedPayload),
    JobStatusChanged(JobStatusChangedPayload),
    StepStatusChanged(StepStatusChangedPayload),
    AgentStatusChanged(AgentStatusChangedPayload),
}

impl Event {
    /// Returns the subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::JobCreated(p) => format!("job.created.{}", p.flow_id),
            Event::JobStatusChanged(p) => format!("job.status.{}", p.job_id),
            Event::StepStatusChanged(p) => format!("step.status.{}", p.job_id),
            Event::AgentStatusChanged(p) => format!("agent.status.{}", p.agent_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreatedPayload {
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub flow_name: String,
    pub build_number: u64,
    pub trigger: Trigger,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusChangedPayload {
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub build_number: u64,
    pub previous: JobStatus,
    pub status: JobStatus,
    pub message: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusChangedPayload {
    pub job_id: JobId,
    pub path: NodePath,
    pub previous: StepStatus,
    pub status: StepStatus,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusChangedPayload {
    pub agent_id: AgentId,
    pub name: String,
    pub previous: AgentStatus,
    pub status: AgentStatus,
    /// Job held by the agent at the moment of the change.
    pub job_id: Option<JobId>,
    pub changed_at: DateTime<Utc>,
}
