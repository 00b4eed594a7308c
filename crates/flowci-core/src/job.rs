//! Job and execution types.

use crate::ids::{AgentId, FlowId, JobId, NodePath};
use crate::step::StepStatus;
use crate::vars::{self, Vars};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One build run of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// `{flow_id}-{build_number}`, unique.
    pub key: String,
    pub flow_id: FlowId,
    pub flow_name: String,
    pub build_number: u64,
    pub trigger: Trigger,
    pub status: JobStatus,
    pub current_path: NodePath,
    pub agent_id: Option<AgentId>,
    pub context: Vars,
    pub message: Option<String>,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn key_of(flow_id: FlowId, build_number: u64) -> String {
        format!("{}-{}", flow_id, build_number)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }

    /// Outcome recorded in the context by the steps executed so far.
    pub fn status_from_context(&self) -> Option<JobStatus> {
        self.context
            .get(vars::JOB_STATUS)
            .and_then(|s| s.parse().ok())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Timeout | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// Job outcome implied by a finished step.
    pub fn from_step(status: StepStatus, allow_failure: bool) -> JobStatus {
        match status {
            StepStatus::Success | StepStatus::Skipped => JobStatus::Success,
            StepStatus::Killed => JobStatus::Cancelled,
            _ if allow_failure => JobStatus::Success,
            StepStatus::Timeout => JobStatus::Timeout,
            StepStatus::Exception | StepStatus::Pending | StepStatus::Running => {
                JobStatus::Failure
            }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILURE" => Ok(JobStatus::Failure),
            "TIMEOUT" => Ok(JobStatus::Timeout),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(crate::Error::Serialization(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduler,
    Api,
    Manual,
    GitPush,
    GitPr,
    GitTag,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduler => "scheduler",
            Trigger::Api => "api",
            Trigger::Manual => "manual",
            Trigger::GitPush => "git_push",
            Trigger::GitPr => "git_pr",
            Trigger::GitTag => "git_tag",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(Trigger::Scheduler),
            "api" => Ok(Trigger::Api),
            "manual" => Ok(Trigger::Manual),
            "git_push" => Ok(Trigger::GitPush),
            "git_pr" => Ok(Trigger::GitPr),
            "git_tag" => Ok(Trigger::GitTag),
            other => Err(crate::Error::Serialization(format!(
                "unknown trigger '{}'",
                other
            ))),
        }
    }
}

/// Raw flow definition captured when the job was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobYml {
    pub job_id: JobId,
    pub raw: String,
    pub created_at: DateTime<Utc>,
}
