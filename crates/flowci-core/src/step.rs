//! Executed command ("step") types.

use crate::cmd::CmdId;
use crate::ids::{FlowId, JobId};
use crate::tree::Node;
use crate::vars::Vars;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution record of one step tree node within one job.
///
/// The same type is used as the callback payload sent back by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedCmd {
    pub id: CmdId,
    pub flow_id: FlowId,
    /// Position of the node in the tree's ordered traversal.
    #[serde(default)]
    pub position: u32,
    pub status: StepStatus,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub process_id: Option<i32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Vars,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutedCmd {
    /// A fresh pending record for `node`.
    pub fn pending(job_id: JobId, flow_id: FlowId, node: &Node, position: u32) -> Self {
        Self {
            id: CmdId::new(job_id, node.path.clone()),
            flow_id,
            position,
            status: StepStatus::Pending,
            allow_failure: node.allow_failure,
            process_id: None,
            exit_code: None,
            output: Vars::new(),
            start_at: None,
            finish_at: None,
            error: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.id.job_id
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success() || (self.allow_failure && self.status.is_failure())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Exception,
    Killed,
    Timeout,
    Skipped,
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepStatus::Exception | StepStatus::Killed | StepStatus::Timeout
        )
    }

    /// Lifecycle rank; a step never moves to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Exception => "EXCEPTION",
            StepStatus::Killed => "KILLED",
            StepStatus::Timeout => "TIMEOUT",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "RUNNING" => Ok(StepStatus::Running),
            "SUCCESS" => Ok(StepStatus::Success),
            "EXCEPTION" => Ok(StepStatus::Exception),
            "KILLED" => Ok(StepStatus::Killed),
            "TIMEOUT" => Ok(StepStatus::Timeout),
            "SKIPPED" => Ok(StepStatus::Skipped),
            other => Err(crate::Error::Serialization(format!(
                "unknown step status '{}'",
                other
            ))),
        }
    }
}
