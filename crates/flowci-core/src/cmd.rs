//! Commands sent to agents and the ids that tie callbacks back to them.

use crate::ids::{FlowId, JobId, NodePath};
use crate::vars::Vars;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one node execution of one job. Rendered as `job_<uuid>#<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CmdId {
    pub job_id: JobId,
    pub path: NodePath,
}

impl CmdId {
    const SEPARATOR: char = '#';

    pub fn new(job_id: JobId, path: NodePath) -> Self {
        Self { job_id, path }
    }
}

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.job_id, Self::SEPARATOR, self.path)
    }
}

impl FromStr for CmdId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (job, path) = s
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| Error::InvalidCallback(format!("malformed cmd id '{}'", s)))?;
        let job_id = job
            .parse::<JobId>()
            .map_err(|e| Error::InvalidCallback(format!("bad job id in '{}': {}", s, e)))?;
        let path = NodePath::parse(path)
            .map_err(|_| Error::InvalidCallback(format!("bad node path in '{}'", s)))?;
        Ok(Self { job_id, path })
    }
}

impl TryFrom<String> for CmdId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CmdId> for String {
    fn from(id: CmdId) -> Self {
        id.to_string()
    }
}

/// Command delivered to an agent's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CmdIn {
    Shell(ShellIn),
    Kill(KillIn),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellIn {
    /// Callback id the agent must echo back.
    pub id: CmdId,
    pub flow_id: FlowId,
    pub job_id: JobId,
    pub step_name: String,
    pub scripts: Vec<String>,
    pub inputs: Vars,
    /// Prefixes of environment variables to capture as step output.
    pub env_filters: Vec<String>,
    pub workdir: Option<String>,
    pub timeout_secs: u64,
    pub allow_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillIn {
    pub job_id: JobId,
}
