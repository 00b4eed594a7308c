//! Flow and flow definition types.
//!
//! A flow owns a user-authored YAML definition such as:
//!
//! ```yaml
//! envs:
//!   GREETING: hello
//! selector:
//!   label: [linux]
//! steps:
//!   - name: build
//!     script: cargo build
//!   - name: test
//!     condition: ${{ FLOWCI_GIT_BRANCH }} == main
//!     allow_failure: true
//!     script: cargo test
//!   - name: cleanup
//!     final: true
//!     script: rm -rf target
//! ```

use crate::ids::FlowId;
use crate::vars::Vars;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named build pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    /// Flow-level variables, merged into every job's context.
    #[serde(default)]
    pub variables: Vars,
    pub created_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: FlowId::new(),
            name: name.into(),
            variables: Vars::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub envs: Vars,
    #[serde(default)]
    pub selector: Option<Selector>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub label: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub envs: Vars,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub allow_failure: Option<bool>,
    #[serde(default, rename = "final")]
    pub is_final: Option<bool>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl FlowDefinition {
    pub fn from_yaml(raw: &str) -> crate::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }
}
