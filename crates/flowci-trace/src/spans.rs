//! Span creation for scheduler operations.

use tracing::{Level, Span, span};

/// CI span attributes following OpenTelemetry semantic conventions.
#[derive(Debug, Default)]
pub struct CiAttributes {
    pub flow_id: Option<String>,
    pub flow_name: Option<String>,
    pub job_id: Option<String>,
    pub build_number: Option<u64>,
    pub trigger: Option<String>,
    pub step_path: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
}

impl CiAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.flow_id = Some(id.into());
        self.flow_name = Some(name.into());
        self
    }

    pub fn job(mut self, id: impl Into<String>, build_number: u64) -> Self {
        self.job_id = Some(id.into());
        self.build_number = Some(build_number);
        self
    }

    pub fn trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn step(mut self, path: impl Into<String>) -> Self {
        self.step_path = Some(path.into());
        self
    }

    pub fn agent(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self.agent_name = Some(name.into());
        self
    }
}

/// Create a span for work on a job.
pub fn job_span(attrs: &CiAttributes, operation: &str) -> Span {
    span!(
        Level::INFO,
        "job",
        operation = operation,
        ci.flow.id = attrs.flow_id.as_deref().unwrap_or(""),
        ci.flow.name = attrs.flow_name.as_deref().unwrap_or(""),
        ci.job.id = attrs.job_id.as_deref().unwrap_or(""),
        ci.job.build_number = attrs.build_number.unwrap_or(0),
        ci.job.trigger = attrs.trigger.as_deref().unwrap_or(""),
    )
}

/// Create a span for a step.
pub fn step_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "step",
        ci.job.id = attrs.job_id.as_deref().unwrap_or(""),
        ci.step.path = attrs.step_path.as_deref().unwrap_or(""),
        ci.agent.id = attrs.agent_id.as_deref().unwrap_or(""),
    )
}

/// Create a span for an agent operation.
pub fn agent_span(attrs: &CiAttributes, operation: &str) -> Span {
    span!(
        Level::INFO,
        "agent",
        operation = operation,
        ci.agent.id = attrs.agent_id.as_deref().unwrap_or(""),
        ci.agent.name = attrs.agent_name.as_deref().unwrap_or(""),
        ci.job.id = attrs.job_id.as_deref().unwrap_or(""),
    )
}
