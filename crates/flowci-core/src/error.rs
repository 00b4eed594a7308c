//! Error types for flow.ci.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job yml not found for job: {0}")]
    JobYmlNotFound(String),

    #[error("Job {job} is {actual}, expected {expected}")]
    StatusConflict {
        job: String,
        expected: String,
        actual: String,
    },

    // Flow errors
    #[error("Invalid flow definition: {0}")]
    InvalidFlow(String),

    #[error("Invalid node path: {0}")]
    InvalidPath(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Step errors
    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("Condition failed: {0}")]
    Condition(String),

    // Agent errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::JobNotFound(_)
                | Error::JobYmlNotFound(_)
                | Error::NodeNotFound(_)
                | Error::StepNotFound(_)
                | Error::AgentNotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidFlow(err.to_string())
    }
}
