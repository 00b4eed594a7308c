//! Job scheduling and step dispatch for flow.ci.
//!
//! [`JobScheduler`] drives a job from creation to a terminal status: it locks
//! an agent through [`AgentRegistry`], walks the job's step tree one node at
//! a time, sends each node through [`DispatchGateway`] and reconciles agent
//! callbacks. Jobs that find no free agent are re-submitted by
//! [`RetryCoordinator`].

pub mod agents;
pub mod condition;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod retry;
pub mod scheduler;
pub mod steps;
pub mod trees;

pub use agents::AgentRegistry;
pub use condition::{ConditionError, ConditionEvaluator};
pub use config::SchedulerConfig;
pub use consumer::Workers;
pub use dispatch::DispatchGateway;
pub use retry::{Resubmit, RetryCoordinator};
pub use scheduler::{Backends, JobScheduler};
pub use steps::StepTracker;
pub use trees::TreeManager;
