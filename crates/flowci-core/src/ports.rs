//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduler and external adapters.

use crate::Result;
use crate::agent::{Agent, AgentStatus};
use crate::cmd::CmdId;
use crate::events::Event;
use crate::ids::*;
use crate::job::{Job, JobYml};
use crate::step::ExecutedCmd;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `job.status.*`, `agent.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Repository for jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job. Fails if the key is already taken.
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    async fn get_by_key(&self, key: &str) -> Result<Option<Job>>;

    async fn update(&self, job: &Job) -> Result<()>;
}

/// Repository for the flow definition snapshot of each job.
#[async_trait]
pub trait JobYmlRepository: Send + Sync {
    async fn create(&self, yml: &JobYml) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobYml>>;
}

/// Per-flow build number counter.
#[async_trait]
pub trait BuildNumberRepository: Send + Sync {
    /// Atomically increment and return the next build number of a flow.
    async fn increment(&self, flow_id: FlowId) -> Result<u64>;
}

/// Repository for executed commands.
#[async_trait]
pub trait StepRepository: Send + Sync {
    async fn insert_many(&self, steps: &[ExecutedCmd]) -> Result<()>;

    async fn get(&self, id: &CmdId) -> Result<Option<ExecutedCmd>>;

    /// Steps of a job ordered by position.
    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<ExecutedCmd>>;

    async fn update(&self, step: &ExecutedCmd) -> Result<()>;
}

/// Repository for agents.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn create(&self, agent: &Agent) -> Result<()>;

    async fn get(&self, id: AgentId) -> Result<Option<Agent>>;

    async fn list(&self) -> Result<Vec<Agent>>;

    /// Agents in `status` sharing at least one of `tags` (all when `tags` is empty).
    async fn find(&self, status: AgentStatus, tags: &[String]) -> Result<Vec<Agent>>;

    async fn update(&self, agent: &Agent) -> Result<()>;
}

/// Queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    #[default]
    Normal = 1,
    High = 2,
}

/// Acknowledges a delivered message.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// A message received from a queue.
pub struct Delivery {
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self { payload, acker }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of queue deliveries.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// At-least-once byte queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<()>;

    /// Consume a queue; higher priority messages are delivered first.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// Change observed under a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordEvent {
    ChildAdded(String),
    ChildRemoved(String),
    ChildUpdated(String),
    Reconnected,
}

pub type CoordEventStream = Pin<Box<dyn Stream<Item = CoordEvent> + Send>>;

/// Proof of holding a coordination lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub path: String,
    pub owner: String,
}

/// Distributed coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn create(&self, mode: CreateMode, path: &str, data: &[u8]) -> Result<()>;

    async fn set(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    /// Try to take the lock on `path`, waiting at most `wait`.
    /// Returns `None` when the lock could not be acquired in time.
    async fn acquire(&self, path: &str, wait: Duration) -> Result<Option<LockToken>>;

    async fn release(&self, token: LockToken) -> Result<()>;

    /// Watch direct children of `path`.
    async fn watch_children(&self, path: &str) -> Result<CoordEventStream>;
}
