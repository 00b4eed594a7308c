//! Job state machine.
//!
//! ```text
//! PENDING -> QUEUED -> RUNNING -> SUCCESS | FAILURE | TIMEOUT | CANCELLED
//! ```
//!
//! A job is only mutated by the consumer handling its current queue message
//! or by the agent-offline listener. Stale and duplicate callbacks are
//! rejected by comparing their node path with `Job::current_path`.

use crate::agents::AgentRegistry;
use crate::condition::ConditionEvaluator;
use crate::config::SchedulerConfig;
use crate::dispatch::DispatchGateway;
use crate::retry::{Resubmit, RetryCoordinator};
use crate::steps::StepTracker;
use crate::trees::TreeManager;

use async_trait::async_trait;
use chrono::Utc;
use flowci_core::agent::AgentStatus;
use flowci_core::events::{
    AgentStatusChangedPayload, Event, JobCreatedPayload, JobStatusChangedPayload,
};
use flowci_core::flow::Flow;
use flowci_core::ids::{AgentId, JobId, NodePath};
use flowci_core::job::{Job, JobStatus, JobYml, Trigger};
use flowci_core::ports::{
    AgentRepository, BuildNumberRepository, Coordinator, EventBus, JobRepository,
    JobYmlRepository, MessageQueue, Priority, StepRepository,
};
use flowci_core::step::{ExecutedCmd, StepStatus};
use flowci_core::tree::{Node, StepTree};
use flowci_core::vars::{self, Vars};
use flowci_core::{Error, Result};
use flowci_trace::{CiAttributes, job_span, step_span};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, warn};

/// Message shown on jobs cancelled because their agent disappeared.
pub const AGENT_OFFLINE_MESSAGE: &str = "Agent unexpected offline";

/// Storage and transport the scheduler runs on.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobRepository>,
    pub job_ymls: Arc<dyn JobYmlRepository>,
    pub build_numbers: Arc<dyn BuildNumberRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub queue: Arc<dyn MessageQueue>,
    pub coordinator: Arc<dyn Coordinator>,
    pub events: Arc<dyn EventBus>,
}

/// The central scheduler service.
pub struct JobScheduler {
    config: SchedulerConfig,
    jobs: Arc<dyn JobRepository>,
    job_ymls: Arc<dyn JobYmlRepository>,
    build_numbers: Arc<dyn BuildNumberRepository>,
    queue: Arc<dyn MessageQueue>,
    events: Arc<dyn EventBus>,
    agents: Arc<AgentRegistry>,
    steps: Arc<StepTracker>,
    trees: TreeManager,
    conditions: ConditionEvaluator,
    gateway: DispatchGateway,
    retry: Arc<RetryCoordinator>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig, backends: Backends) -> Self {
        let agents = Arc::new(AgentRegistry::new(
            backends.agents,
            backends.coordinator,
            backends.events.clone(),
            config.agent_root.clone(),
            config.lock_wait,
        ));
        let steps = Arc::new(StepTracker::new(backends.steps, backends.events.clone()));
        let gateway = DispatchGateway::new(
            backends.queue.clone(),
            steps.clone(),
            config.agent_queue_prefix.clone(),
        );

        Self {
            trees: TreeManager::new(backends.job_ymls.clone()),
            conditions: ConditionEvaluator::new(config.condition_timeout),
            retry: Arc::new(RetryCoordinator::new(config.retry_delay)),
            jobs: backends.jobs,
            job_ymls: backends.job_ymls,
            build_numbers: backends.build_numbers,
            queue: backends.queue,
            events: backends.events,
            agents,
            steps,
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn steps(&self) -> &Arc<StepTracker> {
        &self.steps
    }

    pub fn retry(&self) -> &Arc<RetryCoordinator> {
        &self.retry
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Create a PENDING job from a flow and its yml.
    pub async fn create(
        &self,
        flow: &Flow,
        yml: &str,
        trigger: Trigger,
        inputs: &Vars,
    ) -> Result<Job> {
        let tree = Arc::new(StepTree::parse(yml)?);
        let build_number = self.build_numbers.increment(flow.id).await?;

        let mut context = flow.variables.clone();
        context.insert(vars::FLOW_NAME.to_string(), flow.name.clone());
        context.insert(vars::JOB_BUILD_NUMBER.to_string(), build_number.to_string());
        context.insert(vars::JOB_TRIGGER.to_string(), trigger.to_string());
        context.insert(vars::JOB_STATUS.to_string(), JobStatus::Pending.to_string());
        vars::merge(&mut context, inputs);

        let now = Utc::now();
        let expire = chrono::Duration::from_std(self.config.job_expire)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let job = Job {
            id: JobId::new(),
            key: Job::key_of(flow.id, build_number),
            flow_id: flow.id,
            flow_name: flow.name.clone(),
            build_number,
            trigger,
            status: JobStatus::Pending,
            current_path: NodePath::root(),
            agent_id: None,
            context,
            message: None,
            expire_at: now + expire,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };

        // Steps and yml go first: a job row must never exist without them.
        self.steps.init(&job, &tree).await?;
        self.job_ymls
            .create(&JobYml {
                job_id: job.id,
                raw: yml.to_string(),
                created_at: now,
            })
            .await?;
        self.jobs.create(&job).await?;
        self.trees.put(job.id, tree);

        info!(job_id = %job.id, key = %job.key, %trigger, "Job created");

        self.publish(Event::JobCreated(JobCreatedPayload {
            job_id: job.id,
            flow_id: job.flow_id,
            flow_name: job.flow_name.clone(),
            build_number,
            trigger,
            created_at: now,
        }))
        .await;

        Ok(job)
    }

    /// Put a PENDING job on the job queue.
    pub async fn start(&self, job_id: JobId) -> Result<Job> {
        let mut job = self.get(job_id).await?;

        if job.status != JobStatus::Pending {
            return Err(Error::StatusConflict {
                job: job.id.to_string(),
                expected: JobStatus::Pending.to_string(),
                actual: job.status.to_string(),
            });
        }

        if job.is_expired(Utc::now()) {
            info!(%job_id, "Job expired before start");
            self.finish(&mut job, JobStatus::Timeout, Some("Job expired".to_string()))
                .await?;
            return Ok(job);
        }

        self.set_status(&mut job, JobStatus::Queued, None).await?;

        if let Err(e) = self
            .queue
            .send(
                &self.config.job_queue,
                job.id.to_string().into_bytes(),
                Priority::High,
            )
            .await
        {
            warn!(%job_id, error = %e, "Unable to enqueue job, reverting to pending");
            self.set_status(&mut job, JobStatus::Pending, None).await?;
            return Err(e);
        }

        info!(%job_id, "Job queued");
        Ok(job)
    }

    /// Job queue consumer entry point.
    pub async fn handle_job(&self, job_id: JobId) -> Result<()> {
        let Some(mut job) = self.jobs.get(job_id).await? else {
            warn!(%job_id, "Queued job not found");
            return Ok(());
        };

        if job.status != JobStatus::Queued {
            debug!(%job_id, status = %job.status, "Ignoring job that is not queued");
            return Ok(());
        }

        let span = job_span(&attributes(&job), "dispatch");
        async {
            if job.is_expired(Utc::now()) {
                info!("Job expired while queued");
                return self
                    .finish(&mut job, JobStatus::Timeout, Some("Job expired".to_string()))
                    .await;
            }
            self.dispatch(&mut job).await
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, job: &mut Job) -> Result<()> {
        let lookup = async {
            let tree = self.trees.get(job.id).await?;
            let candidates = self
                .agents
                .find(AgentStatus::Idle, &tree.root().tags)
                .await?;
            Ok::<_, Error>((tree, candidates))
        };
        let (tree, candidates) = match lookup.await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Agent lookup failed, retrying later");
                self.retry.retry(job.id);
                return Ok(());
            }
        };

        if candidates.is_empty() {
            debug!(tags = ?tree.root().tags, "No idle agent");
            self.retry.retry(job.id);
            return Ok(());
        }

        let mut locked = None;
        for candidate in candidates {
            match self.agents.try_lock(job.id, candidate.id).await {
                Ok(Some(agent)) => {
                    locked = Some(agent);
                    break;
                }
                Ok(None) => continue,
                Err(e) => warn!(agent = %candidate.name, error = %e, "Agent lock failed"),
            }
        }

        let Some(agent) = locked else {
            debug!("No agent could be locked");
            self.retry.retry(job.id);
            return Ok(());
        };

        if tree.is_empty() {
            warn!("Flow has no runnable step, job left as is");
            return self.agents.release(agent.id).await;
        }

        info!(agent = %agent.name, "Agent assigned");
        if let Err(e) = self.run_on(job, &tree, agent.id).await {
            error!(agent = %agent.name, error = %e, "Dispatch failed with agent locked");
            self.recover(job.id, Some(agent.id), &e).await?;
        }
        Ok(())
    }

    async fn run_on(&self, job: &mut Job, tree: &StepTree, agent_id: AgentId) -> Result<()> {
        job.agent_id = Some(agent_id);
        job.started_at = Some(Utc::now());
        self.set_status(job, JobStatus::Running, None).await?;

        match self.next_runnable(job, tree, &NodePath::root(), false).await? {
            Some(node) => self.run_node(job, &node).await,
            None => self.finish_from_context(job).await,
        }
    }

    /// Leave a job whose handling broke half way in a state that something
    /// still drives.
    ///
    /// A job still QUEUED in storage gets `agent` back to idle and goes to
    /// the retry queue. A RUNNING job is finished as FAILURE, which also
    /// releases its agent.
    async fn recover(
        &self,
        job_id: JobId,
        agent: Option<AgentId>,
        cause: &Error,
    ) -> Result<()> {
        let stored = match self.jobs.get(job_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(%job_id, error = %e, "Unable to reload job");
                None
            }
        };

        match stored {
            Some(mut job) if job.status == JobStatus::Running => {
                self.finish(&mut job, JobStatus::Failure, Some(cause.to_string()))
                    .await
            }
            Some(job) if job.status != JobStatus::Queued => Ok(()),
            _ => {
                if let Some(agent_id) = agent
                    && let Err(e) = self.agents.release(agent_id).await
                {
                    warn!(%job_id, %agent_id, error = %e, "Unable to release agent");
                }
                self.retry.retry(job_id);
                Ok(())
            }
        }
    }

    /// Callback queue consumer entry point.
    pub async fn process_callback(&self, cmd: ExecutedCmd) -> Result<()> {
        let job_id = cmd.id.job_id;
        let Some(mut job) = self.jobs.get(job_id).await? else {
            warn!(callback = %cmd.id, "Callback for unknown job");
            return Ok(());
        };

        if job.status != JobStatus::Running {
            debug!(callback = %cmd.id, status = %job.status, "Callback for job not running");
            return Ok(());
        }

        if cmd.id.path != job.current_path {
            debug!(
                callback = %cmd.id,
                current = %job.current_path,
                "Stale callback ignored"
            );
            return Ok(());
        }

        let span = step_span(
            &CiAttributes::new()
                .job(job.id.to_string(), job.build_number)
                .step(cmd.id.path.to_string())
                .agent(
                    job.agent_id.map(|a| a.to_string()).unwrap_or_default(),
                    "",
                ),
        );
        let handled = self.apply_callback(&mut job, &cmd).instrument(span).await;

        if let Err(e) = handled {
            error!(%job_id, error = %e, "Callback handling failed");
            self.recover(job_id, None, &e).await?;
        }
        Ok(())
    }

    async fn apply_callback(&self, job: &mut Job, cmd: &ExecutedCmd) -> Result<()> {
        let tree = self.trees.get(job.id).await?;
        let Some(node) = tree.get(&cmd.id.path).cloned() else {
            warn!(path = %cmd.id.path, "Callback for unknown node");
            return Ok(());
        };

        self.steps.update(cmd).await?;
        if !cmd.status.is_finished() {
            return Ok(());
        }

        debug!(status = %cmd.status, "Step finished");
        self.advance(job, &tree, &node, cmd.status, &cmd.output)
            .await
    }

    /// Record the outcome of `node` and move the job to the next node.
    async fn advance(
        &self,
        job: &mut Job,
        tree: &StepTree,
        node: &Node,
        status: StepStatus,
        output: &Vars,
    ) -> Result<()> {
        vars::merge_unreserved(&mut job.context, output);
        record_outcome(job, node, status);

        if status == StepStatus::Killed {
            info!(path = %node.path, "Step killed, cancelling job");
            return self.finish(job, JobStatus::Cancelled, Some("Killed".to_string())).await;
        }

        let failed = (status.is_failure() && !node.allow_failure)
            || job.status_from_context().is_some_and(is_failed);

        match self.next_runnable(job, tree, &node.path, failed).await? {
            Some(next) => self.run_node(job, &next).await,
            None => self.finish_from_context(job).await,
        }
    }

    /// First node after `from` that should run, marking nodes whose
    /// condition is false as skipped on the way.
    async fn next_runnable(
        &self,
        job: &mut Job,
        tree: &StepTree,
        from: &NodePath,
        failed: bool,
    ) -> Result<Option<Node>> {
        let mut cursor = from.clone();

        loop {
            let candidate = if failed {
                tree.next_final(&cursor)
            } else {
                tree.next(&cursor)
            };
            let Some(node) = candidate else {
                return Ok(None);
            };

            let Some(reason) = self.skip_reason(job, node).await else {
                return Ok(Some(node.clone()));
            };

            info!(path = %node.path, %reason, "Step skipped by condition");
            self.steps
                .mark(job.id, &node.path, StepStatus::Skipped, Some(reason))
                .await?;
            record_outcome(job, node, StepStatus::Skipped);
            cursor = node.path.clone();
        }
    }

    /// Why `node` must not run, if it has a condition that does not hold.
    async fn skip_reason(&self, job: &Job, node: &Node) -> Option<String> {
        let condition = node.condition.as_deref().filter(|_| node.has_condition())?;
        let inputs = DispatchGateway::inputs(job, node);

        match self.conditions.evaluate(condition, &inputs).await {
            Ok(true) => None,
            Ok(false) => Some(format!("condition '{}' is false", condition.trim())),
            Err(e) => Some(e.to_string()),
        }
    }

    async fn run_node(&self, job: &mut Job, node: &Node) -> Result<()> {
        job.current_path = node.path.clone();
        job.updated_at = Utc::now();
        self.jobs.update(job).await?;

        if let Err(e) = self.gateway.send(job, node).await {
            error!(path = %node.path, error = %e, "Unable to dispatch step");
            self.finish(job, JobStatus::Failure, Some(e.to_string()))
                .await?;
        }
        Ok(())
    }

    async fn finish_from_context(&self, job: &mut Job) -> Result<()> {
        let status = job
            .status_from_context()
            .filter(JobStatus::is_finished)
            .unwrap_or(JobStatus::Success);
        self.finish(job, status, None).await
    }

    /// Move a job to a terminal status and release everything it holds.
    async fn finish(
        &self,
        job: &mut Job,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        job.finished_at = Some(Utc::now());
        job.context
            .insert(vars::JOB_STATUS.to_string(), status.to_string());
        self.set_status(job, status, message).await?;

        let skipped = self.steps.skip_unfinished(job.id).await?;
        if skipped > 0 {
            debug!(job_id = %job.id, skipped, "Unfinished steps skipped");
        }

        if let Some(agent_id) = job.agent_id
            && let Err(e) = self.agents.release(agent_id).await
        {
            warn!(job_id = %job.id, %agent_id, error = %e, "Unable to release agent");
        }

        self.trees.evict(job.id);
        self.steps.evict(job.id);
        info!(job_id = %job.id, %status, duration_ms = ?job.duration_ms(), "Job finished");
        Ok(())
    }

    /// Request cancellation of a job.
    ///
    /// A running job keeps running until its agent reports back; jobs not
    /// yet dispatched are cancelled right away.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let mut job = self.get(job_id).await?;

        match job.status {
            status if status.is_finished() => Ok(job),
            JobStatus::Running => {
                info!(%job_id, "Sending kill to agent");
                self.gateway.kill(&job).await?;
                Ok(job)
            }
            _ => {
                info!(%job_id, status = %job.status, "Cancelling job before dispatch");
                self.finish(
                    &mut job,
                    JobStatus::Cancelled,
                    Some("Cancelled before dispatch".to_string()),
                )
                .await?;
                Ok(job)
            }
        }
    }

    /// Cancel the job of an agent that went offline while holding it.
    pub async fn on_agent_status_changed(&self, event: &AgentStatusChangedPayload) -> Result<()> {
        if event.status != AgentStatus::Offline {
            return Ok(());
        }
        let Some(job_id) = event.job_id else {
            return Ok(());
        };
        let Some(mut job) = self.jobs.get(job_id).await? else {
            return Ok(());
        };

        if job.status.is_finished() || job.agent_id != Some(event.agent_id) {
            return Ok(());
        }

        warn!(%job_id, agent = %event.name, "Agent went offline while running job");
        self.finish(
            &mut job,
            JobStatus::Cancelled,
            Some(AGENT_OFFLINE_MESSAGE.to_string()),
        )
        .await
    }

    async fn set_status(
        &self,
        job: &mut Job,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        let previous = job.status;
        job.status = status;
        if message.is_some() {
            job.message = message;
        }
        job.updated_at = Utc::now();
        self.jobs.update(job).await?;

        if previous != status {
            self.publish(Event::JobStatusChanged(JobStatusChangedPayload {
                job_id: job.id,
                flow_id: job.flow_id,
                build_number: job.build_number,
                previous,
                status,
                message: job.message.clone(),
                changed_at: job.updated_at,
            }))
            .await;
        }
        Ok(())
    }

    async fn publish(&self, event: Event) {
        let subject = event.subject();
        if let Err(e) = self.events.publish(event).await {
            warn!(%subject, error = %e, "Failed to publish event");
        }
    }
}

#[async_trait]
impl Resubmit for JobScheduler {
    async fn resubmit(&self, job_id: JobId) -> Result<()> {
        let Some(mut job) = self.jobs.get(job_id).await? else {
            return Ok(());
        };

        if job.status != JobStatus::Queued {
            debug!(%job_id, status = %job.status, "Retry dropped, job not queued");
            return Ok(());
        }

        if job.is_expired(Utc::now()) {
            info!(%job_id, "Job expired while waiting for an agent");
            return self
                .finish(&mut job, JobStatus::Timeout, Some("Job expired".to_string()))
                .await;
        }

        self.queue
            .send(
                &self.config.job_queue,
                job_id.to_string().into_bytes(),
                Priority::Normal,
            )
            .await
    }
}

/// Write the job outcome implied by `node` into the context.
///
/// Regular nodes always record their outcome. Final nodes only record a
/// failure, so a cleanup step cannot turn a failed job into a success.
fn record_outcome(job: &mut Job, node: &Node, status: StepStatus) {
    let outcome = JobStatus::from_step(status, node.allow_failure);
    if node.is_final && !is_failed(outcome) {
        return;
    }
    job.context
        .insert(vars::JOB_STATUS.to_string(), outcome.to_string());
}

fn is_failed(status: JobStatus) -> bool {
    status.is_finished() && status != JobStatus::Success
}

fn attributes(job: &Job) -> CiAttributes {
    CiAttributes::new()
        .flow(job.flow_id.to_string(), job.flow_name.clone())
        .job(job.id.to_string(), job.build_number)
        .trigger(job.trigger.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_core::tree::DEFAULT_TIMEOUT_SECS;

    fn node(is_final: bool, allow_failure: bool) -> Node {
        Node {
            path: NodePath::root().append("n").unwrap(),
            name: "n".to_string(),
            envs: Vars::new(),
            scripts: vec![],
            condition: None,
            allow_failure,
            is_final,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            exports: vec![],
            workdir: None,
            tags: vec![],
        }
    }

    fn job_with_status(status: JobStatus) -> Job {
        let now = Utc::now();
        let flow_id = flowci_core::ids::FlowId::new();
        Job {
            id: JobId::new(),
            key: Job::key_of(flow_id, 1),
            flow_id,
            flow_name: "f".to_string(),
            build_number: 1,
            trigger: Trigger::Manual,
            status: JobStatus::Running,
            current_path: NodePath::root(),
            agent_id: None,
            context: vars::from_pairs([(vars::JOB_STATUS, status.as_str())]),
            message: None,
            expire_at: now,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_regular_node_records_any_outcome() {
        let mut job = job_with_status(JobStatus::Failure);
        record_outcome(&mut job, &node(false, false), StepStatus::Success);
        assert_eq!(job.status_from_context(), Some(JobStatus::Success));

        record_outcome(&mut job, &node(false, false), StepStatus::Timeout);
        assert_eq!(job.status_from_context(), Some(JobStatus::Timeout));

        record_outcome(&mut job, &node(false, true), StepStatus::Exception);
        assert_eq!(job.status_from_context(), Some(JobStatus::Success));
    }

    #[test]
    fn test_final_node_only_records_failure() {
        let mut job = job_with_status(JobStatus::Failure);
        record_outcome(&mut job, &node(true, false), StepStatus::Success);
        assert_eq!(job.status_from_context(), Some(JobStatus::Failure));

        let mut job = job_with_status(JobStatus::Success);
        record_outcome(&mut job, &node(true, false), StepStatus::Exception);
        assert_eq!(job.status_from_context(), Some(JobStatus::Failure));
    }
}
