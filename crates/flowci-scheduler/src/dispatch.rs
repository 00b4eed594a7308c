//! Sends nodes to agents.

use crate::steps::StepTracker;
use flowci_core::cmd::{CmdId, CmdIn, KillIn, ShellIn};
use flowci_core::ids::AgentId;
use flowci_core::job::Job;
use flowci_core::ports::{MessageQueue, Priority};
use flowci_core::step::StepStatus;
use flowci_core::tree::Node;
use flowci_core::vars::{self, Vars};
use flowci_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Translates a (job, node) pair into a command on the agent's queue.
pub struct DispatchGateway {
    queue: Arc<dyn MessageQueue>,
    steps: Arc<StepTracker>,
    agent_queue_prefix: String,
}

impl DispatchGateway {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        steps: Arc<StepTracker>,
        agent_queue_prefix: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            steps,
            agent_queue_prefix: agent_queue_prefix.into(),
        }
    }

    pub fn agent_queue(&self, agent_id: AgentId) -> String {
        format!("{}.{}", self.agent_queue_prefix, agent_id)
    }

    /// Variables visible to a node: job context overlaid with node envs.
    pub fn inputs(job: &Job, node: &Node) -> Vars {
        let mut inputs = job.context.clone();
        vars::merge(&mut inputs, &node.envs);
        inputs.insert(vars::STEP_NAME.to_string(), node.name.clone());
        if let Some(agent_id) = job.agent_id {
            inputs.insert(vars::JOB_AGENT.to_string(), agent_id.to_string());
        }
        inputs
    }

    /// Send `node` to the agent assigned to `job`.
    ///
    /// A step that already left PENDING is not sent again. Otherwise it is
    /// marked RUNNING before the send; a failed send marks it EXCEPTION and
    /// returns the error, and the caller decides the job outcome.
    pub async fn send(&self, job: &Job, node: &Node) -> Result<()> {
        let agent_id = job
            .agent_id
            .ok_or_else(|| Error::Internal(format!("job {} has no agent", job.id)))?;

        let current = self.steps.get(job.id, &node.path).await?;
        if current.status != StepStatus::Pending {
            debug!(
                job_id = %job.id,
                path = %node.path,
                status = %current.status,
                "Step already dispatched"
            );
            return Ok(());
        }

        self.steps
            .mark(job.id, &node.path, StepStatus::Running, None)
            .await?;

        let cmd = CmdIn::Shell(ShellIn {
            id: CmdId::new(job.id, node.path.clone()),
            flow_id: job.flow_id,
            job_id: job.id,
            step_name: node.name.clone(),
            scripts: node.scripts.clone(),
            inputs: Self::inputs(job, node),
            env_filters: node.exports.clone(),
            workdir: node.workdir.clone(),
            timeout_secs: node.timeout_secs,
            allow_failure: node.allow_failure,
        });

        let queue = self.agent_queue(agent_id);
        let sent = match serde_json::to_vec(&cmd) {
            Ok(payload) => self.queue.send(&queue, payload, Priority::Normal).await,
            Err(e) => Err(e.into()),
        };

        match sent {
            Ok(()) => {
                debug!(job_id = %job.id, path = %node.path, %queue, "Step dispatched");
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %job.id, path = %node.path, error = %e, "Dispatch failed");
                self.steps
                    .mark(
                        job.id,
                        &node.path,
                        StepStatus::Exception,
                        Some(e.to_string()),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Ask the agent running `job` to stop it.
    pub async fn kill(&self, job: &Job) -> Result<()> {
        let agent_id = job
            .agent_id
            .ok_or_else(|| Error::Internal(format!("job {} has no agent", job.id)))?;

        let payload = serde_json::to_vec(&CmdIn::Kill(KillIn { job_id: job.id }))?;
        self.queue
            .send(&self.agent_queue(agent_id), payload, Priority::High)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowci_core::ids::{FlowId, JobId, NodePath};
    use flowci_core::job::{JobStatus, Trigger};
    use flowci_core::tree::StepTree;
    use flowci_memory::{MemoryEventBus, MemoryQueue, MemoryStepRepository};

    const YML: &str = r#"
envs:
  FROM_FLOW: "1"
steps:
  - name: build
    envs:
      PROFILE: release
    script: make
    exports: [ARTIFACT]
"#;

    fn job() -> Job {
        let now = Utc::now();
        let flow_id = FlowId::new();
        Job {
            id: JobId::new(),
            key: Job::key_of(flow_id, 1),
            flow_id,
            flow_name: "demo".to_string(),
            build_number: 1,
            trigger: Trigger::Api,
            status: JobStatus::Running,
            current_path: NodePath::root(),
            agent_id: Some(AgentId::new()),
            context: vars::from_pairs([("FROM_CONTEXT", "x"), ("PROFILE", "debug")]),
            message: None,
            expire_at: now,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            finished_at: None,
        }
    }

    async fn setup() -> (DispatchGateway, Arc<StepTracker>, Arc<MemoryQueue>, Job, StepTree) {
        let queue = Arc::new(MemoryQueue::new());
        let steps = Arc::new(StepTracker::new(
            Arc::new(MemoryStepRepository::new()),
            Arc::new(MemoryEventBus::new()),
        ));
        let job = job();
        let tree = StepTree::parse(YML).unwrap();
        steps.init(&job, &tree).await.unwrap();
        let gateway = DispatchGateway::new(queue.clone(), steps.clone(), "agents");
        (gateway, steps, queue, job, tree)
    }

    #[tokio::test]
    async fn test_send_marks_running_and_builds_command() {
        let (gateway, steps, queue, job, tree) = setup().await;
        let node = &tree.ordered()[0];

        gateway.send(&job, node).await.unwrap();

        let step = steps.get(job.id, &node.path).await.unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert!(step.start_at.is_some());

        let sent = queue.sent(&gateway.agent_queue(job.agent_id.unwrap()));
        assert_eq!(sent.len(), 1);
        let cmd: CmdIn = serde_json::from_slice(&sent[0]).unwrap();
        let CmdIn::Shell(shell) = cmd else {
            panic!("expected shell command");
        };
        assert_eq!(shell.id, CmdId::new(job.id, node.path.clone()));
        assert_eq!(shell.scripts, vec!["make"]);
        assert_eq!(shell.inputs["PROFILE"], "release");
        assert_eq!(shell.inputs["FROM_CONTEXT"], "x");
        assert_eq!(shell.inputs[vars::STEP_NAME], "build");
        assert_eq!(shell.env_filters, vec!["ARTIFACT"]);
    }

    #[tokio::test]
    async fn test_send_failure_marks_exception() {
        let (gateway, steps, queue, job, tree) = setup().await;
        queue.fail_sends_to("agents.");
        let node = &tree.ordered()[0];

        assert!(gateway.send(&job, node).await.is_err());

        let step = steps.get(job.id, &node.path).await.unwrap();
        assert_eq!(step.status, StepStatus::Exception);
        assert!(step.error.is_some());
    }

    #[tokio::test]
    async fn test_send_skips_step_already_running() {
        let (gateway, steps, queue, job, tree) = setup().await;
        let node = &tree.ordered()[0];
        let queue_name = gateway.agent_queue(job.agent_id.unwrap());

        gateway.send(&job, node).await.unwrap();
        gateway.send(&job, node).await.unwrap();
        assert_eq!(queue.sent(&queue_name).len(), 1);

        steps
            .mark(job.id, &node.path, StepStatus::Success, None)
            .await
            .unwrap();
        gateway.send(&job, node).await.unwrap();
        assert_eq!(queue.sent(&queue_name).len(), 1);
    }

    #[tokio::test]
    async fn test_kill_is_high_priority() {
        let (gateway, _, queue, job, _) = setup().await;
        gateway.kill(&job).await.unwrap();

        let sent = queue.sent_with_priority(&gateway.agent_queue(job.agent_id.unwrap()));
        assert_eq!(sent[0].0, Priority::High);
        let cmd: CmdIn = serde_json::from_slice(&sent[0].1).unwrap();
        assert!(matches!(cmd, CmdIn::Kill(_)));
    }
}
