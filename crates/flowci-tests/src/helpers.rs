//! Test helper functions and utilities.

use chrono::Utc;
use flowci_core::agent::Agent;
use flowci_core::cmd::{CmdIn, ShellIn};
use flowci_core::ports::{AgentRepository, Coordinator, CreateMode, MessageQueue, Priority};
use flowci_core::step::{ExecutedCmd, StepStatus};
use flowci_core::vars::Vars;
use flowci_db::{
    Database, PgAgentRepository, PgBuildNumberRepository, PgJobRepository, PgJobYmlRepository,
    PgStepRepository,
};
use flowci_nats::{KvCoordinator, NatsConnection, NatsEventBus, NatsQueue};
use flowci_scheduler::{Backends, JobScheduler, SchedulerConfig, Workers};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// A scheduler over Postgres and NATS with its background workers running.
pub struct TestServer {
    pub scheduler: Arc<JobScheduler>,
    pub agents: Arc<PgAgentRepository>,
    pub events: Arc<NatsEventBus>,
    workers: Option<Workers>,
}

impl TestServer {
    pub async fn start(
        db: &Database,
        conn: &NatsConnection,
        config: SchedulerConfig,
    ) -> anyhow::Result<Self> {
        let pool = db.pool().clone();
        let events = Arc::new(NatsEventBus::new(conn).await?);
        let queue = Arc::new(NatsQueue::new(conn).await?);
        let agents = Arc::new(PgAgentRepository::new(pool.clone()));

        let scheduler = Arc::new(JobScheduler::new(
            config,
            Backends {
                jobs: Arc::new(PgJobRepository::new(pool.clone())),
                job_ymls: Arc::new(PgJobYmlRepository::new(pool.clone())),
                build_numbers: Arc::new(PgBuildNumberRepository::new(pool.clone())),
                steps: Arc::new(PgStepRepository::new(pool)),
                agents: agents.clone(),
                queue: queue.clone(),
                coordinator: Arc::new(KvCoordinator::new(conn).await?),
                events: events.clone(),
            },
        ));
        scheduler.agents().init().await?;
        scheduler.agents().reconcile().await?;

        let workers = Workers::start(scheduler.clone(), queue, events.clone()).await?;

        Ok(Self {
            scheduler,
            agents,
            events,
            workers: Some(workers),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
    }
}

type Outcome = dyn Fn(&ShellIn) -> StepStatus + Send + Sync;

/// A stand-in agent process: it registers a liveness node on its own NATS
/// connection, reads its command queue and reports every shell command back
/// with the status chosen by `outcome`.
pub struct SimAgent {
    pub agent: Agent,
    conn: NatsConnection,
    coordinator: Option<KvCoordinator>,
    received: Arc<Mutex<Vec<CmdIn>>>,
    handle: JoinHandle<()>,
}

impl SimAgent {
    /// Agent that succeeds at everything.
    pub async fn start(
        conn: NatsConnection,
        server: &TestServer,
        agent: Agent,
    ) -> anyhow::Result<Self> {
        Self::with_outcome(conn, server, agent, |_| StepStatus::Success).await
    }

    pub async fn with_outcome<F>(
        conn: NatsConnection,
        server: &TestServer,
        agent: Agent,
        outcome: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&ShellIn) -> StepStatus + Send + Sync + 'static,
    {
        let config = server.scheduler.config().clone();
        server.agents.create(&agent).await?;

        let queue = NatsQueue::new(&conn).await?;
        let mut commands = queue.consume(&config.agent_queue(agent.id)).await?;

        let coordinator = KvCoordinator::new(&conn).await?;
        coordinator
            .create(
                CreateMode::Ephemeral,
                &server.scheduler.agents().node_path(agent.id),
                b"IDLE",
            )
            .await?;

        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let outcome: Arc<Outcome> = Arc::new(outcome);
        let name = agent.name.clone();

        let handle = tokio::spawn(async move {
            let mut running: Option<ShellIn> = None;
            while let Some(delivery) = commands.next().await {
                let Ok(delivery) = delivery else { continue };
                let cmd: CmdIn = match serde_json::from_slice(&delivery.payload) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        debug!(agent = %name, error = %e, "Unreadable command");
                        let _ = delivery.ack().await;
                        continue;
                    }
                };
                let _ = delivery.ack().await;
                log.lock().unwrap().push(cmd.clone());

                let reply = match cmd {
                    CmdIn::Shell(shell) => {
                        let status = outcome(&shell);
                        let reply = result_of(&shell, status);
                        running = (status == StepStatus::Running).then_some(shell);
                        reply
                    }
                    CmdIn::Kill(_) => match running.take() {
                        Some(shell) => result_of(&shell, StepStatus::Killed),
                        None => continue,
                    },
                };

                let payload = serde_json::to_vec(&reply).unwrap();
                if let Err(e) = queue
                    .send(&config.callback_queue, payload, Priority::Normal)
                    .await
                {
                    debug!(agent = %name, error = %e, "Callback not sent");
                }
            }
        });

        Ok(Self {
            agent,
            conn,
            coordinator: Some(coordinator),
            received,
            handle,
        })
    }

    /// Commands received so far.
    pub fn received(&self) -> Vec<CmdIn> {
        self.received.lock().unwrap().clone()
    }

    /// Paths of the shell commands received so far.
    pub fn shell_paths(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|c| match c {
                CmdIn::Shell(s) => Some(s.id.path.to_string()),
                CmdIn::Kill(_) => None,
            })
            .collect()
    }

    /// Stop answering and drop the connection, so the liveness node ages out.
    pub async fn crash(mut self) {
        self.handle.abort();
        self.coordinator.take();
        self.conn.shutdown().await;
    }
}

impl Drop for SimAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn result_of(shell: &ShellIn, status: StepStatus) -> ExecutedCmd {
    let now = Utc::now();
    let finished = status != StepStatus::Running;
    ExecutedCmd {
        id: shell.id.clone(),
        flow_id: shell.flow_id,
        position: 0,
        status,
        allow_failure: shell.allow_failure,
        process_id: Some(1000),
        exit_code: finished.then_some(if status == StepStatus::Success { 0 } else { 1 }),
        output: Vars::new(),
        start_at: Some(now),
        finish_at: finished.then_some(now),
        error: None,
    }
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(
    timeout: std::time::Duration,
    interval: std::time::Duration,
    mut condition: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Poll interval used by the integration tests.
pub const POLL: Duration = Duration::from_millis(100);

/// Assert that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: std::time::Duration) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation timed out")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_core::cmd::CmdId;
    use flowci_core::ids::{FlowId, JobId, NodePath};

    #[tokio::test]
    async fn test_wait_for_immediate() {
        let result = wait_for(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_millis(10),
            || async { true },
        )
        .await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let result = wait_for(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_millis(10),
            || async { false },
        )
        .await;
        assert!(!result);
    }

    #[test]
    fn test_result_of_running_has_no_exit_code() {
        let job_id = JobId::new();
        let shell = ShellIn {
            id: CmdId::new(job_id, NodePath::parse("root/build").unwrap()),
            flow_id: FlowId::new(),
            job_id,
            step_name: "build".to_string(),
            scripts: vec!["make".to_string()],
            inputs: Vars::new(),
            env_filters: vec![],
            workdir: None,
            timeout_secs: 60,
            allow_failure: false,
        };

        let running = result_of(&shell, StepStatus::Running);
        assert_eq!(running.exit_code, None);
        assert!(running.finish_at.is_none());

        let failed = result_of(&shell, StepStatus::Exception);
        assert_eq!(failed.exit_code, Some(1));
    }
}
