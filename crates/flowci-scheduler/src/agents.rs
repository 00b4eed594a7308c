//! Agent availability and exclusive locking.
//!
//! Every connected agent owns an ephemeral liveness node `{root}/{agent_id}`
//! whose data is its status. Next to it a persistent placeholder
//! `{root}/{agent_id}-lock` names the lock that serializes acquisition of the
//! agent across scheduler instances. The database record mirrors the
//! liveness node and is resynced on startup and on every watch event.

use chrono::Utc;
use flowci_core::agent::{Agent, AgentStatus};
use flowci_core::events::{AgentStatusChangedPayload, Event};
use flowci_core::ids::{AgentId, JobId};
use flowci_core::ports::{AgentRepository, CoordEvent, Coordinator, CreateMode, EventBus};
use flowci_core::{Error, Result};
use flowci_trace::{CiAttributes, agent_span};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

const LOCK_SUFFIX: &str = "-lock";

/// Tracks agent status and hands out exclusive agent locks.
pub struct AgentRegistry {
    agents: Arc<dyn AgentRepository>,
    coordinator: Arc<dyn Coordinator>,
    events: Arc<dyn EventBus>,
    root: String,
    lock_wait: Duration,
}

impl AgentRegistry {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        coordinator: Arc<dyn Coordinator>,
        events: Arc<dyn EventBus>,
        root: impl Into<String>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            agents,
            coordinator,
            events,
            root: root.into(),
            lock_wait,
        }
    }

    /// Liveness node of an agent.
    pub fn node_path(&self, id: AgentId) -> String {
        format!("{}/{}", self.root, id)
    }

    /// Lock placeholder of an agent.
    pub fn lock_path(&self, id: AgentId) -> String {
        format!("{}{}", self.node_path(id), LOCK_SUFFIX)
    }

    /// Make sure the root node exists.
    pub async fn init(&self) -> Result<()> {
        if !self.coordinator.exists(&self.root).await? {
            self.coordinator
                .create(CreateMode::Persistent, &self.root, b"")
                .await?;
            info!(root = %self.root, "Created agent root node");
        }
        Ok(())
    }

    pub async fn get(&self, id: AgentId) -> Result<Agent> {
        self.agents
            .get(id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))
    }

    /// Agents in `status` sharing a tag with `tags` (all of them when empty).
    pub async fn find(&self, status: AgentStatus, tags: &[String]) -> Result<Vec<Agent>> {
        self.agents.find(status, tags).await
    }

    /// Lock an idle agent for `job_id`.
    ///
    /// Returns the agent flipped to BUSY, or `None` when the agent is busy,
    /// not reported idle by its liveness node, or the lock could not be
    /// taken within the configured wait.
    pub async fn try_lock(&self, job_id: JobId, id: AgentId) -> Result<Option<Agent>> {
        let span = agent_span(
            &CiAttributes::new()
                .agent(id.to_string(), "")
                .job(job_id.to_string(), 0),
            "lock",
        );

        async {
            let agent = self.get(id).await?;
            if agent.is_busy() {
                debug!(agent = %agent.name, "Agent already busy");
                return Ok(None);
            }

            match self.coordinator.get(&self.node_path(id)).await {
                Ok(Some(data)) if AgentStatus::from_bytes(&data) == Some(AgentStatus::Idle) => {}
                Ok(data) => {
                    debug!(
                        agent = %agent.name,
                        reported = ?data.as_deref().and_then(AgentStatus::from_bytes),
                        "Agent not idle in coordination service"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    warn!(agent = %agent.name, error = %e, "Unable to read agent node");
                    return Ok(None);
                }
            }

            let token = match self
                .coordinator
                .acquire(&self.lock_path(id), self.lock_wait)
                .await
            {
                Ok(Some(token)) => token,
                Ok(None) => {
                    debug!(agent = %agent.name, "Agent lock contended");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(agent = %agent.name, error = %e, "Unable to acquire agent lock");
                    return Ok(None);
                }
            };

            let locked = self.flip_busy(job_id, id).await;

            if let Err(e) = self.coordinator.release(token).await {
                warn!(agent = %agent.name, error = %e, "Failed to release agent lock");
            }

            let locked = locked?;
            if let Some(agent) = &locked {
                info!(agent = %agent.name, %job_id, "Agent locked");
            }
            Ok(locked)
        }
        .instrument(span)
        .await
    }

    /// Runs while holding the agent lock.
    async fn flip_busy(&self, job_id: JobId, id: AgentId) -> Result<Option<Agent>> {
        let mut agent = self.get(id).await?;
        if agent.is_busy() {
            return Ok(None);
        }

        let previous = agent.status;
        agent.status = AgentStatus::Busy;
        agent.job_id = Some(job_id);
        agent.updated_at = Utc::now();
        self.agents.update(&agent).await?;

        if let Err(e) = self
            .coordinator
            .set(&self.node_path(id), AgentStatus::Busy.as_str().as_bytes())
            .await
        {
            warn!(agent = %agent.name, error = %e, "Unable to mark agent busy, rolling back");
            agent.status = previous;
            agent.job_id = None;
            agent.updated_at = Utc::now();
            self.agents.update(&agent).await?;
            return Ok(None);
        }

        self.publish(&agent, previous, Some(job_id)).await;
        Ok(Some(agent))
    }

    /// Return an agent to IDLE after its job finished.
    ///
    /// A failed coordination write leaves the agent OFFLINE rather than
    /// advertising it as available.
    pub async fn release(&self, id: AgentId) -> Result<()> {
        let mut agent = self.get(id).await?;
        let previous = agent.status;
        let held = agent.job_id;

        match agent.status {
            AgentStatus::Idle => return Ok(()),
            AgentStatus::Offline => {
                if agent.job_id.take().is_some() {
                    agent.updated_at = Utc::now();
                    self.agents.update(&agent).await?;
                }
                return Ok(());
            }
            AgentStatus::Busy => {}
        }

        let token = self
            .coordinator
            .acquire(&self.lock_path(id), self.lock_wait)
            .await
            .unwrap_or_else(|e| {
                warn!(agent = %agent.name, error = %e, "Releasing agent without lock");
                None
            });

        agent.job_id = None;
        agent.status = match self
            .coordinator
            .set(&self.node_path(id), AgentStatus::Idle.as_str().as_bytes())
            .await
        {
            Ok(()) => AgentStatus::Idle,
            Err(e) => {
                warn!(agent = %agent.name, error = %e, "Unable to mark agent idle, setting offline");
                AgentStatus::Offline
            }
        };
        agent.updated_at = Utc::now();
        let saved = self.agents.update(&agent).await;

        if let Some(token) = token
            && let Err(e) = self.coordinator.release(token).await
        {
            warn!(agent = %agent.name, error = %e, "Failed to release agent lock");
        }

        saved?;
        info!(agent = %agent.name, status = %agent.status, "Agent released");
        self.publish(&agent, previous, held).await;
        Ok(())
    }

    /// Align every persisted agent with its liveness node.
    pub async fn reconcile(&self) -> Result<()> {
        let agents = self.agents.list().await?;
        info!(count = agents.len(), "Reconciling agents");

        for agent in agents {
            if let Err(e) = self.resync(agent.id).await {
                warn!(agent = %agent.name, error = %e, "Agent reconciliation failed");
            }
        }
        Ok(())
    }

    async fn resync(&self, id: AgentId) -> Result<()> {
        let node = self.node_path(id);
        match self.coordinator.get(&node).await? {
            None => {
                self.set_status(id, AgentStatus::Offline).await?;
                self.drop_lock_placeholder(id).await;
            }
            Some(data) => {
                let Some(status) = AgentStatus::from_bytes(&data) else {
                    warn!(%node, "Unreadable agent status");
                    return Ok(());
                };
                self.set_status(id, status).await?;
                self.ensure_lock_placeholder(id).await;
            }
        }
        Ok(())
    }

    /// Apply a status coming from the coordination service.
    async fn set_status(&self, id: AgentId, status: AgentStatus) -> Result<()> {
        let mut agent = self.get(id).await?;
        if agent.status == status {
            return Ok(());
        }

        let previous = agent.status;
        let held = agent.job_id;
        agent.status = status;
        if status != AgentStatus::Busy {
            agent.job_id = None;
        }
        agent.updated_at = Utc::now();
        self.agents.update(&agent).await?;

        info!(agent = %agent.name, %previous, %status, "Agent status changed");
        self.publish(&agent, previous, held).await;
        Ok(())
    }

    async fn ensure_lock_placeholder(&self, id: AgentId) {
        let path = self.lock_path(id);
        match self.coordinator.exists(&path).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self
                    .coordinator
                    .create(CreateMode::Persistent, &path, b"")
                    .await
                {
                    debug!(%path, error = %e, "Lock placeholder not created");
                }
            }
            Err(e) => warn!(%path, error = %e, "Unable to check lock placeholder"),
        }
    }

    async fn drop_lock_placeholder(&self, id: AgentId) {
        let path = self.lock_path(id);
        if let Err(e) = self.coordinator.delete(&path, true).await {
            debug!(%path, error = %e, "Lock placeholder not deleted");
        }
    }

    /// Handle one event from the watch on the agent root.
    pub async fn on_event(&self, event: CoordEvent) -> Result<()> {
        let (path, status) = match event {
            CoordEvent::Reconnected => return self.reconcile().await,
            CoordEvent::ChildAdded(path) => (path, Some(AgentStatus::Idle)),
            CoordEvent::ChildRemoved(path) => (path, Some(AgentStatus::Offline)),
            CoordEvent::ChildUpdated(path) => (path, None),
        };

        if path.ends_with(LOCK_SUFFIX) {
            return Ok(());
        }

        let Some(id) = self.agent_id_of(&path) else {
            debug!(%path, "Ignoring event outside agent root");
            return Ok(());
        };

        if self.agents.get(id).await?.is_none() {
            warn!(%path, "Event for unknown agent");
            return Ok(());
        }

        match status {
            Some(AgentStatus::Offline) => {
                self.set_status(id, AgentStatus::Offline).await?;
                self.drop_lock_placeholder(id).await;
            }
            Some(status) => {
                self.ensure_lock_placeholder(id).await;
                self.set_status(id, status).await?;
            }
            None => self.resync(id).await?,
        }
        Ok(())
    }

    /// Start watching the agent root. Events are applied in order on a
    /// dedicated task.
    pub async fn watch(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut stream = self.coordinator.watch_children(&self.root).await?;
        let registry = Arc::clone(self);

        Ok(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Err(e) = registry.on_event(event.clone()).await {
                    warn!(?event, error = %e, "Failed to apply agent event");
                }
            }
            info!("Agent watch ended");
        }))
    }

    fn agent_id_of(&self, path: &str) -> Option<AgentId> {
        path.strip_prefix(self.root.as_str())?
            .strip_prefix('/')?
            .parse()
            .ok()
    }

    async fn publish(&self, agent: &Agent, previous: AgentStatus, job_id: Option<JobId>) {
        let event = Event::AgentStatusChanged(AgentStatusChangedPayload {
            agent_id: agent.id,
            name: agent.name.clone(),
            previous,
            status: agent.status,
            job_id,
            changed_at: Utc::now(),
        });
        if let Err(e) = self.events.publish(event).await {
            warn!(agent = %agent.name, error = %e, "Failed to publish agent event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_memory::{MemoryAgentRepository, MemoryCoordinator, MemoryEventBus};

    const ROOT: &str = "/agents";

    struct Fixture {
        repo: Arc<MemoryAgentRepository>,
        coord: Arc<MemoryCoordinator>,
        bus: Arc<MemoryEventBus>,
        registry: Arc<AgentRegistry>,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(MemoryAgentRepository::new());
        let coord = Arc::new(MemoryCoordinator::new());
        let bus = Arc::new(MemoryEventBus::new());
        let registry = Arc::new(AgentRegistry::new(
            repo.clone(),
            coord.clone(),
            bus.clone(),
            ROOT,
            Duration::from_millis(50),
        ));
        registry.init().await.unwrap();
        Fixture {
            repo,
            coord,
            bus,
            registry,
        }
    }

    async fn connect(f: &Fixture, name: &str) -> Agent {
        let agent = Agent::new(name, vec!["linux".to_string()]);
        f.repo.create(&agent).await.unwrap();
        let node = f.registry.node_path(agent.id);
        f.coord
            .create(CreateMode::Ephemeral, &node, b"IDLE")
            .await
            .unwrap();
        f.registry
            .on_event(CoordEvent::ChildAdded(node))
            .await
            .unwrap();
        f.registry.get(agent.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_node_added_marks_idle_with_placeholder() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;

        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(f.coord.exists(&f.registry.lock_path(agent.id)).await.unwrap());
        assert_eq!(f.bus.published_on("agent.status.*").len(), 1);
    }

    #[tokio::test]
    async fn test_lock_and_release() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;
        let job = JobId::new();

        let locked = f.registry.try_lock(job, agent.id).await.unwrap().unwrap();
        assert_eq!(locked.status, AgentStatus::Busy);
        assert_eq!(locked.job_id, Some(job));
        assert_eq!(
            f.coord.get(&f.registry.node_path(agent.id)).await.unwrap(),
            Some(b"BUSY".to_vec())
        );
        assert!(!f.coord.is_locked(&f.registry.lock_path(agent.id)));

        assert!(
            f.registry
                .try_lock(JobId::new(), agent.id)
                .await
                .unwrap()
                .is_none()
        );

        f.registry.release(agent.id).await.unwrap();
        let released = f.registry.get(agent.id).await.unwrap();
        assert_eq!(released.status, AgentStatus::Idle);
        assert!(released.job_id.is_none());

        // Releasing an idle agent changes nothing.
        let before = f.bus.published().len();
        f.registry.release(agent.id).await.unwrap();
        assert_eq!(f.bus.published().len(), before);
    }

    #[tokio::test]
    async fn test_concurrent_lock_single_winner() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;

        let r1 = f.registry.clone();
        let r2 = f.registry.clone();
        let id = agent.id;
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.try_lock(JobId::new(), id).await }),
            tokio::spawn(async move { r2.try_lock(JobId::new(), id).await }),
        );

        let winners = [a.unwrap().unwrap(), b.unwrap().unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_lock_requires_idle_liveness_node() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;
        f.coord
            .set(&f.registry.node_path(agent.id), b"OFFLINE")
            .await
            .unwrap();

        assert!(
            f.registry
                .try_lock(JobId::new(), agent.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_lock_contention_times_out() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;
        let _held = f
            .coord
            .acquire(&f.registry.lock_path(agent.id), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let result = f.registry.try_lock(JobId::new(), agent.id).await.unwrap();
        assert!(result.is_none());
        assert_eq!(
            f.registry.get(agent.id).await.unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_release_degrades_to_offline_on_coordination_failure() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;
        f.registry
            .try_lock(JobId::new(), agent.id)
            .await
            .unwrap()
            .unwrap();

        f.coord.fail_writes(true);
        f.registry.release(agent.id).await.unwrap();

        let agent = f.registry.get(agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.job_id.is_none());
    }

    #[tokio::test]
    async fn test_node_removed_reports_held_job() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;
        let job = JobId::new();
        f.registry.try_lock(job, agent.id).await.unwrap().unwrap();

        let node = f.registry.node_path(agent.id);
        f.coord.delete(&node, false).await.unwrap();
        f.registry
            .on_event(CoordEvent::ChildRemoved(node))
            .await
            .unwrap();

        let stored = f.registry.get(agent.id).await.unwrap();
        assert_eq!(stored.status, AgentStatus::Offline);
        assert!(!f.coord.exists(&f.registry.lock_path(agent.id)).await.unwrap());

        let last = f.bus.published().pop().unwrap();
        match last {
            Event::AgentStatusChanged(p) => {
                assert_eq!(p.status, AgentStatus::Offline);
                assert_eq!(p.job_id, Some(job));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconcile_marks_missing_nodes_offline() {
        let f = fixture().await;
        let a1 = connect(&f, "a1").await;
        let a2 = connect(&f, "a2").await;

        f.coord
            .delete(&f.registry.node_path(a1.id), false)
            .await
            .unwrap();
        f.coord
            .set(&f.registry.node_path(a2.id), b"BUSY")
            .await
            .unwrap();

        f.registry.reconcile().await.unwrap();

        assert_eq!(
            f.registry.get(a1.id).await.unwrap().status,
            AgentStatus::Offline
        );
        assert_eq!(
            f.registry.get(a2.id).await.unwrap().status,
            AgentStatus::Busy
        );
    }

    #[tokio::test]
    async fn test_lock_placeholder_events_ignored() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;
        let before = f.bus.published().len();

        f.registry
            .on_event(CoordEvent::ChildRemoved(f.registry.lock_path(agent.id)))
            .await
            .unwrap();

        assert_eq!(f.bus.published().len(), before);
        assert_eq!(
            f.registry.get(agent.id).await.unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_watch_follows_session_expiry() {
        let f = fixture().await;
        let agent = connect(&f, "a1").await;
        let handle = f.registry.watch().await.unwrap();

        f.coord.expire_session();

        for _ in 0..50 {
            if f.registry.get(agent.id).await.unwrap().status == AgentStatus::Offline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            f.registry.get(agent.id).await.unwrap().status,
            AgentStatus::Offline
        );
        handle.abort();
    }
}
