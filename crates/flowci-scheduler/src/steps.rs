//! Execution records of the nodes of each job.

use chrono::Utc;
use dashmap::DashMap;
use flowci_core::cmd::CmdId;
use flowci_core::events::{Event, StepStatusChangedPayload};
use flowci_core::ids::{JobId, NodePath};
use flowci_core::job::Job;
use flowci_core::ports::{EventBus, StepRepository};
use flowci_core::step::{ExecutedCmd, StepStatus};
use flowci_core::tree::StepTree;
use flowci_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keeps one [`ExecutedCmd`] per node per job, with a per-job list cache.
pub struct StepTracker {
    steps: Arc<dyn StepRepository>,
    events: Arc<dyn EventBus>,
    cache: DashMap<JobId, Arc<Vec<ExecutedCmd>>>,
}

impl StepTracker {
    pub fn new(steps: Arc<dyn StepRepository>, events: Arc<dyn EventBus>) -> Self {
        Self {
            steps,
            events,
            cache: DashMap::new(),
        }
    }

    /// Create a PENDING record for every runnable node of `tree`.
    pub async fn init(&self, job: &Job, tree: &StepTree) -> Result<Vec<ExecutedCmd>> {
        let steps: Vec<ExecutedCmd> = tree
            .ordered()
            .iter()
            .enumerate()
            .map(|(i, node)| ExecutedCmd::pending(job.id, job.flow_id, node, i as u32))
            .collect();

        self.steps.insert_many(&steps).await?;
        self.cache.remove(&job.id);
        debug!(job_id = %job.id, count = steps.len(), "Steps initialized");
        Ok(steps)
    }

    pub async fn get(&self, job_id: JobId, path: &NodePath) -> Result<ExecutedCmd> {
        let id = CmdId::new(job_id, path.clone());
        self.steps
            .get(&id)
            .await?
            .ok_or_else(|| Error::StepNotFound(id.to_string()))
    }

    /// Steps of a job in tree order.
    pub async fn list(&self, job_id: JobId) -> Result<Arc<Vec<ExecutedCmd>>> {
        if let Some(cached) = self.cache.get(&job_id) {
            return Ok(Arc::clone(&cached));
        }

        let steps = Arc::new(self.steps.list_by_job(job_id).await?);
        self.cache.insert(job_id, Arc::clone(&steps));
        Ok(steps)
    }

    /// Store a new state of a step.
    ///
    /// Returns `false` without touching storage when the status is unchanged
    /// or would move backwards (a finished step never changes again).
    pub async fn update(&self, step: &ExecutedCmd) -> Result<bool> {
        let current = self
            .steps
            .get(&step.id)
            .await?
            .ok_or_else(|| Error::StepNotFound(step.id.to_string()))?;

        if step.status == current.status
            || current.status.is_finished()
            || step.status.rank() < current.status.rank()
        {
            debug!(
                step = %step.id,
                current = %current.status,
                incoming = %step.status,
                "Step update ignored"
            );
            return Ok(false);
        }

        let now = Utc::now();
        let mut updated = current.clone();
        updated.status = step.status;
        updated.process_id = step.process_id.or(current.process_id);
        updated.exit_code = step.exit_code.or(current.exit_code);
        updated.error = step.error.clone().or_else(|| current.error.clone());
        if !step.output.is_empty() {
            updated.output = step.output.clone();
        }
        updated.start_at = current.start_at.or(step.start_at);
        if step.status == StepStatus::Running && updated.start_at.is_none() {
            updated.start_at = Some(now);
        }
        if step.status.is_finished() {
            updated.finish_at = step.finish_at.or(Some(now));
        }

        self.steps.update(&updated).await?;
        self.cache.remove(&step.id.job_id);

        let event = Event::StepStatusChanged(StepStatusChangedPayload {
            job_id: step.id.job_id,
            path: step.id.path.clone(),
            previous: current.status,
            status: updated.status,
            changed_at: now,
        });
        if let Err(e) = self.events.publish(event).await {
            warn!(step = %step.id, error = %e, "Failed to publish step event");
        }
        Ok(true)
    }

    /// Move a step to `status`, recording `error` when given.
    pub async fn mark(
        &self,
        job_id: JobId,
        path: &NodePath,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut step = self.get(job_id, path).await?;
        step.status = status;
        step.error = error;
        self.update(&step).await
    }

    /// Mark every step still PENDING or RUNNING as SKIPPED.
    pub async fn skip_unfinished(&self, job_id: JobId) -> Result<usize> {
        let steps = self.list(job_id).await?;
        let mut skipped = 0;
        for step in steps.iter().filter(|s| !s.status.is_finished()) {
            let mut step = step.clone();
            step.status = StepStatus::Skipped;
            if self.update(&step).await? {
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    /// Drop the cached list of a job.
    pub fn evict(&self, job_id: JobId) {
        self.cache.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_core::ids::FlowId;
    use flowci_core::job::{JobStatus, Trigger};
    use flowci_core::vars::Vars;
    use flowci_memory::{MemoryEventBus, MemoryStepRepository};
    use pretty_assertions::assert_eq;

    fn job() -> Job {
        let now = Utc::now();
        let flow_id = FlowId::new();
        Job {
            id: JobId::new(),
            key: Job::key_of(flow_id, 1),
            flow_id,
            flow_name: "demo".to_string(),
            build_number: 1,
            trigger: Trigger::Manual,
            status: JobStatus::Pending,
            current_path: NodePath::root(),
            agent_id: None,
            context: Vars::new(),
            message: None,
            expire_at: now + chrono::Duration::hours(1),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    fn tree() -> StepTree {
        StepTree::parse(
            "steps:\n  - name: a\n    script: echo a\n  - name: b\n    script: echo b\n",
        )
        .unwrap()
    }

    fn tracker() -> (StepTracker, Arc<MemoryStepRepository>, Arc<MemoryEventBus>) {
        let repo = Arc::new(MemoryStepRepository::new());
        let bus = Arc::new(MemoryEventBus::new());
        (StepTracker::new(repo.clone(), bus.clone()), repo, bus)
    }

    #[tokio::test]
    async fn test_init_and_list_in_tree_order() {
        let (tracker, _, _) = tracker();
        let job = job();
        tracker.init(&job, &tree()).await.unwrap();

        let steps = tracker.list(job.id).await.unwrap();
        let paths: Vec<_> = steps.iter().map(|s| s.id.path.to_string()).collect();
        assert_eq!(paths, vec!["root/a", "root/b"]);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn test_get_unknown_step() {
        let (tracker, _, _) = tracker();
        let err = tracker
            .get(JobId::new(), &NodePath::parse("root/a").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StepNotFound(_)));
    }

    #[tokio::test]
    async fn test_same_status_update_is_noop() {
        let (tracker, repo, bus) = tracker();
        let job = job();
        tracker.init(&job, &tree()).await.unwrap();
        let path = NodePath::parse("root/a").unwrap();

        assert!(
            tracker
                .mark(job.id, &path, StepStatus::Running, None)
                .await
                .unwrap()
        );
        let first = tracker.get(job.id, &path).await.unwrap();
        let updates = repo.updates();
        let events = bus.published().len();

        assert!(
            !tracker
                .mark(job.id, &path, StepStatus::Running, None)
                .await
                .unwrap()
        );
        assert_eq!(repo.updates(), updates);
        assert_eq!(bus.published().len(), events);
        assert_eq!(tracker.get(job.id, &path).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_finished_step_never_changes() {
        let (tracker, _, _) = tracker();
        let job = job();
        tracker.init(&job, &tree()).await.unwrap();
        let path = NodePath::parse("root/a").unwrap();

        tracker
            .mark(job.id, &path, StepStatus::Success, None)
            .await
            .unwrap();
        assert!(
            !tracker
                .mark(job.id, &path, StepStatus::Running, None)
                .await
                .unwrap()
        );
        assert!(
            !tracker
                .mark(job.id, &path, StepStatus::Skipped, None)
                .await
                .unwrap()
        );

        let step = tracker.get(job.id, &path).await.unwrap();
        assert_eq!(step.status, StepStatus::Success);
        assert!(step.finish_at.is_some());
    }

    #[tokio::test]
    async fn test_list_cache_invalidated_on_update() {
        let (tracker, repo, _) = tracker();
        let job = job();
        tracker.init(&job, &tree()).await.unwrap();

        tracker.list(job.id).await.unwrap();
        tracker.list(job.id).await.unwrap();
        assert_eq!(repo.lists(), 1);

        let path = NodePath::parse("root/b").unwrap();
        tracker
            .mark(job.id, &path, StepStatus::Running, None)
            .await
            .unwrap();
        let steps = tracker.list(job.id).await.unwrap();
        assert_eq!(repo.lists(), 2);
        assert_eq!(steps[1].status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_skip_unfinished() {
        let (tracker, _, _) = tracker();
        let job = job();
        tracker.init(&job, &tree()).await.unwrap();
        tracker
            .mark(
                job.id,
                &NodePath::parse("root/a").unwrap(),
                StepStatus::Success,
                None,
            )
            .await
            .unwrap();

        assert_eq!(tracker.skip_unfinished(job.id).await.unwrap(), 1);
        let statuses: Vec<_> = tracker
            .list(job.id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.status)
            .collect();
        assert_eq!(statuses, vec![StepStatus::Success, StepStatus::Skipped]);
    }
}
