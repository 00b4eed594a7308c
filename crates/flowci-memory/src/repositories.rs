//! Repositories backed by hash maps.

use async_trait::async_trait;
use flowci_core::agent::{Agent, AgentStatus};
use flowci_core::cmd::CmdId;
use flowci_core::ids::{AgentId, FlowId, JobId};
use flowci_core::job::{Job, JobStatus, JobYml};
use flowci_core::ports::{
    AgentRepository, BuildNumberRepository, JobRepository, JobYmlRepository, StepRepository,
};
use flowci_core::step::ExecutedCmd;
use flowci_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<HashMap<JobId, Job>>,
    failing: Mutex<Vec<JobStatus>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make updates that would store a job with `status` fail.
    pub fn fail_updates_to(&self, status: JobStatus) {
        self.failing.lock().unwrap().push(status);
    }

    /// Undo every `fail_updates_to`.
    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.values().any(|j| j.key == job.key) {
            return Err(Error::Database(format!("duplicate job key {}", job.key)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.key == key)
            .cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        if self.failing.lock().unwrap().contains(&job.status) {
            return Err(Error::Database(format!(
                "update of job {} to {} refused",
                job.id, job.status
            )));
        }
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(Error::JobNotFound(job.id.to_string())),
        }
    }
}

#[derive(Default)]
pub struct MemoryJobYmlRepository {
    ymls: Mutex<HashMap<JobId, JobYml>>,
    reads: AtomicUsize,
}

impl MemoryJobYmlRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobYmlRepository for MemoryJobYmlRepository {
    async fn create(&self, yml: &JobYml) -> Result<()> {
        let mut ymls = self.ymls.lock().unwrap();
        if ymls.contains_key(&yml.job_id) {
            return Err(Error::Database(format!(
                "job yml already exists for {}",
                yml.job_id
            )));
        }
        ymls.insert(yml.job_id, yml.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobYml>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.ymls.lock().unwrap().get(&job_id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryBuildNumberRepository {
    numbers: Mutex<HashMap<FlowId, u64>>,
}

impl MemoryBuildNumberRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildNumberRepository for MemoryBuildNumberRepository {
    async fn increment(&self, flow_id: FlowId) -> Result<u64> {
        let mut numbers = self.numbers.lock().unwrap();
        let n = numbers.entry(flow_id).or_insert(0);
        *n += 1;
        Ok(*n)
    }
}

#[derive(Default)]
pub struct MemoryStepRepository {
    steps: Mutex<HashMap<CmdId, ExecutedCmd>>,
    updates: AtomicUsize,
    lists: AtomicUsize,
    refuse_inserts: AtomicBool,
}

impl MemoryStepRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update` calls received.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of `list_by_job` calls served.
    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Make every later `insert_many` fail.
    pub fn fail_inserts(&self) {
        self.refuse_inserts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StepRepository for MemoryStepRepository {
    async fn insert_many(&self, steps: &[ExecutedCmd]) -> Result<()> {
        if self.refuse_inserts.load(Ordering::SeqCst) {
            return Err(Error::Database("step insert refused".to_string()));
        }
        let mut stored = self.steps.lock().unwrap();
        if let Some(dup) = steps.iter().find(|s| stored.contains_key(&s.id)) {
            return Err(Error::Database(format!("duplicate step {}", dup.id)));
        }
        for step in steps {
            stored.insert(step.id.clone(), step.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &CmdId) -> Result<Option<ExecutedCmd>> {
        Ok(self.steps.lock().unwrap().get(id).cloned())
    }

    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<ExecutedCmd>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let mut steps: Vec<_> = self
            .steps
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.id.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn update(&self, step: &ExecutedCmd) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut steps = self.steps.lock().unwrap();
        match steps.get_mut(&step.id) {
            Some(existing) => {
                *existing = step.clone();
                Ok(())
            }
            None => Err(Error::StepNotFound(step.id.to_string())),
        }
    }
}

#[derive(Default)]
pub struct MemoryAgentRepository {
    agents: Mutex<HashMap<AgentId, Agent>>,
}

impl MemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for MemoryAgentRepository {
    async fn create(&self, agent: &Agent) -> Result<()> {
        let mut agents = self.agents.lock().unwrap();
        if agents.values().any(|a| a.name == agent.name) {
            return Err(Error::Database(format!("duplicate agent name {}", agent.name)));
        }
        agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.agents.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<_> = self.agents.lock().unwrap().values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn find(&self, status: AgentStatus, tags: &[String]) -> Result<Vec<Agent>> {
        let mut agents: Vec<_> = self
            .agents
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.status == status && a.matches(tags))
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn update(&self, agent: &Agent) -> Result<()> {
        let mut agents = self.agents.lock().unwrap();
        match agents.get_mut(&agent.id) {
            Some(existing) => {
                *existing = agent.clone();
                Ok(())
            }
            None => Err(Error::AgentNotFound(agent.id.to_string())),
        }
    }
}
