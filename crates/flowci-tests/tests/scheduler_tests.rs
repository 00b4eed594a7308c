//! End-to-end scheduling over PostgreSQL and NATS.
//!
//! Run with: `cargo test -p flowci-tests --test scheduler_tests --features integration`

#![cfg(feature = "integration")]

use flowci_core::agent::{Agent, AgentStatus};
use flowci_core::cmd::CmdIn;
use flowci_core::events::Event;
use flowci_core::ids::{AgentId, JobId};
use flowci_core::job::{Job, JobStatus, Trigger};
use flowci_core::ports::{AgentRepository, EventBus};
use flowci_core::step::StepStatus;
use flowci_core::vars::Vars;
use flowci_scheduler::SchedulerConfig;
use flowci_scheduler::scheduler::AGENT_OFFLINE_MESSAGE;
use flowci_tests::{
    AgentFixture, FlowFixture, LINEAR_YML, LINUX_ONLY_YML, POLL, SimAgent, TestServer,
    WITH_FINAL_YML, context::TestContext, wait_for,
};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(20);

fn config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_retry_delay(Duration::from_secs(1))
        .with_lock_wait(Duration::from_secs(1))
}

async fn submit(server: &TestServer, yml: &str) -> Job {
    let job = server
        .scheduler
        .create(&FlowFixture::simple(), yml, Trigger::Manual, &Vars::new())
        .await
        .expect("job created");
    server.scheduler.start(job.id).await.expect("job started")
}

async fn reaches(server: &TestServer, job_id: JobId, status: JobStatus) -> bool {
    wait_for(PATIENCE, POLL, || async move {
        server
            .scheduler
            .get(job_id)
            .await
            .is_ok_and(|job| job.status == status)
    })
    .await
}

async fn agent_is(server: &TestServer, id: AgentId, status: AgentStatus) -> bool {
    wait_for(PATIENCE, POLL, || async move {
        matches!(server.agents.get(id).await, Ok(Some(a)) if a.status == status)
    })
    .await
}

async fn online(ctx: &TestContext, server: &TestServer, agent: Agent) -> SimAgent {
    let sim = SimAgent::start(ctx.connect().await.unwrap(), server, agent)
        .await
        .expect("agent started");
    assert!(agent_is(server, sim.agent.id, AgentStatus::Idle).await);
    sim
}

#[tokio::test]
async fn test_job_runs_to_success() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let server = ctx.server(config()).await.unwrap();
    let agent = online(&ctx, &server, AgentFixture::named("agent-1")).await;

    let job = submit(&server, LINEAR_YML).await;
    assert!(reaches(&server, job.id, JobStatus::Success).await);

    assert_eq!(
        agent.shell_paths(),
        vec!["root/checkout", "root/build", "root/test"]
    );
    let steps = server.scheduler.steps().list(job.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Success));
    assert!(agent_is(&server, agent.agent.id, AgentStatus::Idle).await);
}

#[tokio::test]
async fn test_failure_still_runs_final_step() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let server = ctx.server(config()).await.unwrap();
    let agent = SimAgent::with_outcome(
        ctx.connect().await.unwrap(),
        &server,
        AgentFixture::named("agent-1"),
        |shell| match shell.step_name.as_str() {
            "test" => StepStatus::Exception,
            _ => StepStatus::Success,
        },
    )
    .await
    .unwrap();
    assert!(agent_is(&server, agent.agent.id, AgentStatus::Idle).await);

    let job = submit(&server, WITH_FINAL_YML).await;
    assert!(reaches(&server, job.id, JobStatus::Failure).await);
    assert_eq!(
        agent.shell_paths(),
        vec!["root/build", "root/test", "root/cleanup"]
    );
}

#[tokio::test]
async fn test_queued_job_waits_for_an_agent() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let server = ctx.server(config()).await.unwrap();

    let job = submit(&server, LINEAR_YML).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        server.scheduler.get(job.id).await.unwrap().status,
        JobStatus::Queued
    );

    let _agent = online(&ctx, &server, AgentFixture::named("late")).await;
    assert!(reaches(&server, job.id, JobStatus::Success).await);
}

#[tokio::test]
async fn test_selector_picks_tagged_agent() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let server = ctx.server(config()).await.unwrap();
    let plain = online(&ctx, &server, AgentFixture::named("plain")).await;
    let linux = online(&ctx, &server, AgentFixture::linux("linux")).await;

    let job = submit(&server, LINUX_ONLY_YML).await;
    assert!(reaches(&server, job.id, JobStatus::Success).await);

    let job = server.scheduler.get(job.id).await.unwrap();
    assert_eq!(job.agent_id, Some(linux.agent.id));
    assert!(plain.received().is_empty());
}

#[tokio::test]
async fn test_cancel_kills_running_step() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let server = ctx.server(config()).await.unwrap();
    let agent = SimAgent::with_outcome(
        ctx.connect().await.unwrap(),
        &server,
        AgentFixture::named("slow"),
        |_| StepStatus::Running,
    )
    .await
    .unwrap();
    assert!(agent_is(&server, agent.agent.id, AgentStatus::Idle).await);

    let job = submit(&server, LINEAR_YML).await;
    assert!(reaches(&server, job.id, JobStatus::Running).await);
    let sim = &agent;
    assert!(wait_for(PATIENCE, POLL, || async move { !sim.shell_paths().is_empty() }).await);

    server.scheduler.cancel(job.id).await.unwrap();
    assert!(reaches(&server, job.id, JobStatus::Cancelled).await);
    assert!(agent
        .received()
        .iter()
        .any(|c| matches!(c, CmdIn::Kill(k) if k.job_id == job.id)));
    assert!(agent_is(&server, agent.agent.id, AgentStatus::Idle).await);
}

#[tokio::test]
async fn test_agent_crash_cancels_its_job() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let server = ctx.server(config()).await.unwrap();
    let agent = SimAgent::with_outcome(
        ctx.connect().await.unwrap(),
        &server,
        AgentFixture::named("fragile"),
        |_| StepStatus::Running,
    )
    .await
    .unwrap();
    let agent_id = agent.agent.id;
    assert!(agent_is(&server, agent_id, AgentStatus::Idle).await);

    let job = submit(&server, LINEAR_YML).await;
    assert!(reaches(&server, job.id, JobStatus::Running).await);

    agent.crash().await;

    assert!(reaches(&server, job.id, JobStatus::Cancelled).await);
    let job = server.scheduler.get(job.id).await.unwrap();
    assert_eq!(job.message.as_deref(), Some(AGENT_OFFLINE_MESSAGE));
    assert!(agent_is(&server, agent_id, AgentStatus::Offline).await);
}

#[tokio::test]
async fn test_status_events_follow_the_job() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let server = ctx.server(config()).await.unwrap();
    let _agent = online(&ctx, &server, AgentFixture::named("agent-1")).await;

    let mut events = server.events.subscribe("job.status.*").await.unwrap();
    let job = submit(&server, LINEAR_YML).await;

    let mut seen = Vec::new();
    let collected = tokio::time::timeout(PATIENCE, async {
        while let Some(event) = events.next().await {
            if let Ok(Event::JobStatusChanged(p)) = event
                && p.job_id == job.id
            {
                seen.push(p.status);
                if p.status.is_finished() {
                    break;
                }
            }
        }
    })
    .await;

    assert!(collected.is_ok());
    assert_eq!(
        seen,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Success]
    );
}
