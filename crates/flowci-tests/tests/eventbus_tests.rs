//! Event bus integration tests.
//!
//! Run with: `cargo test -p flowci-tests --test eventbus_tests --features integration`

#![cfg(feature = "integration")]

use flowci_core::events::{Event, JobStatusChangedPayload, StepStatusChangedPayload};
use flowci_core::ids::{FlowId, JobId, NodePath};
use flowci_core::job::JobStatus;
use flowci_core::ports::EventBus;
use flowci_core::step::StepStatus;
use flowci_nats::NatsEventBus;
use flowci_tests::{assert_completes_within, context::TestContext};
use futures::StreamExt;
use std::time::Duration;

fn job_status(job_id: JobId, status: JobStatus) -> Event {
    Event::JobStatusChanged(JobStatusChangedPayload {
        job_id,
        flow_id: FlowId::new(),
        build_number: 1,
        previous: JobStatus::Pending,
        status,
        message: None,
        changed_at: chrono::Utc::now(),
    })
}

fn step_status(job_id: JobId) -> Event {
    Event::StepStatusChanged(StepStatusChangedPayload {
        job_id,
        path: NodePath::parse("root/build").unwrap(),
        previous: StepStatus::Pending,
        status: StepStatus::Running,
        changed_at: chrono::Utc::now(),
    })
}

#[tokio::test]
async fn test_publish_event() {
    let ctx = TestContext::nats_only()
        .await
        .expect("Failed to create context");
    let bus = NatsEventBus::new(&ctx.conn).await.unwrap();

    bus.publish(job_status(JobId::new(), JobStatus::Queued))
        .await
        .expect("Failed to publish event");

    let metrics = ctx.conn.metrics().snapshot();
    assert_eq!(metrics.events_published, 1);
    assert_eq!(metrics.publish_failures, 0);
}

#[tokio::test]
async fn test_subscription_filters_by_subject() {
    let ctx = TestContext::nats_only()
        .await
        .expect("Failed to create context");
    let bus = NatsEventBus::new(&ctx.conn).await.unwrap();

    let job_id = JobId::new();
    let mut jobs = bus.subscribe("job.status.*").await.unwrap();

    bus.publish(step_status(job_id)).await.unwrap();
    bus.publish(job_status(job_id, JobStatus::Running)).await.unwrap();

    let event = assert_completes_within(jobs.next(), Duration::from_secs(5))
        .await
        .expect("stream open")
        .expect("decodable event");
    match event {
        Event::JobStatusChanged(p) => {
            assert_eq!(p.job_id, job_id);
            assert_eq!(p.status, JobStatus::Running);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_every_subscriber_receives() {
    let ctx = TestContext::nats_only()
        .await
        .expect("Failed to create context");
    let bus = NatsEventBus::new(&ctx.conn).await.unwrap();

    let mut first = bus.subscribe("job.>").await.unwrap();
    let mut second = bus.subscribe("job.>").await.unwrap();

    bus.publish(job_status(JobId::new(), JobStatus::Success))
        .await
        .unwrap();

    for stream in [&mut first, &mut second] {
        let event = assert_completes_within(stream.next(), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::JobStatusChanged(_)));
    }
}

#[tokio::test]
async fn test_events_from_another_client() {
    let ctx = TestContext::nats_only()
        .await
        .expect("Failed to create context");
    let subscriber = NatsEventBus::new(&ctx.conn).await.unwrap();
    let other = ctx.connect().await.unwrap();
    let publisher = NatsEventBus::new(&other).await.unwrap();

    let mut steps = subscriber.subscribe("step.status.*").await.unwrap();
    publisher.publish(step_status(JobId::new())).await.unwrap();

    let event = assert_completes_within(steps.next(), Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, Event::StepStatusChanged(_)));
    assert_eq!(subscriber.retained().await.unwrap(), 1);
}
