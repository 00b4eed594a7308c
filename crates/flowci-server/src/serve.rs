//! `serve` and `migrate` commands.

use crate::config::ServerConfig;
use anyhow::Context;
use flowci_db::{
    Database, PgAgentRepository, PgBuildNumberRepository, PgJobRepository, PgJobYmlRepository,
    PgStepRepository,
};
use flowci_nats::{KvCoordinator, NatsConnection, NatsEventBus, NatsQueue};
use flowci_scheduler::{Backends, JobScheduler, Workers};
use flowci_trace::{init_tracer, shutdown_tracer};
use std::sync::Arc;
use tracing::{error, info, warn};

pub async fn migrate(config: &ServerConfig) -> anyhow::Result<()> {
    init_tracer(&config.tracing)?;
    let db = Database::connect(&config.database)
        .await
        .context("connecting to postgres")?;
    db.migrate().await?;
    shutdown_tracer();
    Ok(())
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    init_tracer(&config.tracing)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting flow.ci server");

    let result = serve(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Server stopped with an error");
    }
    shutdown_tracer();
    result
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let db = Database::connect(&config.database)
        .await
        .context("connecting to postgres")?;
    db.migrate().await?;
    let pool = db.pool().clone();

    let conn = NatsConnection::connect(config.nats.clone())
        .await
        .context("connecting to nats")?;
    let events = Arc::new(NatsEventBus::new(&conn).await?);
    let queue = Arc::new(NatsQueue::new(&conn).await?);
    let coordinator = Arc::new(KvCoordinator::new(&conn).await?);

    let scheduler = Arc::new(JobScheduler::new(
        config.scheduler.clone(),
        Backends {
            jobs: Arc::new(PgJobRepository::new(pool.clone())),
            job_ymls: Arc::new(PgJobYmlRepository::new(pool.clone())),
            build_numbers: Arc::new(PgBuildNumberRepository::new(pool.clone())),
            steps: Arc::new(PgStepRepository::new(pool.clone())),
            agents: Arc::new(PgAgentRepository::new(pool)),
            queue: queue.clone(),
            coordinator,
            events: events.clone(),
        },
    ));

    scheduler.agents().init().await?;
    scheduler.agents().reconcile().await?;

    let workers = Workers::start(scheduler, queue, events).await?;

    let health = conn.health_check();
    info!(
        status = ?health.status,
        connected = health.connected,
        "Server ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutting down");

    let stopped = workers.finished();
    if !stopped.is_empty() {
        warn!(?stopped, "Workers had stopped before shutdown");
    }
    workers.shutdown();
    conn.shutdown().await;
    Ok(())
}
