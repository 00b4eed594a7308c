//! Test context providing access to all test infrastructure.

use crate::containers::{self, NatsService, PostgresService};
use crate::helpers::TestServer;
use flowci_db::{Database, DatabaseConfig};
use flowci_nats::{NatsConfig, NatsConnection};
use flowci_scheduler::SchedulerConfig;
use std::time::Duration;

/// Ephemeral agent nodes vanish this long after their owner disconnects.
pub const SESSION_TTL: Duration = Duration::from_secs(2);

/// Postgres and NATS, both connected. Dropping it stops the containers.
pub struct TestContext {
    pub postgres: PostgresService,
    pub nats: NatsService,
    pub db: Database,
    pub conn: NatsConnection,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let (postgres, nats) = tokio::try_join!(containers::postgres(), containers::nats())?;

        let db = connect_db(&postgres).await?;
        let conn = connect_nats(&nats).await?;

        Ok(Self {
            postgres,
            nats,
            db,
            conn,
        })
    }

    /// Repository tests need no broker.
    pub async fn postgres_only() -> anyhow::Result<PostgresOnlyContext> {
        crate::init_test_logging();

        let postgres = containers::postgres().await?;
        let db = connect_db(&postgres).await?;

        Ok(PostgresOnlyContext { postgres, db })
    }

    pub async fn nats_only() -> anyhow::Result<NatsOnlyContext> {
        crate::init_test_logging();

        let nats = containers::nats().await?;
        let conn = connect_nats(&nats).await?;

        Ok(NatsOnlyContext { nats, conn })
    }

    /// A second, independent NATS client, as an agent process would hold.
    pub async fn connect(&self) -> anyhow::Result<NatsConnection> {
        connect_nats(&self.nats).await
    }

    /// Scheduler over the real adapters with its workers running.
    pub async fn server(&self, config: SchedulerConfig) -> anyhow::Result<TestServer> {
        TestServer::start(&self.db, &self.conn, config).await
    }
}

async fn connect_db(postgres: &PostgresService) -> anyhow::Result<Database> {
    let db = Database::connect(&DatabaseConfig::new(postgres.endpoint())).await?;
    db.migrate().await?;
    Ok(db)
}

async fn connect_nats(nats: &NatsService) -> anyhow::Result<NatsConnection> {
    let config = NatsConfig::new(nats.endpoint()).with_session_ttl(SESSION_TTL);
    Ok(NatsConnection::connect(config).await?)
}

pub struct PostgresOnlyContext {
    pub postgres: PostgresService,
    pub db: Database,
}

pub struct NatsOnlyContext {
    pub nats: NatsService,
    pub conn: NatsConnection,
}

impl NatsOnlyContext {
    pub async fn connect(&self) -> anyhow::Result<NatsConnection> {
        connect_nats(&self.nats).await
    }
}
