//! Containers backing the integration tests.

use testcontainers::core::{ContainerPort, IntoContainerPort};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, Image, ImageExt};
use testcontainers_modules::{nats::Nats, postgres::Postgres};

const POSTGRES_TAG: &str = "16-alpine";
const NATS_TAG: &str = "2.10-alpine";

/// A running container and the address tests connect to. Dropping it stops
/// the container.
pub struct Service<I: Image> {
    _container: ContainerAsync<I>,
    endpoint: String,
}

impl<I: Image> Service<I> {
    async fn expose(
        container: ContainerAsync<I>,
        port: ContainerPort,
        endpoint: impl FnOnce(String, u16) -> String,
    ) -> anyhow::Result<Self> {
        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(port).await?;
        Ok(Self {
            endpoint: endpoint(host, port),
            _container: container,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub type PostgresService = Service<Postgres>;
pub type NatsService = Service<Nats>;

/// PostgreSQL with the default `postgres` superuser.
pub async fn postgres() -> anyhow::Result<PostgresService> {
    let container = Postgres::default().with_tag(POSTGRES_TAG).start().await?;
    Service::expose(container, 5432.tcp(), |host, port| {
        format!("postgres://postgres:postgres@{}:{}/postgres", host, port)
    })
    .await
}

/// NATS with JetStream enabled.
pub async fn nats() -> anyhow::Result<NatsService> {
    let container = Nats::default()
        .with_tag(NATS_TAG)
        .with_cmd(["-js"])
        .start()
        .await?;
    Service::expose(container, 4222.tcp(), |host, port| {
        format!("nats://{}:{}", host, port)
    })
    .await
}
