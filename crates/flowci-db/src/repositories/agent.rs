//! PostgreSQL implementation of AgentRepository.

use crate::db_err;
use async_trait::async_trait;
use flowci_core::agent::{Agent, AgentStatus, Os, Resource};
use flowci_core::ids::{AgentId, JobId};
use flowci_core::ports::AgentRepository;
use flowci_core::{Error, Result};
use sqlx::{PgPool, Row};

const AGENT_COLUMNS: &str =
    "id, name, token, tags, status, job_id, url, os, resource, created_at, updated_at";

pub struct PgAgentRepository {
    pool: PgPool,
}

impl PgAgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn os_to_str(os: Os) -> &'static str {
        match os {
            Os::Linux => "linux",
            Os::Macos => "macos",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        }
    }

    fn str_to_os(s: &str) -> Os {
        match s {
            "linux" => Os::Linux,
            "macos" => Os::Macos,
            "windows" => Os::Windows,
            _ => Os::Unknown,
        }
    }

    fn row_to_agent(r: &sqlx::postgres::PgRow) -> Result<Agent> {
        let status: String = r.get("status");
        let os: String = r.get("os");
        let resource: Option<Resource> = r
            .get::<Option<serde_json::Value>, _>("resource")
            .map(serde_json::from_value)
            .transpose()?;

        Ok(Agent {
            id: AgentId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            name: r.get("name"),
            token: r.get("token"),
            tags: r.get("tags"),
            status: status.parse()?,
            job_id: r
                .get::<Option<uuid::Uuid>, _>("job_id")
                .map(JobId::from_uuid),
            url: r.get("url"),
            os: Self::str_to_os(&os),
            resource,
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        })
    }
}

#[async_trait]
impl AgentRepository for PgAgentRepository {
    async fn create(&self, agent: &Agent) -> Result<()> {
        let resource = agent
            .resource
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO agents (id, name, token, tags, status, job_id, url, os, resource, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(agent.id.as_uuid())
        .bind(&agent.name)
        .bind(&agent.token)
        .bind(&agent.tags)
        .bind(agent.status.as_str())
        .bind(agent.job_id.map(|j| *j.as_uuid()))
        .bind(&agent.url)
        .bind(Self::os_to_str(agent.os))
        .bind(&resource)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!("SELECT {} FROM agents WHERE id = $1", AGENT_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agents ORDER BY created_at",
            AGENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn find(&self, status: AgentStatus, tags: &[String]) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agents WHERE status = $1 AND (cardinality($2::text[]) = 0 OR tags && $2::text[]) ORDER BY created_at",
            AGENT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(tags)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn update(&self, agent: &Agent) -> Result<()> {
        let resource = agent
            .resource
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = sqlx::query(
            "UPDATE agents SET tags = $2, status = $3, job_id = $4, url = $5, os = $6, resource = $7, updated_at = $8 WHERE id = $1",
        )
        .bind(agent.id.as_uuid())
        .bind(&agent.tags)
        .bind(agent.status.as_str())
        .bind(agent.job_id.map(|j| *j.as_uuid()))
        .bind(&agent.url)
        .bind(Self::os_to_str(agent.os))
        .bind(&resource)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::AgentNotFound(agent.id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_mapping() {
        for os in [Os::Linux, Os::Macos, Os::Windows, Os::Unknown] {
            assert_eq!(
                PgAgentRepository::str_to_os(PgAgentRepository::os_to_str(os)),
                os
            );
        }
        assert_eq!(PgAgentRepository::str_to_os("plan9"), Os::Unknown);
    }
}
