//! PostgreSQL implementation of JobRepository and JobYmlRepository.

use crate::db_err;
use async_trait::async_trait;
use flowci_core::ids::{AgentId, FlowId, JobId, NodePath};
use flowci_core::job::{Job, JobYml};
use flowci_core::ports::{JobRepository, JobYmlRepository};
use flowci_core::{Error, Result};
use sqlx::{PgPool, Row};

const JOB_COLUMNS: &str = "id, job_key, flow_id, flow_name, build_number, trigger, status, \
     current_path, agent_id, context, message, expire_at, created_at, updated_at, started_at, \
     finished_at";

pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(r: &sqlx::postgres::PgRow) -> Result<Job> {
        let trigger: String = r.get("trigger");
        let status: String = r.get("status");
        let current_path: String = r.get("current_path");

        Ok(Job {
            id: JobId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            key: r.get("job_key"),
            flow_id: FlowId::from_uuid(r.get::<uuid::Uuid, _>("flow_id")),
            flow_name: r.get("flow_name"),
            build_number: r.get::<i64, _>("build_number") as u64,
            trigger: trigger.parse()?,
            status: status.parse()?,
            current_path: NodePath::parse(&current_path)?,
            agent_id: r
                .get::<Option<uuid::Uuid>, _>("agent_id")
                .map(AgentId::from_uuid),
            context: serde_json::from_str(r.get("context"))?,
            message: r.get("message"),
            expire_at: r.get("expire_at"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
            started_at: r.get("started_at"),
            finished_at: r.get("finished_at"),
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO jobs (id, job_key, flow_id, flow_name, build_number, trigger, status, current_path, agent_id, context, message, expire_at, created_at, updated_at, started_at, finished_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.key)
        .bind(job.flow_id.as_uuid())
        .bind(&job.flow_name)
        .bind(job.build_number as i64)
        .bind(job.trigger.as_str())
        .bind(job.status.as_str())
        .bind(job.current_path.as_str())
        .bind(job.agent_id.map(|a| *a.as_uuid()))
        .bind(serde_json::to_string(&job.context)?)
        .bind(&job.message)
        .bind(job.expire_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE job_key = $1", JOB_COLUMNS))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $2, current_path = $3, agent_id = $4, context = $5, message = $6, expire_at = $7, updated_at = $8, started_at = $9, finished_at = $10 WHERE id = $1",
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.current_path.as_str())
        .bind(job.agent_id.map(|a| *a.as_uuid()))
        .bind(serde_json::to_string(&job.context)?)
        .bind(&job.message)
        .bind(job.expire_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job.id.to_string()));
        }
        Ok(())
    }
}

pub struct PgJobYmlRepository {
    pool: PgPool,
}

impl PgJobYmlRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobYmlRepository for PgJobYmlRepository {
    async fn create(&self, yml: &JobYml) -> Result<()> {
        sqlx::query("INSERT INTO job_ymls (job_id, raw, created_at) VALUES ($1, $2, $3)")
            .bind(yml.job_id.as_uuid())
            .bind(&yml.raw)
            .bind(yml.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobYml>> {
        let row = sqlx::query("SELECT job_id, raw, created_at FROM job_ymls WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| JobYml {
            job_id: JobId::from_uuid(r.get::<uuid::Uuid, _>("job_id")),
            raw: r.get("raw"),
            created_at: r.get("created_at"),
        }))
    }
}
