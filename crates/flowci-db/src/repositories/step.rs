//! PostgreSQL implementation of StepRepository.

use crate::db_err;
use async_trait::async_trait;
use flowci_core::cmd::CmdId;
use flowci_core::ids::{FlowId, JobId, NodePath};
use flowci_core::ports::StepRepository;
use flowci_core::step::ExecutedCmd;
use flowci_core::{Error, Result};
use sqlx::{PgPool, Row};

const STEP_COLUMNS: &str = "job_id, node_path, flow_id, position, status, allow_failure, \
     process_id, exit_code, output, start_at, finish_at, error";

pub struct PgStepRepository {
    pool: PgPool,
}

impl PgStepRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_step(r: &sqlx::postgres::PgRow) -> Result<ExecutedCmd> {
        let path: String = r.get("node_path");
        let status: String = r.get("status");

        Ok(ExecutedCmd {
            id: CmdId::new(
                JobId::from_uuid(r.get::<uuid::Uuid, _>("job_id")),
                NodePath::parse(&path)?,
            ),
            flow_id: FlowId::from_uuid(r.get::<uuid::Uuid, _>("flow_id")),
            position: r.get::<i32, _>("position") as u32,
            status: status.parse()?,
            allow_failure: r.get("allow_failure"),
            process_id: r.get("process_id"),
            exit_code: r.get("exit_code"),
            output: serde_json::from_str(r.get("output"))?,
            start_at: r.get("start_at"),
            finish_at: r.get("finish_at"),
            error: r.get("error"),
        })
    }
}

#[async_trait]
impl StepRepository for PgStepRepository {
    /// All steps of a job go in within one transaction.
    async fn insert_many(&self, steps: &[ExecutedCmd]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for step in steps {
            sqlx::query(
                r#"INSERT INTO executed_cmds (job_id, node_path, flow_id, position, status, allow_failure, process_id, exit_code, output, start_at, finish_at, error)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
            )
            .bind(step.id.job_id.as_uuid())
            .bind(step.id.path.as_str())
            .bind(step.flow_id.as_uuid())
            .bind(step.position as i32)
            .bind(step.status.as_str())
            .bind(step.allow_failure)
            .bind(step.process_id)
            .bind(step.exit_code)
            .bind(serde_json::to_string(&step.output)?)
            .bind(step.start_at)
            .bind(step.finish_at)
            .bind(&step.error)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &CmdId) -> Result<Option<ExecutedCmd>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM executed_cmds WHERE job_id = $1 AND node_path = $2",
            STEP_COLUMNS
        ))
        .bind(id.job_id.as_uuid())
        .bind(id.path.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_step).transpose()
    }

    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<ExecutedCmd>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM executed_cmds WHERE job_id = $1 ORDER BY position",
            STEP_COLUMNS
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_step).collect()
    }

    async fn update(&self, step: &ExecutedCmd) -> Result<()> {
        let result = sqlx::query(
            "UPDATE executed_cmds SET status = $3, process_id = $4, exit_code = $5, output = $6, start_at = $7, finish_at = $8, error = $9 WHERE job_id = $1 AND node_path = $2",
        )
        .bind(step.id.job_id.as_uuid())
        .bind(step.id.path.as_str())
        .bind(step.status.as_str())
        .bind(step.process_id)
        .bind(step.exit_code)
        .bind(serde_json::to_string(&step.output)?)
        .bind(step.start_at)
        .bind(step.finish_at)
        .bind(&step.error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::StepNotFound(step.id.to_string()));
        }
        Ok(())
    }
}
