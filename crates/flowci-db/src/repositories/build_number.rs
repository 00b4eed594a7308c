//! PostgreSQL implementation of BuildNumberRepository.

use crate::db_err;
use async_trait::async_trait;
use flowci_core::Result;
use flowci_core::ids::FlowId;
use flowci_core::ports::BuildNumberRepository;
use sqlx::{PgPool, Row};

pub struct PgBuildNumberRepository {
    pool: PgPool,
}

impl PgBuildNumberRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildNumberRepository for PgBuildNumberRepository {
    /// Single upsert, so concurrent callers never share a number.
    async fn increment(&self, flow_id: FlowId) -> Result<u64> {
        let row = sqlx::query(
            "INSERT INTO build_numbers (flow_id, value) VALUES ($1, 1) \
             ON CONFLICT (flow_id) DO UPDATE SET value = build_numbers.value + 1 \
             RETURNING value",
        )
        .bind(flow_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("value") as u64)
    }
}
