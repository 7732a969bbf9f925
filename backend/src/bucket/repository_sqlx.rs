use std::collections::BTreeMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::bucket::model::BucketState;
use crate::bucket::repository::BucketRepository;

/// SQLx-backed bucket store. Weights are kept as a JSON object.
pub struct SqlxBucketRepository {
    pool: AnyPool,
}

impl SqlxBucketRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BucketRepository for SqlxBucketRepository {
    async fn load(&self, bucket_id: &str) -> anyhow::Result<Option<BucketState>> {
        let row = sqlx::query(
            r#"SELECT weights, draws, version FROM bucket_state WHERE bucket_id = ?;"#,
        )
        .bind(bucket_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let weights: BTreeMap<String, f64> =
            serde_json::from_str(&r.get::<String, _>("weights")).context("invalid bucket weights")?;
        let draws: i64 = r.get("draws");

        Ok(Some(BucketState {
            weights,
            draws: u32::try_from(draws).map_err(|_| anyhow!("out of range for u32: {draws}"))?,
            version: r.get("version"),
        }))
    }

    async fn insert_initial(
        &self,
        bucket_id: &str,
        state: &BucketState,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
INSERT INTO bucket_state (bucket_id, weights, draws, version, updated_ms)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT (bucket_id) DO NOTHING;
"#,
        )
        .bind(bucket_id.to_string())
        .bind(serde_json::to_string(&state.weights)?)
        .bind(i64::from(state.draws))
        .bind(state.version)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn compare_and_swap(
        &self,
        bucket_id: &str,
        state: &BucketState,
        expected_version: i64,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE bucket_state
SET weights = ?, draws = ?, version = ?, updated_ms = ?
WHERE bucket_id = ? AND version = ?;
"#,
        )
        .bind(serde_json::to_string(&state.weights)?)
        .bind(i64::from(state.draws))
        .bind(state.version)
        .bind(now_ms)
        .bind(bucket_id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}
