use anyhow::Result;
use async_trait::async_trait;

use crate::bucket::model::BucketState;

#[async_trait]
pub trait BucketRepository: Send + Sync {
    async fn load(&self, bucket_id: &str) -> Result<Option<BucketState>>;

    /// Creates the row unless it exists. Returns whether it was created.
    async fn insert_initial(&self, bucket_id: &str, state: &BucketState, now_ms: i64) -> Result<bool>;

    /// Writes `state` only if the stored version is still `expected_version`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        bucket_id: &str,
        state: &BucketState,
        expected_version: i64,
        now_ms: i64,
    ) -> Result<bool>;
}
