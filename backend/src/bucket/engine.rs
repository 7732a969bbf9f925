use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::bucket::model::{BucketConfig, BucketState, Draw};
use crate::bucket::repository::BucketRepository;
use crate::error::BucketError;
use crate::logger::warn_if_slow;
use crate::metrics::counters::{Counters, bump};
use crate::time::now_ms;

pub const DEFAULT_BUCKET_ID: &str = "coaches";

/// Weighted, degressive lottery over the configured resources.
///
/// Every draw is one read-modify-write of the persisted document. An
/// in-process mutex serializes local callers; the version compare-and-swap
/// rejects writes from other instances that raced in between, and the draw
/// is retried from a fresh read.
pub struct BucketDrawEngine {
    repo: Arc<dyn BucketRepository>,
    cfg: BucketConfig,
    bucket_id: String,
    rng: Mutex<StdRng>,
    gate: AsyncMutex<()>,
    max_conflicts: usize,
    counters: Counters,
}

impl BucketDrawEngine {
    pub fn new(repo: Arc<dyn BucketRepository>, cfg: BucketConfig, counters: Counters) -> Self {
        Self::with_rng(repo, cfg, counters, StdRng::from_entropy())
    }

    /// Deterministic draws for tests and replays.
    pub fn with_seed(repo: Arc<dyn BucketRepository>, cfg: BucketConfig, counters: Counters, seed: u64) -> Self {
        Self::with_rng(repo, cfg, counters, StdRng::seed_from_u64(seed))
    }

    fn with_rng(repo: Arc<dyn BucketRepository>, cfg: BucketConfig, counters: Counters, rng: StdRng) -> Self {
        Self {
            repo,
            cfg,
            bucket_id: DEFAULT_BUCKET_ID.to_string(),
            rng: Mutex::new(rng),
            gate: AsyncMutex::new(()),
            max_conflicts: 5,
            counters,
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.cfg
    }

    #[instrument(skip(self), target = "bucket")]
    pub async fn draw(&self) -> Result<Draw, BucketError> {
        let _gate = self.gate.lock().await;

        for attempt in 1..=self.max_conflicts {
            let current = self.load_or_init().await?;

            let mut next = current.clone();
            let draw = {
                let mut rng = self.rng.lock();
                next.draw(&mut *rng, &self.cfg)?
            };
            next.version = current.version + 1;

            if self.swap(&next, current.version).await? {
                bump(&self.counters.bucket_draws);
                if draw.reset || draw.forced_reset {
                    bump(&self.counters.bucket_resets);
                }
                if draw.forced_reset {
                    warn!("bucket was exhausted before the threshold; defaults restored");
                }
                info!(
                    resource_id = %draw.resource_id,
                    draws = next.draws,
                    reset = draw.reset,
                    version = next.version,
                    "bucket draw"
                );
                return Ok(draw);
            }

            bump(&self.counters.bucket_conflicts);
            debug!(attempt, "bucket version moved underneath us; retrying");
        }

        Err(BucketError::Conflict(self.max_conflicts))
    }

    /// Current persisted state.
    pub async fn snapshot(&self) -> Result<BucketState, BucketError> {
        self.load_or_init().await
    }

    /// Restores the configured defaults and zeroes the counter.
    #[instrument(skip(self), target = "bucket")]
    pub async fn reset(&self) -> Result<BucketState, BucketError> {
        let _gate = self.gate.lock().await;

        for _ in 0..self.max_conflicts {
            let current = self.load_or_init().await?;
            let mut next = current.clone();
            next.reset(&self.cfg);
            next.version = current.version + 1;

            if self.swap(&next, current.version).await? {
                bump(&self.counters.bucket_resets);
                info!(version = next.version, "bucket reset");
                return Ok(next);
            }
            bump(&self.counters.bucket_conflicts);
        }

        Err(BucketError::Conflict(self.max_conflicts))
    }

    /// Loads the bucket, creating it from the defaults on first use. A stored
    /// bucket whose resources no longer match the configuration starts over.
    async fn load_or_init(&self) -> Result<BucketState, BucketError> {
        let loaded = warn_if_slow("db_bucket_load", Duration::from_millis(50), async {
            self.repo.load(&self.bucket_id).await
        })
        .await
        .map_err(BucketError::Storage)?;

        match loaded {
            Some(state) if state.matches(&self.cfg) => Ok(state),
            Some(state) => {
                warn!(
                    stored = ?state.weights.keys().collect::<Vec<_>>(),
                    "bucket resources changed in configuration; restoring defaults"
                );
                let mut next = BucketState::fresh(&self.cfg);
                next.version = state.version + 1;
                if self.swap(&next, state.version).await? {
                    Ok(next)
                } else {
                    self.repo
                        .load(&self.bucket_id)
                        .await
                        .map_err(BucketError::Storage)?
                        .ok_or_else(|| BucketError::Storage(anyhow::anyhow!("bucket row vanished")))
                }
            }
            None => {
                let fresh = BucketState::fresh(&self.cfg);
                self.repo
                    .insert_initial(&self.bucket_id, &fresh, now_ms())
                    .await
                    .map_err(BucketError::Storage)?;
                self.repo
                    .load(&self.bucket_id)
                    .await
                    .map_err(BucketError::Storage)?
                    .ok_or_else(|| BucketError::Storage(anyhow::anyhow!("bucket row missing after insert")))
            }
        }
    }

    async fn swap(&self, next: &BucketState, expected: i64) -> Result<bool, BucketError> {
        warn_if_slow("db_bucket_swap", Duration::from_millis(50), async {
            self.repo
                .compare_and_swap(&self.bucket_id, next, expected, now_ms())
                .await
        })
        .await
        .map_err(BucketError::Storage)
    }
}
