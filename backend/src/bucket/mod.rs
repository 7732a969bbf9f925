pub mod engine;
pub mod model;
pub mod repository;
pub mod repository_sqlx;

pub use engine::BucketDrawEngine;
pub use model::{BucketConfig, BucketState, Draw};
pub use repository::BucketRepository;
pub use repository_sqlx::SqlxBucketRepository;
