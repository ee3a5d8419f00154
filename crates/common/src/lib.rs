//! Shared types for the generated-API runtime.
//!
//! Holds the persistence-facing models ([`ApiRecord`], [`Artifact`],
//! [`UsageRecord`]), the deployment view shared by the registry and the
//! orchestrator, API key hashing, and the narrow storage traits the runtime
//! reads and writes through.

pub mod error;
pub mod keys;
pub mod models;
pub mod redis_store;
pub mod store;

pub use error::{Error, Result};
pub use keys::{hash_api_key, verify_api_key};
pub use models::{
    ApiRecord, ApiStatus, Artifact, DeploymentHandle, DeploymentStatus, PlanTier, UsageRecord,
};
pub use redis_store::RedisStore;
pub use store::{ArtifactStore, MemoryStore, RecordStore, UsageSink};
