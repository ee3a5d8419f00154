//! Redis-backed persistence
//!
//! Key layout:
//! - `api:{api_id}` – JSON [`ApiRecord`]
//! - `apis:all` – set of every known api_id
//! - `artifact:{api_id}` – hash with `code` and `dependencies` fields
//! - `usage:{api_id}` – list of JSON [`UsageRecord`]s, append-only

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{ApiRecord, Artifact, UsageRecord};
use crate::store::{ArtifactStore, RecordStore, UsageSink};

const ALL_APIS_KEY: &str = "apis:all";

/// Storage backend over a shared Redis connection
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn record_key(api_id: &str) -> String {
        format!("api:{}", api_id)
    }

    fn artifact_key(api_id: &str) -> String {
        format!("artifact:{}", api_id)
    }

    fn usage_key(api_id: &str) -> String {
        format!("usage:{}", api_id)
    }

    /// Write a record (used by seeding tools and tests)
    pub async fn put_record(&self, record: &ApiRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;

        let _: () = conn.set(Self::record_key(&record.api_id), json).await?;
        let _: () = conn.sadd(ALL_APIS_KEY, &record.api_id).await?;

        debug!("Stored record for API: {}", record.api_id);
        Ok(())
    }

    /// Write an artifact (used by seeding tools and tests)
    pub async fn put_artifact(&self, api_id: &str, artifact: &Artifact) -> Result<()> {
        let mut conn = self.conn.clone();
        let fields: [(&str, Vec<u8>); 2] = [
            ("code", artifact.code.clone()),
            ("dependencies", artifact.manifest().into_bytes()),
        ];

        let _: () = conn
            .hset_multiple(Self::artifact_key(api_id), &fields[..])
            .await?;
        Ok(())
    }

    /// Number of usage records appended for an API
    pub async fn usage_count(&self, api_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(Self::usage_key(api_id)).await?;
        Ok(len)
    }

    /// Remove everything stored for an API
    pub async fn delete_api(&self, api_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![
                Self::record_key(api_id),
                Self::artifact_key(api_id),
                Self::usage_key(api_id),
            ])
            .await?;
        let _: () = conn.srem(ALL_APIS_KEY, api_id).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn list_active(&self) -> Result<Vec<ApiRecord>> {
        let mut conn = self.conn.clone();
        let api_ids: Vec<String> = conn.smembers(ALL_APIS_KEY).await?;

        let mut active = Vec::new();
        for api_id in api_ids {
            match self.get_record(&api_id).await {
                Ok(Some(record)) if record.is_active() => active.push(record),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable record {}: {}", api_id, e),
            }
        }

        active.sort_by(|a, b| a.api_id.cmp(&b.api_id));
        Ok(active)
    }

    async fn get_record(&self, api_id: &str) -> Result<Option<ApiRecord>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(Self::record_key(api_id)).await?;

        match json {
            Some(data) => {
                let record: ApiRecord =
                    serde_json::from_str(&data).map_err(|e| Error::InvalidRecord {
                        api_id: api_id.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for RedisStore {
    async fn fetch_artifact(&self, api_id: &str) -> Result<Option<Artifact>> {
        let mut conn = self.conn.clone();
        let mut fields: HashMap<String, Vec<u8>> =
            conn.hgetall(Self::artifact_key(api_id)).await?;

        let Some(code) = fields.remove("code") else {
            return Ok(None);
        };
        let manifest = fields
            .remove("dependencies")
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        Ok(Some(Artifact::from_manifest(code, &manifest)))
    }
}

#[async_trait]
impl UsageSink for RedisStore {
    async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        let _: () = conn.rpush(Self::usage_key(&record.api_id), json).await?;
        Ok(())
    }
}
