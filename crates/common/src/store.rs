//! Persistence interfaces consumed by the runtime
//!
//! The runtime only reads API records and artifacts, and only appends usage
//! records. Everything else about storage belongs to the CRUD layer.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::models::{ApiRecord, Artifact, UsageRecord};

/// Read access to API metadata
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record with `active` status
    async fn list_active(&self) -> Result<Vec<ApiRecord>>;

    /// A single record regardless of status
    async fn get_record(&self, api_id: &str) -> Result<Option<ApiRecord>>;

    /// Connectivity check used by the health endpoint
    async fn ping(&self) -> Result<()>;
}

/// Source of code artifacts by API identifier
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch_artifact(&self, api_id: &str) -> Result<Option<Artifact>>;
}

/// Append-only destination for usage records
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append_usage(&self, record: &UsageRecord) -> Result<()>;
}

/// In-process store for tests and local runs
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ApiRecord>>,
    artifacts: RwLock<HashMap<String, Artifact>>,
    usage: Mutex<Vec<UsageRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_record(&self, record: ApiRecord) {
        self.records.write().insert(record.api_id.clone(), record);
    }

    pub fn put_artifact(&self, api_id: &str, artifact: Artifact) {
        self.artifacts.write().insert(api_id.to_string(), artifact);
    }

    pub fn remove_record(&self, api_id: &str) {
        self.records.write().remove(api_id);
    }

    /// Snapshot of all appended usage records
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.lock().clone()
    }

    /// Simulate an outage: every call fails until re-enabled
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_active(&self) -> Result<Vec<ApiRecord>> {
        self.check_available()?;
        let mut active: Vec<ApiRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.api_id.cmp(&b.api_id));
        Ok(active)
    }

    async fn get_record(&self, api_id: &str) -> Result<Option<ApiRecord>> {
        self.check_available()?;
        Ok(self.records.read().get(api_id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn fetch_artifact(&self, api_id: &str) -> Result<Option<Artifact>> {
        self.check_available()?;
        Ok(self.artifacts.read().get(api_id).cloned())
    }
}

#[async_trait]
impl UsageSink for MemoryStore {
    async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        self.check_available()?;
        self.usage.lock().push(record.clone());
        Ok(())
    }
}
