//! API Registry
//!
//! In-memory directory mapping an `api_id` to everything the gateway needs to
//! route a call: key hash, owner, rate-limit policy, and the current
//! deployment handle.
//!
//! ## Concurrency
//!
//! The map is published as an immutable snapshot behind an `Arc`. Writers
//! build a fresh map off to the side (serialized by a writer mutex) and swap
//! the pointer; readers clone the current `Arc` and never see a partially
//! updated entry.

pub mod models;

use genapi_common::{ApiRecord, DeploymentHandle, RecordStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub use models::RegistryEntry;

type Snapshot = Arc<HashMap<String, Arc<RegistryEntry>>>;

/// Copy-on-write registry of loaded APIs
#[derive(Default)]
pub struct ApiRegistry {
    current: RwLock<Snapshot>,
    writer: Mutex<()>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from every active record in the persistence layer.
    ///
    /// Deployment handles of APIs that stay loaded are kept; APIs that are no
    /// longer active drop out. Nothing is deployed here.
    pub async fn load_all(&self, store: &dyn RecordStore) -> genapi_common::Result<usize> {
        let records = store.list_active().await?;
        let count = records.len();

        self.write(|map| {
            let mut next = HashMap::with_capacity(records.len());
            for record in records {
                let deployment = map
                    .get(&record.api_id)
                    .and_then(|existing| existing.deployment.clone());
                let entry = RegistryEntry::from_record(&record).with_deployment(deployment);
                next.insert(record.api_id.clone(), Arc::new(entry));
            }
            *map = next;
        });

        info!("Loaded {} active APIs into registry", count);
        Ok(count)
    }

    /// Look up an entry
    pub fn get(&self, api_id: &str) -> Option<Arc<RegistryEntry>> {
        self.snapshot().get(api_id).cloned()
    }

    /// Insert or replace an entry as a whole
    pub fn upsert(&self, entry: RegistryEntry) -> Option<Arc<RegistryEntry>> {
        let api_id = entry.api_id.clone();
        let entry = Arc::new(entry);
        let mut previous = None;

        self.write(|map| {
            previous = map.insert(api_id.clone(), entry);
        });

        debug!("Registry upsert for API: {}", api_id);
        previous
    }

    /// Refresh auth and policy fields from a record, keeping the deployment
    pub fn upsert_record(&self, record: &ApiRecord) -> Option<Arc<RegistryEntry>> {
        let deployment = self
            .get(&record.api_id)
            .and_then(|existing| existing.deployment.clone());
        self.upsert(RegistryEntry::from_record(record).with_deployment(deployment))
    }

    /// Publish a new deployment handle for an existing entry.
    ///
    /// Returns `false` when the API is not in the registry.
    pub fn set_deployment(&self, api_id: &str, handle: Option<DeploymentHandle>) -> bool {
        let mut found = false;

        self.write(|map| {
            if let Some(existing) = map.get(api_id) {
                let updated = existing.as_ref().clone().with_deployment(handle);
                map.insert(api_id.to_string(), Arc::new(updated));
                found = true;
            }
        });

        found
    }

    /// Remove an entry (delete or pause)
    pub fn remove(&self, api_id: &str) -> Option<Arc<RegistryEntry>> {
        let mut removed = None;
        self.write(|map| {
            removed = map.remove(api_id);
        });

        if removed.is_some() {
            info!("Removed API {} from registry", api_id);
        }
        removed
    }

    pub fn contains(&self, api_id: &str) -> bool {
        self.snapshot().contains_key(api_id)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries whose deployment is currently running
    pub fn running_count(&self) -> usize {
        self.snapshot()
            .values()
            .filter(|entry| entry.is_routable())
            .count()
    }

    /// Any entry owned by the given principal
    pub fn find_by_owner(&self, owner_id: &str) -> Option<Arc<RegistryEntry>> {
        let snapshot = self.snapshot();
        let mut owned: Vec<&Arc<RegistryEntry>> = snapshot
            .values()
            .filter(|entry| entry.owner_id == owner_id)
            .collect();
        owned.sort_by(|a, b| a.api_id.cmp(&b.api_id));
        owned.first().map(|entry| Arc::clone(*entry))
    }

    /// Current immutable view of the whole registry
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.current.read())
    }

    fn write(&self, mutate: impl FnOnce(&mut HashMap<String, Arc<RegistryEntry>>)) {
        let _writer = self.writer.lock();
        let mut next = self.snapshot().as_ref().clone();
        mutate(&mut next);
        *self.current.write() = Arc::new(next);
    }
}
