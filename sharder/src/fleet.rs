//! Registry of supervised workers, shared by the manager and the IPC server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Value, json};

use crate::bridge::protocol::WorkerIdentity;
use crate::partition::shard_for_guild;
use crate::supervisor::{WorkerHandle, WorkerRole};

#[derive(Debug, Default)]
pub struct Fleet {
    clusters: RwLock<BTreeMap<u32, Arc<WorkerHandle>>>,
    services: RwLock<BTreeMap<String, Arc<WorkerHandle>>>,
    shard_total: AtomicU32,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the cluster handles of a partition over `shard_total` shards.
    pub fn set_clusters(&self, handles: impl IntoIterator<Item = Arc<WorkerHandle>>, shard_total: u32) {
        let mut clusters = write(&self.clusters);
        clusters.clear();
        for handle in handles {
            if let WorkerIdentity::Cluster(id) = handle.identity() {
                clusters.insert(*id, handle);
            }
        }
        self.shard_total.store(shard_total, Ordering::Release);
    }

    pub fn shard_total(&self) -> u32 {
        self.shard_total.load(Ordering::Acquire)
    }

    pub fn cluster(&self, id: u32) -> Option<Arc<WorkerHandle>> {
        read(&self.clusters).get(&id).cloned()
    }

    pub fn clusters(&self) -> Vec<Arc<WorkerHandle>> {
        read(&self.clusters).values().cloned().collect()
    }

    pub fn cluster_count(&self) -> usize {
        read(&self.clusters).len()
    }

    /// Cluster whose shard range contains the guild's shard.
    pub fn cluster_for_guild(&self, guild_id: u64) -> Option<Arc<WorkerHandle>> {
        let total = self.shard_total();
        if total == 0 {
            return None;
        }
        let shard = shard_for_guild(guild_id, total);
        read(&self.clusters)
            .values()
            .find(|h| h.shards().is_some_and(|r| r.contains(shard)))
            .cloned()
    }

    pub fn service(&self, name: &str) -> Option<Arc<WorkerHandle>> {
        read(&self.services).get(name).cloned()
    }

    pub fn services(&self) -> Vec<Arc<WorkerHandle>> {
        read(&self.services).values().cloned().collect()
    }

    /// Add a service handle; hands it back if the name is taken.
    pub fn insert_service(&self, handle: Arc<WorkerHandle>) -> Result<(), Arc<WorkerHandle>> {
        let WorkerIdentity::Service(name) = handle.identity().clone() else {
            return Err(handle);
        };
        let mut services = write(&self.services);
        if services.contains_key(&name) {
            return Err(handle);
        }
        services.insert(name, handle);
        Ok(())
    }

    pub fn remove_service(&self, name: &str) -> Option<Arc<WorkerHandle>> {
        write(&self.services).remove(name)
    }

    pub fn handle(&self, identity: &WorkerIdentity) -> Option<Arc<WorkerHandle>> {
        match identity {
            WorkerIdentity::Cluster(id) => self.cluster(*id),
            WorkerIdentity::Service(name) => self.service(name),
        }
    }

    /// Readiness overview, served by the `fleet` diagnostic.
    pub fn summary(&self) -> Value {
        let clusters: Vec<Value> = self
            .clusters()
            .iter()
            .map(|h| {
                json!({
                    "id": match h.role() {
                        WorkerRole::Cluster { id, .. } => Some(*id),
                        WorkerRole::Service { .. } => None,
                    },
                    "shards": h.shards(),
                    "ready": h.is_ready(),
                    "pid": h.pid(),
                })
            })
            .collect();
        let services: Vec<Value> = self
            .services()
            .iter()
            .map(|h| {
                json!({
                    "name": match h.role() {
                        WorkerRole::Service { name, .. } => Some(name.as_str()),
                        WorkerRole::Cluster { .. } => None,
                    },
                    "ready": h.is_ready(),
                    "pid": h.pid(),
                })
            })
            .collect();
        json!({
            "shardTotal": self.shard_total(),
            "clusters": clusters,
            "services": services,
        })
    }
}
